use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::service::{TransferId, TransferRequest, TransferService, TransferState};
use crate::actions::{Action, ActionKind};
use crate::db::current_timestamp_millis;
use crate::entry::{Entry, OfflineStatus};
use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription, TransferEvent, TransferProgress};
use crate::offline::{FailureDisposition, OfflineRepository, TransferDirection, TransferRecord};
use crate::remote::{fetch_all_children, node_content_url, node_upload_url, RemoteRepository, DEFAULT_PAGE_SIZE};
use crate::session::Session;
use crate::settings::{default_transfer_concurrency, EngineSettings, RetryPolicy};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// 轮询系统传输服务状态的间隔。
    pub poll_interval: Duration,
    pub page_size: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_transfer_concurrency(),
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl From<&EngineSettings> for WorkerConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency,
            retry: settings.retry,
            ..Self::default()
        }
    }
}

/// 后台传输引擎：扫描离线仓库中的 Pending 记录并驱动其完成。
///
/// 同一条目同一时刻最多只有一个传输（按 entry id 的 single-flight 锁），
/// 所有状态都在仓库里，重启后重新扫描即可继续。
#[derive(Clone)]
pub struct TransferWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    session: Session,
    repository: Arc<OfflineRepository>,
    remote: Arc<dyn RemoteRepository>,
    transfers: Arc<dyn TransferService>,
    bus: EventBus,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    progress_meters: Mutex<HashMap<String, ProgressTick>>,
    stopped: AtomicBool,
}

#[derive(Default)]
struct InFlight {
    transfer_id: Option<TransferId>,
    cancelled: bool,
}

/// 记录最近一次用来计算速度的快照（字节数 + 时间）。
struct ProgressTick {
    bytes: u64,
    instant: Instant,
}

/// single-flight 锁，离开作用域时释放。
struct FlightGuard {
    inner: Arc<WorkerInner>,
    entry_id: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.lock_in_flight().remove(&self.entry_id);
        self.inner.lock_meters().remove(&self.entry_id);
    }
}

/// `start` 返回的句柄，丢弃时停止后台监听与延迟重扫。
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
    listener: JoinHandle<()>,
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.listener.abort();
    }
}

impl WorkerInner {
    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_meters(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProgressTick>> {
        self.progress_meters.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl TransferWorker {
    pub fn new(
        session: Session,
        repository: Arc<OfflineRepository>,
        remote: Arc<dyn RemoteRepository>,
        transfers: Arc<dyn TransferService>,
        bus: EventBus,
        config: WorkerConfig,
    ) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            inner: Arc::new(WorkerInner {
                session,
                repository,
                remote,
                transfers,
                bus,
                config,
                semaphore: Arc::new(Semaphore::new(permits)),
                in_flight: Mutex::new(HashMap::new()),
                progress_meters: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_in_flight(&self, entry_id: &str) -> bool {
        self.inner.lock_in_flight().contains_key(entry_id)
    }

    pub fn in_flight_ids(&self) -> HashSet<String> {
        self.inner.lock_in_flight().keys().cloned().collect()
    }

    fn try_acquire(&self, entry_id: &str) -> Option<FlightGuard> {
        let mut in_flight = self.inner.lock_in_flight();
        if in_flight.contains_key(entry_id) {
            return None;
        }
        in_flight.insert(entry_id.to_string(), InFlight::default());
        Some(FlightGuard {
            inner: self.inner.clone(),
            entry_id: entry_id.to_string(),
        })
    }

    /// 把没有被本进程持有的 Syncing 记录视为中断，重新排队。
    pub fn recover(&self) -> Result<usize> {
        self.inner
            .repository
            .recover_interrupted(&self.in_flight_ids())
    }

    /// 扫描 Pending 记录，为每个未在传输中的条目启动后台任务。返回启动的数量。
    pub async fn scan(&self) -> Result<usize> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Ok(0);
        }
        if self.inner.session.is_signed_out() {
            debug!("session signed out, skipping transfer scan");
            return Ok(0);
        }
        let mut started = 0;
        for record in self.inner.repository.pending_records()? {
            let Some(guard) = self.try_acquire(record.entry_id()) else {
                debug!(entry_id = %record.entry.id, "transfer already in flight");
                continue;
            };
            let worker = self.clone();
            tokio::spawn(async move {
                let entry_id = guard.entry_id.clone();
                if let Err(err) = worker.run(guard).await {
                    error!(entry_id = %entry_id, error = %err, "transfer task failed");
                }
            });
            started += 1;
        }
        if started > 0 {
            debug!(started, "transfer scan started tasks");
        }
        Ok(started)
    }

    /// 在当前任务中同步处理单个条目。条目已在传输中或不在 Pending 时返回 `None`。
    pub async fn sync_entry(&self, entry_id: &str) -> Result<Option<OfflineStatus>> {
        if self.inner.session.is_signed_out() {
            return Ok(None);
        }
        match self.try_acquire(entry_id) {
            Some(guard) => self.run(guard).await,
            None => Ok(None),
        }
    }

    /// 取消进行中的传输。记录会回到 Pending（或在已被删除时直接丢弃）。
    pub async fn cancel(&self, entry_id: &str) -> bool {
        let transfer_id = {
            let mut in_flight = self.inner.lock_in_flight();
            match in_flight.get_mut(entry_id) {
                Some(flight) => {
                    flight.cancelled = true;
                    flight.transfer_id.clone()
                }
                None => return false,
            }
        };
        if let Some(id) = transfer_id {
            if let Err(err) = self.inner.transfers.cancel(&id).await {
                debug!(entry_id, error = %err, "transfer service could not cancel");
            }
        }
        info!(entry_id, "cancelled transfer");
        true
    }

    /// 订阅传输事件；订阅时先收到当前 Pending/Syncing 记录的快照。
    pub fn subscribe_progress(&self) -> Result<Subscription<TransferEvent>> {
        let snapshot = self
            .inner
            .repository
            .records()?
            .into_iter()
            .filter_map(|record| {
                let entry_id = record.entry.id;
                let direction = record.direction;
                match record.entry.offline_status {
                    OfflineStatus::Pending => Some(TransferEvent::Queued {
                        entry_id,
                        direction,
                    }),
                    OfflineStatus::Syncing => Some(TransferEvent::Started {
                        entry_id,
                        direction,
                    }),
                    _ => None,
                }
            })
            .collect();
        Ok(self.inner.bus.transfers().subscribe_with_replay(snapshot))
    }

    /// 监听动作完成事件：新增离线/上传触发扫描，取消离线/删除取消对应传输。
    pub fn start(&self) -> WorkerHandle {
        self.inner.stopped.store(false, Ordering::SeqCst);
        let mut actions = self.inner.bus.actions().subscribe_filtered(|action| {
            matches!(
                action.kind,
                ActionKind::AddOffline
                    | ActionKind::RemoveOffline
                    | ActionKind::Delete
                    | ActionKind::DeleteForever
                    | ActionKind::UploadPhoto
                    | ActionKind::UploadExtensionFiles
            )
        });
        let worker = self.clone();
        let listener = tokio::spawn(async move {
            while let Some(action) = actions.recv().await {
                worker.handle_action(action).await;
            }
        });
        WorkerHandle {
            inner: self.inner.clone(),
            listener,
        }
    }

    async fn handle_action(&self, action: Action) {
        match action.kind {
            ActionKind::AddOffline | ActionKind::UploadPhoto | ActionKind::UploadExtensionFiles => {
                if let Err(err) = self.scan().await {
                    warn!(error = %err, "transfer scan after action failed");
                }
            }
            _ => {
                for entry in action.targets() {
                    self.cancel(&entry.id).await;
                }
            }
        }
    }

    fn schedule_rescan(&self, delay: Duration) {
        let worker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = worker.scan().await {
                warn!(error = %err, "scheduled transfer scan failed");
            }
        });
    }

    async fn run(&self, guard: FlightGuard) -> Result<Option<OfflineStatus>> {
        let _permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;
        let entry_id = guard.entry_id.as_str();
        if self.is_cancelled(entry_id) {
            return Ok(None);
        }
        let Some(record) = self.inner.repository.begin_transfer(entry_id)? else {
            return Ok(None);
        };
        self.inner.bus.transfers().publish(TransferEvent::Started {
            entry_id: entry_id.to_string(),
            direction: record.direction,
        });

        let outcome = if record.entry.is_folder() && !record.is_upload() {
            self.sync_folder(&record).await
        } else {
            self.transfer_file(&record).await
        };
        self.finish(&record, outcome)
    }

    fn finish(&self, record: &TransferRecord, outcome: Result<u64>) -> Result<Option<OfflineStatus>> {
        let repository = &self.inner.repository;
        let entry_id = record.entry_id();
        let bus = self.inner.bus.transfers();
        match outcome {
            Ok(bytes) => match repository.complete_transfer(entry_id, bytes)? {
                Some(done) => {
                    info!(entry_id, bytes, "transfer synced");
                    bus.publish(TransferEvent::Completed {
                        entry_id: entry_id.to_string(),
                        direction: done.direction,
                        bytes,
                    });
                    self.publish_total(done.direction);
                    Ok(Some(OfflineStatus::Synced))
                }
                None => {
                    self.discard(record);
                    Ok(None)
                }
            },
            Err(err) => {
                // 登出不算失败：记录保持 Pending，等待重新登录后继续
                let err = if err == Error::SignedOut {
                    Error::Cancelled
                } else {
                    err
                };
                let policy = &self.inner.config.retry;
                match repository.fail_transfer(entry_id, &err, policy)? {
                    None => {
                        self.discard(record);
                        Ok(None)
                    }
                    Some(FailureDisposition::Requeued) => {
                        bus.publish(TransferEvent::Cancelled {
                            entry_id: entry_id.to_string(),
                        });
                        Ok(Some(OfflineStatus::Pending))
                    }
                    Some(FailureDisposition::Retry { retry_count, delay }) => {
                        warn!(entry_id, retry_count, ?delay, error = %err, "transfer failed, will retry");
                        bus.publish(TransferEvent::Retrying {
                            entry_id: entry_id.to_string(),
                            retry_count,
                            delay,
                        });
                        self.schedule_rescan(delay);
                        Ok(Some(OfflineStatus::Pending))
                    }
                    Some(FailureDisposition::Terminal { retry_count }) => {
                        error!(entry_id, retry_count, error = %err, "transfer failed permanently");
                        bus.publish(TransferEvent::Failed {
                            entry_id: entry_id.to_string(),
                            error: err,
                            terminal: true,
                        });
                        self.publish_total(record.direction);
                        Ok(Some(OfflineStatus::Error))
                    }
                }
            }
        }
    }

    /// 记录在传输途中被删除：丢弃结果并清掉已写入的内容。
    fn discard(&self, record: &TransferRecord) {
        debug!(entry_id = %record.entry.id, "record removed during transfer, discarding result");
        if record.is_upload() {
            return;
        }
        if let Err(err) = self.inner.repository.cache().remove(&record.entry) {
            warn!(entry_id = %record.entry.id, error = %err, "failed to remove discarded content");
        }
    }

    fn publish_total(&self, direction: TransferDirection) {
        match self.inner.repository.total_transfer_size(direction) {
            Ok(bytes) => {
                self.inner
                    .bus
                    .transfers()
                    .publish(TransferEvent::TotalSize { direction, bytes });
            }
            Err(err) => warn!(error = %err, "failed to compute total transfer size"),
        }
    }

    fn is_cancelled(&self, entry_id: &str) -> bool {
        self.inner
            .lock_in_flight()
            .get(entry_id)
            .is_some_and(|flight| flight.cancelled)
    }

    /// 离线文件夹：拉取子项并登记为子记录，新子项立即触发一次扫描。
    async fn sync_folder(&self, record: &TransferRecord) -> Result<u64> {
        let folder_id = record.entry_id();
        let children = fetch_all_children(
            self.inner.remote.as_ref(),
            folder_id,
            self.inner.config.page_size,
        )
        .await?;
        let entries: Vec<Entry> = children
            .into_iter()
            .map(|child| {
                let mut entry = Entry::from_child_association(child, &());
                entry.parent_id = Some(folder_id.to_string());
                entry
            })
            .collect();
        let queued = self.inner.repository.sync_children(folder_id, &entries)?;
        debug!(folder_id, children = entries.len(), queued, "synced offline folder");
        if queued > 0 {
            self.schedule_rescan(Duration::ZERO);
        }
        Ok(0)
    }

    async fn transfer_file(&self, record: &TransferRecord) -> Result<u64> {
        let session = &self.inner.session;
        let base = session.base_url()?;
        let token = session.access_token()?;
        let entry = &record.entry;
        let request = match record.direction {
            TransferDirection::Download => {
                let cache = self.inner.repository.cache();
                cache.ensure_root().await?;
                TransferRequest {
                    direction: TransferDirection::Download,
                    url: node_content_url(&base, &entry.id)?,
                    bearer_token: Some(token),
                    local_path: cache.path_for(entry),
                    title: entry.name.clone(),
                    mime_type: entry.mime_type.clone(),
                }
            }
            TransferDirection::Upload => {
                let local_path = record.local_path.clone().ok_or_else(|| {
                    Error::NotFound(format!("upload {} has no local source", entry.id))
                })?;
                let parent_id = entry.parent_id.as_deref().ok_or_else(|| {
                    Error::NotFound(format!("upload {} has no destination folder", entry.id))
                })?;
                TransferRequest {
                    direction: TransferDirection::Upload,
                    url: node_upload_url(&base, parent_id, &entry.name)?,
                    bearer_token: Some(token),
                    local_path,
                    title: entry.name.clone(),
                    mime_type: entry.mime_type.clone(),
                }
            }
        };
        self.await_transfer(entry.id.as_str(), record.direction, request)
            .await
    }

    async fn await_transfer(
        &self,
        entry_id: &str,
        direction: TransferDirection,
        request: TransferRequest,
    ) -> Result<u64> {
        let transfers = &self.inner.transfers;
        let transfer_id = transfers.enqueue(request).await?;
        let cancel_now = {
            let mut in_flight = self.inner.lock_in_flight();
            match in_flight.get_mut(entry_id) {
                Some(flight) => {
                    flight.transfer_id = Some(transfer_id.clone());
                    flight.cancelled
                }
                None => false,
            }
        };
        if cancel_now {
            transfers.cancel(&transfer_id).await?;
        }

        let mut last_bytes = None;
        loop {
            match transfers.query_status(&transfer_id).await? {
                TransferState::Queued => {}
                TransferState::Running { bytes, expected } => {
                    if last_bytes != Some(bytes) {
                        last_bytes = Some(bytes);
                        self.report_progress(entry_id, direction, bytes, expected);
                    }
                }
                TransferState::Completed { bytes } => {
                    self.report_progress(entry_id, direction, bytes, Some(bytes));
                    return Ok(bytes);
                }
                TransferState::Failed(err) => return Err(err),
                TransferState::Cancelled => return Err(Error::Cancelled),
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    fn report_progress(
        &self,
        entry_id: &str,
        direction: TransferDirection,
        bytes: u64,
        expected_size: Option<u64>,
    ) {
        let speed_bps = self.compute_speed_bps(entry_id, bytes);
        self.inner
            .bus
            .transfers()
            .publish(TransferEvent::Progress(TransferProgress {
                entry_id: entry_id.to_string(),
                direction,
                bytes_transferred: bytes,
                expected_size,
                speed_bps,
                timestamp_millis: current_timestamp_millis(),
            }));
    }

    fn compute_speed_bps(&self, entry_id: &str, bytes: u64) -> Option<f64> {
        let now = Instant::now();
        let previous = self.inner.lock_meters().insert(
            entry_id.to_string(),
            ProgressTick {
                bytes,
                instant: now,
            },
        )?;
        let delta_bytes = bytes.saturating_sub(previous.bytes);
        let elapsed = now.duration_since(previous.instant).as_secs_f64();
        if delta_bytes > 0 && elapsed > 0.0 {
            Some(delta_bytes as f64 / elapsed)
        } else {
            None
        }
    }
}
