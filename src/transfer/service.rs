use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{redirect::Policy, Client};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::offline::TransferDirection;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
/// 终态任务无人查询时在表中保留的时长。
const FINISHED_JOB_RETENTION: Duration = Duration::from_secs(10 * 60);

/// 系统传输服务中的任务标识。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransferId(pub String);

impl TransferId {
    pub fn new() -> Self {
        TransferId(Uuid::new_v4().to_string())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次网络传输的描述。下载时 `local_path` 为目标文件，上传时为源文件。
#[derive(Clone, Debug, PartialEq)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub url: Url,
    pub bearer_token: Option<String>,
    pub local_path: PathBuf,
    pub title: String,
    pub mime_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransferState {
    Queued,
    Running { bytes: u64, expected: Option<u64> },
    Completed { bytes: u64 },
    Failed(Error),
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed { .. } | TransferState::Failed(_) | TransferState::Cancelled
        )
    }
}

/// 系统级后台传输调度器。核心只需要入队、查询、取消三个能力。
#[async_trait]
pub trait TransferService: Send + Sync {
    async fn enqueue(&self, request: TransferRequest) -> Result<TransferId>;
    async fn query_status(&self, id: &TransferId) -> Result<TransferState>;
    async fn cancel(&self, id: &TransferId) -> Result<()>;
}

struct Job {
    state: TransferState,
    cancel: Arc<AtomicBool>,
    finished_at: Option<Instant>,
}

/// 基于 reqwest 的默认实现：每个任务一个 tokio 任务，下载先写 `.part` 再重命名。
#[derive(Clone)]
pub struct HttpTransferService {
    client: Client,
    jobs: Arc<Mutex<HashMap<TransferId, Job>>>,
    retention: Duration,
}

impl HttpTransferService {
    pub fn new() -> Result<Self> {
        Self::with_retention(FINISHED_JOB_RETENTION)
    }

    /// 指定终态任务的保留时长；超过时长仍未被查询的任务在下一次入队时清理。
    pub fn with_retention(retention: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(REQUEST_TIMEOUT)?,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            retention,
        })
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<TransferId, Job>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, id: &TransferId, state: TransferState) {
        let mut jobs = self.lock_jobs();
        if let Some(job) = jobs.get_mut(id) {
            if state.is_terminal() {
                job.finished_at = Some(Instant::now());
            }
            job.state = state;
        }
    }

    /// 清理保留期已过的终态任务，返回清理的数量。
    fn sweep_finished(&self, now: Instant) -> usize {
        let mut jobs = self.lock_jobs();
        let before = jobs.len();
        jobs.retain(|_, job| {
            job.finished_at
                .map_or(true, |finished| now.saturating_duration_since(finished) < self.retention)
        });
        before - jobs.len()
    }

    #[cfg(test)]
    fn job_count(&self) -> usize {
        self.lock_jobs().len()
    }

    async fn run(&self, id: TransferId, request: TransferRequest, cancel: Arc<AtomicBool>) {
        let result = match request.direction {
            TransferDirection::Download => self.download(&id, &request, &cancel).await,
            TransferDirection::Upload => self.upload(&id, &request, &cancel).await,
        };
        let state = match result {
            Ok(bytes) => {
                info!(title = %request.title, bytes, "transfer completed");
                TransferState::Completed { bytes }
            }
            Err(Error::Cancelled) => TransferState::Cancelled,
            Err(err) => {
                warn!(title = %request.title, error = %err, "transfer failed");
                TransferState::Failed(err)
            }
        };
        self.set_state(&id, state);
    }

    async fn download(
        &self,
        id: &TransferId,
        request: &TransferRequest,
        cancel: &AtomicBool,
    ) -> Result<u64> {
        if let Some(dir) = request.local_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::from_io(e, format!("failed to create directory {dir:?}")))?;
        }
        let part_path = part_path(&request.local_path);
        let result = self
            .stream_to_file(id, request, &part_path, cancel)
            .await;
        match result {
            Ok(bytes) => {
                tokio::fs::rename(&part_path, &request.local_path)
                    .await
                    .map_err(|e| Error::from_io(e, "failed to move downloaded file into place"))?;
                Ok(bytes)
            }
            Err(err) => {
                if let Err(remove_err) = tokio::fs::remove_file(&part_path).await {
                    debug!(path = ?part_path, error = %remove_err, "no partial file to remove");
                }
                remove_empty_placeholder(&request.local_path).await;
                Err(err)
            }
        }
    }

    async fn stream_to_file(
        &self,
        id: &TransferId,
        request: &TransferRequest,
        part_path: &Path,
        cancel: &AtomicBool,
    ) -> Result<u64> {
        let mut builder = self.client.get(request.url.clone());
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(
                status.as_u16(),
                format!("download of {} returned HTTP {status}", request.title),
            ));
        }
        let expected = response.content_length();
        let mut file = tokio::fs::File::create(part_path)
            .await
            .map_err(|e| Error::from_io(e, format!("failed to create {part_path:?}")))?;
        let mut bytes: u64 = 0;
        self.set_state(id, TransferState::Running { bytes, expected });

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::from_io(e, "failed to write file"))?;
            bytes += chunk.len() as u64;
            self.set_state(id, TransferState::Running { bytes, expected });
        }
        file.flush()
            .await
            .map_err(|e| Error::from_io(e, "failed to flush file"))?;
        Ok(bytes)
    }

    async fn upload(
        &self,
        id: &TransferId,
        request: &TransferRequest,
        cancel: &AtomicBool,
    ) -> Result<u64> {
        let content = tokio::fs::read(&request.local_path)
            .await
            .map_err(|e| Error::from_io(e, format!("failed to read {:?}", request.local_path)))?;
        let total = content.len() as u64;
        self.set_state(
            id,
            TransferState::Running {
                bytes: 0,
                expected: Some(total),
            },
        );
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        let mut builder = self
            .client
            .post(request.url.clone())
            .header("Content-Type", "application/octet-stream")
            .body(content);
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(
                status.as_u16(),
                format!("upload of {} returned HTTP {status}", request.title),
            ));
        }
        Ok(total)
    }
}

#[async_trait]
impl TransferService for HttpTransferService {
    async fn enqueue(&self, request: TransferRequest) -> Result<TransferId> {
        let swept = self.sweep_finished(Instant::now());
        if swept > 0 {
            debug!(swept, "dropped finished transfers nobody queried");
        }
        let id = TransferId::new();
        let cancel = Arc::new(AtomicBool::new(false));
        self.lock_jobs().insert(
            id.clone(),
            Job {
                state: TransferState::Queued,
                cancel: cancel.clone(),
                finished_at: None,
            },
        );
        debug!(transfer_id = %id.0, url = %request.url, "enqueued transfer");
        let service = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            service.run(job_id, request, cancel).await;
        });
        Ok(id)
    }

    /// 终态被查询一次后即从表中移除。
    async fn query_status(&self, id: &TransferId) -> Result<TransferState> {
        let mut jobs = self.lock_jobs();
        let state = jobs
            .get(id)
            .map(|job| job.state.clone())
            .ok_or_else(|| Error::NotFound(format!("transfer {}", id.0)))?;
        if state.is_terminal() {
            jobs.remove(id);
        }
        Ok(state)
    }

    async fn cancel(&self, id: &TransferId) -> Result<()> {
        let jobs = self.lock_jobs();
        match jobs.get(id) {
            Some(job) => {
                job.cancel.store(true, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::NotFound(format!("transfer {}", id.0))),
        }
    }
}

/// 构建带统一超时与重定向策略的 HTTP 客户端。
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .redirect(Policy::limited(10))
        .build()
        .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))
}

/// 下载目标若仍是预留的空文件则删除；已有内容的文件（例如旧的缓存副本）保留。
async fn remove_empty_placeholder(destination: &Path) {
    match tokio::fs::metadata(destination).await {
        Ok(metadata) if metadata.is_file() && metadata.len() == 0 => {
            if let Err(err) = tokio::fs::remove_file(destination).await {
                warn!(path = ?destination, error = %err, "failed to remove download placeholder");
            }
        }
        _ => {}
    }
}

pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
