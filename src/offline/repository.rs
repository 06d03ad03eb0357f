use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ContentCache, OfflineStore, TransferDirection, TransferRecord};
use crate::db::current_timestamp_millis;
use crate::entry::{Entry, EntryType, OfflineLookup, OfflineState, OfflineStatus};
use crate::error::{Error, Result};
use crate::settings::RetryPolicy;

/// 传输失败后记录的去向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureDisposition {
    /// 被取消，回到 Pending，不计入重试次数。
    Requeued,
    /// 网络类失败，等待 `delay` 后再次尝试。
    Retry { retry_count: u32, delay: Duration },
    /// 进入终态 Error，需要用户手动重新排队。
    Terminal { retry_count: u32 },
}

/// 离线状态机：传输记录的唯一所有者。
///
/// 所有“读-改-写”都在同一把写锁内完成，同一条目的并发写入因此是串行的。
pub struct OfflineRepository {
    store: Arc<dyn OfflineStore>,
    cache: ContentCache,
    writer: Mutex<()>,
}

impl OfflineRepository {
    pub fn new(store: Arc<dyn OfflineStore>, cache: ContentCache) -> Self {
        Self {
            store,
            cache,
            writer: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn fetch(&self, entry_id: &str) -> Result<Option<TransferRecord>> {
        self.store.fetch(entry_id)
    }

    pub fn records(&self) -> Result<Vec<TransferRecord>> {
        self.store.load()
    }

    /// 离线视图：顶层为用户标记的条目与上传，否则为某个离线文件夹的子项。
    pub fn offline_entries(&self, parent_id: Option<&str>) -> Result<Vec<Entry>> {
        Ok(self
            .store
            .load()?
            .into_iter()
            .filter(|record| match parent_id {
                None => record.is_user_marked(),
                Some(parent) => record.entry.parent_id.as_deref() == Some(parent),
            })
            .map(|record| record.entry)
            .collect())
    }

    /// 等待处理且退避期限已过的记录，按创建顺序排列。
    pub fn pending_records(&self) -> Result<Vec<TransferRecord>> {
        let now = current_timestamp_millis();
        Ok(self
            .store
            .load()?
            .into_iter()
            .filter(|record| record.status() == OfflineStatus::Pending && record.is_due(now))
            .collect())
    }

    /// 标记离线。重复调用是幂等的：已有记录时不新建，也不改动其状态。
    pub fn mark_offline(&self, entry: &Entry) -> Result<Entry> {
        if entry.is_trashed || entry.is_upload || !(entry.is_file() || entry.is_folder()) {
            return Err(Error::illegal_selection(format!(
                "entry {} of type {} cannot be kept offline",
                entry.id,
                entry.entry_type.as_str()
            )));
        }
        let _guard = self.lock();
        if let Some(mut existing) = self.store.fetch(&entry.id)? {
            if existing.is_upload() {
                return Err(Error::illegal_selection(format!(
                    "entry {} is a pending upload",
                    entry.id
                )));
            }
            let status = existing.status();
            if !existing.entry.is_offline {
                // 离线文件夹的子项被单独标记，只升级为用户标记
                existing.entry.is_offline = true;
                self.store.upsert(&existing)?;
            }
            debug!(entry_id = %entry.id, status = status.as_str(), "entry already tracked offline");
            return Ok(entry.clone().with_offline_flags(true, false, status));
        }

        let now = current_timestamp_millis();
        let record = TransferRecord {
            entry: snapshot(entry).with_offline_flags(true, false, OfflineStatus::Pending),
            direction: TransferDirection::Download,
            byte_size: entry.size.unwrap_or(0),
            retry_count: 0,
            last_error: None,
            local_path: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert(&record)?;
        info!(entry_id = %entry.id, "marked entry offline");
        Ok(entry
            .clone()
            .with_offline_flags(true, false, OfflineStatus::Pending))
    }

    /// 取消离线：任何状态都直接删除记录，文件夹连同其子项与缓存一起删除。
    pub fn remove_offline(&self, entry: &Entry) -> Result<Entry> {
        let removed = self.remove_record(&entry.id)?;
        if !removed.is_empty() {
            info!(entry_id = %entry.id, removed = removed.len(), "removed entry from offline");
        }
        Ok(entry.clone().without_offline_status())
    }

    /// 删除一条记录及其子项记录，返回被删除的记录。
    pub fn remove_record(&self, entry_id: &str) -> Result<Vec<TransferRecord>> {
        let _guard = self.lock();
        self.remove_tree_locked(entry_id)
    }

    fn remove_tree_locked(&self, entry_id: &str) -> Result<Vec<TransferRecord>> {
        let records = self.store.load()?;
        if !records.iter().any(|r| r.entry_id() == entry_id) {
            return Ok(Vec::new());
        }
        let mut doomed: HashSet<String> = HashSet::from([entry_id.to_string()]);
        loop {
            let before = doomed.len();
            for record in &records {
                let parent_doomed = record
                    .entry
                    .parent_id
                    .as_ref()
                    .is_some_and(|parent| doomed.contains(parent));
                if parent_doomed && !record.is_user_marked() {
                    doomed.insert(record.entry.id.clone());
                }
            }
            if doomed.len() == before {
                break;
            }
        }

        let removed: Vec<TransferRecord> = records
            .into_iter()
            .filter(|r| doomed.contains(r.entry_id()))
            .collect();
        let ids: Vec<String> = removed.iter().map(|r| r.entry.id.clone()).collect();
        self.store.remove(&ids)?;
        for record in removed.iter().filter(|r| !r.is_upload()) {
            if let Err(err) = self.cache.remove(&record.entry) {
                warn!(entry_id = %record.entry.id, error = %err, "failed to remove cached content");
            }
        }
        Ok(removed)
    }

    /// 为本地文件创建上传记录，id 为新生成的 uuid。
    pub fn schedule_upload(
        &self,
        parent_id: &str,
        local_path: &Path,
        name: Option<&str>,
        mime_type: Option<String>,
    ) -> Result<Entry> {
        let metadata = std::fs::metadata(local_path)
            .map_err(|e| Error::from_io(e, format!("failed to read upload source {local_path:?}")))?;
        if !metadata.is_file() {
            return Err(Error::NotFound(format!(
                "upload source {local_path:?} is not a file"
            )));
        }
        let name = name
            .map(str::to_string)
            .or_else(|| {
                local_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_default();

        let now = current_timestamp_millis();
        let entry = Entry {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(parent_id.to_string()),
            entry_type: EntryType::File,
            name,
            mime_type,
            size: Some(metadata.len()),
            is_upload: true,
            offline_status: OfflineStatus::Pending,
            ..Entry::default()
        };
        let record = TransferRecord {
            entry: entry.clone(),
            direction: TransferDirection::Upload,
            byte_size: metadata.len(),
            retry_count: 0,
            last_error: None,
            local_path: Some(local_path.to_path_buf()),
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        };
        let _guard = self.lock();
        self.store.upsert(&record)?;
        info!(entry_id = %entry.id, parent_id, "scheduled upload");
        Ok(entry)
    }

    /// 清除一条已完成或失败的上传记录；仍在排队/上传中的不受影响。
    pub fn clear_upload(&self, entry_id: &str) -> Result<bool> {
        let _guard = self.lock();
        match self.store.fetch(entry_id)? {
            Some(record) if record.is_upload() && is_finished(record.status()) => {
                self.store.remove(&[record.entry.id])?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn clear_finished_uploads(&self) -> Result<usize> {
        let _guard = self.lock();
        let ids: Vec<String> = self
            .store
            .load()?
            .into_iter()
            .filter(|r| r.is_upload() && is_finished(r.status()))
            .map(|r| r.entry.id)
            .collect();
        self.store.remove(&ids)?;
        Ok(ids.len())
    }

    /// 用户手动重试：Error 回到 Pending 并清零重试次数。其它状态原样返回。
    pub fn requeue(&self, entry_id: &str) -> Result<Option<Entry>> {
        let _guard = self.lock();
        let Some(mut record) = self.store.fetch(entry_id)? else {
            return Ok(None);
        };
        if record.status() == OfflineStatus::Error {
            record.entry.offline_status = OfflineStatus::Pending;
            record.retry_count = 0;
            record.last_error = None;
            record.next_attempt_at = None;
            self.store.upsert(&record)?;
            info!(entry_id, "requeued failed transfer");
        }
        Ok(Some(record.entry))
    }

    /// 已同步的文件夹重新排队，使其子项列表被重新拉取。
    pub fn requeue_synced_folders(&self) -> Result<usize> {
        let _guard = self.lock();
        let mut count = 0;
        for mut record in self.store.load()? {
            if record.entry.is_folder() && record.status() == OfflineStatus::Synced {
                record.entry.offline_status = OfflineStatus::Pending;
                self.store.upsert(&record)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Pending → Syncing。记录不存在或不在 Pending 时返回 `None`。
    pub fn begin_transfer(&self, entry_id: &str) -> Result<Option<TransferRecord>> {
        let _guard = self.lock();
        let Some(mut record) = self.store.fetch(entry_id)? else {
            return Ok(None);
        };
        if !transition(&mut record, OfflineStatus::Syncing) {
            return Ok(None);
        }
        self.store.upsert(&record)?;
        Ok(Some(record))
    }

    /// Syncing → Synced。记录在传输途中被删除时返回 `None`。
    pub fn complete_transfer(&self, entry_id: &str, byte_size: u64) -> Result<Option<TransferRecord>> {
        let _guard = self.lock();
        let Some(mut record) = self.store.fetch(entry_id)? else {
            return Ok(None);
        };
        if !transition(&mut record, OfflineStatus::Synced) {
            return Ok(None);
        }
        record.byte_size = byte_size;
        if record.entry.is_file() {
            record.entry.size = Some(byte_size);
        }
        record.retry_count = 0;
        record.last_error = None;
        self.store.upsert(&record)?;
        Ok(Some(record))
    }

    /// 按错误类型决定记录去向：取消回到 Pending；网络失败在预算内回到 Pending
    /// 并累加重试次数；其余错误直接进入 Error，重试次数不变。
    pub fn fail_transfer(
        &self,
        entry_id: &str,
        error: &Error,
        policy: &RetryPolicy,
    ) -> Result<Option<FailureDisposition>> {
        let _guard = self.lock();
        let Some(mut record) = self.store.fetch(entry_id)? else {
            return Ok(None);
        };

        let disposition = match error {
            Error::Cancelled => {
                if !transition(&mut record, OfflineStatus::Pending) {
                    return Ok(None);
                }
                FailureDisposition::Requeued
            }
            err if err.is_retryable() => {
                let retry_count = record.retry_count.saturating_add(1);
                let next = if policy.is_exhausted(retry_count) {
                    OfflineStatus::Error
                } else {
                    OfflineStatus::Pending
                };
                if !transition(&mut record, next) {
                    return Ok(None);
                }
                record.retry_count = retry_count;
                record.last_error = Some(err.to_string());
                if next == OfflineStatus::Error {
                    FailureDisposition::Terminal { retry_count }
                } else {
                    let delay = policy.delay_for(retry_count);
                    let delay_millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                    record.next_attempt_at =
                        Some(current_timestamp_millis().saturating_add(delay_millis));
                    FailureDisposition::Retry { retry_count, delay }
                }
            }
            err => {
                if !transition(&mut record, OfflineStatus::Error) {
                    return Ok(None);
                }
                record.last_error = Some(err.to_string());
                FailureDisposition::Terminal {
                    retry_count: record.retry_count,
                }
            }
        };
        self.store.upsert(&record)?;
        Ok(Some(disposition))
    }

    /// 启动时调用：没有被持有的 Syncing 记录视为中断，回到 Pending。
    pub fn recover_interrupted(&self, held: &HashSet<String>) -> Result<usize> {
        let _guard = self.lock();
        let mut recovered = 0;
        for mut record in self.store.load()? {
            if record.status() != OfflineStatus::Syncing || held.contains(record.entry_id()) {
                continue;
            }
            if transition(&mut record, OfflineStatus::Pending) {
                self.store.upsert(&record)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "requeued interrupted transfers");
        }
        Ok(recovered)
    }

    /// 用远端子项列表刷新离线文件夹：新增子项登记为 Pending，内容有变化的已同步
    /// 子项重新排队，远端已不存在的子项连同其后代一起删除。返回新排队的数量。
    pub fn sync_children(&self, folder_id: &str, children: &[Entry]) -> Result<usize> {
        let _guard = self.lock();
        let records = self.store.load()?;
        let now = current_timestamp_millis();
        let mut queued = 0;

        for child in children.iter().filter(|c| c.is_file() || c.is_folder()) {
            match records.iter().find(|r| r.entry_id() == child.id) {
                Some(existing) => {
                    if !content_changed(&existing.entry, child) {
                        continue;
                    }
                    let mut updated = existing.clone();
                    updated.entry = updated.entry.copy_with_metadata(child);
                    updated.entry.size = child.size;
                    updated.byte_size = child.size.unwrap_or(existing.byte_size);
                    if existing.status() == OfflineStatus::Synced
                        && transition(&mut updated, OfflineStatus::Pending)
                    {
                        queued += 1;
                    }
                    self.store.upsert(&updated)?;
                }
                None => {
                    let record = TransferRecord {
                        entry: snapshot(child).with_offline_flags(
                            false,
                            false,
                            OfflineStatus::Pending,
                        ),
                        direction: TransferDirection::Download,
                        byte_size: child.size.unwrap_or(0),
                        retry_count: 0,
                        last_error: None,
                        local_path: None,
                        next_attempt_at: None,
                        created_at: now,
                        updated_at: now,
                    };
                    self.store.upsert(&record)?;
                    queued += 1;
                }
            }
        }

        let remote_ids: HashSet<&str> = children.iter().map(|c| c.id.as_str()).collect();
        let stale: Vec<String> = records
            .iter()
            .filter(|r| {
                r.entry.parent_id.as_deref() == Some(folder_id)
                    && !r.is_user_marked()
                    && !remote_ids.contains(r.entry_id())
            })
            .map(|r| r.entry.id.clone())
            .collect();
        for id in stale {
            let removed = self.remove_tree_locked(&id)?;
            debug!(folder_id, entry_id = %id, removed = removed.len(), "dropped stale offline child");
        }
        Ok(queued)
    }

    /// 总传输大小总是从存储重新计算，不做增量累加。
    pub fn total_transfer_size(&self, direction: TransferDirection) -> Result<u64> {
        Ok(self
            .store
            .load()?
            .iter()
            .filter(|r| r.direction == direction && r.counts_toward_total())
            .map(|r| r.byte_size)
            .sum())
    }
}

impl OfflineLookup for OfflineRepository {
    fn offline_state(&self, entry_id: &str) -> Option<OfflineState> {
        match self.store.fetch(entry_id) {
            Ok(record) => record.map(|r| OfflineState {
                is_offline: r.entry.is_offline,
                is_upload: r.entry.is_upload,
                status: r.status(),
            }),
            Err(err) => {
                warn!(entry_id, error = %err, "failed to read offline state");
                None
            }
        }
    }
}

fn transition(record: &mut TransferRecord, next: OfflineStatus) -> bool {
    let current = record.status();
    if !current.can_transition_to(next) {
        debug!(
            entry_id = %record.entry.id,
            from = current.as_str(),
            to = next.as_str(),
            "ignored illegal offline transition"
        );
        return false;
    }
    record.entry.offline_status = next;
    record.next_attempt_at = None;
    true
}

fn is_finished(status: OfflineStatus) -> bool {
    matches!(status, OfflineStatus::Synced | OfflineStatus::Error)
}

/// 持久化前清掉只在内存中有意义的字段。
fn snapshot(entry: &Entry) -> Entry {
    Entry {
        is_partial: false,
        is_selected_for_multi_selection: false,
        ..entry.clone()
    }
}

fn content_changed(stored: &Entry, fresh: &Entry) -> bool {
    stored.name != fresh.name
        || stored.modified.map(|t| t.timestamp()) != fresh.modified.map(|t| t.timestamp())
        || (fresh.size.is_some() && stored.size != fresh.size)
}
