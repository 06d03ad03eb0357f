use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::contextual::hydrate;
use super::export::{export_file, reserve_destination};
use super::resolver::toggles_offline;
use super::{Action, ActionInput, ActionKind};
use crate::entry::{Entry, EntryType};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::offline::{OfflineRepository, TransferDirection};
use crate::remote::{node_content_url, RemoteRepository};
use crate::session::Session;
use crate::transfer::{TransferRequest, TransferService, TransferState};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 执行动作的副作用，成功后在事件总线上发布完成事件。
///
/// 失败直接返回给调用方，不发布任何事件。
#[derive(Clone)]
pub struct ActionExecutor {
    session: Session,
    remote: Arc<dyn RemoteRepository>,
    repository: Arc<OfflineRepository>,
    transfers: Arc<dyn TransferService>,
    bus: EventBus,
    export_directory: PathBuf,
    poll_interval: Duration,
}

impl ActionExecutor {
    pub fn new(
        session: Session,
        remote: Arc<dyn RemoteRepository>,
        repository: Arc<OfflineRepository>,
        transfers: Arc<dyn TransferService>,
        bus: EventBus,
        export_directory: PathBuf,
    ) -> Self {
        Self {
            session,
            remote,
            repository,
            transfers,
            bus,
            export_directory,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// OpenWith 等待缓存下载时的轮询间隔。
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn export_directory(&self) -> &Path {
        &self.export_directory
    }

    /// 单目标执行，返回（可能已更新的）目标条目。
    pub async fn execute(&self, action: &Action) -> Result<Entry> {
        if action.is_multi() {
            return Err(Error::illegal_selection(format!(
                "{} targets {} entries, use execute_multi",
                action.kind.as_str(),
                action.entries.len()
            )));
        }
        if action.kind.touches_remote() {
            self.session.ensure_active()?;
        }
        let action = self.hydrated(action).await;
        let result = self.run(&action).await;
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                log_failure(&action, &err);
                return Err(err);
            }
        };
        info!(kind = action.kind.as_str(), entry_id = %entry.id, "action completed");
        if action.kind.is_mutating() {
            self.bus.actions().publish(action.copy(entry.clone()));
        }
        Ok(entry)
    }

    /// 多选执行，返回合成的选择条目与各成员更新后的条目。
    pub async fn execute_multi(&self, action: &Action) -> Result<(Entry, Vec<Entry>)> {
        if action.entries.is_empty() {
            return Err(Error::illegal_selection("multi-selection is empty"));
        }
        if !action.kind.supports_multi() {
            return Err(Error::illegal_selection(format!(
                "{} does not support multi-selection",
                action.kind.as_str()
            )));
        }
        if action.entries.iter().any(|e| e.entry_type == EntryType::Group) {
            return Err(Error::illegal_selection("group rows cannot be executed"));
        }
        if action.kind.touches_remote() {
            self.session.ensure_active()?;
        }

        let entries = match self.run_multi(action).await {
            Ok(entries) => entries,
            Err(err) => {
                log_failure(action, &err);
                return Err(err);
            }
        };
        let updated = action.copy_with_entries(entries);
        info!(
            kind = action.kind.as_str(),
            count = updated.entries.len(),
            "multi-selection action completed"
        );
        self.bus.actions().publish(updated.clone());
        Ok((updated.entry, updated.entries))
    }

    /// 确保文件在本地有一份副本并返回其路径：已同步时直接使用缓存，
    /// 否则下载到缓存目录并等待完成。
    pub async fn local_copy(&self, entry: &Entry) -> Result<PathBuf> {
        let cache = self.repository.cache();
        let path = cache.path_for(entry);
        if entry.is_synced() && cache.contains(entry) {
            return Ok(path);
        }
        self.session.ensure_active()?;
        cache.ensure_root().await?;
        let request = self.download_request(entry, path.clone())?;
        let transfer_id = self.transfers.enqueue(request).await?;
        loop {
            match self.transfers.query_status(&transfer_id).await? {
                TransferState::Completed { bytes } => {
                    debug!(entry_id = %entry.id, bytes, "cached copy ready");
                    return Ok(path);
                }
                TransferState::Failed(err) => return Err(err),
                TransferState::Cancelled => return Err(Error::Cancelled),
                TransferState::Queued | TransferState::Running { .. } => {}
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// 部分条目在执行前尽量补全；补全失败时按原条目继续。
    async fn hydrated(&self, action: &Action) -> Action {
        let entry = &action.entry;
        if !entry.is_partial
            || entry.has_offline_status()
            || entry.entry_type == EntryType::Site
            || !(action.kind.touches_remote() || action.kind == ActionKind::Download)
        {
            return action.clone();
        }
        match hydrate(entry, self.remote.as_ref(), self.repository.as_ref()).await {
            Ok(full) => action.copy(full),
            Err(err) => {
                warn!(entry_id = %entry.id, error = %err, "executing with partial entry");
                action.clone()
            }
        }
    }

    async fn run(&self, action: &Action) -> Result<Entry> {
        let entry = &action.entry;
        match action.kind {
            ActionKind::Download => self.download(entry).await,
            ActionKind::Export => {
                if !entry.is_synced() || !self.repository.cache().contains(entry) {
                    return Err(Error::NotFound(format!(
                        "{} is not available offline",
                        entry.name
                    )));
                }
                self.export(entry).await
            }
            ActionKind::OpenWith => {
                let path = self.local_copy(entry).await?;
                debug!(entry_id = %entry.id, path = %path.display(), "opening local copy");
                Ok(entry.clone())
            }
            ActionKind::UploadPhoto | ActionKind::UploadExtensionFiles => {
                let input = required_input(action)?;
                if input.files.is_empty() {
                    return Err(Error::Cancelled);
                }
                for file in &input.files {
                    self.repository.schedule_upload(
                        &entry.id,
                        &file.path,
                        file.name.as_deref(),
                        file.mime_type.clone(),
                    )?;
                }
                Ok(entry.clone())
            }
            ActionKind::AddFavorite => {
                self.remote.add_favorite(entry).await?;
                Ok(Entry {
                    is_favorite: true,
                    ..entry.clone()
                })
            }
            ActionKind::RemoveFavorite => {
                self.remote.remove_favorite(entry).await?;
                Ok(Entry {
                    is_favorite: false,
                    ..entry.clone()
                })
            }
            ActionKind::AddOffline => self.repository.mark_offline(entry),
            ActionKind::RemoveOffline => self.repository.remove_offline(entry),
            ActionKind::MoveFilesFolders => {
                let destination = required_destination(action)?;
                self.move_entry(entry, destination).await
            }
            ActionKind::UpdateFileFolder => {
                let input = required_input(action)?;
                let name = required_name(input)?;
                let node = self
                    .remote
                    .update_node(&entry.id, name, input.description.as_deref())
                    .await?;
                Ok(entry.copy_with_metadata(&Entry::from_node(node, self.repository.as_ref())))
            }
            ActionKind::Delete => self.delete(entry).await,
            ActionKind::DeleteForever => {
                self.remote.delete_forever(&entry.id).await?;
                Ok(entry.clone())
            }
            ActionKind::Restore => self.restore(entry).await,
            ActionKind::StartProcess => {
                self.remote.start_process(std::slice::from_ref(entry)).await?;
                Ok(entry.clone())
            }
            ActionKind::CreateFolder => {
                let input = required_input(action)?;
                let name = required_name(input)?;
                let node = self
                    .remote
                    .create_folder(&entry.id, name, input.description.as_deref())
                    .await?;
                Ok(Entry::from_node(node, self.repository.as_ref()))
            }
        }
    }

    async fn run_multi(&self, action: &Action) -> Result<Vec<Entry>> {
        let mut updated = Vec::with_capacity(action.entries.len());
        match action.kind {
            ActionKind::AddFavorite => {
                for entry in &action.entries {
                    if !entry.is_favorite {
                        self.remote.add_favorite(entry).await?;
                    }
                    updated.push(Entry {
                        is_favorite: true,
                        ..entry.clone()
                    });
                }
            }
            ActionKind::RemoveFavorite => {
                for entry in &action.entries {
                    if entry.is_favorite {
                        self.remote.remove_favorite(entry).await?;
                    }
                    updated.push(Entry {
                        is_favorite: false,
                        ..entry.clone()
                    });
                }
            }
            ActionKind::AddOffline => {
                for entry in &action.entries {
                    if toggles_offline(entry) {
                        updated.push(self.repository.mark_offline(entry)?);
                    } else {
                        updated.push(entry.clone());
                    }
                }
            }
            ActionKind::RemoveOffline => {
                for entry in &action.entries {
                    if entry.is_offline {
                        updated.push(self.repository.remove_offline(entry)?);
                    } else {
                        updated.push(entry.clone());
                    }
                }
            }
            ActionKind::MoveFilesFolders => {
                let destination = required_destination(action)?;
                for entry in &action.entries {
                    updated.push(self.move_entry(entry, destination).await?);
                }
            }
            ActionKind::Delete => {
                for entry in &action.entries {
                    updated.push(self.delete(entry).await?);
                }
            }
            ActionKind::DeleteForever => {
                for entry in &action.entries {
                    self.remote.delete_forever(&entry.id).await?;
                    updated.push(entry.clone());
                }
            }
            ActionKind::Restore => {
                for entry in &action.entries {
                    updated.push(self.restore(entry).await?);
                }
            }
            ActionKind::StartProcess => {
                self.remote.start_process(&action.entries).await?;
                updated.extend(action.entries.iter().cloned());
            }
            kind => {
                return Err(Error::illegal_selection(format!(
                    "{} does not support multi-selection",
                    kind.as_str()
                )));
            }
        }
        Ok(updated)
    }

    /// 已同步时复制缓存文件；否则交给系统传输服务下载，不等待完成。
    async fn download(&self, entry: &Entry) -> Result<Entry> {
        if !entry.is_file() {
            return Err(Error::illegal_selection(format!(
                "{} is not a file",
                entry.id
            )));
        }
        if entry.is_synced() && self.repository.cache().contains(entry) {
            return self.export(entry).await;
        }
        self.session.ensure_active()?;
        let destination = reserve_destination(&self.export_directory, &entry.name).await?;
        let request = self.download_request(entry, destination.clone())?;
        if let Err(err) = self.transfers.enqueue(request).await {
            if let Err(remove_err) = tokio::fs::remove_file(&destination).await {
                warn!(path = %destination.display(), error = %remove_err, "failed to remove reserved download");
            }
            return Err(err);
        }
        info!(entry_id = %entry.id, path = %destination.display(), "download enqueued");
        Ok(entry.clone())
    }

    async fn export(&self, entry: &Entry) -> Result<Entry> {
        let source = self.repository.cache().path_for(entry);
        export_file(&source, &self.export_directory, &entry.name).await?;
        Ok(entry.clone())
    }

    fn download_request(&self, entry: &Entry, local_path: PathBuf) -> Result<TransferRequest> {
        let base = self.session.base_url()?;
        Ok(TransferRequest {
            direction: TransferDirection::Download,
            url: node_content_url(&base, &entry.id)?,
            bearer_token: Some(self.session.access_token()?),
            local_path,
            title: entry.name.clone(),
            mime_type: entry.mime_type.clone(),
        })
    }

    async fn move_entry(&self, entry: &Entry, destination: &str) -> Result<Entry> {
        let node = self.remote.move_node(&entry.id, destination).await?;
        Ok(entry.copy_with_metadata(&Entry::from_node(node, self.repository.as_ref())))
    }

    /// 移到回收站，同时丢弃本地离线记录。远端已删除但本地记录删不掉时返回存储错误，
    /// 不发布事件。
    async fn delete(&self, entry: &Entry) -> Result<Entry> {
        self.remote.delete_entry(entry).await?;
        self.repository.remove_record(&entry.id).map_err(|err| {
            warn!(entry_id = %entry.id, error = %err, "failed to drop offline record of deleted entry");
            err
        })?;
        Ok(Entry {
            is_trashed: true,
            ..entry.clone().without_offline_status()
        })
    }

    async fn restore(&self, entry: &Entry) -> Result<Entry> {
        let node = self.remote.restore_node(&entry.id).await?;
        let restored = entry.copy_with_metadata(&Entry::from_node(node, self.repository.as_ref()));
        Ok(Entry {
            is_trashed: false,
            ..restored
        })
    }
}

fn required_input(action: &Action) -> Result<&ActionInput> {
    action.input.as_ref().ok_or(Error::Cancelled)
}

fn required_name(input: &ActionInput) -> Result<&str> {
    input
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(Error::Cancelled)
}

fn required_destination(action: &Action) -> Result<&str> {
    required_input(action)?
        .destination_id
        .as_deref()
        .ok_or(Error::Cancelled)
}

fn log_failure(action: &Action, err: &Error) {
    if err.is_user_visible() {
        warn!(kind = action.kind.as_str(), entry_id = %action.entry.id, error = %err, "action failed");
    } else {
        debug!(kind = action.kind.as_str(), entry_id = %action.entry.id, "action cancelled");
    }
}
