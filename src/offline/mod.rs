pub mod cache;
pub mod repository;
pub mod storage;

use std::path::PathBuf;

use crate::entry::{Entry, OfflineStatus};

pub use cache::{sanitize_file_name, ContentCache};
pub use repository::{FailureDisposition, OfflineRepository};
pub use storage::{OfflineStore, SqliteOfflineStore};

/// 传输方向。下载对应远端条目的离线副本，上传对应尚未被服务端确认的本地新建。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    pub(crate) fn as_i64(&self) -> i64 {
        match self {
            TransferDirection::Download => 0,
            TransferDirection::Upload => 1,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        match value {
            1 => TransferDirection::Upload,
            _ => TransferDirection::Download,
        }
    }
}

/// 离线仓库中的一行：条目快照 + 传输状态。状态本身存放在 `entry.offline_status`。
#[derive(Clone, Debug, PartialEq)]
pub struct TransferRecord {
    pub entry: Entry,
    pub direction: TransferDirection,
    pub byte_size: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// 上传记录的本地源文件。
    pub local_path: Option<PathBuf>,
    /// 网络失败后的退避期限（毫秒时间戳），期限之前扫描不会再次启动它。
    pub next_attempt_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TransferRecord {
    pub fn entry_id(&self) -> &str {
        &self.entry.id
    }

    pub fn status(&self) -> OfflineStatus {
        self.entry.offline_status
    }

    pub fn is_upload(&self) -> bool {
        self.direction == TransferDirection::Upload
    }

    /// 用户直接标记的离线条目（不是离线文件夹的子项）。
    pub fn is_user_marked(&self) -> bool {
        self.entry.is_offline || self.entry.is_upload
    }

    /// 退避期限已过（或没有期限）。
    pub fn is_due(&self, now_millis: i64) -> bool {
        self.next_attempt_at.map_or(true, |deadline| deadline <= now_millis)
    }

    /// 是否计入“总传输大小”。
    pub fn counts_toward_total(&self) -> bool {
        matches!(
            self.status(),
            OfflineStatus::Pending | OfflineStatus::Syncing | OfflineStatus::Synced
        )
    }
}
