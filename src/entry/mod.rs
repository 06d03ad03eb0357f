pub mod remote;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use remote::{
    ContentInfo, DeletedNode, Favorite, FavoriteTarget, FavoriteTargetNode, Node,
    NodeChildAssociation, OfflineLookup, OfflineState, PathElement, PathInfo, ResultNode,
    SharedLink, Site, SiteRole, SiteRoleKind,
};

/// 内容条目的类型。`Group` 只用于列表中的分组伪行，永远不可选中。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Folder,
    Site,
    FileLink,
    FolderLink,
    Group,
    #[default]
    Unknown,
}

impl EntryType {
    /// 根据远端类型标签推导类型；未知标签时回退到 file/folder 布尔值。
    pub fn from_tag(tag: &str, is_file: bool, is_folder: bool) -> Self {
        match tag {
            "cm:content" => return EntryType::File,
            "cm:folder" => return EntryType::Folder,
            // 管理员可见的站点根目录，按普通文件夹处理
            "st:sites" => return EntryType::Folder,
            "st:site" => return EntryType::Site,
            "app:filelink" => return EntryType::FileLink,
            "app:folderlink" => return EntryType::FolderLink,
            _ => {}
        }
        if is_file {
            EntryType::File
        } else if is_folder {
            EntryType::Folder
        } else {
            EntryType::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::File => "file",
            EntryType::Folder => "folder",
            EntryType::Site => "site",
            EntryType::FileLink => "file_link",
            EntryType::FolderLink => "folder_link",
            EntryType::Group => "group",
            EntryType::Unknown => "unknown",
        }
    }

    /// 数据库存储值的反向解析，无法识别时为 `Unknown`。
    pub fn parse(value: &str) -> Self {
        match value {
            "file" => EntryType::File,
            "folder" => EntryType::Folder,
            "site" => EntryType::Site,
            "file_link" => EntryType::FileLink,
            "folder_link" => EntryType::FolderLink,
            "group" => EntryType::Group,
            _ => EntryType::Unknown,
        }
    }
}

/// 离线同步状态。`Undefined` 表示没有任何离线记录。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineStatus {
    #[default]
    Undefined,
    Pending,
    Syncing,
    Synced,
    Error,
}

impl OfflineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineStatus::Undefined => "undefined",
            OfflineStatus::Pending => "pending",
            OfflineStatus::Syncing => "syncing",
            OfflineStatus::Synced => "synced",
            OfflineStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "pending" => OfflineStatus::Pending,
            "syncing" => OfflineStatus::Syncing,
            "synced" => OfflineStatus::Synced,
            "error" => OfflineStatus::Error,
            _ => OfflineStatus::Undefined,
        }
    }

    /// 状态机允许的迁移。删除记录不是迁移，任何状态都可以直接删除。
    pub fn can_transition_to(&self, next: OfflineStatus) -> bool {
        use OfflineStatus::*;
        matches!(
            (self, next),
            (Undefined, Pending)
                | (Pending, Syncing)
                | (Syncing, Synced)
                | (Syncing, Error)
                | (Syncing, Pending)
                // 手动重新排队，或已同步内容需要刷新
                | (Error, Pending)
                | (Synced, Pending)
        )
    }
}

/// 统一的内容条目模型：远端各种返回结构最终都规整为它。
///
/// 按约定不可变：修改总是通过构造新值完成。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Entry {
    pub id: String,
    pub parent_id: Option<String>,
    pub entry_type: EntryType,
    pub name: String,
    pub path: Option<String>,
    pub mime_type: Option<String>,
    pub properties: HashMap<String, String>,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub is_partial: bool,
    pub is_favorite: bool,
    pub can_delete: bool,
    pub can_create: bool,
    pub is_trashed: bool,
    pub other_id: Option<String>,
    pub is_offline: bool,
    pub is_upload: bool,
    pub offline_status: OfflineStatus,
    pub is_selected_for_multi_selection: bool,
}

impl Entry {
    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }

    pub fn is_folder(&self) -> bool {
        self.entry_type == EntryType::Folder
    }

    pub fn is_link(&self) -> bool {
        matches!(
            self.entry_type,
            EntryType::FileLink | EntryType::FolderLink
        )
    }

    pub fn is_synced(&self) -> bool {
        self.offline_status == OfflineStatus::Synced
    }

    pub fn has_offline_status(&self) -> bool {
        self.offline_status != OfflineStatus::Undefined
    }

    /// 本地缓存文件名，id 前缀保证同名文件互不覆盖。
    pub fn file_name(&self) -> String {
        format!("{}-{}", self.id, self.name)
    }

    /// 只比较服务端可描述的字段，忽略离线/选择等本地状态，
    /// 修改时间只比较到秒。
    pub fn metadata_equals(&self, other: &Entry) -> bool {
        self.id == other.id
            && self.parent_id == other.parent_id
            && self.entry_type == other.entry_type
            && self.name == other.name
            && self.path == other.path
            && self.mime_type == other.mime_type
            && self.modified.map(|t| t.timestamp()) == other.modified.map(|t| t.timestamp())
            && self.is_favorite == other.is_favorite
            && self.can_delete == other.can_delete
            && self.other_id == other.other_id
    }

    /// 把新拉取条目的元数据字段套用到当前条目上，保留本地字段。
    pub fn copy_with_metadata(&self, other: &Entry) -> Entry {
        Entry {
            parent_id: other.parent_id.clone(),
            entry_type: other.entry_type,
            name: other.name.clone(),
            path: other.path.clone(),
            mime_type: other.mime_type.clone(),
            modified: other.modified,
            is_favorite: other.is_favorite,
            can_delete: other.can_delete,
            other_id: other.other_id.clone(),
            ..self.clone()
        }
    }

    /// 多选时合成的临时目标：id/name 为各成员逗号拼接，永不持久化。
    pub fn with_selected_entries(entries: &[Entry]) -> Entry {
        Entry {
            id: entries
                .iter()
                .map(|e| e.id.as_str())
                .collect::<Vec<_>>()
                .join(","),
            name: entries
                .iter()
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
            ..Entry::default()
        }
    }

    /// 合并离线记录中的本地状态。
    pub fn with_offline_flags(mut self, is_offline: bool, is_upload: bool, status: OfflineStatus) -> Entry {
        self.is_offline = is_offline;
        self.is_upload = is_upload;
        self.offline_status = status;
        self
    }

    /// 清除离线相关字段，用于取消离线后返回给调用方。
    pub fn without_offline_status(mut self) -> Entry {
        self.is_offline = false;
        self.is_upload = false;
        self.offline_status = OfflineStatus::Undefined;
        self
    }
}

pub(crate) fn can_delete(operations: Option<&[String]>) -> bool {
    operations.is_some_and(|ops| ops.iter().any(|op| op == "delete"))
}

pub(crate) fn can_create(operations: Option<&[String]>) -> bool {
    operations.is_some_and(|ops| ops.iter().any(|op| op == "create"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case("cm:content", false, false, EntryType::File)]
    #[case("cm:folder", false, false, EntryType::Folder)]
    #[case("st:sites", false, false, EntryType::Folder)]
    #[case("st:site", false, false, EntryType::Site)]
    #[case("app:filelink", false, false, EntryType::FileLink)]
    #[case("app:folderlink", false, false, EntryType::FolderLink)]
    #[case("custom:doc", true, false, EntryType::File)]
    #[case("custom:space", false, true, EntryType::Folder)]
    #[case("custom:thing", false, false, EntryType::Unknown)]
    fn test_type_from_tag(
        #[case] tag: &str,
        #[case] is_file: bool,
        #[case] is_folder: bool,
        #[case] expected: EntryType,
    ) {
        assert_eq!(EntryType::from_tag(tag, is_file, is_folder), expected);
    }

    fn sample() -> Entry {
        Entry {
            id: "n1".to_string(),
            parent_id: Some("p1".to_string()),
            entry_type: EntryType::File,
            name: "report.pdf".to_string(),
            path: Some("Company Home › Docs".to_string()),
            mime_type: Some("application/pdf".to_string()),
            modified: Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()),
            can_delete: true,
            ..Entry::default()
        }
    }

    #[test]
    fn test_metadata_equals_ignores_local_state() {
        let a = sample();
        let mut b = sample().with_offline_flags(true, false, OfflineStatus::Synced);
        b.is_selected_for_multi_selection = true;
        b.modified = a.modified.map(|t| t + chrono::Duration::milliseconds(450));
        b.properties.insert("cm:title".to_string(), "Quarterly".to_string());

        assert!(a.metadata_equals(&b));
        assert!(b.metadata_equals(&a));
    }

    #[test]
    fn test_metadata_equals_detects_server_changes() {
        let a = sample();
        let mut renamed = sample();
        renamed.name = "report-v2.pdf".to_string();
        let mut later = sample();
        later.modified = a.modified.map(|t| t + chrono::Duration::seconds(1));

        assert!(!a.metadata_equals(&renamed));
        assert!(!a.metadata_equals(&later));
    }

    #[test]
    fn test_copy_with_metadata_keeps_local_flags() {
        let local = sample().with_offline_flags(true, false, OfflineStatus::Synced);
        let mut fresh = sample();
        fresh.name = "renamed.pdf".to_string();
        fresh.is_favorite = true;

        let merged = local.copy_with_metadata(&fresh);
        assert_eq!(merged.name, "renamed.pdf");
        assert!(merged.is_favorite);
        assert!(merged.is_offline);
        assert!(merged.is_synced());
    }

    #[test]
    fn test_derived_flags() {
        let entry = sample().with_offline_flags(false, false, OfflineStatus::Pending);
        assert!(entry.is_file());
        assert!(!entry.is_folder());
        assert!(entry.has_offline_status());
        assert!(!entry.is_synced());
        assert_eq!(entry.file_name(), "n1-report.pdf");
    }

    #[test]
    fn test_selection_joins_members() {
        let mut other = sample();
        other.id = "n2".to_string();
        other.name = "notes.txt".to_string();
        let selection = Entry::with_selected_entries(&[sample(), other]);
        assert_eq!(selection.id, "n1,n2");
        assert_eq!(selection.name, "report.pdf,notes.txt");
        assert!(!selection.has_offline_status());
    }

    #[test]
    fn test_status_transitions() {
        assert!(OfflineStatus::Pending.can_transition_to(OfflineStatus::Syncing));
        assert!(OfflineStatus::Syncing.can_transition_to(OfflineStatus::Error));
        assert!(OfflineStatus::Error.can_transition_to(OfflineStatus::Pending));
        assert!(!OfflineStatus::Pending.can_transition_to(OfflineStatus::Synced));
        assert!(!OfflineStatus::Error.can_transition_to(OfflineStatus::Synced));
        assert_eq!(OfflineStatus::parse("SYNCED"), OfflineStatus::Synced);
        assert_eq!(OfflineStatus::parse("bogus"), OfflineStatus::Undefined);
    }
}
