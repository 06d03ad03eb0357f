use super::{can_create, can_delete, Entry, EntryType, OfflineStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;

/// 离线仓库对条目的本地状态查询，构造 Entry 时立即合并。
pub trait OfflineLookup {
    fn offline_state(&self, entry_id: &str) -> Option<OfflineState>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OfflineState {
    pub is_offline: bool,
    pub is_upload: bool,
    pub status: OfflineStatus,
}

/// 没有离线仓库时使用（例如纯远端预览）。
impl OfflineLookup for () {
    fn offline_state(&self, _entry_id: &str) -> Option<OfflineState> {
        None
    }
}

impl Entry {
    pub fn with_offline_status(self, lookup: &dyn OfflineLookup) -> Entry {
        match lookup.offline_state(&self.id) {
            Some(state) => self.with_offline_flags(state.is_offline, state.is_upload, state.status),
            None => self,
        }
    }

    pub fn from_node(node: Node, lookup: &dyn OfflineLookup) -> Entry {
        node.into_entry().with_offline_status(lookup)
    }

    pub fn from_search_result(result: ResultNode, lookup: &dyn OfflineLookup) -> Entry {
        result.node.into_entry().with_offline_status(lookup)
    }

    /// 子节点关联：链接类节点的目标 id 存在 `cm:destination` 属性里。
    pub fn from_child_association(child: NodeChildAssociation, lookup: &dyn OfflineLookup) -> Entry {
        let other_id = child
            .node
            .properties
            .as_ref()
            .and_then(|props| props.get("cm:destination"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut entry = child.node.into_entry();
        entry.other_id = other_id;
        entry.with_offline_status(lookup)
    }

    pub fn from_deleted_node(deleted: DeletedNode, lookup: &dyn OfflineLookup) -> Entry {
        let mut entry = deleted.node.into_entry();
        entry.is_partial = false;
        entry.can_delete = false;
        entry.can_create = false;
        entry.is_trashed = true;
        entry.with_offline_status(lookup)
    }

    pub fn from_favorite(favorite: Favorite, lookup: &dyn OfflineLookup) -> Result<Entry> {
        let target = favorite.target;
        if let Some(file) = target.file {
            return Ok(file.into_entry(EntryType::File, false).with_offline_status(lookup));
        }
        if let Some(folder) = target.folder {
            return Ok(folder.into_entry(EntryType::Folder, true).with_offline_status(lookup));
        }
        if let Some(site) = target.site {
            let mut entry = Entry::from_site(site, lookup);
            entry.is_partial = false;
            entry.is_favorite = true;
            return Ok(entry);
        }
        Err(Error::NotFound(format!(
            "favorite {} has no file, folder or site target",
            favorite.target_guid.unwrap_or_default()
        )))
    }

    pub fn from_site(site: Site, lookup: &dyn OfflineLookup) -> Entry {
        Entry {
            id: site.guid,
            entry_type: EntryType::Site,
            name: site.title,
            is_partial: true,
            can_delete: site.role == Some(SiteRoleKind::SiteManager),
            other_id: Some(site.id),
            ..Entry::default()
        }
        .with_offline_status(lookup)
    }

    pub fn from_site_role(role: SiteRole, lookup: &dyn OfflineLookup) -> Entry {
        let mut entry = Entry::from_site(role.site, lookup);
        entry.can_delete = role.role == SiteRoleKind::SiteManager;
        entry
    }

    pub fn from_shared_link(link: SharedLink, lookup: &dyn OfflineLookup) -> Entry {
        Entry {
            id: link.node_id.unwrap_or_default(),
            entry_type: EntryType::File,
            name: link.name.unwrap_or_default(),
            path: link.path.as_ref().and_then(PathInfo::formatted),
            mime_type: link.content.as_ref().and_then(|c| c.mime_type.clone()),
            size: link.content.as_ref().and_then(|c| c.size_in_bytes),
            properties: properties_compat(link.properties.as_ref()),
            modified: link.modified_at,
            is_partial: link.is_favorite.is_none() || link.allowable_operations.is_none(),
            is_favorite: link.is_favorite.unwrap_or(false),
            can_delete: can_delete(link.allowable_operations.as_deref()),
            ..Entry::default()
        }
        .with_offline_status(lookup)
    }
}

/// 远端节点。
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default)]
    pub is_folder: bool,
    pub path: Option<PathInfo>,
    pub content: Option<ContentInfo>,
    pub properties: Option<HashMap<String, Value>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    pub is_favorite: Option<bool>,
    pub allowable_operations: Option<Vec<String>>,
}

impl Node {
    fn into_entry(self) -> Entry {
        let operations = self.allowable_operations.as_deref();
        Entry {
            entry_type: EntryType::from_tag(&self.node_type, self.is_file, self.is_folder),
            path: self.path.as_ref().and_then(PathInfo::formatted),
            mime_type: self.content.as_ref().and_then(|c| c.mime_type.clone()),
            size: self.content.as_ref().and_then(|c| c.size_in_bytes),
            properties: properties_compat(self.properties.as_ref()),
            modified: self.modified_at,
            created: self.created_at,
            is_partial: self.is_favorite.is_none() || operations.is_none(),
            is_favorite: self.is_favorite.unwrap_or(false),
            can_delete: can_delete(operations),
            can_create: can_create(operations),
            id: self.id,
            parent_id: self.parent_id,
            name: self.name,
            ..Entry::default()
        }
    }
}

/// 搜索结果节点。
#[derive(Clone, Debug, Deserialize)]
pub struct ResultNode {
    #[serde(flatten)]
    pub node: Node,
    pub search: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeChildAssociation {
    #[serde(flatten)]
    pub node: Node,
    pub association: Option<Value>,
}

/// 回收站中的节点。
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedNode {
    #[serde(flatten)]
    pub node: Node,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub archived_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Favorite {
    pub target_guid: Option<String>,
    pub target: FavoriteTarget,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FavoriteTarget {
    pub file: Option<FavoriteTargetNode>,
    pub folder: Option<FavoriteTargetNode>,
    pub site: Option<Site>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteTargetNode {
    pub id: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub path: Option<PathInfo>,
    pub content: Option<ContentInfo>,
    pub properties: Option<HashMap<String, Value>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub modified_at: Option<DateTime<Utc>>,
    pub allowable_operations: Option<Vec<String>>,
}

impl FavoriteTargetNode {
    fn into_entry(self, entry_type: EntryType, with_create: bool) -> Entry {
        let operations = self.allowable_operations.as_deref();
        Entry {
            entry_type,
            path: self.path.as_ref().and_then(PathInfo::formatted),
            mime_type: if entry_type == EntryType::File {
                self.content.as_ref().and_then(|c| c.mime_type.clone())
            } else {
                None
            },
            size: self.content.as_ref().and_then(|c| c.size_in_bytes),
            properties: properties_compat(self.properties.as_ref()),
            modified: self.modified_at,
            is_partial: operations.is_none(),
            is_favorite: true,
            can_delete: can_delete(operations),
            can_create: with_create && can_create(operations),
            id: self.id,
            parent_id: self.parent_id,
            name: self.name,
            ..Entry::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum SiteRoleKind {
    SiteManager,
    SiteCollaborator,
    SiteContributor,
    SiteConsumer,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Site {
    pub id: String,
    pub guid: String,
    #[serde(default)]
    pub title: String,
    pub role: Option<SiteRoleKind>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SiteRole {
    pub site: Site,
    pub role: SiteRoleKind,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedLink {
    pub id: Option<String>,
    pub node_id: Option<String>,
    pub name: Option<String>,
    pub path: Option<PathInfo>,
    pub content: Option<ContentInfo>,
    pub properties: Option<HashMap<String, Value>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub modified_at: Option<DateTime<Utc>>,
    pub is_favorite: Option<bool>,
    pub allowable_operations: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PathInfo {
    pub elements: Option<Vec<PathElement>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PathElement {
    pub id: Option<String>,
    pub name: String,
}

impl PathInfo {
    /// 以 ` › ` 连接路径各级名称；没有元素时返回 None。
    pub fn formatted(&self) -> Option<String> {
        let elements = self.elements.as_ref()?;
        if elements.is_empty() {
            return None;
        }
        Some(
            elements
                .iter()
                .map(|el| el.name.as_str())
                .collect::<Vec<_>>()
                .join(" \u{203A} "),
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentInfo {
    pub mime_type: Option<String>,
    pub size_in_bytes: Option<u64>,
}

/// 只保留字符串属性；字符串数组以 ", " 拼接，其余类型忽略。
fn properties_compat(src: Option<&HashMap<String, Value>>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(src) = src else {
        return map;
    };
    for (key, value) in src {
        match value {
            Value::String(s) => {
                map.insert(key.clone(), s.clone());
            }
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                map.insert(key.clone(), joined);
            }
            _ => {}
        }
    }
    map
}

/// 远端时间戳可能是 RFC 3339，也可能是 `+0000` 形式的时区偏移。
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    DateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f%z")
        .map(|parsed| Some(parsed.with_timezone(&Utc)))
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    struct FixedLookup(OfflineState);

    impl OfflineLookup for FixedLookup {
        fn offline_state(&self, entry_id: &str) -> Option<OfflineState> {
            (entry_id == "n1").then_some(self.0)
        }
    }

    fn node_json() -> Value {
        json!({
            "id": "n1",
            "parentId": "p1",
            "nodeType": "cm:content",
            "name": "report.pdf",
            "isFile": true,
            "isFolder": false,
            "path": {"elements": [{"id": "r", "name": "Company Home"}, {"id": "p1", "name": "Docs"}]},
            "content": {"mimeType": "application/pdf", "sizeInBytes": 2048},
            "properties": {"cm:title": "Report", "cm:taggable": ["a", "b"], "cm:versionLabel": 1.0},
            "modifiedAt": "2024-03-01T10:00:00.000+0000",
            "isFavorite": false,
            "allowableOperations": ["delete", "update"]
        })
    }

    #[test]
    fn test_node_normalization() {
        let node: Node = serde_json::from_value(node_json()).unwrap();
        let entry = Entry::from_node(node, &());

        assert_eq!(entry.entry_type, EntryType::File);
        assert_eq!(entry.path.as_deref(), Some("Company Home \u{203A} Docs"));
        assert_eq!(entry.mime_type.as_deref(), Some("application/pdf"));
        assert_eq!(entry.size, Some(2048));
        assert_eq!(entry.properties.get("cm:title").map(String::as_str), Some("Report"));
        assert_eq!(entry.properties.get("cm:taggable").map(String::as_str), Some("a, b"));
        assert!(!entry.properties.contains_key("cm:versionLabel"));
        assert_eq!(entry.modified, Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()));
        assert!(entry.can_delete);
        assert!(!entry.can_create);
        assert!(!entry.is_partial);
        assert!(!entry.has_offline_status());
    }

    #[test]
    fn test_missing_operations_marks_partial() {
        let mut value = node_json();
        value.as_object_mut().unwrap().remove("allowableOperations");
        let node: Node = serde_json::from_value(value).unwrap();
        let entry = Entry::from_node(node, &());
        assert!(entry.is_partial);
        assert!(!entry.can_delete);
    }

    #[test]
    fn test_constructor_joins_offline_state() {
        let node: Node = serde_json::from_value(node_json()).unwrap();
        let lookup = FixedLookup(OfflineState {
            is_offline: true,
            is_upload: false,
            status: OfflineStatus::Synced,
        });
        let entry = Entry::from_node(node, &lookup);
        assert!(entry.is_offline);
        assert!(entry.is_synced());
    }

    #[test]
    fn test_deleted_node_is_trashed() {
        let mut value = node_json();
        value["archivedAt"] = json!("2024-04-01T08:30:00Z");
        let deleted: DeletedNode = serde_json::from_value(value).unwrap();
        let entry = Entry::from_deleted_node(deleted, &());
        assert!(entry.is_trashed);
        assert!(!entry.can_delete);
        assert!(!entry.is_partial);
    }

    #[test]
    fn test_child_association_reads_destination() {
        let value = json!({
            "id": "l1",
            "nodeType": "app:filelink",
            "name": "shortcut",
            "properties": {"cm:destination": "n1"},
            "isFavorite": false,
            "allowableOperations": []
        });
        let child: NodeChildAssociation = serde_json::from_value(value).unwrap();
        let entry = Entry::from_child_association(child, &());
        assert!(entry.is_link());
        assert_eq!(entry.other_id.as_deref(), Some("n1"));
    }

    #[test]
    fn test_favorite_site_is_complete() {
        let value = json!({
            "targetGuid": "g1",
            "target": {"site": {"id": "marketing", "guid": "g1", "title": "Marketing", "role": "SiteManager"}}
        });
        let favorite: Favorite = serde_json::from_value(value).unwrap();
        let entry = Entry::from_favorite(favorite, &()).unwrap();
        assert_eq!(entry.entry_type, EntryType::Site);
        assert!(entry.is_favorite);
        assert!(!entry.is_partial);
        assert!(entry.can_delete);
        assert_eq!(entry.other_id.as_deref(), Some("marketing"));
    }

    #[test]
    fn test_empty_favorite_is_rejected() {
        let favorite: Favorite = serde_json::from_value(json!({"targetGuid": "x", "target": {}})).unwrap();
        assert!(matches!(Entry::from_favorite(favorite, &()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_site_without_favorite_is_partial() {
        let site: Site = serde_json::from_value(json!({"id": "hr", "guid": "g2", "title": "HR"})).unwrap();
        let entry = Entry::from_site(site, &());
        assert!(entry.is_partial);
        assert!(!entry.can_delete);
    }
}
