use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;

use super::{TransferDirection, TransferRecord};
use crate::db::{
    self, delete_offline_entries, load_offline_entries, load_offline_entry, upsert_offline_entry,
    Database, OfflineEntryRecord,
};
use crate::entry::{Entry, EntryType, OfflineStatus};
use crate::error::Result;

/// 定义持久化接口，方便替换存储实现或编写单测。
pub trait OfflineStore: Send + Sync {
    fn load(&self) -> Result<Vec<TransferRecord>>;
    fn fetch(&self, entry_id: &str) -> Result<Option<TransferRecord>>;
    fn upsert(&self, record: &TransferRecord) -> Result<()>;
    fn remove(&self, entry_ids: &[String]) -> Result<()>;
}

/// 默认的 SQLite 实现，所有记录都限定在一个账户下。
pub struct SqliteOfflineStore {
    db: Arc<Database>,
    account_id: String,
}

impl SqliteOfflineStore {
    pub fn new(db: Arc<Database>, account_id: impl Into<String>) -> Self {
        Self {
            db,
            account_id: account_id.into(),
        }
    }
}

impl OfflineStore for SqliteOfflineStore {
    fn load(&self) -> Result<Vec<TransferRecord>> {
        Ok(load_offline_entries(&self.db, &self.account_id)?
            .into_iter()
            .map(transfer_from_record)
            .collect())
    }

    fn fetch(&self, entry_id: &str) -> Result<Option<TransferRecord>> {
        Ok(load_offline_entry(&self.db, &self.account_id, entry_id)?.map(transfer_from_record))
    }

    fn upsert(&self, record: &TransferRecord) -> Result<()> {
        upsert_offline_entry(&self.db, &record_from_transfer(&self.account_id, record))
    }

    fn remove(&self, entry_ids: &[String]) -> Result<()> {
        delete_offline_entries(&self.db, &self.account_id, entry_ids)
    }
}

/// 将运行时记录转换成数据库行；统一在此处理类型与符号转换。
fn record_from_transfer(account_id: &str, record: &TransferRecord) -> OfflineEntryRecord {
    let entry = &record.entry;
    let properties = if entry.properties.is_empty() {
        None
    } else {
        serde_json::to_string(&entry.properties).ok()
    };
    OfflineEntryRecord {
        account_id: account_id.to_string(),
        entry_id: entry.id.clone(),
        parent_id: entry.parent_id.clone(),
        entry_type: entry.entry_type.as_str().to_string(),
        name: entry.name.clone(),
        path: entry.path.clone(),
        mime_type: entry.mime_type.clone(),
        properties,
        modified_secs: entry.modified.map(|t| t.timestamp()),
        is_offline: entry.is_offline,
        direction: record.direction.as_i64(),
        byte_size: record.byte_size.try_into().unwrap_or(i64::MAX),
        status: entry.offline_status.as_str().to_string(),
        retry_count: record.retry_count.into(),
        last_error: record.last_error.clone(),
        local_path: record
            .local_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
        next_attempt_at_millis: record.next_attempt_at,
        created_at_millis: record.created_at,
        updated_at_millis: db::current_timestamp_millis(),
    }
}

fn transfer_from_record(record: OfflineEntryRecord) -> TransferRecord {
    let direction = TransferDirection::from_i64(record.direction);
    let properties: HashMap<String, String> = record
        .properties
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let byte_size = if record.byte_size >= 0 {
        record.byte_size as u64
    } else {
        0
    };
    let entry_type = EntryType::parse(&record.entry_type);
    let entry = Entry {
        id: record.entry_id,
        parent_id: record.parent_id,
        entry_type,
        name: record.name,
        path: record.path,
        mime_type: record.mime_type,
        properties,
        modified: record
            .modified_secs
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        size: (entry_type == EntryType::File).then_some(byte_size),
        is_offline: record.is_offline,
        is_upload: direction == TransferDirection::Upload,
        offline_status: OfflineStatus::parse(&record.status),
        ..Entry::default()
    };
    TransferRecord {
        entry,
        direction,
        byte_size,
        retry_count: record.retry_count.clamp(0, u32::MAX as i64) as u32,
        last_error: record.last_error,
        local_path: record.local_path.map(PathBuf::from),
        next_attempt_at: record.next_attempt_at_millis,
        created_at: record.created_at_millis,
        updated_at: record.updated_at_millis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_survives_storage() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = SqliteOfflineStore::new(db.clone(), "alice");
        let mut entry = Entry {
            id: "n1".to_string(),
            parent_id: Some("p1".to_string()),
            entry_type: EntryType::File,
            name: "a.txt".to_string(),
            modified: DateTime::from_timestamp(1_700_000_000, 0),
            is_offline: true,
            offline_status: OfflineStatus::Syncing,
            ..Entry::default()
        };
        entry.properties.insert("cm:title".to_string(), "A".to_string());
        let record = TransferRecord {
            entry,
            direction: TransferDirection::Download,
            byte_size: 42,
            retry_count: 2,
            last_error: Some("network failure: timeout".to_string()),
            local_path: None,
            next_attempt_at: Some(99),
            created_at: 10,
            updated_at: 10,
        };
        store.upsert(&record).unwrap();

        let loaded = store.fetch("n1").unwrap().unwrap();
        assert_eq!(loaded.status(), OfflineStatus::Syncing);
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.next_attempt_at, Some(99));
        assert_eq!(loaded.entry.properties.get("cm:title").map(String::as_str), Some("A"));
        assert!(loaded.entry.metadata_equals(&record.entry));
        assert!(loaded.entry.is_offline);
        assert!(!loaded.entry.is_upload);

        let other_account = SqliteOfflineStore::new(db, "bob");
        assert!(other_account.load().unwrap().is_empty());
    }
}
