use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, StorageResult};
use crate::error::Error;

/// 离线条目持久化模块：负责 offline_entries 表结构与增删改查。
/// 主键为 (account_id, entry_id)，应用重启后据此恢复同步队列。

pub(crate) const OFFLINE_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS offline_entries (
    account_id TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    parent_id TEXT,
    entry_type TEXT NOT NULL,
    name TEXT NOT NULL,
    path TEXT,
    mime_type TEXT,
    properties TEXT,
    modified_secs INTEGER,
    is_offline INTEGER NOT NULL,
    direction INTEGER NOT NULL,
    byte_size INTEGER NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    last_error TEXT,
    local_path TEXT,
    next_attempt_at_millis INTEGER,
    created_at_millis INTEGER NOT NULL,
    updated_at_millis INTEGER NOT NULL,
    PRIMARY KEY (account_id, entry_id)
);
CREATE INDEX IF NOT EXISTS offline_entries_parent ON offline_entries (account_id, parent_id);";

/// 旧版本建出的表缺少退避期限列，按需补齐。
pub(crate) fn migrate_offline_table(conn: &Connection) -> StorageResult<()> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(offline_entries)")
        .map_err(|e| Error::storage(format!("failed to inspect offline entry table: {e}")))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| Error::storage(format!("failed to inspect offline entry table: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::storage(format!("failed to inspect offline entry table: {e}")))?;
    if !columns.iter().any(|name| name == "next_attempt_at_millis") {
        conn.execute(
            "ALTER TABLE offline_entries ADD COLUMN next_attempt_at_millis INTEGER",
            [],
        )
        .map_err(|e| Error::storage(format!("failed to add retry deadline column: {e}")))?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfflineEntryRecord {
    pub account_id: String,
    pub entry_id: String,
    pub parent_id: Option<String>,
    pub entry_type: String,
    pub name: String,
    pub path: Option<String>,
    pub mime_type: Option<String>,
    pub properties: Option<String>,
    pub modified_secs: Option<i64>,
    pub is_offline: bool,
    pub direction: i64,
    pub byte_size: i64,
    pub status: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub local_path: Option<String>,
    pub next_attempt_at_millis: Option<i64>,
    pub created_at_millis: i64,
    pub updated_at_millis: i64,
}

const SELECT_COLUMNS: &str = "
    account_id,
    entry_id,
    parent_id,
    entry_type,
    name,
    path,
    mime_type,
    properties,
    modified_secs,
    is_offline,
    direction,
    byte_size,
    status,
    retry_count,
    last_error,
    local_path,
    next_attempt_at_millis,
    created_at_millis,
    updated_at_millis";

pub fn upsert_offline_entry(db: &Database, record: &OfflineEntryRecord) -> StorageResult<()> {
    db.with_connection(|conn| {
        conn.execute(
            "INSERT INTO offline_entries (
                account_id,
                entry_id,
                parent_id,
                entry_type,
                name,
                path,
                mime_type,
                properties,
                modified_secs,
                is_offline,
                direction,
                byte_size,
                status,
                retry_count,
                last_error,
                local_path,
                next_attempt_at_millis,
                created_at_millis,
                updated_at_millis
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, entry_id) DO UPDATE SET
                parent_id = excluded.parent_id,
                entry_type = excluded.entry_type,
                name = excluded.name,
                path = excluded.path,
                mime_type = excluded.mime_type,
                properties = excluded.properties,
                modified_secs = excluded.modified_secs,
                is_offline = excluded.is_offline,
                direction = excluded.direction,
                byte_size = excluded.byte_size,
                status = excluded.status,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                local_path = excluded.local_path,
                next_attempt_at_millis = excluded.next_attempt_at_millis,
                updated_at_millis = excluded.updated_at_millis",
            params![
                record.account_id,
                record.entry_id,
                record.parent_id,
                record.entry_type,
                record.name,
                record.path,
                record.mime_type,
                record.properties,
                record.modified_secs,
                record.is_offline as i64,
                record.direction,
                record.byte_size,
                record.status,
                record.retry_count,
                record.last_error,
                record.local_path,
                record.next_attempt_at_millis,
                record.created_at_millis,
                record.updated_at_millis,
            ],
        )
        .map_err(|e| {
            Error::storage(format!(
                "failed to upsert offline entry {}: {e}",
                record.entry_id
            ))
        })?;
        Ok(())
    })
}

pub fn load_offline_entries(db: &Database, account_id: &str) -> StorageResult<Vec<OfflineEntryRecord>> {
    db.with_connection(|conn| {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS}
                FROM offline_entries
                WHERE account_id = ?
                ORDER BY created_at_millis ASC, entry_id ASC"
            ))
            .map_err(|e| Error::storage(format!("failed to prepare offline entry query: {e}")))?;
        let rows = stmt
            .query_map(params![account_id], map_offline_entry)
            .map_err(|e| Error::storage(format!("failed to query offline entries: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::storage(format!("failed to parse offline entry row: {e}")))?;
        Ok(rows)
    })
}

pub fn load_offline_entry(
    db: &Database,
    account_id: &str,
    entry_id: &str,
) -> StorageResult<Option<OfflineEntryRecord>> {
    db.with_connection(|conn| {
        conn.query_row(
            &format!(
                "SELECT {SELECT_COLUMNS}
                FROM offline_entries
                WHERE account_id = ? AND entry_id = ?"
            ),
            params![account_id, entry_id],
            map_offline_entry,
        )
        .optional()
        .map_err(|e| Error::storage(format!("failed to read offline entry {entry_id}: {e}")))
    })
}

pub fn delete_offline_entry(db: &Database, account_id: &str, entry_id: &str) -> StorageResult<()> {
    db.with_connection(|conn| {
        conn.execute(
            "DELETE FROM offline_entries WHERE account_id = ? AND entry_id = ?",
            params![account_id, entry_id],
        )
        .map_err(|e| Error::storage(format!("failed to delete offline entry {entry_id}: {e}")))?;
        Ok(())
    })
}

/// 批量删除，单个事务内完成，避免级联删除只执行了一半。
pub fn delete_offline_entries(db: &Database, account_id: &str, entry_ids: &[String]) -> StorageResult<()> {
    if entry_ids.is_empty() {
        return Ok(());
    }
    db.with_connection(|conn| {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::storage(format!("failed to begin transaction: {e}")))?;
        for entry_id in entry_ids {
            tx.execute(
                "DELETE FROM offline_entries WHERE account_id = ? AND entry_id = ?",
                params![account_id, entry_id],
            )
            .map_err(|e| Error::storage(format!("failed to delete offline entry {entry_id}: {e}")))?;
        }
        tx.commit()
            .map_err(|e| Error::storage(format!("failed to commit offline entry removal: {e}")))
    })
}

fn map_offline_entry(row: &Row) -> rusqlite::Result<OfflineEntryRecord> {
    Ok(OfflineEntryRecord {
        account_id: row.get(0)?,
        entry_id: row.get(1)?,
        parent_id: row.get(2)?,
        entry_type: row.get(3)?,
        name: row.get(4)?,
        path: row.get(5)?,
        mime_type: row.get(6)?,
        properties: row.get(7)?,
        modified_secs: row.get(8)?,
        is_offline: row.get::<_, i64>(9)? != 0,
        direction: row.get(10)?,
        byte_size: row.get(11)?,
        status: row.get(12)?,
        retry_count: row.get(13)?,
        last_error: row.get(14)?,
        local_path: row.get(15)?,
        next_attempt_at_millis: row.get(16)?,
        created_at_millis: row.get(17)?,
        updated_at_millis: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(account: &str, id: &str) -> OfflineEntryRecord {
        OfflineEntryRecord {
            account_id: account.to_string(),
            entry_id: id.to_string(),
            parent_id: None,
            entry_type: "file".to_string(),
            name: format!("{id}.txt"),
            path: None,
            mime_type: Some("text/plain".to_string()),
            properties: Some("{}".to_string()),
            modified_secs: Some(1_700_000_000),
            is_offline: true,
            direction: 0,
            byte_size: 12,
            status: "pending".to_string(),
            retry_count: 0,
            last_error: None,
            local_path: None,
            next_attempt_at_millis: None,
            created_at_millis: 1,
            updated_at_millis: 1,
        }
    }

    #[test]
    fn test_records_are_scoped_by_account() {
        let db = Database::open_in_memory().unwrap();
        upsert_offline_entry(&db, &record("alice", "n1")).unwrap();
        upsert_offline_entry(&db, &record("bob", "n1")).unwrap();

        assert_eq!(load_offline_entries(&db, "alice").unwrap().len(), 1);
        delete_offline_entry(&db, "alice", "n1").unwrap();
        assert!(load_offline_entry(&db, "alice", "n1").unwrap().is_none());
        assert!(load_offline_entry(&db, "bob", "n1").unwrap().is_some());
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let db = Database::open_in_memory().unwrap();
        let mut rec = record("alice", "n1");
        upsert_offline_entry(&db, &rec).unwrap();
        rec.status = "synced".to_string();
        rec.retry_count = 2;
        upsert_offline_entry(&db, &rec).unwrap();

        let rows = load_offline_entries(&db, "alice").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "synced");
        assert_eq!(rows[0].retry_count, 2);
    }

    #[test]
    fn test_legacy_table_gains_deadline_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE offline_entries (
                account_id TEXT NOT NULL,
                entry_id TEXT NOT NULL,
                parent_id TEXT,
                entry_type TEXT NOT NULL,
                name TEXT NOT NULL,
                path TEXT,
                mime_type TEXT,
                properties TEXT,
                modified_secs INTEGER,
                is_offline INTEGER NOT NULL,
                direction INTEGER NOT NULL,
                byte_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                last_error TEXT,
                local_path TEXT,
                created_at_millis INTEGER NOT NULL,
                updated_at_millis INTEGER NOT NULL,
                PRIMARY KEY (account_id, entry_id)
            );",
        )
        .unwrap();
        migrate_offline_table(&conn).unwrap();
        migrate_offline_table(&conn).unwrap();

        let db = Database::from_connection(conn).unwrap();
        let mut rec = record("alice", "n1");
        rec.next_attempt_at_millis = Some(5_000);
        upsert_offline_entry(&db, &rec).unwrap();
        let loaded = load_offline_entry(&db, "alice", "n1").unwrap().unwrap();
        assert_eq!(loaded.next_attempt_at_millis, Some(5_000));

        rec.next_attempt_at_millis = None;
        upsert_offline_entry(&db, &rec).unwrap();
        let loaded = load_offline_entry(&db, "alice", "n1").unwrap().unwrap();
        assert_eq!(loaded.next_attempt_at_millis, None);
    }

    #[test]
    fn test_batch_delete() {
        let db = Database::open_in_memory().unwrap();
        for id in ["a", "b", "c"] {
            upsert_offline_entry(&db, &record("alice", id)).unwrap();
        }
        delete_offline_entries(&db, "alice", &["a".to_string(), "c".to_string()]).unwrap();
        let rows = load_offline_entries(&db, "alice").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry_id, "b");
    }
}
