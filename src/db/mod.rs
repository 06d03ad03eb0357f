use crate::error::Error;
use directories::ProjectDirs;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

mod offline_entries;
mod settings;

pub use offline_entries::{
    delete_offline_entries, delete_offline_entry, load_offline_entries, load_offline_entry,
    upsert_offline_entry, OfflineEntryRecord,
};
pub use settings::{get_setting, set_setting};

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "ContentSync";
const APPLICATION: &str = "ContentSync";
const DB_FILE_NAME: &str = "offline.db";

pub type StorageResult<T> = Result<T, Error>;

/// SQLite 连接句柄。单连接 + 互斥锁，所有写入天然串行。
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// 打开（必要时创建）指定路径的数据库，并执行建表迁移。
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                Error::from_io(e, format!("failed to create database directory {dir:?}"))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::storage(format!("failed to open SQLite database: {e}")))?;
        debug!(path = %path.display(), "opened offline database");
        Self::with_migrations(conn)
    }

    /// 使用平台数据目录下的默认数据库文件。
    pub fn open_default() -> StorageResult<Self> {
        Self::open(default_database_path()?)
    }

    /// 内存数据库，不打 `#[cfg(test)]`，方便宿主在自己的测试里复用。
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage(format!("failed to open in-memory database: {e}")))?;
        Self::with_migrations(conn)
    }

    #[cfg(test)]
    pub(crate) fn from_connection(conn: Connection) -> StorageResult<Self> {
        Self::with_migrations(conn)
    }

    fn with_migrations(conn: Connection) -> StorageResult<Self> {
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_connection<T, F>(&self, operation: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        operation(&conn)
    }
}

fn apply_migrations(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        format!(
            "{}\n{}",
            offline_entries::OFFLINE_TABLE_SCHEMA,
            settings::SETTINGS_TABLE_SCHEMA,
        )
        .as_str(),
    )
    .map_err(|e| Error::storage(format!("failed to initialize database schema: {e}")))?;
    offline_entries::migrate_offline_table(conn)
}

pub fn default_database_path() -> StorageResult<PathBuf> {
    Ok(project_dirs()?.data_dir().join(DB_FILE_NAME))
}

/// 默认的内容缓存根目录。
pub fn default_cache_root() -> StorageResult<PathBuf> {
    Ok(project_dirs()?.cache_dir().join("content"))
}

fn project_dirs() -> StorageResult<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION).ok_or_else(|| {
        Error::storage("failed to resolve application data directory".to_string())
    })
}

pub(crate) fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(apply_migrations).unwrap();
        let count: i64 = db
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('offline_entries', 'settings')",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| Error::storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("offline.db");
        let db = Database::open(&path).unwrap();
        drop(db);
        assert!(path.exists());
    }
}
