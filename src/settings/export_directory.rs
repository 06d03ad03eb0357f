use std::path::{Path, PathBuf};

use directories::UserDirs;

use crate::db::{self, Database};
use crate::error::{Error, Result};

const EXPORT_DIR_KEY: &str = "export_directory";

/// Download/Export 写入的用户可见目录；未设置时为系统下载目录下的应用子目录。
pub fn get_export_directory(db: &Database) -> Result<PathBuf> {
    db::get_setting(db, EXPORT_DIR_KEY)?
        .map(PathBuf::from)
        .map_or_else(default_export_directory, Ok)
}

/// 只接受绝对路径，首尾空白会被去掉。
pub fn set_export_directory(db: &Database, path: &str) -> Result<PathBuf> {
    let trimmed = path.trim();
    if trimmed.is_empty() || !Path::new(trimmed).is_absolute() {
        return Err(Error::Configuration(format!(
            "export directory must be an absolute path, got {path:?}"
        )));
    }
    db::set_setting(db, EXPORT_DIR_KEY, trimmed)?;
    Ok(PathBuf::from(trimmed))
}

pub fn default_export_directory() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| {
        Error::Configuration("failed to resolve the user's download directory".to_string())
    })?;
    let base = dirs.download_dir().unwrap_or_else(|| dirs.home_dir());
    Ok(base.join("ContentSync"))
}
