use crate::db::{self, Database};
use crate::error::Result;

const PROCESS_ENABLED_KEY: &str = "process_enabled";

/// 流程（工作流）功能开关，默认关闭。
pub fn get_process_enabled(db: &Database) -> Result<bool> {
    Ok(db::get_setting(db, PROCESS_ENABLED_KEY)?
        .map(|value| matches!(value.trim(), "1" | "true"))
        .unwrap_or(false))
}

pub fn set_process_enabled(db: &Database, enabled: bool) -> Result<bool> {
    db::set_setting(db, PROCESS_ENABLED_KEY, if enabled { "true" } else { "false" })?;
    Ok(enabled)
}
