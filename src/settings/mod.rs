mod bounded;
pub mod export_directory;
pub mod features;
pub mod retry_policy;
pub mod transfer_concurrency;

use std::path::PathBuf;

use crate::db::Database;
use crate::error::Result;

pub use export_directory::{default_export_directory, get_export_directory, set_export_directory};
pub use features::{get_process_enabled, set_process_enabled};
pub use retry_policy::{
    get_retry_policy, set_retry_base_delay, set_retry_budget, RetryPolicy, MAX_RETRY_BUDGET,
    MIN_RETRY_BUDGET,
};
pub use transfer_concurrency::{
    default_transfer_concurrency, get_transfer_concurrency, set_transfer_concurrency,
    MAX_TRANSFER_CONCURRENCY, MIN_TRANSFER_CONCURRENCY,
};

/// 引擎启动时一次性读取的全部配置。
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub export_directory: PathBuf,
    pub process_enabled: bool,
}

impl EngineSettings {
    pub fn load(db: &Database) -> Result<Self> {
        Ok(Self {
            max_concurrency: get_transfer_concurrency(db)?,
            retry: get_retry_policy(db)?,
            export_directory: get_export_directory(db)?,
            process_enabled: get_process_enabled(db)?,
        })
    }
}
