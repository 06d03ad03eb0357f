use super::bounded::BoundedSetting;
use crate::db::Database;
use crate::error::Result;

pub const MIN_TRANSFER_CONCURRENCY: usize = 1;
pub const MAX_TRANSFER_CONCURRENCY: usize = 8;

/// 同时进行的后台传输数。
const CONCURRENCY: BoundedSetting<usize> = BoundedSetting::new(
    "transfer_max_concurrency",
    "transfer concurrency",
    MIN_TRANSFER_CONCURRENCY,
    MAX_TRANSFER_CONCURRENCY,
    3,
);

pub fn get_transfer_concurrency(db: &Database) -> Result<usize> {
    CONCURRENCY.load(db)
}

pub fn set_transfer_concurrency(db: &Database, value: usize) -> Result<usize> {
    CONCURRENCY.store(db, value)
}

pub fn default_transfer_concurrency() -> usize {
    CONCURRENCY.default_value()
}
