use std::time::Duration;

use super::bounded::BoundedSetting;
use crate::db::Database;
use crate::error::Result;

pub const MIN_RETRY_BUDGET: u32 = 1;
pub const MAX_RETRY_BUDGET: u32 = 10;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

const RETRY_BUDGET: BoundedSetting<u32> = BoundedSetting::new(
    "transfer_retry_budget",
    "retry budget",
    MIN_RETRY_BUDGET,
    MAX_RETRY_BUDGET,
    3,
);

/// 退避基数，以毫秒存储。
const RETRY_BASE_DELAY_MILLIS: BoundedSetting<u64> = BoundedSetting::new(
    "transfer_retry_base_delay_millis",
    "retry base delay (ms)",
    100,
    600_000,
    2_000,
);

/// 网络类失败的重试策略：预算次数 + 指数退避。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub budget: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: RETRY_BUDGET.default_value(),
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MILLIS.default_value()),
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间：base * 2^(attempt-1)，封顶 max_delay。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// 已用掉的重试次数是否耗尽预算。
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.budget
    }
}

pub fn get_retry_policy(db: &Database) -> Result<RetryPolicy> {
    Ok(RetryPolicy {
        budget: RETRY_BUDGET.load(db)?,
        base_delay: Duration::from_millis(RETRY_BASE_DELAY_MILLIS.load(db)?),
        max_delay: MAX_RETRY_DELAY,
    })
}

pub fn set_retry_budget(db: &Database, budget: u32) -> Result<u32> {
    RETRY_BUDGET.store(db, budget)
}

pub fn set_retry_base_delay(db: &Database, delay: Duration) -> Result<Duration> {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    RETRY_BASE_DELAY_MILLIS.store(db, millis)?;
    Ok(delay)
}
