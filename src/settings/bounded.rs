use std::fmt::Display;
use std::str::FromStr;

use crate::db::{self, Database};
use crate::error::{Error, Result};

/// 设置表中带取值区间的数值项。
///
/// 读取时缺失返回默认值，越界的存量值截断到区间内；写入时越界直接拒绝。
#[derive(Clone, Copy, Debug)]
pub(crate) struct BoundedSetting<T> {
    pub(crate) key: &'static str,
    label: &'static str,
    min: T,
    max: T,
    default: T,
}

impl<T> BoundedSetting<T> {
    pub(crate) const fn new(key: &'static str, label: &'static str, min: T, max: T, default: T) -> Self {
        Self {
            key,
            label,
            min,
            max,
            default,
        }
    }
}

impl<T> BoundedSetting<T>
where
    T: Copy + Ord + Display + FromStr,
    T::Err: Display,
{
    pub(crate) fn default_value(&self) -> T {
        self.default
    }

    pub(crate) fn load(&self, db: &Database) -> Result<T> {
        match db::get_setting(db, self.key)? {
            Some(raw) => self.parse(&raw),
            None => Ok(self.default),
        }
    }

    pub(crate) fn store(&self, db: &Database, value: T) -> Result<T> {
        if value < self.min || value > self.max {
            return Err(Error::Configuration(format!(
                "{} must be between {} and {}",
                self.label, self.min, self.max
            )));
        }
        db::set_setting(db, self.key, &value.to_string())?;
        Ok(value)
    }

    fn parse(&self, raw: &str) -> Result<T> {
        let parsed = raw
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Configuration(format!("invalid {} value: {e}", self.label)))?;
        Ok(parsed.clamp(self.min, self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SAMPLE: BoundedSetting<u32> = BoundedSetting::new("sample", "sample", 2, 6, 4);

    #[rstest]
    #[case("1", 2)]
    #[case(" 5 ", 5)]
    #[case("99", 6)]
    fn test_stored_values_are_clamped(#[case] raw: &str, #[case] expected: u32) {
        let db = Database::open_in_memory().unwrap();
        db::set_setting(&db, SAMPLE.key, raw).unwrap();
        assert_eq!(SAMPLE.load(&db).unwrap(), expected);
    }

    #[test]
    fn test_garbage_is_a_configuration_error() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(SAMPLE.load(&db).unwrap(), 4);
        db::set_setting(&db, SAMPLE.key, "many").unwrap();
        assert!(matches!(SAMPLE.load(&db), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_store_rejects_out_of_range() {
        let db = Database::open_in_memory().unwrap();
        assert!(SAMPLE.store(&db, 7).is_err());
        assert_eq!(SAMPLE.store(&db, 6).unwrap(), 6);
        assert_eq!(SAMPLE.load(&db).unwrap(), 6);
    }
}
