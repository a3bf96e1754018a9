use std::convert::TryFrom;

use anyhow::{anyhow, Result};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_within_range() {
        assert_eq!(to_i64(300_000).unwrap(), 300_000);
        assert_eq!(to_u64(5_000, "consecutive_ms").unwrap(), 5_000);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(to_i64(u64::MAX).is_err());
        let err = to_u64(-1, "consecutive_ms").unwrap_err();
        assert!(err.to_string().contains("consecutive_ms"));
    }
}
