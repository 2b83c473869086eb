//! 时间处理工具模块
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（INTEGER）
//! - **业务层**: 统一使用 `chrono::DateTime<Utc>`
//! - **供应商层**: 各家时间格式五花八门，统一在这里解析

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// 毫秒时间戳 -> DateTime<Utc>（越界时回落到 UNIX 纪元）
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// 计算时间分桶编号，用于去重键
pub fn time_bucket(at: DateTime<Utc>, bucket_secs: u64) -> i64 {
    let bucket = bucket_secs.max(1) as i64;
    at.timestamp().div_euclid(bucket)
}

/// 没有时区信息的格式一律按 UTC 处理
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// 解析供应商返回的时间戳
///
/// 支持 RFC3339、UNIX 秒 / 毫秒，以及常见的无时区格式
pub fn parse_provider_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    if value.chars().all(|c| c.is_ascii_digit()) {
        let number: i64 = value.parse().ok()?;
        // 13 位按毫秒，其余按秒
        return if value.len() >= 13 {
            Utc.timestamp_millis_opt(number).single()
        } else {
            Utc.timestamp_opt(number, 0).single()
        };
    }

    NAIVE_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(value, fmt)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();

        assert_eq!(parse_provider_timestamp("2024-03-01T12:30:05Z"), Some(expected));
        assert_eq!(parse_provider_timestamp("2024-03-01 12:30:05"), Some(expected));
        assert_eq!(parse_provider_timestamp(" 01/03/2024 12:30:05 "), Some(expected));
        assert_eq!(
            parse_provider_timestamp(&expected.timestamp().to_string()),
            Some(expected)
        );
        assert_eq!(
            parse_provider_timestamp(&expected.timestamp_millis().to_string()),
            Some(expected)
        );
        assert_eq!(parse_provider_timestamp("5 minutes ago"), None);
        assert_eq!(parse_provider_timestamp(""), None);
    }

    #[test]
    fn test_time_bucket() {
        let a = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 59).unwrap();
        let c = Utc.with_ymd_and_hms(2024, 3, 1, 12, 31, 0).unwrap();

        assert_eq!(time_bucket(a, 60), time_bucket(b, 60));
        assert_ne!(time_bucket(b, 60), time_bucket(c, 60));
        // bucket 为 0 时按 1 秒处理
        assert_ne!(time_bucket(a, 0), time_bucket(b, 0));
    }
}
