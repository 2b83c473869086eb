use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::utils::time_bucket;

/// 短信去重键生成器
///
/// 去重键只由内容决定：(rental_id, sender, body, 时间桶)。
/// 同一条短信不管从 API 还是抓取渠道进来、重试多少次，都会得到同一个键，
/// 所以入库天然幂等，多个会话并发写入也会收敛到同一结果。
#[derive(Debug, Clone, Copy)]
pub struct DedupKeyer {
    /// 时间桶大小（秒）
    bucket_secs: u64,
}

impl DedupKeyer {
    pub fn new(bucket_secs: u64) -> Self {
        Self {
            bucket_secs: bucket_secs.max(1),
        }
    }

    /// 计算去重键（SHA-256 十六进制）
    pub fn key(&self, rental_id: &str, sender: &str, body: &str, received_at: DateTime<Utc>) -> String {
        let bucket = time_bucket(received_at, self.bucket_secs);

        let mut hasher = Sha256::new();
        hasher.update(rental_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize(sender).as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize(body).as_bytes());
        hasher.update([0u8]);
        hasher.update(bucket.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Default for DedupKeyer {
    fn default() -> Self {
        Self::new(60)
    }
}

/// 去掉首尾空白并把连续空白压成一个空格
///
/// 抓取到的 HTML 文本经常带换行和缩进，API 返回的是干净文本，
/// 归一化之后两个渠道才能对上。
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_is_deterministic() {
        let keyer = DedupKeyer::new(60);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 10).unwrap();

        let a = keyer.key("r1", "WhatsApp", "Your code is 123-456", at);
        let b = keyer.key("r1", "WhatsApp", "Your code is 123-456", at);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_whitespace_differences_converge() {
        let keyer = DedupKeyer::new(60);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 10).unwrap();
        let later_same_bucket = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 50).unwrap();

        let api = keyer.key("r1", "WhatsApp", "Your code is 123-456", at);
        let scraped = keyer.key("r1", " WhatsApp\n", "Your code\n   is 123-456 ", later_same_bucket);
        assert_eq!(api, scraped);
    }

    #[test]
    fn test_key_separates_rentals_and_buckets() {
        let keyer = DedupKeyer::new(60);
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 10).unwrap();
        let next_bucket = Utc.with_ymd_and_hms(2024, 5, 1, 8, 1, 10).unwrap();

        let base = keyer.key("r1", "Telegram", "code 1", at);
        assert_ne!(base, keyer.key("r2", "Telegram", "code 1", at));
        assert_ne!(base, keyer.key("r1", "Telegram", "code 1", next_bucket));
        assert_ne!(base, keyer.key("r1", "Telegram", "code 2", at));
    }
}
