//! 短信去重存储
//!
//! 只追加。每条短信按内容派生的去重键入库，`INSERT OR IGNORE`
//! 让重复写入（重试、API 与抓取两个渠道、多个会话并发同步）全部收敛。

use rusqlite::{params, Connection, Row, Transaction};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::provider::RawMessage;
use crate::storage::deduplication::DedupKeyer;
use crate::storage::entities::Message;
use crate::storage::SharedConnection;
use crate::utils::from_millis;

/// 单条写入的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    /// 是否真的插入了新行（false 表示命中已有去重键）
    pub inserted: bool,
    pub dedup_key: String,
}

#[derive(Debug, Clone)]
pub struct MessageStore {
    conn: SharedConnection,
    keyer: DedupKeyer,
}

impl MessageStore {
    pub fn new(conn: SharedConnection, keyer: DedupKeyer) -> Self {
        Self { conn, keyer }
    }

    pub async fn upsert(&self, rental_id: &str, raw: &RawMessage) -> Result<UpsertOutcome> {
        let conn = self.conn.lock().await;
        insert_one(&conn, &self.keyer, rental_id, raw)
    }

    /// 一次事务写入一批短信，返回新插入的条数
    pub async fn upsert_batch(&self, rental_id: &str, batch: &[RawMessage]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let inserted = insert_all(&tx, &self.keyer, rental_id, batch)?;
        tx.commit()?;

        debug!(
            "短信批量入库: rental_id={}, 收到 {} 条, 新增 {} 条",
            rental_id,
            batch.len(),
            inserted
        );
        Ok(inserted)
    }

    /// 按接收时间排序，时间相同再按去重键，保证多次读取顺序稳定
    pub async fn list(&self, rental_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, rental_id, sender, body, received_at, source, dedup_key
             FROM messages WHERE rental_id = ?1
             ORDER BY received_at ASC, dedup_key ASC",
        )?;
        let rows = stmt.query_map(params![rental_id], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub async fn count(&self, rental_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE rental_id = ?1",
            params![rental_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// 删除一个租用的全部短信；只在手动号码物理删除的事务里调用
pub(crate) fn delete_for_rental(conn: &Connection, rental_id: &str) -> Result<usize> {
    let deleted = conn.execute("DELETE FROM messages WHERE rental_id = ?1", params![rental_id])?;
    Ok(deleted)
}

fn insert_one(
    conn: &Connection,
    keyer: &DedupKeyer,
    rental_id: &str,
    raw: &RawMessage,
) -> Result<UpsertOutcome> {
    let dedup_key = keyer.key(rental_id, &raw.sender, &raw.body, raw.received_at);
    let changed = conn.execute(
        "INSERT OR IGNORE INTO messages (id, rental_id, sender, body, received_at, source, dedup_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            rental_id,
            raw.sender.trim(),
            raw.body.trim(),
            raw.received_at.timestamp_millis(),
            raw.source.as_str(),
            dedup_key,
        ],
    )?;
    Ok(UpsertOutcome {
        inserted: changed > 0,
        dedup_key,
    })
}

fn insert_all(
    tx: &Transaction<'_>,
    keyer: &DedupKeyer,
    rental_id: &str,
    batch: &[RawMessage],
) -> Result<usize> {
    let mut inserted = 0;
    for raw in batch {
        if insert_one(tx, keyer, rental_id, raw)?.inserted {
            inserted += 1;
        }
    }
    Ok(inserted)
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let source: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        rental_id: row.get(1)?,
        sender: row.get(2)?,
        body: row.get(3)?,
        received_at: from_millis(row.get(4)?),
        source: source.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        dedup_key: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::MessageSource;
    use crate::storage::open_database;
    use chrono::{TimeZone, Utc};

    fn raw(sender: &str, body: &str, secs: u32, source: MessageSource) -> RawMessage {
        RawMessage {
            sender: sender.to_string(),
            body: body.to_string(),
            received_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, secs).unwrap(),
            source,
        }
    }

    async fn store() -> MessageStore {
        MessageStore::new(open_database(None).await.unwrap(), DedupKeyer::new(60))
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = store().await;
        let msg = raw("WhatsApp", "code 123456", 5, MessageSource::ProviderApi);

        let first = store.upsert("r1", &msg).await.unwrap();
        let second = store.upsert("r1", &msg).await.unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.dedup_key, second.dedup_key);
        assert_eq!(store.count("r1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_api_and_scrape_converge() {
        let store = store().await;
        let from_api = raw("Telegram", "Login code: 55821", 3, MessageSource::ProviderApi);
        let from_page = raw(" Telegram ", "Login code:\n  55821", 40, MessageSource::Scrape);

        let inserted = store
            .upsert_batch("r1", &[from_api.clone(), from_page])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        // 再同步一次同样的批次，不会产生新行
        assert_eq!(store.upsert_batch("r1", &[from_api]).await.unwrap(), 0);

        let listed = store.list("r1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].source, MessageSource::ProviderApi);
    }

    #[tokio::test]
    async fn test_list_order_is_stable() {
        let store = store().await;
        store
            .upsert_batch(
                "r1",
                &[
                    raw("B", "second", 30, MessageSource::ProviderApi),
                    raw("A", "first", 1, MessageSource::ProviderApi),
                ],
            )
            .await
            .unwrap();
        store.upsert("r2", &raw("C", "other rental", 2, MessageSource::ManualTest)).await.unwrap();

        let listed = store.list("r1").await.unwrap();
        let bodies: Vec<_> = listed.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);

        let again = store.list("r1").await.unwrap();
        assert_eq!(listed, again);

        let conn = store.conn.lock().await;
        assert_eq!(delete_for_rental(&conn, "r1").unwrap(), 2);
        drop(conn);
        assert_eq!(store.count("r2").await.unwrap(), 1);
    }
}
