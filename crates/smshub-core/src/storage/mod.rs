//! 存储层
//!
//! 单个 SQLite 连接（`data_dir` 为空时使用内存库，仅限会话内），
//! 由租用登记表和短信去重库共享。

pub mod deduplication;
pub mod entities;
pub mod message_store;
pub mod migrate;
pub mod rental_registry;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Result, SmsHubError};

pub use deduplication::DedupKeyer;
pub use entities::{Message, MessageSource, NativeIdKind, NativeIds, NewRental, Rental, RentalStatus};
pub use message_store::{MessageStore, UpsertOutcome};
pub use rental_registry::{RentalFilter, RentalRegistry};

/// 数据库文件名
const DB_FILE_NAME: &str = "smshub.db";

/// 共享连接
pub type SharedConnection = Arc<Mutex<Connection>>;

/// 打开（或创建）数据库并执行 migrations
pub async fn open_database(data_dir: Option<&Path>) -> Result<SharedConnection> {
    let mut conn = match data_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SmsHubError::IO(format!("创建数据目录失败: {}", e)))?;
            let db_path = dir.join(DB_FILE_NAME);
            info!("📂 打开数据库: {}", db_path.display());
            Connection::open(&db_path)
                .map_err(|e| SmsHubError::Database(format!("打开数据库失败: {}", e)))?
        }
        None => {
            info!("📂 使用内存数据库（会话级）");
            Connection::open_in_memory()
                .map_err(|e| SmsHubError::Database(format!("打开内存数据库失败: {}", e)))?
        }
    };

    migrate::init_db(&mut conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_on_disk_database_twice() {
        let temp_dir = TempDir::new().unwrap();

        let first = open_database(Some(temp_dir.path())).await.unwrap();
        drop(first);
        let second = open_database(Some(temp_dir.path())).await.unwrap();
        drop(second);

        assert!(temp_dir.path().join(DB_FILE_NAME).exists());
    }
}
