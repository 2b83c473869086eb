//! 租用登记表
//!
//! 规范状态的唯一来源。状态机：
//!
//! ```text
//! requested ──rent()──▶ active ──时间到──▶ expired
//!                         │  ▲
//!                         │  └── extend（只改到期时间）
//!                         └──cancel()──▶ cancelled
//! ```
//!
//! expired / cancelled 是终态，没有任何出边。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SmsHubError};
use crate::provider::ProviderKind;
use crate::storage::entities::{NativeIds, NewRental, Rental, RentalStatus};
use crate::storage::{message_store, SharedConnection};
use crate::utils::from_millis;

const RENTAL_COLUMNS: &str = "id, phone_number, provider, native_ids, service_code, country_code, \
     status, leased_at, expires_at, assignee, access_credentials, manual";

/// 列表过滤条件
#[derive(Debug, Clone, Default)]
pub struct RentalFilter {
    pub assignee: Option<String>,
    pub status: Option<RentalStatus>,
}

/// 租用登记表
#[derive(Debug, Clone)]
pub struct RentalRegistry {
    conn: SharedConnection,
}

impl RentalRegistry {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// 新建租用记录
    ///
    /// 手动登记的号码按供应商标识幂等：同一个标识重复登记直接返回已有记录。
    /// 供应商下发的所有标识都会逐条落库。
    pub async fn create_rental(&self, new: NewRental) -> Result<Rental> {
        if new.native_ids.is_empty() {
            return Err(SmsHubError::InvalidArgument(
                "租用记录至少需要一个供应商标识".to_string(),
            ));
        }
        if new.expires_at < new.leased_at {
            return Err(SmsHubError::InvalidArgument(
                "到期时间不能早于租用时间".to_string(),
            ));
        }

        let mut conn = self.conn.lock().await;

        if new.manual {
            if let Some(existing) = find_by_native_ids(&conn, new.provider, &new.native_ids)? {
                info!(
                    "♻️ 手动登记的号码已存在，直接复用: rental_id={}, phone={}",
                    existing.id, existing.phone_number
                );
                return Ok(existing);
            }
        }

        let rental = Rental {
            id: Uuid::new_v4().to_string(),
            phone_number: new.phone_number,
            provider: new.provider,
            native_ids: new.native_ids,
            service_code: new.service_code,
            country_code: new.country_code,
            status: RentalStatus::Active,
            leased_at: new.leased_at,
            expires_at: new.expires_at,
            assignee: new.assignee,
            access_credentials: new.access_credentials,
            manual: new.manual,
        };

        let native_ids_json = serde_json::to_string(&rental.native_ids)?;
        let credentials_json = rental
            .access_credentials
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO rentals ({}, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                RENTAL_COLUMNS
            ),
            params![
                rental.id,
                rental.phone_number,
                rental.provider.as_str(),
                native_ids_json,
                rental.service_code,
                rental.country_code,
                rental.status.as_str(),
                rental.leased_at.timestamp_millis(),
                rental.expires_at.timestamp_millis(),
                rental.assignee,
                credentials_json,
                rental.manual,
                Utc::now().timestamp_millis(),
            ],
        )?;
        for (kind, native_id) in rental.native_ids.iter() {
            tx.execute(
                "INSERT INTO rental_native_ids (rental_id, provider, id_kind, native_id) VALUES (?1, ?2, ?3, ?4)",
                params![rental.id, rental.provider.as_str(), kind.as_str(), native_id],
            )?;
        }
        tx.commit()?;

        info!(
            "✅ 新建租用记录: rental_id={}, provider={}, phone={}, ids={}",
            rental.id,
            rental.provider,
            rental.phone_number,
            rental.native_ids.len()
        );

        Ok(rental)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Rental>> {
        let conn = self.conn.lock().await;
        find_by_id(&conn, id)
    }

    pub async fn get(&self, id: &str) -> Result<Rental> {
        self.find(id)
            .await?
            .ok_or_else(|| SmsHubError::NotFound(format!("rental {}", id)))
    }

    /// 按供应商标识反查（任一角色命中即可）
    pub async fn find_by_native_id(
        &self,
        provider: ProviderKind,
        native_id: &str,
    ) -> Result<Option<Rental>> {
        let conn = self.conn.lock().await;
        let rental_id: Option<String> = conn
            .query_row(
                "SELECT rental_id FROM rental_native_ids WHERE provider = ?1 AND native_id = ?2 LIMIT 1",
                params![provider.as_str(), native_id],
                |row| row.get(0),
            )
            .optional()?;
        match rental_id {
            Some(id) => find_by_id(&conn, &id),
            None => Ok(None),
        }
    }

    pub async fn list(&self, filter: &RentalFilter) -> Result<Vec<Rental>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rentals
             WHERE (?1 IS NULL OR assignee = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY leased_at DESC, id ASC",
            RENTAL_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![filter.assignee, filter.status.map(|s| s.as_str())],
            row_to_rental,
        )?;
        let mut rentals = Vec::new();
        for row in rows {
            rentals.push(row?);
        }
        Ok(rentals)
    }

    /// 更新规范状态
    ///
    /// 同状态是 no-op；终态不允许再迁移。
    pub async fn update_status(&self, id: &str, status: RentalStatus) -> Result<Rental> {
        let conn = self.conn.lock().await;
        let current = get_by_id(&conn, id)?;

        if current.status == status {
            return Ok(current);
        }
        if current.status.is_terminal() {
            return Err(SmsHubError::AlreadyTerminal {
                rental_id: current.id,
                status: current.status,
            });
        }

        conn.execute(
            "UPDATE rentals SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'active'",
            params![status.as_str(), Utc::now().timestamp_millis(), id],
        )?;
        info!("🔄 租用状态变更: rental_id={}, {} -> {}", id, current.status, status);

        Ok(Rental { status, ..current })
    }

    /// 延长到期时间，绝不往回拨
    pub async fn extend_expiry(&self, id: &str, new_expiry: DateTime<Utc>) -> Result<Rental> {
        let conn = self.conn.lock().await;
        let current = get_by_id(&conn, id)?;

        if current.status.is_terminal() {
            return Err(SmsHubError::AlreadyTerminal {
                rental_id: current.id,
                status: current.status,
            });
        }
        if new_expiry <= current.expires_at {
            debug!(
                "到期时间未前进，保持不变: rental_id={}, current={}, requested={}",
                id, current.expires_at, new_expiry
            );
            return Ok(current);
        }

        conn.execute(
            "UPDATE rentals SET expires_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_expiry.timestamp_millis(), Utc::now().timestamp_millis(), id],
        )?;
        info!("⏩ 延长租用: rental_id={}, {} -> {}", id, current.expires_at, new_expiry);

        Ok(Rental {
            expires_at: new_expiry,
            ..current
        })
    }

    /// 分配使用人
    ///
    /// 已分配给别人时需要显式 `force` 才能改派；`None` 表示释放。
    pub async fn assign(&self, id: &str, assignee: Option<&str>, force: bool) -> Result<Rental> {
        let conn = self.conn.lock().await;
        let current = get_by_id(&conn, id)?;

        if current.assignee.as_deref() == assignee {
            return Ok(current);
        }
        if let (Some(existing), Some(_)) = (current.assignee.as_deref(), assignee) {
            if !force {
                return Err(SmsHubError::AlreadyAssigned {
                    rental_id: current.id.clone(),
                    assignee: existing.to_string(),
                });
            }
        }

        conn.execute(
            "UPDATE rentals SET assignee = ?1, updated_at = ?2 WHERE id = ?3",
            params![assignee, Utc::now().timestamp_millis(), id],
        )?;
        info!(
            "👤 分配租用: rental_id={}, {:?} -> {:?} (force={})",
            id, current.assignee, assignee, force
        );

        Ok(Rental {
            assignee: assignee.map(str::to_string),
            ..current
        })
    }

    /// 已到期但还标着 active 的记录，先落成 expired 再做后续操作
    pub async fn reconcile_expiry(&self, id: &str, now: DateTime<Utc>) -> Result<Rental> {
        let current = self.get(id).await?;
        if current.status == RentalStatus::Active && current.is_elapsed(now) {
            return self.update_status(id, RentalStatus::Expired).await;
        }
        Ok(current)
    }

    /// 批量把到期的 active 记录置为 expired，返回受影响的 id
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM rentals WHERE status = 'active' AND expires_at <= ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![now.timestamp_millis()], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        tx.execute(
            "UPDATE rentals SET status = 'expired', updated_at = ?1 WHERE status = 'active' AND expires_at <= ?2",
            params![Utc::now().timestamp_millis(), now.timestamp_millis()],
        )?;
        tx.commit()?;

        if !ids.is_empty() {
            info!("⏰ {} 条租用已到期", ids.len());
        }
        Ok(ids)
    }

    /// 物理删除手动登记的号码和它的全部短信；供应商租用记录不允许删除
    ///
    /// 登记记录和短信在同一个事务里删除，任何一步失败都整体回滚。
    /// 返回删除的短信条数（记录不存在时返回 `None`，保证幂等）。
    pub async fn delete_manual(&self, id: &str) -> Result<Option<usize>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let Some(current) = find_by_id(&tx, id)? else {
            return Ok(None);
        };
        if !current.manual {
            return Err(SmsHubError::InvalidOperation(format!(
                "rental {} 由供应商租用，只能取消不能删除",
                id
            )));
        }
        let removed_messages = message_store::delete_for_rental(&tx, id)?;
        tx.execute("DELETE FROM rentals WHERE id = ?1", params![id])?;
        tx.commit()?;
        info!(
            "🗑️ 删除手动登记的号码: rental_id={}, phone={}, messages={}",
            id, current.phone_number, removed_messages
        );
        Ok(Some(removed_messages))
    }
}

fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Rental>> {
    let rental = conn
        .query_row(
            &format!("SELECT {} FROM rentals WHERE id = ?1", RENTAL_COLUMNS),
            params![id],
            row_to_rental,
        )
        .optional()?;
    Ok(rental)
}

fn get_by_id(conn: &Connection, id: &str) -> Result<Rental> {
    find_by_id(conn, id)?.ok_or_else(|| SmsHubError::NotFound(format!("rental {}", id)))
}

fn find_by_native_ids(
    conn: &Connection,
    provider: ProviderKind,
    native_ids: &NativeIds,
) -> Result<Option<Rental>> {
    for (kind, native_id) in native_ids.iter() {
        let rental_id: Option<String> = conn
            .query_row(
                "SELECT rental_id FROM rental_native_ids WHERE provider = ?1 AND id_kind = ?2 AND native_id = ?3",
                params![provider.as_str(), kind.as_str(), native_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = rental_id {
            return find_by_id(conn, &id);
        }
    }
    Ok(None)
}

fn row_to_rental(row: &Row<'_>) -> rusqlite::Result<Rental> {
    let provider: String = row.get(2)?;
    let native_ids: String = row.get(3)?;
    let status: String = row.get(6)?;
    let credentials: Option<String> = row.get(10)?;

    Ok(Rental {
        id: row.get(0)?,
        phone_number: row.get(1)?,
        provider: provider.parse().map_err(|e| conversion_error(2, e))?,
        native_ids: serde_json::from_str(&native_ids).map_err(|e| conversion_error(3, e))?,
        service_code: row.get(4)?,
        country_code: row.get(5)?,
        status: status.parse().map_err(|e| conversion_error(6, e))?,
        leased_at: from_millis(row.get(7)?),
        expires_at: from_millis(row.get(8)?),
        assignee: row.get(9)?,
        access_credentials: credentials
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| conversion_error(10, e))?,
        manual: row.get(11)?,
    })
}

fn conversion_error<E>(column: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
}
