//! Device registration repository.
//!
//! A registration row carries the encrypted device token plus its SHA-256
//! hash; lookups go through the hash. The logical key for idempotent
//! upserts is (token_hash, ups_id, environment, server_id,
//! installation_id) — `IS NOT DISTINCT FROM` keeps the nullable parts of
//! the key honest.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;
use vlt_schemas::Environment;

#[derive(Debug, Clone)]
pub struct NewDeviceRegistration {
    pub ups_id: String,
    /// Trimmed; empty aliases are stored as null.
    pub ups_alias: Option<String>,
    /// AES-GCM ciphertext of the raw device token, base64.
    pub device_token_ciphertext: String,
    /// SHA-256 hex of the raw device token.
    pub token_hash: String,
    pub installation_id: Option<Uuid>,
    pub server_id: Option<Uuid>,
    pub ups_hidden: bool,
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Updated,
}

/// Idempotent register: a second call with identical inputs leaves one
/// row and reports `Updated`.
pub async fn register_device(
    pool: &PgPool,
    reg: &NewDeviceRegistration,
) -> Result<RegisterOutcome> {
    let existing: Option<(Uuid,)> = sqlx::query_as::<_, (Uuid,)>(
        r#"
        select id from devices
        where token_hash = $1
          and ups_id = $2
          and environment = $3
          and server_id is not distinct from $4
          and installation_id is not distinct from $5
        "#,
    )
    .bind(&reg.token_hash)
    .bind(&reg.ups_id)
    .bind(reg.environment.as_str())
    .bind(reg.server_id)
    .bind(reg.installation_id)
    .fetch_optional(pool)
    .await
    .context("register_device lookup failed")?;

    match existing {
        Some((id,)) => {
            sqlx::query(
                "update devices set ups_alias = $2, ups_hidden = $3, device_token = $4 \
                 where id = $1",
            )
            .bind(id)
            .bind(&reg.ups_alias)
            .bind(reg.ups_hidden)
            .bind(&reg.device_token_ciphertext)
            .execute(pool)
            .await
            .context("register_device update failed")?;
            Ok(RegisterOutcome::Updated)
        }
        None => {
            sqlx::query(
                r#"
                insert into devices (
                  id, ups_id, ups_alias, device_token, token_hash,
                  installation_id, server_id, ups_hidden, environment
                ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&reg.ups_id)
            .bind(&reg.ups_alias)
            .bind(&reg.device_token_ciphertext)
            .bind(&reg.token_hash)
            .bind(reg.installation_id)
            .bind(reg.server_id)
            .bind(reg.ups_hidden)
            .bind(reg.environment.as_str())
            .execute(pool)
            .await
            .context("register_device insert failed")?;
            Ok(RegisterOutcome::Created)
        }
    }
}

/// Idempotent unregister; deleting an absent registration is not an error.
/// Returns the number of rows removed.
pub async fn unregister_device(
    pool: &PgPool,
    token_hash: &str,
    ups_id: &str,
    environment: Environment,
) -> Result<u64> {
    let result = sqlx::query(
        "delete from devices where token_hash = $1 and ups_id = $2 and environment = $3",
    )
    .bind(token_hash)
    .bind(ups_id)
    .bind(environment.as_str())
    .execute(pool)
    .await
    .context("unregister_device failed")?;
    Ok(result.rows_affected())
}

/// Total registrations; the Relay update fan-out skips when zero.
pub async fn count_devices(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>("select count(*)::bigint from devices")
        .fetch_one(pool)
        .await
        .context("count_devices failed")?;
    Ok(n)
}
