//! Postgres access for the Volteec backend.
//!
//! All writes to the `ups` table go through [`ups`]; device registrations
//! through [`devices`]. Nothing else in the workspace issues SQL.

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use vlt_config::{DatabaseConfig, TlsMode};

pub mod devices;
pub mod ups;

pub use devices::{
    count_devices, register_device, unregister_device, NewDeviceRegistration, RegisterOutcome,
};
pub use ups::{fetch_all, fetch_by_id, register_failure, upsert_snapshot};

/// Connect using the structured database configuration.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let ssl_mode = match config.tls_mode {
        TlsMode::Require => PgSslMode::Require,
        TlsMode::Prefer => PgSslMode::Prefer,
        TlsMode::Disable => PgSslMode::Disable,
    };

    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.username)
        .password(&config.password)
        .database(&config.name)
        .ssl_mode(ssl_mode);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence), used by /ready.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='ups'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_ups_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_ups_table: bool,
}

/// Test helper: connect via `VOLTEEC_TEST_DATABASE_URL` and migrate.
/// Returns `None` when the variable is unset so DB scenarios can skip
/// on machines without a Postgres.
pub async fn testkit_pool() -> Result<Option<PgPool>> {
    let Ok(url) = std::env::var("VOLTEEC_TEST_DATABASE_URL") else {
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .context("failed to connect to test Postgres")?;
    migrate(&pool).await?;
    Ok(Some(pool))
}
