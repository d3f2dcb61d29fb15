//! Read-side seam over the UPS table for the HTTP layer.
//!
//! The poller owns all writes; handlers and the SSE snapshot phase only
//! ever read. Keeping that read path behind a trait lets the scenario
//! tests drive the full router without a Postgres.

use async_trait::async_trait;
use sqlx::PgPool;
use vlt_schemas::UpsRow;

#[async_trait]
pub trait UpsReader: Send + Sync {
    async fn fetch_all(&self) -> anyhow::Result<Vec<UpsRow>>;
    async fn fetch_by_id(&self, ups_id: &str) -> anyhow::Result<Option<UpsRow>>;
}

pub struct PgUpsReader {
    pool: PgPool,
}

impl PgUpsReader {
    pub fn new(pool: PgPool) -> Self {
        PgUpsReader { pool }
    }
}

#[async_trait]
impl UpsReader for PgUpsReader {
    async fn fetch_all(&self) -> anyhow::Result<Vec<UpsRow>> {
        vlt_db::fetch_all(&self.pool).await
    }

    async fn fetch_by_id(&self, ups_id: &str) -> anyhow::Result<Option<UpsRow>> {
        vlt_db::fetch_by_id(&self.pool, ups_id).await
    }
}
