use super::LedgerStore;
use crate::errors::LedgerError;
use crate::models::{Client, TransactionKind};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

/// PostgreSQL ledger over the `clients` / `token_transactions` tables
#[derive(Clone)]
pub struct PgLedger {
    pool: Pool<Postgres>,
}

impl PgLedger {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, LedgerError> {
        info!("Connecting to ledger database...");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        // Test the connection
        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        info!("Ledger database connection verified");

        Ok(PgLedger { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgLedger { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;

        info!("Ledger schema up to date");
        Ok(())
    }

    /// Provision a client row; the ledger itself never creates clients implicitly
    pub async fn create_client(&self, identity: &str) -> Result<Client, LedgerError> {
        let client = sqlx::query_as::<_, Client>(
            r#"
            INSERT INTO clients (auth_token)
            VALUES ($1)
            RETURNING id, auth_token, created_at
            "#,
        )
        .bind(identity)
        .fetch_one(&self.pool)
        .await?;

        Ok(client)
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn append(
        &self,
        identity: &str,
        magnitude: i64,
        kind: TransactionKind,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO token_transactions (client_id, amount, transaction_type)
            SELECT id, $2, $3
            FROM clients
            WHERE auth_token = $1
            "#,
        )
        .bind(identity)
        .bind(magnitude)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::UnknownClient(identity.to_string()));
        }

        Ok(())
    }

    async fn compute_balance(&self, identity: &str) -> Result<i64, LedgerError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(
                CASE WHEN t.transaction_type = 'PURCHASE' THEN t.amount ELSE -t.amount END
            ), 0)::BIGINT
            FROM clients c
            LEFT JOIN token_transactions t ON t.client_id = c.id
            WHERE c.auth_token = $1
            GROUP BY c.id
            "#,
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(balance,)| balance)
            .ok_or_else(|| LedgerError::UnknownClient(identity.to_string()))
    }

    async fn list_clients(&self) -> Result<Vec<String>, LedgerError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT auth_token FROM clients ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(identity,)| identity).collect())
    }
}
