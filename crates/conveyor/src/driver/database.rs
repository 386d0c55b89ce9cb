use super::Driver;
use crate::clock::Clock;
use crate::envelope::{after, Envelope, Payload};
use crate::error::{QueueError, Result};
use crate::registry::ConnectorContext;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TABLE: &str = "jobs";
const DEFAULT_MAX_CONNECTIONS: u64 = 5;
const COLUMNS: &str = "id, queue, payload, attempts, available_at, reserved_until, created_at";

/// Postgres table-backed queue
///
/// One row per job. Leases are taken with `FOR UPDATE SKIP LOCKED`, so
/// any number of workers can poll the same table without handing a row
/// to two of them.
#[derive(Debug, Clone)]
pub struct DatabaseDriver {
    connection: String,
    queue: String,
    retry_after: Duration,
    pool: Pool<Postgres>,
    table_name: String,
    clock: Arc<dyn Clock>,
}

impl DatabaseDriver {
    pub fn new(
        connection: &str,
        pool: Pool<Postgres>,
        table_name: &str,
        queue: &str,
        retry_after: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        validate_table_name(table_name)?;
        Ok(Self {
            connection: connection.to_string(),
            queue: queue.to_string(),
            retry_after,
            pool,
            table_name: table_name.to_string(),
            clock,
        })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn ensure_schema(&self) -> Result<()> {
        let table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                seq BIGSERIAL NOT NULL,
                queue TEXT NOT NULL,
                payload JSONB NOT NULL,
                attempts INT NOT NULL DEFAULT 0,
                available_at TIMESTAMPTZ NOT NULL,
                reserved_until TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            self.table_name
        );
        let index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_queue_available ON {} (queue, available_at, seq)",
            self.table_name, self.table_name
        );

        sqlx::query(&table).execute(&self.pool).await?;
        sqlx::query(&index).execute(&self.pool).await?;

        Ok(())
    }

    async fn insert<'e, E>(&self, executor: E, envelope: &Envelope) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let query = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table_name, COLUMNS
        );

        sqlx::query(&query)
            .bind(&envelope.id)
            .bind(&envelope.queue)
            .bind(Json(&envelope.payload))
            .bind(envelope.attempts as i32)
            .bind(envelope.available_at)
            .bind(envelope.reserved_until)
            .bind(envelope.created_at)
            .execute(executor)
            .await?;

        Ok(())
    }
}

/// Connector for the `database` driver type.
///
/// Options: `url` (required), `table` (default `jobs`),
/// `max_connections` (default 5), `migrate` (default true).
pub async fn connect(ctx: ConnectorContext) -> Result<Arc<dyn Driver>> {
    let url = ctx.config.require_str("url")?;
    let table = ctx.config.option_str("table").unwrap_or(DEFAULT_TABLE);
    let max_connections = ctx
        .config
        .option_u64("max_connections")
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections as u32)
        .connect(url)
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?;

    let driver = DatabaseDriver::new(
        &ctx.name,
        pool,
        table,
        &ctx.config.queue,
        ctx.config.retry_after_duration(),
        ctx.clock.clone(),
    )?;

    let migrate = ctx
        .config
        .options
        .get("migrate")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(true);
    if migrate {
        driver.ensure_schema().await?;
    }

    Ok(Arc::new(driver))
}

/// The table name is spliced into SQL text, so only plain identifiers pass
fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(QueueError::Configuration(format!(
            "invalid queue table name [{}]",
            name
        )))
    }
}

fn envelope_from_row(row: &PgRow) -> Result<Envelope> {
    let payload: Json<Payload> = row.try_get("payload")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(Envelope {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        payload: payload.0,
        attempts: attempts.max(0) as u32,
        available_at: row.try_get("available_at")?,
        reserved_until: row.try_get("reserved_until")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Driver for DatabaseDriver {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn driver_type(&self) -> &'static str {
        "database"
    }

    fn default_queue(&self) -> &str {
        &self.queue
    }

    fn retry_after(&self) -> Duration {
        self.retry_after
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<String> {
        self.insert(&self.pool, &envelope).await?;
        Ok(envelope.id)
    }

    async fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        for envelope in &envelopes {
            self.insert(&mut *tx, envelope).await?;
        }
        tx.commit().await?;

        Ok(envelopes.into_iter().map(|e| e.id).collect())
    }

    async fn dequeue_lease(&self, queue: &str, lease: Duration) -> Result<Option<Envelope>> {
        let now = self.clock.now();
        // Claim and lease in one statement; SKIP LOCKED keeps competing
        // workers off rows another transaction is already claiming.
        let query = format!(
            r#"
            UPDATE {table}
            SET attempts = attempts + 1, reserved_until = $3
            WHERE id = (
                SELECT id
                FROM {table}
                WHERE queue = $1
                  AND ((reserved_until IS NULL AND available_at <= $2) OR reserved_until <= $2)
                ORDER BY available_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {columns}
            "#,
            table = self.table_name,
            columns = COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(queue)
            .bind(now)
            .bind(after(now, lease))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(envelope_from_row).transpose()
    }

    async fn acknowledge(&self, id: &str) -> Result<()> {
        self.delete(id).await
    }

    async fn release(&self, id: &str, delay: Duration) -> Result<()> {
        // A fresh sequence puts the job behind others available at the same instant
        let query = format!(
            "UPDATE {} SET reserved_until = NULL, available_at = $2, seq = DEFAULT WHERE id = $1",
            self.table_name
        );

        sqlx::query(&query)
            .bind(id)
            .bind(after(self.clock.now(), delay))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE id = $1", self.table_name);

        sqlx::query(&query).bind(id).execute(&self.pool).await?;

        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        let query = format!("SELECT COUNT(*) FROM {} WHERE queue = $1", self.table_name);

        let count: i64 = sqlx::query_scalar(&query)
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::validate_table_name;

    #[test]
    fn table_names_are_plain_identifiers() {
        assert!(validate_table_name("jobs").is_ok());
        assert!(validate_table_name("queue_jobs_2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2jobs").is_err());
        assert!(validate_table_name("jobs; DROP TABLE users").is_err());
    }
}
