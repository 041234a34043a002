//! PostgreSQL implementation of [`QueueStore`].

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, instrument, warn};

use super::{
    QueueStore, claimed_batch_id,
    errors::{Result, StoreError},
};
use crate::types::{BatchId, ClaimedBatch, MessageStatus, Personalisation, QueueRecord};

#[derive(Debug, FromRow)]
struct QueueRow {
    nhs_number: String,
    message_id: Option<String>,
    batch_id: Option<String>,
    routing_plan_id: String,
    message_status: String,
    variable_text_1: Option<String>,
    address_line_1: Option<String>,
    address_line_2: Option<String>,
    address_line_3: Option<String>,
    address_line_4: Option<String>,
    address_line_5: Option<String>,
    postcode: Option<String>,
    gp_practice_name: Option<String>,
}

impl TryFrom<QueueRow> for QueueRecord {
    type Error = StoreError;

    fn try_from(row: QueueRow) -> Result<Self> {
        let message_status = row
            .message_status
            .parse::<MessageStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(QueueRecord {
            nhs_number: row.nhs_number,
            message_id: row.message_id,
            batch_id: row.batch_id,
            routing_plan_id: row.routing_plan_id,
            message_status,
            personalisation: Personalisation {
                variable_text_1: row.variable_text_1,
                address_line_1: row.address_line_1,
                address_line_2: row.address_line_2,
                address_line_3: row.address_line_3,
                address_line_4: row.address_line_4,
                address_line_5: row.address_line_5,
                postcode: row.postcode,
                gp_practice_name: row.gp_practice_name,
            },
        })
    }
}

/// Queue store backed by the `message_queue` table.
#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run one single-row update in its own transaction, rolling back unless exactly
    /// `expect_rows` (when given) rows were touched.
    async fn update_in_transaction(&self, query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>, expect_rows: Option<u64>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        match query.execute(&mut *tx).await {
            Ok(done) => {
                let affected = done.rows_affected();
                if let Some(expected) = expect_rows
                    && affected != expected
                {
                    tx.rollback().await?;
                    return Err(StoreError::Other(anyhow::anyhow!(
                        "expected to update {expected} record(s), matched {affected}"
                    )));
                }
                tx.commit().await?;
                Ok(affected)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e.into())
            }
        }
    }
}

fn into_records(rows: Vec<QueueRow>) -> Vec<QueueRecord> {
    rows.into_iter()
        .filter_map(|row| match QueueRecord::try_from(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable queue row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self), err)]
    async fn claim_next_batch(&self, batch_id: &str) -> Result<Option<ClaimedBatch>> {
        let routing_plan_id: Option<String> = sqlx::query_scalar("SELECT claim_next_batch($1)")
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(routing_plan_id.map(|routing_plan_id| ClaimedBatch {
            batch_id: batch_id.to_string(),
            routing_plan_id,
        }))
    }

    #[instrument(skip(self))]
    async fn fetch_recipients(&self, batch_id: &str) -> Vec<QueueRecord> {
        let rows = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT nhs_number, message_id, batch_id, routing_plan_id, message_status,
                   variable_text_1, address_line_1, address_line_2, address_line_3,
                   address_line_4, address_line_5, postcode, gp_practice_name
            FROM message_queue
            WHERE batch_id = $1
            ORDER BY id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => into_records(rows),
            Err(e) => {
                error!(error = %e, "Failed to fetch recipients");
                Vec::new()
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn message_reference_exists(&self, message_id: &str) -> Result<bool> {
        let exists = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM message_queue WHERE message_id = $1)")
            .bind(message_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    #[instrument(skip(self, record), fields(nhs_number = %record.nhs_number), err)]
    async fn assign_message_reference(&self, record: &QueueRecord, message_id: &str) -> Result<()> {
        let batch_id = claimed_batch_id(record)?;
        let query = sqlx::query(
            r#"
            UPDATE message_queue
            SET message_id = $1, updated_at = now()
            WHERE batch_id = $2 AND nhs_number = $3 AND message_id IS NULL
            "#,
        )
        .bind(message_id)
        .bind(batch_id)
        .bind(&record.nhs_number);

        self.update_in_transaction(query, Some(1)).await?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(nhs_number = %record.nhs_number), err)]
    async fn release_claim(&self, record: &QueueRecord) -> Result<()> {
        let batch_id = claimed_batch_id(record)?;
        let query = sqlx::query(
            r#"
            UPDATE message_queue
            SET batch_id = NULL, message_id = NULL, updated_at = now()
            WHERE batch_id = $1 AND nhs_number = $2 AND message_status = 'new'
            "#,
        )
        .bind(batch_id)
        .bind(&record.nhs_number);

        self.update_in_transaction(query, None).await?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(nhs_number = %record.nhs_number), err)]
    async fn set_status(&self, record: &QueueRecord, status: MessageStatus) -> Result<()> {
        let batch_id = claimed_batch_id(record)?;
        let query = sqlx::query(
            r#"
            UPDATE message_queue
            SET message_status = $1, updated_at = now()
            WHERE batch_id = $2 AND nhs_number = $3
              AND message_status_rank(message_status) < message_status_rank($1)
            "#,
        )
        .bind(status.as_str())
        .bind(batch_id)
        .bind(&record.nhs_number);

        let affected = self.update_in_transaction(query, None).await?;
        if affected == 0 {
            debug!(%status, "Status unchanged, record already at or past target");
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn update_status_by_reference(&self, batch_id: &str, message_id: &str, status: MessageStatus) -> Result<i32> {
        let mut tx = self.pool.begin().await?;

        let code = sqlx::query_scalar::<_, i32>("SELECT update_message_status($1, $2, $3)")
            .bind(batch_id)
            .bind(message_id)
            .bind(status.as_str())
            .fetch_one(&mut *tx)
            .await;

        match code {
            Ok(code) => {
                tx.commit().await?;
                Ok(code)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self))]
    async fn fetch_batch_ids_with_status(&self, status: MessageStatus) -> Vec<BatchId> {
        let batch_ids = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT batch_id FROM message_queue WHERE message_status = $1 AND batch_id IS NOT NULL ORDER BY batch_id",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await;

        batch_ids.unwrap_or_else(|e| {
            error!(error = %e, "Failed to fetch batch ids");
            Vec::new()
        })
    }

    #[instrument(skip(self), err)]
    async fn find_by_message_reference(&self, message_id: &str) -> Result<Option<QueueRecord>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT nhs_number, message_id, batch_id, routing_plan_id, message_status,
                   variable_text_1, address_line_1, address_line_2, address_line_3,
                   address_line_4, address_line_5, postcode, gp_practice_name
            FROM message_queue
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueRecord::try_from).transpose()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
