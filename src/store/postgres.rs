use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;

use super::{DocumentStore, StoreError, TransactionFn, TransactionOutcome, TransactionStep};

/// key: document-store-postgres -> jsonb documents with row locks
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let value: Option<Value> =
            sqlx::query_scalar("SELECT value FROM documents WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.filter(|value| !value.is_null()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO documents (key, value) VALUES ($1, $2)
            ON CONFLICT (key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn run_transaction(
        &self,
        key: &str,
        apply: &mut TransactionFn<'_>,
    ) -> Result<TransactionOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|err| classify(key, err))?;

        // Placeholder row gives FOR UPDATE something to lock on first use; it is rolled
        // back with the transaction when the body aborts.
        sqlx::query(
            "INSERT INTO documents (key, value) VALUES ($1, 'null'::jsonb) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .execute(&mut tx)
        .await
        .map_err(|err| classify(key, err))?;

        let current: Value =
            sqlx::query_scalar("SELECT value FROM documents WHERE key = $1 FOR UPDATE")
                .bind(key)
                .fetch_one(&mut tx)
                .await
                .map_err(|err| classify(key, err))?;
        let current = Some(current).filter(|value| !value.is_null());

        match apply(current.as_ref()) {
            TransactionStep::Abort => {
                tx.rollback().await.map_err(|err| classify(key, err))?;
                Ok(TransactionOutcome::Aborted)
            }
            TransactionStep::Commit(write) => {
                sqlx::query("UPDATE documents SET value = $2, updated_at = NOW() WHERE key = $1")
                    .bind(key)
                    .bind(&write.document)
                    .execute(&mut tx)
                    .await
                    .map_err(|err| classify(key, err))?;

                for entry in &write.appends {
                    sqlx::query("INSERT INTO document_log (collection, value) VALUES ($1, $2)")
                        .bind(&entry.collection)
                        .bind(&entry.value)
                        .execute(&mut tx)
                        .await
                        .map_err(|err| classify(key, err))?;
                }

                tx.commit().await.map_err(|err| classify(key, err))?;
                debug!(%key, appends = write.appends.len(), "document transaction committed");
                Ok(TransactionOutcome::Committed(write.document))
            }
        }
    }

    async fn log(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let rows: Vec<Value> = sqlx::query_scalar(
            "SELECT value FROM document_log WHERE collection = $1 ORDER BY id ASC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn classify(key: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        // serialization_failure, deadlock_detected
        if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
            return StoreError::Conflict(key.to_string());
        }
    }
    StoreError::Database(err)
}
