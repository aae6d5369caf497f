pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgDocumentStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("transaction on `{0}` conflicted with a concurrent writer")]
    Conflict(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Append-only record written in the same transaction as a document update.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub collection: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct TransactionWrite {
    pub document: Value,
    pub appends: Vec<LogEntry>,
}

/// What a transaction body decided after inspecting the current document.
#[derive(Debug, Clone)]
pub enum TransactionStep {
    Commit(TransactionWrite),
    Abort,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Committed(Value),
    Aborted,
}

/// Body of a single-key transaction. It may be invoked more than once by a backend that
/// retries internally, so it must not have side effects beyond its captured state.
pub type TransactionFn<'a> = dyn FnMut(Option<&Value>) -> TransactionStep + Send + 'a;

/// key: document-store -> keyed documents + single-key transactions
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Pure read; never creates the document.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Reads the document under `key`, hands it to `apply`, and applies the returned write
    /// (document plus log appends) atomically. Concurrent transactions on the same key are
    /// serialized; a backend that cannot serialize them reports `StoreError::Conflict`.
    async fn run_transaction(
        &self,
        key: &str,
        apply: &mut TransactionFn<'_>,
    ) -> Result<TransactionOutcome, StoreError>;

    /// Entries appended to `collection`, oldest first.
    async fn log(&self, collection: &str) -> Result<Vec<Value>, StoreError>;
}
