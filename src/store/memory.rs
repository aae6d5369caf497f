use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    DocumentStore, StoreError, TransactionFn, TransactionOutcome, TransactionStep,
};

/// key: document-store-memory -> process-local backend
///
/// Transactions on one key run under that key's async mutex, so they are serialized and
/// never report a conflict.
#[derive(Default)]
pub struct MemoryStore {
    documents: DashMap<String, Value>,
    logs: DashMap<String, Vec<Value>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.documents.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.documents.insert(key.to_string(), value);
        Ok(())
    }

    async fn run_transaction(
        &self,
        key: &str,
        apply: &mut TransactionFn<'_>,
    ) -> Result<TransactionOutcome, StoreError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let current = self.documents.get(key).map(|entry| entry.value().clone());
        match apply(current.as_ref()) {
            TransactionStep::Abort => Ok(TransactionOutcome::Aborted),
            TransactionStep::Commit(write) => {
                for entry in write.appends {
                    self.logs
                        .entry(entry.collection)
                        .or_insert_with(Vec::new)
                        .push(entry.value);
                }
                self.documents.insert(key.to_string(), write.document.clone());
                Ok(TransactionOutcome::Committed(write.document))
            }
        }
    }

    async fn log(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .logs
            .get(collection)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}
