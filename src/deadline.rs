use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time;

/// key: deadline -> hard time budget for async work
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} (budget {}ms)", budget.as_millis())]
pub struct DeadlineExceeded {
    pub message: String,
    pub budget: Duration,
}

/// Classes of work that carry their own default budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    DocumentParsing,
    Chat,
    Run,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineConfig {
    pub document_parsing: Duration,
    pub chat: Duration,
    pub run: Duration,
}

impl DeadlineConfig {
    pub fn budget(&self, class: OperationClass) -> Duration {
        match class {
            OperationClass::DocumentParsing => self.document_parsing,
            OperationClass::Chat => self.chat,
            OperationClass::Run => self.run,
        }
    }
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            document_parsing: Duration::from_secs(120),
            chat: Duration::from_secs(60),
            run: Duration::from_secs(300),
        }
    }
}

/// Races `operation` against a timer of length `budget`.
///
/// The operation's own result or error is returned unchanged when it wins. When the timer
/// wins the operation future is dropped, which cancels it at its next suspension point, and
/// the caller receives `DeadlineExceeded` converted into its error type. A timeout means the
/// outcome is unknown: side effects the operation already started may still land.
///
/// Calls nest freely; the innermost expiring budget fires first and the timer is released
/// on every exit path.
pub async fn with_deadline<F, T, E>(
    operation: F,
    budget: Duration,
    on_timeout: impl Into<String>,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<DeadlineExceeded>,
{
    match time::timeout(budget, operation).await {
        Ok(result) => result,
        Err(_) => Err(E::from(DeadlineExceeded {
            message: on_timeout.into(),
            budget,
        })),
    }
}

/// Like [`with_deadline`] but for work that must not be torn down mid-flight.
///
/// The operation runs on its own task. On timeout the task is left to finish in the
/// background and whatever it produces is discarded.
pub async fn spawn_with_deadline<F, T, E>(
    operation: F,
    budget: Duration,
    on_timeout: impl Into<String>,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<DeadlineExceeded> + From<JoinError> + Send + 'static,
{
    let handle = tokio::spawn(operation);
    match time::timeout(budget, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(E::from(join_error)),
        Err(_) => Err(E::from(DeadlineExceeded {
            message: on_timeout.into(),
            budget,
        })),
    }
}
