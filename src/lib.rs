pub mod billing;
pub mod config;
pub mod deadline;
pub mod error;
pub mod extractor;
pub mod pipeline;
pub mod providers;
pub mod routes;
pub mod store;

pub use billing::{CreditLedger, UsageLimiter};
pub use deadline::{spawn_with_deadline, with_deadline, DeadlineConfig, DeadlineExceeded};
pub use pipeline::{AnalysisPipeline, PipelineError, PipelineSettings};
pub use store::{DocumentStore, MemoryStore, PgDocumentStore};
