// agent-storage/crates/agent-storage/src/lib.rs

pub mod config;
pub mod error;
pub mod memory_db;
pub mod metrics;
pub mod sql;
pub mod telemetry;

// Public API exports
pub use config::StorageConfig;
pub use error::{ErrorCategory, ErrorDomain, Result, StorageError};
pub use memory_db::{
    AgentStorage, ConversationStore, EvalQuery, EvalStore, IncludeSpec, MessageFormat, MessagesArgs,
    Page, PageRequest, PaginatedMessagesArgs, ResourceStore, StoreOperations, ThreadOrder,
    ThreadOrderField, TraceQuery, TraceStore, WorkflowRunsQuery, WorkflowStore,
};
pub use sql::Dialect;
