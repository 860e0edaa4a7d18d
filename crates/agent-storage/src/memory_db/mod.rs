//! Memory database module - pooled SQLite storage for threads, messages,
//! resources, traces, evals and workflow snapshots
pub mod schema;
pub mod migration;
pub mod pagination;
pub mod operations;
pub mod indexes;
pub mod message_format;
pub mod conversation_store;
pub mod resource_store;
pub mod trace_store;
pub mod eval_store;
pub mod workflow_store;
pub use schema::*;
pub use pagination::{Page, PageRequest};
pub use operations::StoreOperations;
pub use message_format::{MessageFormat, MessageList};
pub use conversation_store::{ConversationStore, IncludeSpec, MessagesArgs, PaginatedMessagesArgs, ThreadOrder, ThreadOrderField};
pub use resource_store::ResourceStore;
pub use trace_store::{TraceQuery, TraceStore};
pub use eval_store::{EvalQuery, EvalStore};
pub use workflow_store::{WorkflowRunsQuery, WorkflowStore};

use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::sql::builder::QueryBuilder;
use crate::sql::dialect::Dialect;
use crate::sql::executor::Executor;
use crate::sql::identifier::Ident;

/// Resolves logical names into quoted, schema-qualified SQL for one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaContext {
    dialect: Dialect,
    schema: Option<Ident>,
}

impl SchemaContext {
    pub fn new(dialect: Dialect, schema_name: Option<&str>) -> Result<Self> {
        let schema = schema_name.map(Ident::new).transpose()?;
        Ok(Self { dialect, schema })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn schema(&self) -> Option<&Ident> {
        self.schema.as_ref()
    }

    pub fn builder(&self) -> QueryBuilder {
        QueryBuilder::new(self.dialect)
    }

    /// Validated, quoted and qualified table name.
    pub fn table(&self, name: &str) -> Result<String> {
        Ok(self.dialect.qualify(self.schema.as_ref(), &Ident::table(name)?))
    }

    pub fn col(&self, name: &str) -> Result<String> {
        Ok(self.dialect.quote(&Ident::column(name)?))
    }

    pub fn select_list(&self, columns: &[&str]) -> Result<String> {
        Ok(columns
            .iter()
            .map(|c| self.col(c))
            .collect::<Result<Vec<_>>>()?
            .join(", "))
    }

    /// Index names are global in some backends, so they carry the schema.
    pub fn index_name(&self, base: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}_{base}"),
            None => base.to_string(),
        }
    }
}

/// Connection pool plus the rendering context every store shares.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    context: SchemaContext,
    config: StorageConfig,
}

impl Database {
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        info!("Opening agent storage at: {}", config.db_path.display());
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::third_party("STORAGE_OPEN_FAILED", e)
                        .with_detail("path", config.db_path.display().to_string())
                })?;
            }
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(&config.db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA synchronous = NORMAL;",
                )
            });
        let pool = Pool::builder().max_size(config.pool_size).build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }

        let context = SchemaContext::new(Dialect::Sqlite, config.schema_name.as_deref())?;
        info!("Agent storage pool ready ({} connections)", config.pool_size);
        Ok(Self { pool, context, config })
    }

    /// Each in-memory connection is its own database, so the pool holds
    /// exactly one connection and never recycles it.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        let mut config = StorageConfig::new(":memory:");
        config.pool_size = 1;
        Ok(Self {
            pool,
            context: SchemaContext::new(Dialect::Sqlite, None)?,
            config,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn context(&self) -> &SchemaContext {
        &self.context
    }

    /// Runs `f` on one pooled connection off the async runtime.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Executor, &SchemaContext) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let context = self.context.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&*conn, &context)
        })
        .await?
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.config.db_path.as_os_str() == ":memory:" {
            return;
        }
        match self.pool.try_get() {
            Some(conn) => {
                if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                    warn!("WAL checkpoint on close failed: {}", e);
                } else {
                    debug!("WAL checkpoint completed on close");
                }
            }
            None => debug!("No idle connection for WAL checkpoint on close"),
        }
    }
}

/// Owns the pool and every store built on it.
pub struct AgentStorage {
    pub operations: StoreOperations,
    pub conversations: ConversationStore,
    pub resources: ResourceStore,
    pub traces: TraceStore,
    pub evals: EvalStore,
    pub workflows: WorkflowStore,
    db: Arc<Database>,
}

impl AgentStorage {
    pub fn new(config: StorageConfig) -> Result<Self> {
        Ok(Self::from_database(Database::open(config)?))
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    fn from_database(db: Database) -> Self {
        let db = Arc::new(db);
        Self {
            operations: StoreOperations::new(Arc::clone(&db)),
            conversations: ConversationStore::new(Arc::clone(&db)),
            resources: ResourceStore::new(Arc::clone(&db)),
            traces: TraceStore::new(Arc::clone(&db)),
            evals: EvalStore::new(Arc::clone(&db)),
            workflows: WorkflowStore::new(Arc::clone(&db)),
            db,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        self.db.config()
    }

    /// Creates every table, applies forward column migrations and, when
    /// configured, provisions the automatic indexes.
    pub async fn init(&self) -> Result<()> {
        crate::metrics::init_metrics();
        migration::initialize(&self.operations).await?;
        if self.config().create_automatic_indexes {
            let created = self.operations.create_automatic_indexes().await;
            info!("Automatic indexes ready: {}", created.join(", "));
        }
        info!("Agent storage initialized successfully");
        Ok(())
    }
}
