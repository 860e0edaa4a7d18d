// agent-storage/crates/agent-storage/src/config.rs

use std::env;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::sql::identifier::parse_sql_identifier;

pub const DEFAULT_POOL_SIZE: u32 = 10;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_PER_PAGE: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub pool_size: u32,
    /// Namespace for tables (Postgres/ClickHouse) and prefix for index names.
    pub schema_name: Option<String>,
    pub busy_timeout_ms: u64,
    pub default_per_page: usize,
    pub create_automatic_indexes: bool,
}

impl StorageConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            pool_size: DEFAULT_POOL_SIZE,
            schema_name: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            default_per_page: DEFAULT_PER_PAGE,
            create_automatic_indexes: true,
        }
    }

    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("AGENT_STORAGE_DB_PATH")
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                StorageError::user(
                    "STORAGE_CONFIG_MISSING_FIELD",
                    "AGENT_STORAGE_DB_PATH environment variable not set",
                )
                .with_detail("field", "db_path")
            })?;

        let config = Self {
            db_path: PathBuf::from(db_path),
            pool_size: parse_var(&lookup, "AGENT_STORAGE_POOL_SIZE", DEFAULT_POOL_SIZE)?,
            schema_name: lookup("AGENT_STORAGE_SCHEMA").filter(|s| !s.is_empty()),
            busy_timeout_ms: parse_var(&lookup, "AGENT_STORAGE_BUSY_TIMEOUT_MS", DEFAULT_BUSY_TIMEOUT_MS)?,
            default_per_page: parse_var(&lookup, "AGENT_STORAGE_DEFAULT_PER_PAGE", DEFAULT_PER_PAGE)?,
            create_automatic_indexes: parse_var(&lookup, "AGENT_STORAGE_AUTO_INDEXES", true)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(invalid_field("pool_size", "must be at least 1"));
        }
        if self.default_per_page == 0 {
            return Err(invalid_field("default_per_page", "must be at least 1"));
        }
        if let Some(schema) = &self.schema_name {
            parse_sql_identifier(schema, "schema")?;
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Storage configuration:");
        info!("- Database: {}", self.db_path.display());
        info!("- Pool size: {}", self.pool_size);
        info!("- Schema: {}", self.schema_name.as_deref().unwrap_or("(default)"));
        info!("- Busy timeout: {}ms", self.busy_timeout_ms);
        info!("- Default page size: {}", self.default_per_page);
        info!("- Automatic indexes: {}", self.create_automatic_indexes);
    }
}

fn invalid_field(field: &str, reason: &str) -> StorageError {
    StorageError::user("STORAGE_CONFIG_INVALID_FIELD", format!("{field} {reason}"))
        .with_detail("field", field)
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            StorageError::user(
                "STORAGE_CONFIG_INVALID_FIELD",
                format!("{key} has invalid value {raw:?}"),
            )
            .with_detail("field", key)
        }),
    }
}
