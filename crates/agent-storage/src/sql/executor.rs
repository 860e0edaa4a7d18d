//! The capability every backend client provides to the stores
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::sql::builder::Query;
use crate::sql::dialect::Dialect;
use crate::sql::value::{SqlRow, SqlValue};

/// A connection able to run rendered statements. All store logic is written
/// against this trait; only the SQL text it receives is dialect-specific.
pub trait Executor {
    fn dialect(&self) -> Dialect;

    fn run_query(&self, query: &Query) -> Result<Vec<SqlRow>>;

    /// Returns the number of affected rows.
    fn run_statement(&self, query: &Query) -> Result<usize>;

    /// Runs parameterless SQL (DDL, transaction control).
    fn run_script(&self, sql: &str) -> Result<()>;

    fn query_one(&self, query: &Query) -> Result<Option<SqlRow>> {
        Ok(self.run_query(query)?.into_iter().next())
    }

    /// First column of the first row as a non-negative count.
    fn query_count(&self, query: &Query) -> Result<u64> {
        let count = match self.query_one(query)?.as_ref().and_then(|row| row.value_at(0)) {
            Some(SqlValue::Integer(n)) => *n,
            Some(SqlValue::Text(s)) => s.parse().unwrap_or_default(),
            Some(SqlValue::Real(f)) => *f as i64,
            _ => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

/// Runs `f` inside one transaction: commit when it returns `Ok`, rollback on
/// any error. Backends without transactions run `f` directly.
pub fn scoped_transaction<T, F>(exec: &dyn Executor, f: F) -> Result<T>
where
    F: FnOnce(&dyn Executor) -> Result<T>,
{
    let dialect = exec.dialect();
    if !dialect.supports_transactions() {
        return f(exec);
    }

    exec.run_script(dialect.begin_transaction())?;
    match f(exec) {
        Ok(value) => {
            if let Err(e) = exec.run_script("COMMIT") {
                rollback(exec, &e);
                return Err(e);
            }
            Ok(value)
        }
        Err(e) => {
            rollback(exec, &e);
            Err(e)
        }
    }
}

fn rollback(exec: &dyn Executor, cause: &StorageError) {
    debug!("Rolling back transaction after {}", cause.id);
    if let Err(e) = exec.run_script("ROLLBACK") {
        warn!("Rollback failed after {}: {}", cause.id, e);
    }
}
