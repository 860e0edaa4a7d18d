//! SQLite backend adapter over `rusqlite`
use std::sync::Arc;

use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};

use crate::error::Result;
use crate::sql::builder::Query;
use crate::sql::dialect::Dialect;
use crate::sql::executor::Executor;
use crate::sql::value::{format_timestamp, SqlRow, SqlValue};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Timestamp(ts) => ToSqlOutput::Owned(SqliteValue::Text(format_timestamp(ts))),
            SqlValue::Json(v) => ToSqlOutput::Owned(SqliteValue::Text(v.to_string())),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl Executor for Connection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn run_query(&self, query: &Query) -> Result<Vec<SqlRow>> {
        let mut stmt = self.prepare(&query.sql)?;
        let columns: Arc<[String]> = stmt.column_names().into_iter().map(str::to_string).collect();
        let width = columns.len();

        let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_value_ref(row.get_ref(i)?));
            }
            out.push(SqlRow::new(Arc::clone(&columns), values));
        }
        Ok(out)
    }

    fn run_statement(&self, query: &Query) -> Result<usize> {
        let mut stmt = self.prepare(&query.sql)?;
        Ok(stmt.execute(params_from_iter(query.params.iter()))?)
    }

    fn run_script(&self, sql: &str) -> Result<()> {
        Ok(self.execute_batch(sql)?)
    }
}
