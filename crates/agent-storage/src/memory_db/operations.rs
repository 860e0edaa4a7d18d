//! Generic table operations shared by every store
//!
//! The async methods on [`StoreOperations`] each check out one pooled
//! connection; the free functions below are the same operations for use
//! inside a transaction that already holds a connection.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Result, StorageError, StorageResultExt};
use crate::memory_db::schema::TableName;
use crate::memory_db::{Database, SchemaContext};
use crate::sql::builder::Query;
use crate::sql::executor::{scoped_transaction, Executor};
use crate::sql::identifier::Ident;
use crate::sql::schema::{ColumnType, TableSchema};
use crate::sql::value::{Record, SqlRow};

#[derive(Clone)]
pub struct StoreOperations {
    pub(super) db: Arc<Database>,
}

impl StoreOperations {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, table: &str, record: Record) -> Result<()> {
        let table = table.to_string();
        self.db
            .run(move |exec, ctx| {
                insert_record(exec, ctx, &table, &record)
                    .classify("STORAGE_INSERT_FAILED")
                    .detail("tableName", table.as_str())
            })
            .await
    }

    /// All records or none: the inserts share one transaction.
    pub async fn batch_insert(&self, table: &str, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let table = table.to_string();
        self.db
            .run(move |exec, ctx| {
                batch_insert_records(exec, ctx, &table, &records)
                    .classify("STORAGE_BATCH_INSERT_FAILED")
                    .detail("tableName", table.as_str())
                    .detail("numberOfRecords", records.len())
            })
            .await
    }

    /// The row matching every key, keyed by column name. JSON columns of
    /// the built-in tables come back parsed.
    pub async fn load(&self, table: &str, keys: Record) -> Result<Option<Map<String, Value>>> {
        let table = table.to_string();
        self.db
            .run(move |exec, ctx| {
                load_row(exec, ctx, &table, &keys)
                    .map(|row| row.map(|row| decode_loaded(&table, &row)))
                    .classify("STORAGE_LOAD_FAILED")
                    .detail("tableName", table.as_str())
            })
            .await
    }

    pub async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        let table = table.to_string();
        let schema = schema.clone();
        self.db
            .run(move |exec, ctx| {
                let qualified = ctx.table(&table)?;
                let sql = ctx.dialect().create_table(&qualified, &schema)?;
                debug!("Creating table {}", qualified);
                exec.run_script(&sql)
                    .classify("STORAGE_CREATE_TABLE_FAILED")
                    .detail("tableName", table.as_str())
            })
            .await
    }

    /// Adds each of `columns` that the table lacks. Safe to repeat.
    pub async fn alter_table(&self, table: &str, schema: &TableSchema, columns: &[&str]) -> Result<()> {
        let table = table.to_string();
        let schema = schema.clone();
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        self.db
            .run(move |exec, ctx| {
                alter_table_sync(exec, ctx, &table, &schema, &columns)
                    .classify("STORAGE_ALTER_TABLE_FAILED")
                    .detail("tableName", table.as_str())
            })
            .await
    }

    /// Deletes every row and keeps the table.
    pub async fn clear_table(&self, table: &str) -> Result<()> {
        let table = table.to_string();
        self.db
            .run(move |exec, ctx| {
                let qualified = ctx.table(&table)?;
                exec.run_script(&ctx.dialect().clear_table(&qualified))
                    .classify("STORAGE_CLEAR_TABLE_FAILED")
                    .detail("tableName", table.as_str())?;
                info!("Cleared table {}", qualified);
                Ok(())
            })
            .await
    }

    pub async fn drop_table(&self, table: &str) -> Result<()> {
        let table = table.to_string();
        self.db
            .run(move |exec, ctx| {
                let qualified = ctx.table(&table)?;
                exec.run_script(&ctx.dialect().drop_table(&qualified))
                    .classify("STORAGE_DROP_TABLE_FAILED")
                    .detail("tableName", table.as_str())
            })
            .await
    }

    pub async fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let table = table.to_string();
        let column = column.to_string();
        self.db
            .run(move |exec, ctx| {
                has_column_sync(exec, ctx, &table, &column)
                    .classify("STORAGE_HAS_COLUMN_FAILED")
                    .detail("tableName", table.as_str())
            })
            .await
    }
}

pub(crate) fn insert_query(ctx: &SchemaContext, table: &str, record: &Record) -> Result<Query> {
    if record.is_empty() {
        return Err(StorageError::user(
            "STORAGE_EMPTY_RECORD",
            format!("Cannot insert an empty record into {table}"),
        ));
    }
    let mut qb = ctx.builder();
    qb.push("INSERT INTO ").push(&ctx.table(table)?).push(" (");
    let columns = record.keys().map(|k| ctx.col(k)).collect::<Result<Vec<_>>>()?;
    qb.push(&columns.join(", ")).push(") VALUES (");
    qb.push_bind_list(record.values().cloned()).push(")");
    Ok(qb.build())
}

pub(crate) fn insert_record(exec: &dyn Executor, ctx: &SchemaContext, table: &str, record: &Record) -> Result<()> {
    exec.run_statement(&insert_query(ctx, table, record)?)?;
    Ok(())
}

pub(crate) fn batch_insert_records(
    exec: &dyn Executor,
    ctx: &SchemaContext,
    table: &str,
    records: &[Record],
) -> Result<()> {
    scoped_transaction(exec, |tx| {
        for record in records {
            insert_record(tx, ctx, table, record)?;
        }
        Ok(())
    })
}

/// Insert that replaces `update` columns when a row with the same
/// `conflict` key exists.
pub(crate) fn upsert_record(
    exec: &dyn Executor,
    ctx: &SchemaContext,
    table: &str,
    record: &Record,
    conflict: &[&str],
    update: &[&str],
) -> Result<()> {
    let mut query = insert_query(ctx, table, record)?;
    let conflict = conflict.iter().map(Ident::column).collect::<Result<Vec<_>>>()?;
    let update = update.iter().map(Ident::column).collect::<Result<Vec<_>>>()?;
    query.sql.push_str(&ctx.dialect().upsert_clause(&conflict, &update));
    exec.run_statement(&query)?;
    Ok(())
}

pub(crate) fn load_row(
    exec: &dyn Executor,
    ctx: &SchemaContext,
    table: &str,
    keys: &Record,
) -> Result<Option<SqlRow>> {
    let mut qb = ctx.builder();
    qb.push("SELECT * FROM ").push(&ctx.table(table)?);
    for (column, value) in keys {
        qb.and_where().push(&ctx.col(column)?).push(" = ").push_bind(value.clone());
    }
    qb.push(" LIMIT 1");
    exec.query_one(&qb.build())
}

pub(crate) fn has_column_sync(exec: &dyn Executor, ctx: &SchemaContext, table: &str, column: &str) -> Result<bool> {
    let query = ctx
        .dialect()
        .has_column(ctx.schema(), &Ident::table(table)?, &Ident::column(column)?);
    Ok(exec.query_one(&query)?.is_some())
}

fn alter_table_sync(
    exec: &dyn Executor,
    ctx: &SchemaContext,
    table: &str,
    schema: &TableSchema,
    columns: &[String],
) -> Result<()> {
    let qualified = ctx.table(table)?;
    for column in columns {
        let def = schema.get(column).ok_or_else(|| {
            StorageError::user(
                "STORAGE_UNKNOWN_COLUMN",
                format!("Column {column} is not part of the {table} schema"),
            )
        })?;
        if has_column_sync(exec, ctx, table, column)? {
            continue;
        }
        info!("Adding column {} to {}", column, qualified);
        exec.run_script(&ctx.dialect().add_column(&qualified, &Ident::column(column)?, def))?;
    }
    Ok(())
}

/// Row to JSON object, parsing the JSON columns of known tables. The
/// workflow snapshot is always stored as a JSON string.
fn decode_loaded(table: &str, row: &SqlRow) -> Map<String, Value> {
    let mut object = row.to_json_object();
    let Some(known) = TableName::ALL.into_iter().find(|t| t.as_str() == table) else {
        return object;
    };
    let schema = known.schema();
    for (column, value) in object.iter_mut() {
        let is_json = schema
            .get(column)
            .is_some_and(|def| def.column_type == ColumnType::Jsonb)
            || (known == TableName::WorkflowSnapshot && column == "snapshot");
        if let (true, Value::String(raw)) = (is_json, &*value) {
            if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                *value = parsed;
            }
        }
    }
    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::schema::ColumnDef;
    use crate::sql::value::SqlValue;
    use serde_json::json;

    fn ops() -> StoreOperations {
        StoreOperations::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn record(pairs: &[(&str, SqlValue)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn kv_schema() -> TableSchema {
        TableSchema::new()
            .column("id", ColumnDef::primary_key(ColumnType::Text))
            .column("value", ColumnDef::nullable(ColumnType::Text))
    }

    #[tokio::test]
    async fn test_insert_then_load() {
        let ops = ops();
        ops.create_table("kv", &kv_schema()).await.unwrap();
        ops.insert("kv", record(&[("id", "a".into()), ("value", "one".into())])).await.unwrap();

        let row = ops.load("kv", record(&[("id", "a".into())])).await.unwrap().unwrap();
        assert_eq!(row["value"], json!("one"));
        assert!(ops.load("kv", record(&[("id", "zz".into())])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_failure_is_classified() {
        let ops = ops();
        let err = ops.insert("missing_table", record(&[("id", "a".into())])).await.unwrap_err();
        assert_eq!(err.id, "STORAGE_INSERT_FAILED");
        assert_eq!(err.details["tableName"], json!("missing_table"));
        assert!(!err.is_user());
    }

    #[tokio::test]
    async fn test_batch_insert_is_all_or_nothing() {
        let ops = ops();
        ops.create_table("kv", &kv_schema()).await.unwrap();
        let rows = vec![
            record(&[("id", "a".into())]),
            record(&[("id", "b".into())]),
            record(&[("id", "a".into())]),
        ];
        let err = ops.batch_insert("kv", rows).await.unwrap_err();
        assert_eq!(err.id, "STORAGE_BATCH_INSERT_FAILED");
        assert_eq!(err.details["numberOfRecords"], json!(3));
        assert!(ops.load("kv", record(&[("id", "b".into())])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alter_table_adds_missing_columns_once() {
        let ops = ops();
        ops.create_table("kv", &kv_schema()).await.unwrap();
        let wider = kv_schema().column("extra", ColumnDef::required(ColumnType::Text));
        assert!(!ops.has_column("kv", "extra").await.unwrap());
        ops.alter_table("kv", &wider, &["extra"]).await.unwrap();
        ops.alter_table("kv", &wider, &["extra"]).await.unwrap();
        assert!(ops.has_column("kv", "extra").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_keeps_table_and_drop_removes_it() {
        let ops = ops();
        ops.create_table("kv", &kv_schema()).await.unwrap();
        ops.insert("kv", record(&[("id", "a".into())])).await.unwrap();
        ops.clear_table("kv").await.unwrap();
        assert!(ops.load("kv", record(&[("id", "a".into())])).await.unwrap().is_none());

        ops.drop_table("kv").await.unwrap();
        assert!(ops.load("kv", record(&[("id", "a".into())])).await.is_err());
    }

    #[tokio::test]
    async fn test_unsafe_table_name_is_a_user_error() {
        let ops = ops();
        let err = ops.clear_table("kv; DROP TABLE x").await.unwrap_err();
        assert_eq!(err.id, "STORAGE_INVALID_IDENTIFIER");
        assert!(err.is_user());
    }

    #[tokio::test]
    async fn test_load_parses_workflow_snapshot() {
        let ops = ops();
        let table = TableName::WorkflowSnapshot;
        ops.create_table(table.as_str(), &table.schema()).await.unwrap();
        let now = chrono::Utc::now();
        ops.insert(
            table.as_str(),
            record(&[
                ("workflow_name", "wf".into()),
                ("run_id", "r1".into()),
                ("snapshot", SqlValue::Json(json!({"status": "running"}))),
                ("created_at", now.into()),
                ("updated_at", now.into()),
            ]),
        )
        .await
        .unwrap();

        let row = ops
            .load(table.as_str(), record(&[("workflow_name", "wf".into()), ("run_id", "r1".into())]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["snapshot"], json!({"status": "running"}));
    }
}
