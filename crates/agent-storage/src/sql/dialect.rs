//! Per-backend SQL rendering
//!
//! The stores build every statement through this module, so the paging,
//! windowing and merge logic is written once and only the text differs
//! between SQLite, Postgres and ClickHouse.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::sql::builder::{Query, QueryBuilder};
use crate::sql::identifier::Ident;
use crate::sql::schema::{ColumnDef, ColumnType, TableSchema, ValidatedIndex};
use crate::sql::value::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    ClickHouse,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
            Dialect::ClickHouse => "clickhouse",
        }
    }

    pub fn quote(&self, ident: &Ident) -> String {
        match self {
            Dialect::Sqlite | Dialect::Postgres => format!("\"{}\"", ident.as_str()),
            Dialect::ClickHouse => format!("`{}`", ident.as_str()),
        }
    }

    /// SQLite has no schema namespaces; the schema only prefixes index names.
    pub fn qualify(&self, schema: Option<&Ident>, table: &Ident) -> String {
        match (self, schema) {
            (Dialect::Sqlite, _) | (_, None) => self.quote(table),
            (_, Some(schema)) => format!("{}.{}", self.quote(schema), self.quote(table)),
        }
    }

    pub fn placeholder(&self, index: usize, value: &SqlValue) -> String {
        match self {
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Postgres => format!("${index}"),
            Dialect::ClickHouse => {
                let ty = match value {
                    SqlValue::Null => "Nullable(String)",
                    SqlValue::Integer(_) => "Int64",
                    SqlValue::Real(_) => "Float64",
                    SqlValue::Text(_) | SqlValue::Json(_) => "String",
                    SqlValue::Timestamp(_) => "DateTime64(6, 'UTC')",
                };
                format!("{{p{index}:{ty}}}")
            }
        }
    }

    pub fn column_type(&self, ty: ColumnType) -> &'static str {
        match self {
            Dialect::Sqlite => match ty {
                ColumnType::Text | ColumnType::Timestamp | ColumnType::Uuid | ColumnType::Jsonb => "TEXT",
                ColumnType::Integer | ColumnType::Bigint => "INTEGER",
                ColumnType::Float => "REAL",
            },
            Dialect::Postgres => match ty {
                ColumnType::Text => "TEXT",
                ColumnType::Timestamp => "TIMESTAMPTZ",
                ColumnType::Uuid => "UUID",
                ColumnType::Jsonb => "JSONB",
                ColumnType::Integer => "INTEGER",
                ColumnType::Float => "DOUBLE PRECISION",
                ColumnType::Bigint => "BIGINT",
            },
            Dialect::ClickHouse => match ty {
                ColumnType::Text | ColumnType::Uuid | ColumnType::Jsonb => "String",
                ColumnType::Timestamp => "DateTime64(6, 'UTC')",
                ColumnType::Integer | ColumnType::Bigint => "Int64",
                ColumnType::Float => "Float64",
            },
        }
    }

    fn column_definition(&self, column: &Ident, def: &ColumnDef, force_nullable: bool) -> String {
        let ty = self.column_type(def.column_type);
        let nullable = def.nullable || force_nullable;
        match self {
            Dialect::ClickHouse if nullable => format!("{} Nullable({ty})", self.quote(column)),
            Dialect::ClickHouse => format!("{} {ty}", self.quote(column)),
            _ if nullable => format!("{} {ty}", self.quote(column)),
            _ => format!("{} {ty} NOT NULL", self.quote(column)),
        }
    }

    /// ClickHouse has no multi-statement transactions.
    pub fn supports_transactions(&self) -> bool {
        !matches!(self, Dialect::ClickHouse)
    }

    pub fn begin_transaction(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "BEGIN IMMEDIATE TRANSACTION",
            Dialect::Postgres => "BEGIN",
            Dialect::ClickHouse => "",
        }
    }

    /// Text value of `key` inside a JSON column, NULL when absent or null.
    /// `key` must already have passed `parse_field_key`.
    pub fn json_text(&self, quoted_column: &str, key: &str) -> String {
        match self {
            Dialect::Sqlite => format!("CAST(json_extract({quoted_column}, '$.{key}') AS TEXT)"),
            Dialect::Postgres => {
                let path = key.split('.').collect::<Vec<_>>().join(",");
                format!("({quoted_column}::jsonb #>> '{{{path}}}')")
            }
            Dialect::ClickHouse => {
                let path = key
                    .split('.')
                    .map(|s| format!("'{s}'"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("nullIf(JSONExtractString({quoted_column}, {path}), '')")
            }
        }
    }

    /// Suffix for `LIKE` patterns escaped with a backslash.
    pub fn like_escape(&self) -> &'static str {
        match self {
            Dialect::Sqlite | Dialect::Postgres => " ESCAPE '\\'",
            Dialect::ClickHouse => "",
        }
    }

    /// Most-recent-first ordering with a stable tiebreak. SQLite breaks ties
    /// by insertion order through `rowid`; the others fall back to the key.
    pub fn recency_order(&self, created_column: &str, id_column: &str) -> String {
        match self {
            Dialect::Sqlite => format!("{created_column} DESC, rowid DESC"),
            _ => format!("{created_column} DESC, {id_column} DESC"),
        }
    }

    /// `ON CONFLICT` tail of an insert. ClickHouse tables use
    /// `ReplacingMergeTree`, where a plain insert supersedes the old row.
    pub fn upsert_clause(&self, conflict: &[Ident], update: &[Ident]) -> String {
        match self {
            Dialect::ClickHouse => String::new(),
            _ => {
                let target = conflict.iter().map(|c| self.quote(c)).collect::<Vec<_>>().join(", ");
                if update.is_empty() {
                    return format!(" ON CONFLICT ({target}) DO NOTHING");
                }
                let set = update
                    .iter()
                    .map(|c| {
                        let q = self.quote(c);
                        format!("{q} = excluded.{q}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(" ON CONFLICT ({target}) DO UPDATE SET {set}")
            }
        }
    }

    pub fn create_table(&self, qualified: &str, schema: &TableSchema) -> Result<String> {
        let mut columns = Vec::new();
        for (name, def) in schema.columns() {
            columns.push(self.column_definition(&Ident::column(name)?, def, false));
        }
        let key = schema
            .primary_key()
            .into_iter()
            .map(|c| Ident::column(c).map(|i| self.quote(&i)))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        Ok(match self {
            Dialect::ClickHouse => {
                let engine = if schema.has_column("updated_at") {
                    "ReplacingMergeTree(`updated_at`)"
                } else if key.is_empty() {
                    "MergeTree()"
                } else {
                    "ReplacingMergeTree()"
                };
                let order = if key.is_empty() { "tuple()".to_string() } else { format!("({key})") };
                format!(
                    "CREATE TABLE IF NOT EXISTS {qualified} ({}) ENGINE = {engine} ORDER BY {order}",
                    columns.join(", ")
                )
            }
            _ => {
                if !key.is_empty() {
                    columns.push(format!("PRIMARY KEY ({key})"));
                }
                format!("CREATE TABLE IF NOT EXISTS {qualified} ({})", columns.join(", "))
            }
        })
    }

    /// Forward-migration column add. Added columns are always nullable so
    /// existing rows stay valid.
    pub fn add_column(&self, qualified: &str, column: &Ident, def: &ColumnDef) -> String {
        let definition = self.column_definition(column, def, true);
        match self {
            Dialect::Sqlite => format!("ALTER TABLE {qualified} ADD COLUMN {definition}"),
            _ => format!("ALTER TABLE {qualified} ADD COLUMN IF NOT EXISTS {definition}"),
        }
    }

    pub fn clear_table(&self, qualified: &str) -> String {
        match self {
            Dialect::Sqlite => format!("DELETE FROM {qualified}"),
            Dialect::Postgres => format!("TRUNCATE TABLE {qualified} CASCADE"),
            Dialect::ClickHouse => format!("TRUNCATE TABLE IF EXISTS {qualified}"),
        }
    }

    pub fn drop_table(&self, qualified: &str) -> String {
        format!("DROP TABLE IF EXISTS {qualified}")
    }

    pub fn has_column(&self, schema: Option<&Ident>, table: &Ident, column: &Ident) -> Query {
        let mut qb = QueryBuilder::new(*self);
        match self {
            Dialect::Sqlite => {
                qb.push("SELECT 1 FROM pragma_table_info(")
                    .push_bind(table.as_str())
                    .push(") WHERE name = ")
                    .push_bind(column.as_str());
            }
            Dialect::Postgres => {
                qb.push("SELECT 1 FROM information_schema.columns WHERE table_schema = ")
                    .push_bind(schema.map_or("public", Ident::as_str))
                    .push(" AND table_name = ")
                    .push_bind(table.as_str())
                    .push(" AND column_name = ")
                    .push_bind(column.as_str());
            }
            Dialect::ClickHouse => {
                qb.push("SELECT 1 FROM system.columns WHERE database = ");
                match schema {
                    Some(schema) => qb.push_bind(schema.as_str()),
                    None => qb.push("currentDatabase()"),
                };
                qb.push(" AND table = ")
                    .push_bind(table.as_str())
                    .push(" AND name = ")
                    .push_bind(column.as_str());
            }
        }
        qb.build()
    }

    pub fn create_index(&self, qualified_table: &str, index: &ValidatedIndex) -> Result<String> {
        let name = self.quote(&index.name);
        match self {
            Dialect::ClickHouse => {
                if index.unique || index.where_clause.is_some() {
                    return Err(StorageError::user(
                        "STORAGE_UNSUPPORTED_INDEX_OPTION",
                        format!(
                            "ClickHouse skip index {} cannot be unique or partial",
                            index.name
                        ),
                    ));
                }
                let columns = index
                    .columns
                    .iter()
                    .map(|c| self.quote(&c.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                let method = index.method.as_ref().map_or("minmax", Ident::as_str);
                Ok(format!(
                    "ALTER TABLE {qualified_table} ADD INDEX IF NOT EXISTS {name} ({columns}) TYPE {method} GRANULARITY 1"
                ))
            }
            _ => {
                let columns = index
                    .columns
                    .iter()
                    .map(|c| match c.order {
                        Some(order) => format!("{} {}", self.quote(&c.name), order.as_sql()),
                        None => self.quote(&c.name),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut sql = String::from("CREATE ");
                if index.unique {
                    sql.push_str("UNIQUE ");
                }
                sql.push_str("INDEX ");
                if index.concurrent && *self == Dialect::Postgres {
                    sql.push_str("CONCURRENTLY ");
                }
                sql.push_str(&format!("IF NOT EXISTS {name} ON {qualified_table}"));
                if let (Dialect::Postgres, Some(method)) = (self, &index.method) {
                    sql.push_str(&format!(" USING {method}"));
                }
                sql.push_str(&format!(" ({columns})"));
                if let Some(predicate) = &index.where_clause {
                    sql.push_str(&format!(" WHERE {predicate}"));
                }
                Ok(sql)
            }
        }
    }

    pub fn drop_index(&self, schema: Option<&Ident>, qualified_table: &str, name: &Ident) -> String {
        match self {
            Dialect::Sqlite => format!("DROP INDEX IF EXISTS {}", self.quote(name)),
            Dialect::Postgres => format!("DROP INDEX CONCURRENTLY IF EXISTS {}", self.qualify(schema, name)),
            Dialect::ClickHouse => format!(
                "ALTER TABLE {qualified_table} DROP INDEX IF EXISTS {}",
                self.quote(name)
            ),
        }
    }

    /// Catalog query returning `name`, `table_name` and `definition`.
    pub fn list_indexes(&self, schema: Option<&Ident>, table: Option<&Ident>) -> Query {
        let mut qb = QueryBuilder::new(*self);
        match self {
            Dialect::Sqlite => {
                qb.push(
                    "SELECT name, tbl_name AS table_name, sql AS definition FROM sqlite_master \
                     WHERE type = 'index' AND sql IS NOT NULL",
                );
                if let Some(table) = table {
                    qb.push(" AND tbl_name = ").push_bind(table.as_str());
                }
            }
            Dialect::Postgres => {
                qb.push(
                    "SELECT indexname AS name, tablename AS table_name, indexdef AS definition \
                     FROM pg_indexes WHERE schemaname = ",
                )
                .push_bind(schema.map_or("public", Ident::as_str));
                if let Some(table) = table {
                    qb.push(" AND tablename = ").push_bind(table.as_str());
                }
            }
            Dialect::ClickHouse => {
                qb.push(
                    "SELECT name, table AS table_name, \
                     concat('INDEX ', name, ' (', expr, ') TYPE ', type_full) AS definition \
                     FROM system.data_skipping_indices WHERE database = ",
                );
                match schema {
                    Some(schema) => qb.push_bind(schema.as_str()),
                    None => qb.push("currentDatabase()"),
                };
                if let Some(table) = table {
                    qb.push(" AND table = ").push_bind(table.as_str());
                }
            }
        }
        qb.push(" ORDER BY name");
        qb.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::schema::IndexSpec;

    fn threads_schema() -> TableSchema {
        TableSchema::new()
            .column("id", ColumnDef::primary_key(ColumnType::Text))
            .column("metadata", ColumnDef::nullable(ColumnType::Jsonb))
            .column("updated_at", ColumnDef::required(ColumnType::Timestamp))
    }

    #[test]
    fn test_create_table_per_dialect() {
        let schema = threads_schema();
        assert_eq!(
            Dialect::Sqlite.create_table("\"t\"", &schema).unwrap(),
            "CREATE TABLE IF NOT EXISTS \"t\" (\"id\" TEXT NOT NULL, \"metadata\" TEXT, \
             \"updated_at\" TEXT NOT NULL, PRIMARY KEY (\"id\"))"
        );
        assert_eq!(
            Dialect::Postgres.create_table("\"s\".\"t\"", &schema).unwrap(),
            "CREATE TABLE IF NOT EXISTS \"s\".\"t\" (\"id\" TEXT NOT NULL, \"metadata\" JSONB, \
             \"updated_at\" TIMESTAMPTZ NOT NULL, PRIMARY KEY (\"id\"))"
        );
        assert_eq!(
            Dialect::ClickHouse.create_table("`t`", &schema).unwrap(),
            "CREATE TABLE IF NOT EXISTS `t` (`id` String, `metadata` Nullable(String), \
             `updated_at` DateTime64(6, 'UTC')) ENGINE = ReplacingMergeTree(`updated_at`) ORDER BY (`id`)"
        );
    }

    #[test]
    fn test_qualify_ignores_schema_for_sqlite() {
        let schema = Ident::new("tenant_a").unwrap();
        let table = Ident::table("agent_threads").unwrap();
        assert_eq!(Dialect::Sqlite.qualify(Some(&schema), &table), "\"agent_threads\"");
        assert_eq!(
            Dialect::Postgres.qualify(Some(&schema), &table),
            "\"tenant_a\".\"agent_threads\""
        );
        assert_eq!(
            Dialect::ClickHouse.qualify(Some(&schema), &table),
            "`tenant_a`.`agent_threads`"
        );
    }

    #[test]
    fn test_create_index_postgres_is_concurrent() {
        let index = IndexSpec::new("msg_idx", "agent_messages", &["thread_id", "created_at DESC"])
            .with_method("btree")
            .with_where("role = 'user'")
            .validate()
            .unwrap();
        assert_eq!(
            Dialect::Postgres.create_index("\"agent_messages\"", &index).unwrap(),
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS \"msg_idx\" ON \"agent_messages\" USING btree \
             (\"thread_id\", \"created_at\" DESC) WHERE role = 'user'"
        );
        assert_eq!(
            Dialect::Sqlite.create_index("\"agent_messages\"", &index).unwrap(),
            "CREATE INDEX IF NOT EXISTS \"msg_idx\" ON \"agent_messages\" \
             (\"thread_id\", \"created_at\" DESC) WHERE role = 'user'"
        );
    }

    #[test]
    fn test_create_index_clickhouse_skip_index() {
        let index = IndexSpec::new("evals_idx", "agent_evals", &["agent_name", "created_at DESC"])
            .validate()
            .unwrap();
        assert_eq!(
            Dialect::ClickHouse.create_index("`agent_evals`", &index).unwrap(),
            "ALTER TABLE `agent_evals` ADD INDEX IF NOT EXISTS `evals_idx` (`agent_name`, `created_at`) \
             TYPE minmax GRANULARITY 1"
        );
        let unique = IndexSpec::new("u", "agent_evals", &["run_id"]).unique().validate().unwrap();
        assert!(Dialect::ClickHouse.create_index("`agent_evals`", &unique).is_err());
    }

    #[test]
    fn test_upsert_clause() {
        let id = Ident::column("id").unwrap();
        let content = Ident::column("content").unwrap();
        assert_eq!(
            Dialect::Postgres.upsert_clause(&[id.clone()], &[content]),
            " ON CONFLICT (\"id\") DO UPDATE SET \"content\" = excluded.\"content\""
        );
        assert_eq!(Dialect::ClickHouse.upsert_clause(&[id], &[]), "");
    }

    #[test]
    fn test_json_text_extraction() {
        assert_eq!(
            Dialect::Sqlite.json_text("\"test_info\"", "testPath"),
            "CAST(json_extract(\"test_info\", '$.testPath') AS TEXT)"
        );
        assert_eq!(
            Dialect::Postgres.json_text("\"attributes\"", "http.status"),
            "(\"attributes\"::jsonb #>> '{http,status}')"
        );
        assert_eq!(
            Dialect::ClickHouse.json_text("`attributes`", "http.status"),
            "nullIf(JSONExtractString(`attributes`, 'http', 'status'), '')"
        );
    }

    #[test]
    fn test_add_column_and_teardown() {
        let col = Ident::column("resource_id").unwrap();
        let def = ColumnDef::required(ColumnType::Text);
        assert_eq!(
            Dialect::Postgres.add_column("\"m\"", &col, &def),
            "ALTER TABLE \"m\" ADD COLUMN IF NOT EXISTS \"resource_id\" TEXT"
        );
        assert_eq!(
            Dialect::Sqlite.add_column("\"m\"", &col, &def),
            "ALTER TABLE \"m\" ADD COLUMN \"resource_id\" TEXT"
        );
        assert_eq!(Dialect::Postgres.clear_table("\"m\""), "TRUNCATE TABLE \"m\" CASCADE");
        assert_eq!(Dialect::Sqlite.clear_table("\"m\""), "DELETE FROM \"m\"");
    }

    #[test]
    fn test_list_indexes_filters_by_schema_and_table() {
        let table = Ident::table("agent_messages").unwrap();
        let q = Dialect::Postgres.list_indexes(None, Some(&table));
        assert!(q.sql.contains("FROM pg_indexes WHERE schemaname = $1 AND tablename = $2"));
        assert_eq!(q.params, vec![SqlValue::from("public"), SqlValue::from("agent_messages")]);
    }
}
