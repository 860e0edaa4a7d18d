//! SQL rendering and execution primitives shared by all stores
pub mod builder;
pub mod dialect;
pub mod executor;
pub mod identifier;
pub mod schema;
pub mod sqlite;
pub mod value;

pub use builder::{Query, QueryBuilder};
pub use dialect::Dialect;
pub use executor::{scoped_transaction, Executor};
pub use identifier::{parse_field_key, parse_sql_identifier, Ident};
pub use schema::{
    ColumnDef, ColumnType, IndexColumn, IndexInfo, IndexSpec, SortDirection, TableSchema,
};
pub use value::{Record, SqlRow, SqlValue};
