//! Logical table and index descriptions
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::sql::identifier::Ident;

/// Logical column types. Each dialect maps them to a concrete SQL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Timestamp,
    Uuid,
    Jsonb,
    Integer,
    Float,
    Bigint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnDef {
    pub const fn required(column_type: ColumnType) -> Self {
        Self { column_type, primary_key: false, nullable: false }
    }

    pub const fn nullable(column_type: ColumnType) -> Self {
        Self { column_type, primary_key: false, nullable: true }
    }

    pub const fn primary_key(column_type: ColumnType) -> Self {
        Self { column_type, primary_key: true, nullable: false }
    }
}

/// Ordered column list of a table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSchema {
    columns: Vec<(String, ColumnDef)>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: &str, def: ColumnDef) -> Self {
        self.columns.push((name.to_string(), def));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|(c, _)| c == name).map(|(_, d)| d)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnDef)> {
        self.columns.iter().map(|(c, d)| (c.as_str(), d))
    }

    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|(_, d)| d.primary_key)
            .map(|(c, _)| c.as_str())
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One entry of an index column list: `"<column> [ASC|DESC]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub name: Ident,
    pub order: Option<SortDirection>,
}

impl IndexColumn {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split_whitespace();
        let name = parts.next().ok_or_else(|| {
            StorageError::user("STORAGE_INVALID_INDEX_COLUMN", "Index column must not be empty")
        })?;
        let order = match parts.next().map(str::to_ascii_uppercase).as_deref() {
            None => None,
            Some("ASC") => Some(SortDirection::Asc),
            Some("DESC") => Some(SortDirection::Desc),
            Some(other) => {
                return Err(StorageError::user(
                    "STORAGE_INVALID_INDEX_COLUMN",
                    format!("Unsupported sort order {other:?} in index column {spec:?}"),
                ))
            }
        };
        if parts.next().is_some() {
            return Err(StorageError::user(
                "STORAGE_INVALID_INDEX_COLUMN",
                format!("Unexpected tokens in index column {spec:?}"),
            ));
        }
        Ok(Self { name: Ident::column(name)?, order })
    }
}

/// Description of an index to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Partial-index predicate. Trusted SQL supplied by the application,
    /// never by end users.
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Build without blocking writers where the backend supports it.
    #[serde(default = "default_concurrent")]
    pub concurrent: bool,
}

fn default_concurrent() -> bool {
    true
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
            where_clause: None,
            method: None,
            concurrent: true,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_where(mut self, predicate: impl Into<String>) -> Self {
        self.where_clause = Some(predicate.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Validates every name in the descriptor and parses the column list.
    pub fn validate(&self) -> Result<ValidatedIndex> {
        if self.columns.is_empty() {
            return Err(StorageError::user(
                "STORAGE_INVALID_INDEX_COLUMN",
                format!("Index {} needs at least one column", self.name),
            ));
        }
        if let Some(predicate) = &self.where_clause {
            if predicate.contains(';') {
                return Err(StorageError::user(
                    "STORAGE_INVALID_INDEX_PREDICATE",
                    format!("Index predicate for {} must be a single expression", self.name),
                ));
            }
        }
        let method = self.method.as_deref().map(Ident::new).transpose()?;
        Ok(ValidatedIndex {
            name: Ident::new(&self.name)?,
            table: Ident::table(&self.table)?,
            columns: self
                .columns
                .iter()
                .map(|c| IndexColumn::parse(c))
                .collect::<Result<Vec<_>>>()?,
            unique: self.unique,
            where_clause: self.where_clause.clone(),
            method,
            concurrent: self.concurrent,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIndex {
    pub name: Ident,
    pub table: Ident,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
    pub where_clause: Option<String>,
    pub method: Option<Ident>,
    pub concurrent: bool,
}

/// An index as reported by the backend catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub definition: String,
}

impl IndexInfo {
    pub fn from_definition(name: String, table: String, definition: String) -> Self {
        let upper = definition.to_ascii_uppercase();
        Self {
            columns: parse_index_columns(&definition),
            unique: upper.contains("UNIQUE INDEX"),
            name,
            table,
            definition,
        }
    }
}

/// Extracts the column list from an index definition such as
/// `CREATE INDEX "i" ON "t" ("thread_id", "created_at" DESC)`.
pub fn parse_index_columns(definition: &str) -> Vec<String> {
    let Some(start) = definition.find('(') else {
        return Vec::new();
    };
    let mut depth = 0usize;
    let mut end = None;
    for (offset, ch) in definition[start..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(end) = end else {
        return Vec::new();
    };
    definition[start + 1..end]
        .split(',')
        .map(|c| c.trim().replace(['"', '`'], ""))
        .filter(|c| !c.is_empty())
        .collect()
}
