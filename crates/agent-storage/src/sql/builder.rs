//! Incremental SQL construction with dialect-specific placeholders
use crate::sql::dialect::Dialect;
use crate::sql::identifier::Ident;
use crate::sql::value::SqlValue;

/// Rendered SQL text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Query {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), params: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    dialect: Dialect,
    sql: String,
    params: Vec<SqlValue>,
    has_where: bool,
}

impl QueryBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect, sql: String::new(), params: Vec::new(), has_where: false }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push_ident(&mut self, ident: &Ident) -> &mut Self {
        let quoted = self.dialect.quote(ident);
        self.sql.push_str(&quoted);
        self
    }

    /// Appends a placeholder and records the value behind it.
    pub fn push_bind(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        let value = value.into();
        let placeholder = self.dialect.placeholder(self.params.len() + 1, &value);
        self.sql.push_str(&placeholder);
        self.params.push(value);
        self
    }

    /// Comma-separated placeholders, e.g. for `IN (...)`.
    pub fn push_bind_list<I, V>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_bind(value);
        }
        self
    }

    /// Emits ` WHERE ` the first time and ` AND ` afterwards.
    pub fn and_where(&mut self) -> &mut Self {
        let keyword = if self.has_where { " AND " } else { " WHERE " };
        self.sql.push_str(keyword);
        self.has_where = true;
        self
    }

    /// Limits are plain integers, rendered inline for every dialect.
    pub fn push_limit_offset(&mut self, limit: usize, offset: usize) -> &mut Self {
        self.sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        self
    }

    pub fn build(self) -> Query {
        Query { sql: self.sql, params: self.params }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_follow_dialect() {
        let mut qb = QueryBuilder::new(Dialect::Postgres);
        qb.push("SELECT * FROM t");
        qb.and_where().push("a = ").push_bind("x");
        qb.and_where().push("b IN (").push_bind_list([1i64, 2]).push(")");
        let q = qb.build();
        assert_eq!(q.sql, "SELECT * FROM t WHERE a = $1 AND b IN ($2, $3)");
        assert_eq!(q.params.len(), 3);

        let mut qb = QueryBuilder::new(Dialect::Sqlite);
        qb.push("SELECT 1").and_where().push("a = ").push_bind("x");
        assert_eq!(qb.build().sql, "SELECT 1 WHERE a = ?1");

        let mut qb = QueryBuilder::new(Dialect::ClickHouse);
        qb.push("SELECT 1").and_where().push("n = ").push_bind(5i64);
        assert_eq!(qb.build().sql, "SELECT 1 WHERE n = {p1:Int64}");
    }

    #[test]
    fn test_limit_offset_inline() {
        let mut qb = QueryBuilder::new(Dialect::Sqlite);
        qb.push("SELECT 1").push_limit_offset(10, 20);
        assert_eq!(qb.build().sql, "SELECT 1 LIMIT 10 OFFSET 20");
    }
}
