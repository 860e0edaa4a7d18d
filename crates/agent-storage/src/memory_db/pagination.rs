//! The single count-then-fetch pagination routine shared by every store
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metrics;
use crate::sql::builder::Query;
use crate::sql::executor::Executor;
use crate::sql::value::SqlRow;

/// One page of results: `{ items, total, page, perPage, hasMore }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: usize,
    pub per_page: usize,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty(request: PageRequest) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page: request.page,
            per_page: request.per_page,
            has_more: false,
        }
    }

    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
            has_more: self.has_more,
        }
    }
}

/// Zero-based page number and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: usize,
    pub per_page: usize,
}

impl PageRequest {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self { page, per_page }
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.per_page)
    }
}

/// Count query over the base filter plus the data query for one page.
/// The data query already carries its `LIMIT`/`OFFSET`.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub count: Query,
    pub data: Query,
}

/// Counts, fetches and computes `has_more`. A zero count returns an empty
/// page without running the data query.
pub fn paginate<T, F>(
    exec: &dyn Executor,
    request: PageRequest,
    query: &PageQuery,
    mut map_row: F,
) -> Result<Page<T>>
where
    F: FnMut(&SqlRow) -> Result<T>,
{
    let total = exec.query_count(&query.count)?;
    if total == 0 {
        return Ok(Page::empty(request));
    }

    let rows = exec.run_query(&query.data)?;
    let fetched = rows.len();
    let items = rows.iter().map(&mut map_row).collect::<Result<Vec<_>>>()?;

    Ok(Page {
        items,
        total,
        page: request.page,
        per_page: request.per_page,
        has_more: ((request.offset() + fetched) as u64) < total,
    })
}

/// Read-path failure policy: the error is reported and counted, and the
/// caller receives `fallback()` instead.
pub(crate) fn or_degraded<T>(operation: &str, result: Result<T>, fallback: impl FnOnce() -> T) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            metrics::track_degraded_read(operation, &e.with_detail("operation", operation));
            fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::builder::QueryBuilder;
    use crate::sql::dialect::Dialect;
    use rusqlite::Connection;

    fn seeded(n: usize) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE items (n INTEGER)").unwrap();
        for i in 0..n {
            conn.execute("INSERT INTO items (n) VALUES (?1)", [i as i64]).unwrap();
        }
        conn
    }

    fn page_query(request: PageRequest) -> PageQuery {
        let mut data = QueryBuilder::new(Dialect::Sqlite);
        data.push("SELECT n FROM items ORDER BY n")
            .push_limit_offset(request.per_page, request.offset());
        PageQuery { count: Query::raw("SELECT COUNT(*) FROM items"), data: data.build() }
    }

    #[test]
    fn test_pages_until_exhausted() {
        let conn = seeded(25);
        let mut seen = Vec::new();
        for page in 0..3 {
            let request = PageRequest::new(page, 10);
            let result = paginate(&conn, request, &page_query(request), |row| row.integer("n")).unwrap();
            assert_eq!(result.total, 25);
            assert_eq!(result.has_more, page < 2);
            seen.extend(result.items);
        }
        assert_eq!(seen, (0..25).collect::<Vec<i64>>());
    }

    #[test]
    fn test_empty_table_skips_data_query() {
        let conn = seeded(0);
        let request = PageRequest::new(0, 10);
        // the data query references a missing table; it must never run
        let query = PageQuery {
            count: Query::raw("SELECT COUNT(*) FROM items"),
            data: Query::raw("SELECT n FROM no_such_table"),
        };
        let result = paginate(&conn, request, &query, |row| row.integer("n")).unwrap();
        assert_eq!(result, Page::empty(request));
    }

    #[test]
    fn test_page_past_the_end() {
        let conn = seeded(5);
        let request = PageRequest::new(3, 10);
        let result = paginate(&conn, request, &page_query(request), |row| row.integer("n")).unwrap();
        assert!(result.items.is_empty());
        assert_eq!(result.total, 5);
        assert!(!result.has_more);
    }

    #[test]
    fn test_degraded_read_returns_fallback() {
        let failed: Result<Page<i64>> =
            Err(crate::error::StorageError::user("STORAGE_TEST_FAILURE", "boom"));
        let request = PageRequest::new(2, 5);
        let page = or_degraded("test_read", failed, || Page::empty(request));
        assert_eq!(page.page, 2);
        assert!(page.items.is_empty());
    }
}
