//! Append-only telemetry spans
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StorageResultExt};
use crate::memory_db::conversation_store::date_filter;
use crate::memory_db::operations::batch_insert_records;
use crate::memory_db::pagination::{or_degraded, paginate, Page, PageQuery, PageRequest};
use crate::memory_db::schema::{DateRange, TableName, Trace};
use crate::memory_db::{Database, SchemaContext};
use crate::sql::builder::QueryBuilder;
use crate::sql::identifier::parse_field_key;
use crate::sql::value::{Record, SqlRow, SqlValue};

const TRACE_COLUMNS: [&str; 14] = [
    "id",
    "parent_span_id",
    "name",
    "trace_id",
    "scope",
    "kind",
    "attributes",
    "status",
    "events",
    "links",
    "other",
    "start_time",
    "end_time",
    "created_at",
];

/// Filters for trace reads. `name` matches as a prefix, `attributes`
/// compares keys of the attributes JSON and `filters` compares columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default)]
    pub date_range: DateRange,
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_per_page() -> usize {
    100
}

impl TraceQuery {
    pub fn page(page: usize, per_page: usize) -> Self {
        Self { page, per_page, ..Default::default() }
    }
}

#[derive(Clone)]
pub struct TraceStore {
    db: Arc<Database>,
}

impl TraceStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Inserts all spans in one transaction.
    pub async fn batch_traces_insert(&self, traces: Vec<Trace>) -> Result<()> {
        if traces.is_empty() {
            return Ok(());
        }
        let records: Vec<Record> = traces.iter().map(trace_record).collect();
        self.db
            .run(move |exec, ctx| {
                batch_insert_records(exec, ctx, TableName::Traces.as_str(), &records)
                    .classify("STORAGE_BATCH_INSERT_FAILED")
                    .detail("tableName", TableName::Traces.as_str())
                    .detail("numberOfRecords", records.len())
            })
            .await
    }

    /// Newest spans first. Failures degrade to an empty page.
    pub async fn get_traces_paginated(&self, query: TraceQuery) -> Page<Trace> {
        let request = PageRequest::new(query.page, query.per_page);
        let result = self
            .db
            .run(move |exec, ctx| {
                let mut count = ctx.builder();
                count.push("SELECT COUNT(*) FROM ").push(&ctx.table(TableName::Traces.as_str())?);
                trace_filters(ctx, &mut count, &query)?;

                let mut data = ctx.builder();
                data.push("SELECT ")
                    .push(&ctx.select_list(&TRACE_COLUMNS)?)
                    .push(" FROM ")
                    .push(&ctx.table(TableName::Traces.as_str())?);
                trace_filters(ctx, &mut data, &query)?;
                data.push(&format!(" ORDER BY {} DESC, {} DESC", ctx.col("start_time")?, ctx.col("id")?))
                    .push_limit_offset(request.per_page, request.offset());

                let page_query = PageQuery { count: count.build(), data: data.build() };
                paginate(exec, request, &page_query, trace_from_row)
            })
            .await;
        or_degraded("get_traces_paginated", result, || Page::empty(request))
    }

    #[deprecated(note = "use get_traces_paginated")]
    pub async fn get_traces(&self, query: TraceQuery) -> Vec<Trace> {
        self.get_traces_paginated(query).await.items
    }
}

/// Escapes `LIKE` wildcards so `prefix` matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn trace_filters(ctx: &SchemaContext, qb: &mut QueryBuilder, query: &TraceQuery) -> Result<()> {
    let dialect = ctx.dialect();
    if let Some(name) = &query.name {
        qb.and_where()
            .push(&ctx.col("name")?)
            .push(" LIKE ")
            .push_bind(like_prefix(name))
            .push(dialect.like_escape());
    }
    if let Some(scope) = &query.scope {
        qb.and_where().push(&ctx.col("scope")?).push(" = ").push_bind(scope.as_str());
    }
    let attributes = ctx.col("attributes")?;
    for (key, value) in &query.attributes {
        qb.and_where()
            .push(&dialect.json_text(&attributes, parse_field_key(key)?))
            .push(" = ")
            .push_bind(value.as_str());
    }
    for (column, value) in &query.filters {
        qb.and_where()
            .push(&ctx.col(column)?)
            .push(" = ")
            .push_bind(SqlValue::from_json(value));
    }
    date_filter(ctx, qb, "created_at", &query.date_range)
}

fn trace_record(trace: &Trace) -> Record {
    Record::from([
        ("id".to_string(), SqlValue::from(&trace.id)),
        ("parent_span_id".to_string(), SqlValue::from(trace.parent_span_id.clone())),
        ("name".to_string(), SqlValue::from(&trace.name)),
        ("trace_id".to_string(), SqlValue::from(&trace.trace_id)),
        ("scope".to_string(), SqlValue::from(&trace.scope)),
        ("kind".to_string(), SqlValue::from(trace.kind)),
        ("attributes".to_string(), SqlValue::from(trace.attributes.clone())),
        ("status".to_string(), SqlValue::from(trace.status.clone())),
        ("events".to_string(), SqlValue::from(trace.events.clone())),
        ("links".to_string(), SqlValue::from(trace.links.clone())),
        ("other".to_string(), SqlValue::from(trace.other.clone())),
        ("start_time".to_string(), SqlValue::from(trace.start_time)),
        ("end_time".to_string(), SqlValue::from(trace.end_time)),
        ("created_at".to_string(), SqlValue::from(trace.created_at)),
    ])
}

fn trace_from_row(row: &SqlRow) -> Result<Trace> {
    Ok(Trace {
        id: row.text("id")?,
        parent_span_id: row.opt_text("parent_span_id")?,
        name: row.text("name")?,
        trace_id: row.text("trace_id")?,
        scope: row.text("scope")?,
        kind: row.integer("kind")?,
        attributes: row.opt_json("attributes")?,
        status: row.opt_json("status")?,
        events: row.opt_json("events")?,
        links: row.opt_json("links")?,
        other: row.opt_text("other")?,
        start_time: row.integer("start_time")?,
        end_time: row.integer("end_time")?,
        created_at: row.timestamp("created_at")?,
    })
}
