//! Workflow run snapshots keyed by `(workflow_name, run_id)`
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, StorageResultExt};
use crate::memory_db::conversation_store::date_filter;
use crate::memory_db::operations::{has_column_sync, upsert_record, StoreOperations};
use crate::memory_db::pagination::{or_degraded, paginate, Page, PageQuery, PageRequest};
use crate::memory_db::schema::{DateRange, TableName, WorkflowRun};
use crate::memory_db::{Database, SchemaContext};
use crate::sql::builder::QueryBuilder;
use crate::sql::executor::Executor;
use crate::sql::value::{Record, SqlRow, SqlValue};

const RUN_COLUMNS: [&str; 6] = ["workflow_name", "run_id", "resource_id", "snapshot", "created_at", "updated_at"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
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

impl WorkflowRunsQuery {
    pub fn page(page: usize, per_page: usize) -> Self {
        Self { page, per_page, ..Default::default() }
    }
}

#[derive(Clone)]
pub struct WorkflowStore {
    db: Arc<Database>,
    operations: StoreOperations,
}

impl WorkflowStore {
    pub fn new(db: Arc<Database>) -> Self {
        let operations = StoreOperations::new(Arc::clone(&db));
        Self { db, operations }
    }

    /// Stores the snapshot for a run, replacing an earlier one.
    pub async fn persist_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
        resource_id: Option<String>,
        snapshot: Value,
    ) -> Result<()> {
        let now = Utc::now();
        let record = Record::from([
            ("workflow_name".to_string(), SqlValue::from(workflow_name)),
            ("run_id".to_string(), SqlValue::from(run_id)),
            ("resource_id".to_string(), SqlValue::from(resource_id)),
            ("snapshot".to_string(), SqlValue::Text(snapshot.to_string())),
            ("created_at".to_string(), SqlValue::from(now)),
            ("updated_at".to_string(), SqlValue::from(now)),
        ]);
        let run_id = run_id.to_string();
        self.db
            .run(move |exec, ctx| {
                upsert_record(
                    exec,
                    ctx,
                    TableName::WorkflowSnapshot.as_str(),
                    &record,
                    &["workflow_name", "run_id"],
                    &["resource_id", "snapshot", "updated_at"],
                )
                .classify("STORAGE_PERSIST_WORKFLOW_SNAPSHOT_FAILED")
                .detail("runId", run_id.as_str())
            })
            .await
    }

    pub async fn load_workflow_snapshot(&self, workflow_name: &str, run_id: &str) -> Result<Option<Value>> {
        let keys = Record::from([
            ("workflow_name".to_string(), SqlValue::from(workflow_name)),
            ("run_id".to_string(), SqlValue::from(run_id)),
        ]);
        let row = self
            .operations
            .load(TableName::WorkflowSnapshot.as_str(), keys)
            .await
            .classify("STORAGE_LOAD_WORKFLOW_SNAPSHOT_FAILED")
            .detail("runId", run_id)?;
        Ok(row.and_then(|mut row| row.remove("snapshot")))
    }

    /// Newest runs first. Failures degrade to an empty page.
    pub async fn get_workflow_runs(&self, query: WorkflowRunsQuery) -> Page<WorkflowRun> {
        let request = PageRequest::new(query.page, query.per_page);
        let result = self
            .db
            .run(move |exec, ctx| {
                let mut count = ctx.builder();
                count
                    .push("SELECT COUNT(*) FROM ")
                    .push(&ctx.table(TableName::WorkflowSnapshot.as_str())?);
                run_filters(exec, ctx, &mut count, &query)?;

                let mut data = run_select(ctx)?;
                run_filters(exec, ctx, &mut data, &query)?;
                data.push(&format!(" ORDER BY {} DESC", ctx.col("created_at")?))
                    .push_limit_offset(request.per_page, request.offset());

                let page_query = PageQuery { count: count.build(), data: data.build() };
                paginate(exec, request, &page_query, run_from_row)
            })
            .await;
        or_degraded("get_workflow_runs", result, || Page::empty(request))
    }

    pub async fn get_workflow_run_by_id(&self, run_id: &str, workflow_name: Option<&str>) -> Result<Option<WorkflowRun>> {
        let run_id = run_id.to_string();
        let workflow_name = workflow_name.map(str::to_string);
        self.db
            .run(move |exec, ctx| {
                let lookup = || -> Result<Option<WorkflowRun>> {
                    let mut qb = run_select(ctx)?;
                    qb.and_where().push(&ctx.col("run_id")?).push(" = ").push_bind(run_id.as_str());
                    if let Some(name) = &workflow_name {
                        qb.and_where().push(&ctx.col("workflow_name")?).push(" = ").push_bind(name.as_str());
                    }
                    exec.query_one(&qb.build())?.as_ref().map(run_from_row).transpose()
                };
                lookup()
                    .classify("STORAGE_GET_WORKFLOW_RUN_BY_ID_FAILED")
                    .detail("runId", run_id.as_str())
            })
            .await
    }
}

fn run_select(ctx: &SchemaContext) -> Result<QueryBuilder> {
    let mut qb = ctx.builder();
    qb.push("SELECT ")
        .push(&ctx.select_list(&RUN_COLUMNS)?)
        .push(" FROM ")
        .push(&ctx.table(TableName::WorkflowSnapshot.as_str())?);
    Ok(qb)
}

fn run_filters(exec: &dyn Executor, ctx: &SchemaContext, qb: &mut QueryBuilder, query: &WorkflowRunsQuery) -> Result<()> {
    if let Some(name) = &query.workflow_name {
        qb.and_where().push(&ctx.col("workflow_name")?).push(" = ").push_bind(name.as_str());
    }
    if let Some(resource_id) = &query.resource_id {
        if has_column_sync(exec, ctx, TableName::WorkflowSnapshot.as_str(), "resource_id")? {
            qb.and_where().push(&ctx.col("resource_id")?).push(" = ").push_bind(resource_id.as_str());
        } else {
            warn!("[{}] resource_id column missing, ignoring resource filter", TableName::WorkflowSnapshot);
        }
    }
    date_filter(ctx, qb, "created_at", &query.date_range)
}

fn run_from_row(row: &SqlRow) -> Result<WorkflowRun> {
    let raw = row.text("snapshot")?;
    let snapshot = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
    Ok(WorkflowRun {
        workflow_name: row.text("workflow_name")?,
        run_id: row.text("run_id")?,
        resource_id: row.opt_text("resource_id")?,
        snapshot,
        created_at: row.timestamp("created_at")?,
        updated_at: row.timestamp("updated_at")?,
    })
}
