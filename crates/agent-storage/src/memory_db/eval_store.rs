//! Evaluation results, split into test and live runs by `testInfo.testPath`
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError, StorageResultExt};
use crate::memory_db::conversation_store::date_filter;
use crate::memory_db::operations::insert_record;
use crate::memory_db::pagination::{or_degraded, paginate, Page, PageQuery, PageRequest};
use crate::memory_db::schema::{DateRange, EvalResult, EvalRow, EvalType, TableName};
use crate::memory_db::{Database, SchemaContext};
use crate::sql::builder::QueryBuilder;
use crate::sql::value::{Record, SqlRow, SqlValue};

const EVAL_COLUMNS: [&str; 10] = [
    "run_id",
    "agent_name",
    "input",
    "output",
    "result",
    "metric_name",
    "instructions",
    "test_info",
    "global_run_id",
    "created_at",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub eval_type: Option<EvalType>,
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

impl EvalQuery {
    pub fn page(page: usize, per_page: usize) -> Self {
        Self { page, per_page, ..Default::default() }
    }
}

#[derive(Clone)]
pub struct EvalStore {
    db: Arc<Database>,
}

impl EvalStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn save_eval(&self, row: EvalRow) -> Result<()> {
        let record = eval_record(&row);
        self.db
            .run(move |exec, ctx| {
                insert_record(exec, ctx, TableName::Evals.as_str(), &record)
                    .classify("STORAGE_INSERT_FAILED")
                    .detail("tableName", TableName::Evals.as_str())
            })
            .await
    }

    /// Newest evals first. Failures, including rows with a malformed
    /// result, degrade to an empty page.
    pub async fn get_evals(&self, query: EvalQuery) -> Page<EvalRow> {
        let request = PageRequest::new(query.page, query.per_page);
        let result = self
            .db
            .run(move |exec, ctx| {
                let mut count = ctx.builder();
                count.push("SELECT COUNT(*) FROM ").push(&ctx.table(TableName::Evals.as_str())?);
                eval_filters(ctx, &mut count, &query)?;

                let mut data = eval_select(ctx)?;
                eval_filters(ctx, &mut data, &query)?;
                data.push(&newest_first(ctx)?)
                    .push_limit_offset(request.per_page, request.offset());

                let page_query = PageQuery { count: count.build(), data: data.build() };
                paginate(exec, request, &page_query, eval_from_row)
            })
            .await;
        or_degraded("get_evals", result, || Page::empty(request))
    }

    #[deprecated(note = "use get_evals")]
    pub async fn get_evals_by_agent_name(&self, agent_name: &str, eval_type: Option<EvalType>) -> Vec<EvalRow> {
        let query = EvalQuery {
            agent_name: Some(agent_name.to_string()),
            eval_type,
            ..Default::default()
        };
        let result: Result<Vec<EvalRow>> = self
            .db
            .run(move |exec, ctx| {
                let mut data = eval_select(ctx)?;
                eval_filters(ctx, &mut data, &query)?;
                data.push(&newest_first(ctx)?);
                exec.run_query(&data.build())?.iter().map(eval_from_row).collect()
            })
            .await;
        or_degraded("get_evals_by_agent_name", result, Vec::new)
    }
}

fn eval_select(ctx: &SchemaContext) -> Result<QueryBuilder> {
    let mut qb = ctx.builder();
    qb.push("SELECT ")
        .push(&ctx.select_list(&EVAL_COLUMNS)?)
        .push(" FROM ")
        .push(&ctx.table(TableName::Evals.as_str())?);
    Ok(qb)
}

fn newest_first(ctx: &SchemaContext) -> Result<String> {
    Ok(format!(" ORDER BY {} DESC", ctx.col("created_at")?))
}

fn eval_filters(ctx: &SchemaContext, qb: &mut QueryBuilder, query: &EvalQuery) -> Result<()> {
    if let Some(agent_name) = &query.agent_name {
        qb.and_where().push(&ctx.col("agent_name")?).push(" = ").push_bind(agent_name.as_str());
    }
    if let Some(eval_type) = query.eval_type {
        let test_path = ctx.dialect().json_text(&ctx.col("test_info")?, "testPath");
        let predicate = match eval_type {
            EvalType::Test => " IS NOT NULL",
            EvalType::Live => " IS NULL",
        };
        qb.and_where().push(&test_path).push(predicate);
    }
    date_filter(ctx, qb, "created_at", &query.date_range)
}

fn eval_record(row: &EvalRow) -> Record {
    Record::from([
        ("run_id".to_string(), SqlValue::from(&row.run_id)),
        ("agent_name".to_string(), SqlValue::from(&row.agent_name)),
        ("input".to_string(), SqlValue::from(&row.input)),
        ("output".to_string(), SqlValue::from(&row.output)),
        (
            "result".to_string(),
            SqlValue::Json(serde_json::to_value(&row.result).unwrap_or_default()),
        ),
        ("metric_name".to_string(), SqlValue::from(&row.metric_name)),
        ("instructions".to_string(), SqlValue::from(&row.instructions)),
        ("test_info".to_string(), SqlValue::from(row.test_info.clone())),
        ("global_run_id".to_string(), SqlValue::from(&row.global_run_id)),
        ("created_at".to_string(), SqlValue::from(row.created_at)),
    ])
}

/// `result.score` must be a number.
fn eval_from_row(row: &SqlRow) -> Result<EvalRow> {
    let raw = row.json("result")?;
    let result: EvalResult = serde_json::from_value(raw.clone()).map_err(|e| {
        StorageError::user(
            "STORAGE_INVALID_EVAL_RESULT",
            format!("Invalid eval result {raw}: {e}"),
        )
    })?;
    Ok(EvalRow {
        run_id: row.text("run_id")?,
        agent_name: row.text("agent_name")?,
        input: row.text("input")?,
        output: row.text("output")?,
        result,
        metric_name: row.text("metric_name")?,
        instructions: row.text("instructions")?,
        test_info: row.opt_json("test_info")?,
        global_run_id: row.text("global_run_id")?,
        created_at: row.timestamp("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::AgentStorage;
    use chrono::Utc;
    use serde_json::json;

    fn eval(run_id: &str, test_info: Option<serde_json::Value>) -> EvalRow {
        EvalRow {
            run_id: run_id.into(),
            agent_name: "support-agent".into(),
            input: "question".into(),
            output: "answer".into(),
            result: EvalResult { score: 0.75, info: None },
            metric_name: "relevance".into(),
            instructions: "rate relevance".into(),
            test_info,
            global_run_id: "global-1".into(),
            created_at: Utc::now(),
        }
    }

    fn result_row(result: &str) -> SqlRow {
        let columns: Arc<[String]> = EVAL_COLUMNS.iter().map(|c| c.to_string()).collect();
        let values = EVAL_COLUMNS
            .iter()
            .map(|c| match *c {
                "result" => SqlValue::Text(result.to_string()),
                "test_info" => SqlValue::Null,
                "created_at" => SqlValue::Text("2024-05-01T10:00:00.000000Z".into()),
                other => SqlValue::Text(other.to_string()),
            })
            .collect();
        SqlRow::new(columns, values)
    }

    #[test]
    fn test_score_must_be_numeric() {
        assert_eq!(eval_from_row(&result_row(r#"{"score": 1}"#)).unwrap().result.score, 1.0);
        let err = eval_from_row(&result_row(r#"{"score": "high"}"#)).unwrap_err();
        assert_eq!(err.id, "STORAGE_INVALID_EVAL_RESULT");
        assert!(err.is_user());
        assert!(eval_from_row(&result_row(r#"{"info": {}}"#)).is_err());
    }

    #[tokio::test]
    async fn test_type_filter_splits_test_and_live() {
        let storage = AgentStorage::new_in_memory().unwrap();
        storage.init().await.unwrap();
        storage.evals.save_eval(eval("r1", Some(json!({"testPath": "evals/a.test.ts"})))).await.unwrap();
        storage.evals.save_eval(eval("r2", Some(json!({"testPath": null})))).await.unwrap();
        storage.evals.save_eval(eval("r3", None)).await.unwrap();

        let mut query = EvalQuery::page(0, 10);
        query.eval_type = Some(EvalType::Test);
        let tests = storage.evals.get_evals(query.clone()).await;
        assert_eq!(tests.total, 1);
        assert_eq!(tests.items[0].eval_type(), EvalType::Test);

        query.eval_type = Some(EvalType::Live);
        let live = storage.evals.get_evals(query).await;
        assert_eq!(live.total, 2);
        assert!(live.items.iter().all(|e| e.eval_type() == EvalType::Live));
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_legacy_read_degrades_when_table_missing() {
        let storage = AgentStorage::new_in_memory().unwrap();
        let rows = storage.evals.get_evals_by_agent_name("support-agent", None).await;
        assert!(rows.is_empty());
    }
}
