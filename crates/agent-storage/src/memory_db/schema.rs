//! Database schema definitions and record types for the storage core
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;
use crate::sql::schema::{ColumnDef, ColumnType, TableSchema};

/// Logical tables owned by the storage core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableName {
    Threads,
    Messages,
    Resources,
    Traces,
    Evals,
    WorkflowSnapshot,
}

impl TableName {
    pub const ALL: [TableName; 6] = [
        TableName::Threads,
        TableName::Messages,
        TableName::Resources,
        TableName::Traces,
        TableName::Evals,
        TableName::WorkflowSnapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Threads => "agent_threads",
            TableName::Messages => "agent_messages",
            TableName::Resources => "agent_resources",
            TableName::Traces => "agent_traces",
            TableName::Evals => "agent_evals",
            TableName::WorkflowSnapshot => "agent_workflow_snapshot",
        }
    }

    pub fn schema(&self) -> TableSchema {
        use ColumnType::*;
        match self {
            TableName::Threads => TableSchema::new()
                .column("id", ColumnDef::primary_key(Text))
                .column("resource_id", ColumnDef::required(Text))
                .column("title", ColumnDef::required(Text))
                .column("metadata", ColumnDef::nullable(Jsonb))
                .column("created_at", ColumnDef::required(Timestamp))
                .column("updated_at", ColumnDef::required(Timestamp)),
            TableName::Messages => TableSchema::new()
                .column("id", ColumnDef::primary_key(Text))
                .column("thread_id", ColumnDef::required(Text))
                .column("resource_id", ColumnDef::nullable(Text))
                .column("role", ColumnDef::required(Text))
                .column("type", ColumnDef::required(Text))
                .column("content", ColumnDef::required(Text))
                .column("created_at", ColumnDef::required(Timestamp)),
            TableName::Resources => TableSchema::new()
                .column("id", ColumnDef::primary_key(Text))
                .column("working_memory", ColumnDef::nullable(Text))
                .column("metadata", ColumnDef::nullable(Jsonb))
                .column("created_at", ColumnDef::required(Timestamp))
                .column("updated_at", ColumnDef::required(Timestamp)),
            TableName::Traces => TableSchema::new()
                .column("id", ColumnDef::primary_key(Text))
                .column("parent_span_id", ColumnDef::nullable(Text))
                .column("name", ColumnDef::required(Text))
                .column("trace_id", ColumnDef::required(Text))
                .column("scope", ColumnDef::required(Text))
                .column("kind", ColumnDef::required(Integer))
                .column("attributes", ColumnDef::nullable(Jsonb))
                .column("status", ColumnDef::nullable(Jsonb))
                .column("events", ColumnDef::nullable(Jsonb))
                .column("links", ColumnDef::nullable(Jsonb))
                .column("other", ColumnDef::nullable(Text))
                .column("start_time", ColumnDef::required(Bigint))
                .column("end_time", ColumnDef::required(Bigint))
                .column("created_at", ColumnDef::required(Timestamp)),
            TableName::Evals => TableSchema::new()
                .column("input", ColumnDef::required(Text))
                .column("output", ColumnDef::required(Text))
                .column("result", ColumnDef::required(Jsonb))
                .column("agent_name", ColumnDef::required(Text))
                .column("metric_name", ColumnDef::required(Text))
                .column("instructions", ColumnDef::required(Text))
                .column("test_info", ColumnDef::nullable(Jsonb))
                .column("global_run_id", ColumnDef::required(Text))
                .column("run_id", ColumnDef::required(Text))
                .column("created_at", ColumnDef::required(Timestamp)),
            TableName::WorkflowSnapshot => TableSchema::new()
                .column("workflow_name", ColumnDef::primary_key(Text))
                .column("run_id", ColumnDef::primary_key(Text))
                .column("resource_id", ColumnDef::nullable(Text))
                .column("snapshot", ColumnDef::required(Text))
                .column("created_at", ColumnDef::required(Timestamp))
                .column("updated_at", ColumnDef::required(Timestamp)),
        }
    }

    /// Columns added after the first release; `init()` adds them to
    /// existing tables.
    pub fn migrated_columns(&self) -> &'static [&'static str] {
        match self {
            TableName::Messages => &["resource_id"],
            TableName::WorkflowSnapshot => &["resource_id"],
            _ => &[],
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub resource_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(id: impl Into<String>, resource_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            resource_id: resource_id.into(),
            title: title.into(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
            MessageRole::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            "system" => Ok(MessageRole::System),
            other => Err(StorageError::user(
                "STORAGE_INVALID_MESSAGE_ROLE",
                format!("Unknown message role {other:?}"),
            )),
        }
    }
}

/// A stored message. `message_type` is the protocol tag (`"v1"`/`"v2"`)
/// that decides the shape of `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub resource_id: String,
    pub role: MessageRole,
    #[serde(rename = "type")]
    pub message_type: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

/// Partial update of one message. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl MessageUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_memory: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub trace_id: String,
    pub scope: String,
    pub kind: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other: Option<String>,
    /// Nanoseconds since the epoch.
    pub start_time: i64,
    pub end_time: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalResult {
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalType {
    Test,
    Live,
}

impl EvalType {
    /// An eval is a test run when `testInfo.testPath` is present and non-null.
    pub fn classify(test_info: Option<&Value>) -> Self {
        match test_info.and_then(|info| info.get("testPath")) {
            Some(path) if !path.is_null() => EvalType::Test,
            _ => EvalType::Live,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRow {
    pub run_id: String,
    pub agent_name: String,
    pub input: String,
    pub output: String,
    pub result: EvalResult,
    pub metric_name: String,
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_info: Option<Value>,
    pub global_run_id: String,
    pub created_at: DateTime<Utc>,
}

impl EvalRow {
    pub fn eval_type(&self) -> EvalType {
        EvalType::classify(self.test_info.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub workflow_name: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub snapshot: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inclusive `created_at` bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start: Some(start), end: Some(end) }
    }
}
