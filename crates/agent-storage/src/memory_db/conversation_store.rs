//! Threads and their messages: paginated and windowed reads, upserts that
//! may move messages between threads, and merge-on-write content updates
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Result, StorageError, StorageResultExt};
use crate::memory_db::message_format::{
    content_to_text, merge_message_content, parse_stored_content, MessageFormat, MessageList,
};
use crate::memory_db::operations::upsert_record;
use crate::memory_db::pagination::{or_degraded, paginate, Page, PageQuery, PageRequest};
use crate::memory_db::schema::{DateRange, Message, MessageUpdate, TableName, Thread};
use crate::memory_db::{Database, SchemaContext};
use crate::sql::builder::{Query, QueryBuilder};
use crate::sql::executor::{scoped_transaction, Executor};
use crate::sql::schema::SortDirection;
use crate::sql::value::{Record, SqlRow, SqlValue};

const THREAD_COLUMNS: [&str; 6] = ["id", "resource_id", "title", "metadata", "created_at", "updated_at"];
const MESSAGE_COLUMNS: [&str; 7] = ["id", "thread_id", "resource_id", "role", "type", "content", "created_at"];

/// Context to pull in around one message: the target plus up to
/// `with_previous_messages` older and `with_next_messages` newer messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncludeSpec {
    pub id: String,
    /// Thread of the target; defaults to the thread being read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub with_previous_messages: usize,
    #[serde(default)]
    pub with_next_messages: usize,
}

impl IncludeSpec {
    pub fn new(id: impl Into<String>, with_previous_messages: usize, with_next_messages: usize) -> Self {
        Self { id: id.into(), thread_id: None, with_previous_messages, with_next_messages }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaginatedMessagesArgs {
    pub thread_id: String,
    pub page: usize,
    pub per_page: usize,
    pub date_range: DateRange,
    pub include: Vec<IncludeSpec>,
    pub format: MessageFormat,
}

impl PaginatedMessagesArgs {
    pub fn new(thread_id: impl Into<String>, page: usize, per_page: usize) -> Self {
        Self {
            thread_id: thread_id.into(),
            page,
            per_page,
            date_range: DateRange::default(),
            include: Vec::new(),
            format: MessageFormat::V2,
        }
    }
}

/// Arguments of the legacy `get_messages` read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagesArgs {
    pub thread_id: String,
    /// Number of most recent messages; the configured page size when unset.
    pub last: Option<usize>,
    pub include: Vec<IncludeSpec>,
    pub format: MessageFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ThreadOrderField {
    #[default]
    CreatedAt,
    UpdatedAt,
}

impl ThreadOrderField {
    fn column(&self) -> &'static str {
        match self {
            ThreadOrderField::CreatedAt => "created_at",
            ThreadOrderField::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadOrder {
    pub order_by: ThreadOrderField,
    pub sort_direction: SortDirection,
}

#[derive(Clone)]
pub struct ConversationStore {
    db: Arc<Database>,
}

impl ConversationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ---- threads ----

    pub async fn get_thread_by_id(&self, thread_id: &str) -> Result<Option<Thread>> {
        let thread_id = thread_id.to_string();
        self.db
            .run(move |exec, ctx| {
                find_thread(exec, ctx, &thread_id)
                    .classify("STORAGE_GET_THREAD_BY_ID_FAILED")
                    .detail("threadId", thread_id.as_str())
            })
            .await
    }

    /// Every thread of a resource. Failures degrade to an empty list.
    #[deprecated(note = "use get_threads_by_resource_id_paginated")]
    pub async fn get_threads_by_resource_id(&self, resource_id: &str, order: ThreadOrder) -> Vec<Thread> {
        let resource_id = resource_id.to_string();
        let result: Result<Vec<Thread>> = self
            .db
            .run(move |exec, ctx| {
                let mut qb = thread_select(ctx, &resource_id)?;
                qb.push(&thread_order_clause(ctx, order)?);
                exec.run_query(&qb.build())?.iter().map(thread_from_row).collect()
            })
            .await;
        or_degraded("get_threads_by_resource_id", result, Vec::new)
    }

    pub async fn get_threads_by_resource_id_paginated(
        &self,
        resource_id: &str,
        request: PageRequest,
        order: ThreadOrder,
    ) -> Page<Thread> {
        let resource_id = resource_id.to_string();
        let result = self
            .db
            .run(move |exec, ctx| {
                let mut count = ctx.builder();
                count
                    .push("SELECT COUNT(*) FROM ")
                    .push(&ctx.table(TableName::Threads.as_str())?)
                    .and_where()
                    .push(&ctx.col("resource_id")?)
                    .push(" = ")
                    .push_bind(resource_id.as_str());

                let mut data = thread_select(ctx, &resource_id)?;
                data.push(&thread_order_clause(ctx, order)?)
                    .push_limit_offset(request.per_page, request.offset());

                let query = PageQuery { count: count.build(), data: data.build() };
                paginate(exec, request, &query, thread_from_row)
            })
            .await;
        or_degraded("get_threads_by_resource_id_paginated", result, || Page::empty(request))
    }

    /// Inserts or replaces the thread row.
    pub async fn save_thread(&self, thread: Thread) -> Result<Thread> {
        self.db
            .run(move |exec, ctx| {
                upsert_record(
                    exec,
                    ctx,
                    TableName::Threads.as_str(),
                    &thread_record(&thread),
                    &["id"],
                    &["resource_id", "title", "metadata", "updated_at"],
                )
                .classify("STORAGE_SAVE_THREAD_FAILED")
                .detail("threadId", thread.id.as_str())?;
                Ok(thread)
            })
            .await
    }

    /// Sets the title, merges `metadata` into the stored metadata and bumps
    /// `updated_at`.
    pub async fn update_thread(&self, thread_id: &str, title: &str, metadata: Map<String, Value>) -> Result<Thread> {
        let thread_id = thread_id.to_string();
        let title = title.to_string();
        self.db
            .run(move |exec, ctx| {
                scoped_transaction(exec, |tx| {
                    let mut thread = find_thread(tx, ctx, &thread_id)?.ok_or_else(|| {
                        StorageError::user(
                            "STORAGE_UPDATE_THREAD_NOT_FOUND",
                            format!("Thread {thread_id} not found"),
                        )
                    })?;
                    thread.title = title;
                    thread.metadata.extend(metadata);
                    thread.updated_at = Utc::now();

                    let mut qb = ctx.builder();
                    qb.push("UPDATE ")
                        .push(&ctx.table(TableName::Threads.as_str())?)
                        .push(" SET ")
                        .push(&ctx.col("title")?)
                        .push(" = ")
                        .push_bind(thread.title.as_str())
                        .push(", ")
                        .push(&ctx.col("metadata")?)
                        .push(" = ")
                        .push_bind(thread.metadata.clone())
                        .push(", ")
                        .push(&ctx.col("updated_at")?)
                        .push(" = ")
                        .push_bind(thread.updated_at)
                        .and_where()
                        .push(&ctx.col("id")?)
                        .push(" = ")
                        .push_bind(thread.id.as_str());
                    tx.run_statement(&qb.build())?;
                    Ok(thread)
                })
                .classify("STORAGE_UPDATE_THREAD_FAILED")
                .detail("threadId", thread_id.as_str())
            })
            .await
    }

    /// Removes the thread and every message in it.
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let thread_id = thread_id.to_string();
        self.db
            .run(move |exec, ctx| {
                scoped_transaction(exec, |tx| {
                    let mut messages = ctx.builder();
                    messages
                        .push("DELETE FROM ")
                        .push(&ctx.table(TableName::Messages.as_str())?)
                        .and_where()
                        .push(&ctx.col("thread_id")?)
                        .push(" = ")
                        .push_bind(thread_id.as_str());
                    let removed = tx.run_statement(&messages.build())?;

                    let mut thread = ctx.builder();
                    thread
                        .push("DELETE FROM ")
                        .push(&ctx.table(TableName::Threads.as_str())?)
                        .and_where()
                        .push(&ctx.col("id")?)
                        .push(" = ")
                        .push_bind(thread_id.as_str());
                    tx.run_statement(&thread.build())?;
                    debug!("Deleted thread {} with {} messages", thread_id, removed);
                    Ok(())
                })
                .classify("STORAGE_DELETE_THREAD_FAILED")
                .detail("threadId", thread_id.as_str())
            })
            .await
    }

    // ---- messages ----

    /// One page of a thread's messages, newest first in the page window and
    /// returned oldest first, together with any requested include windows.
    /// Failures degrade to an empty page.
    pub async fn get_messages_paginated(&self, args: PaginatedMessagesArgs) -> Page<Message> {
        let request = PageRequest::new(args.page, args.per_page);
        let thread_id = args.thread_id.clone();
        let result = self
            .db
            .run(move |exec, ctx| paginated_messages(exec, ctx, &args))
            .await
            .detail("threadId", thread_id.as_str());
        or_degraded("get_messages_paginated", result, || Page::empty(request))
    }

    /// The last messages of a thread plus include windows, oldest first.
    #[deprecated(note = "use get_messages_paginated")]
    pub async fn get_messages(&self, args: MessagesArgs) -> Result<Vec<Message>> {
        let last = args.last.unwrap_or(self.db.config().default_per_page);
        self.db
            .run(move |exec, ctx| {
                let mut list = MessageList::new();
                list.add_all(included_messages(exec, ctx, &args.thread_id, &args.include)?);

                if last > 0 {
                    let mut qb = message_select(ctx)?;
                    thread_filter(ctx, &mut qb, &args.thread_id, &DateRange::default())?;
                    exclude_ids(ctx, &mut qb, &list)?;
                    qb.push(" ORDER BY ")
                        .push(&recency(ctx)?)
                        .push_limit_offset(last, 0);
                    list.add_all(select_messages(exec, &qb.build())?);
                }
                Ok(list.into_sorted(args.format))
            })
            .await
            .classify("STORAGE_GET_MESSAGES_FAILED")
    }

    /// Upserts messages. A message saved under a new thread moves there, and
    /// both its old and new threads get a fresh `updated_at`.
    pub async fn save_messages(&self, messages: Vec<Message>, format: MessageFormat) -> Result<Vec<Message>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        for message in &messages {
            if message.thread_id.is_empty() || message.resource_id.is_empty() {
                return Err(StorageError::user(
                    "STORAGE_SAVE_MESSAGES_MISSING_THREAD_OR_RESOURCE",
                    "Every message needs a threadId and a resourceId",
                )
                .with_detail("messageId", message.id.as_str()));
            }
        }

        self.db
            .run(move |exec, ctx| {
                scoped_transaction(exec, |tx| save_messages_tx(tx, ctx, &messages))
                    .classify("STORAGE_SAVE_MESSAGES_FAILED")
                    .detail("numberOfMessages", messages.len())?;
                let mut list = MessageList::new();
                list.add_all(messages);
                Ok(list.into_sorted(format))
            })
            .await
    }

    /// Applies partial updates. Unknown ids are skipped; the updated rows
    /// are returned as stored, newest first.
    pub async fn update_messages(&self, updates: Vec<MessageUpdate>) -> Result<Vec<Message>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        self.db
            .run(move |exec, ctx| {
                scoped_transaction(exec, |tx| update_messages_tx(tx, ctx, &updates))
                    .classify("STORAGE_UPDATE_MESSAGES_FAILED")
            })
            .await
    }
}

fn thread_from_row(row: &SqlRow) -> Result<Thread> {
    Ok(Thread {
        id: row.text("id")?,
        resource_id: row.text("resource_id")?,
        title: row.opt_text("title")?.unwrap_or_default(),
        metadata: row.json_object("metadata")?,
        created_at: row.timestamp("created_at")?,
        updated_at: row.timestamp("updated_at")?,
    })
}

fn thread_record(thread: &Thread) -> Record {
    Record::from([
        ("id".to_string(), SqlValue::from(&thread.id)),
        ("resource_id".to_string(), SqlValue::from(&thread.resource_id)),
        ("title".to_string(), SqlValue::from(&thread.title)),
        ("metadata".to_string(), SqlValue::from(thread.metadata.clone())),
        ("created_at".to_string(), SqlValue::from(thread.created_at)),
        ("updated_at".to_string(), SqlValue::from(thread.updated_at)),
    ])
}

fn message_from_row(row: &SqlRow) -> Result<Message> {
    Ok(Message {
        id: row.text("id")?,
        thread_id: row.text("thread_id")?,
        resource_id: row.opt_text("resource_id")?.unwrap_or_default(),
        role: row.text("role")?.parse()?,
        message_type: row.text("type")?,
        content: parse_stored_content(row.text("content")?),
        created_at: row.timestamp("created_at")?,
    })
}

fn message_record(message: &Message) -> Record {
    Record::from([
        ("id".to_string(), SqlValue::from(&message.id)),
        ("thread_id".to_string(), SqlValue::from(&message.thread_id)),
        ("resource_id".to_string(), SqlValue::from(&message.resource_id)),
        ("role".to_string(), SqlValue::from(message.role.as_str())),
        ("type".to_string(), SqlValue::from(&message.message_type)),
        ("content".to_string(), SqlValue::Text(content_to_text(&message.content))),
        ("created_at".to_string(), SqlValue::from(message.created_at)),
    ])
}

fn find_thread(exec: &dyn Executor, ctx: &SchemaContext, thread_id: &str) -> Result<Option<Thread>> {
    let mut qb = ctx.builder();
    qb.push("SELECT ")
        .push(&ctx.select_list(&THREAD_COLUMNS)?)
        .push(" FROM ")
        .push(&ctx.table(TableName::Threads.as_str())?)
        .and_where()
        .push(&ctx.col("id")?)
        .push(" = ")
        .push_bind(thread_id);
    exec.query_one(&qb.build())?.as_ref().map(thread_from_row).transpose()
}

fn thread_select(ctx: &SchemaContext, resource_id: &str) -> Result<QueryBuilder> {
    let mut qb = ctx.builder();
    qb.push("SELECT ")
        .push(&ctx.select_list(&THREAD_COLUMNS)?)
        .push(" FROM ")
        .push(&ctx.table(TableName::Threads.as_str())?)
        .and_where()
        .push(&ctx.col("resource_id")?)
        .push(" = ")
        .push_bind(resource_id);
    Ok(qb)
}

fn thread_order_clause(ctx: &SchemaContext, order: ThreadOrder) -> Result<String> {
    let direction = order.sort_direction.as_sql();
    Ok(format!(
        " ORDER BY {} {direction}, {} {direction}",
        ctx.col(order.order_by.column())?,
        ctx.col("id")?
    ))
}

fn message_select(ctx: &SchemaContext) -> Result<QueryBuilder> {
    let mut qb = ctx.builder();
    qb.push("SELECT ")
        .push(&ctx.select_list(&MESSAGE_COLUMNS)?)
        .push(" FROM ")
        .push(&ctx.table(TableName::Messages.as_str())?);
    Ok(qb)
}

fn recency(ctx: &SchemaContext) -> Result<String> {
    Ok(ctx.dialect().recency_order(&ctx.col("created_at")?, &ctx.col("id")?))
}

fn thread_filter(ctx: &SchemaContext, qb: &mut QueryBuilder, thread_id: &str, range: &DateRange) -> Result<()> {
    qb.and_where().push(&ctx.col("thread_id")?).push(" = ").push_bind(thread_id);
    date_filter(ctx, qb, "created_at", range)
}

/// Inclusive bounds on a timestamp column.
pub(crate) fn date_filter(ctx: &SchemaContext, qb: &mut QueryBuilder, column: &str, range: &DateRange) -> Result<()> {
    if let Some(start) = range.start {
        qb.and_where().push(&ctx.col(column)?).push(" >= ").push_bind(start);
    }
    if let Some(end) = range.end {
        qb.and_where().push(&ctx.col(column)?).push(" <= ").push_bind(end);
    }
    Ok(())
}

fn exclude_ids(ctx: &SchemaContext, qb: &mut QueryBuilder, list: &MessageList) -> Result<()> {
    let ids = list.ids();
    if !ids.is_empty() {
        qb.and_where()
            .push(&ctx.col("id")?)
            .push(" NOT IN (")
            .push_bind_list(ids)
            .push(")");
    }
    Ok(())
}

fn select_messages(exec: &dyn Executor, query: &Query) -> Result<Vec<Message>> {
    exec.run_query(query)?.iter().map(message_from_row).collect()
}

/// Ranks the thread newest first (rank 1 = most recent) and keeps the ranks
/// from `target - with_next_messages` to `target + with_previous_messages`.
fn window_query(ctx: &SchemaContext, thread_id: &str, include: &IncludeSpec) -> Result<Query> {
    let columns = ctx.select_list(&MESSAGE_COLUMNS)?;
    let mut qb = ctx.builder();
    qb.push(&format!(
        "WITH ordered AS (SELECT {columns}, ROW_NUMBER() OVER (ORDER BY {}) AS row_num FROM {}",
        recency(ctx)?,
        ctx.table(TableName::Messages.as_str())?
    ))
    .and_where()
    .push(&ctx.col("thread_id")?)
    .push(" = ")
    .push_bind(thread_id)
    .push(&format!("), target AS (SELECT row_num FROM ordered WHERE {} = ", ctx.col("id")?))
    .push_bind(include.id.as_str())
    .push(&format!(
        ") SELECT {columns} FROM ordered, target \
         WHERE ordered.row_num BETWEEN target.row_num - "
    ))
    .push_bind(include.with_next_messages as i64)
    .push(" AND target.row_num + ")
    .push_bind(include.with_previous_messages as i64)
    .push(" ORDER BY ordered.row_num DESC");
    Ok(qb.build())
}

fn included_messages(
    exec: &dyn Executor,
    ctx: &SchemaContext,
    thread_id: &str,
    include: &[IncludeSpec],
) -> Result<Vec<Message>> {
    let mut list = MessageList::new();
    for spec in include {
        let thread = spec.thread_id.as_deref().unwrap_or(thread_id);
        list.add_all(select_messages(exec, &window_query(ctx, thread, spec)?)?);
    }
    Ok(list.into_messages())
}

fn paginated_messages(exec: &dyn Executor, ctx: &SchemaContext, args: &PaginatedMessagesArgs) -> Result<Page<Message>> {
    let request = PageRequest::new(args.page, args.per_page);
    let mut list = MessageList::new();
    list.add_all(included_messages(exec, ctx, &args.thread_id, &args.include)?);

    let mut count = ctx.builder();
    count.push("SELECT COUNT(*) FROM ").push(&ctx.table(TableName::Messages.as_str())?);
    thread_filter(ctx, &mut count, &args.thread_id, &args.date_range)?;

    let mut data = message_select(ctx)?;
    thread_filter(ctx, &mut data, &args.thread_id, &args.date_range)?;
    exclude_ids(ctx, &mut data, &list)?;
    data.push(" ORDER BY ")
        .push(&recency(ctx)?)
        .push_limit_offset(request.per_page, request.offset());

    let query = PageQuery { count: count.build(), data: data.build() };
    let page = paginate(exec, request, &query, message_from_row)?;
    if page.total == 0 && list.is_empty() {
        return Ok(page);
    }

    list.add_all(page.items);
    Ok(Page {
        items: list.into_sorted(args.format),
        total: page.total,
        page: page.page,
        per_page: page.per_page,
        has_more: page.has_more,
    })
}

fn ids_in(ctx: &SchemaContext, qb: &mut QueryBuilder, column: &str, ids: &[String]) -> Result<()> {
    qb.and_where()
        .push(&ctx.col(column)?)
        .push(" IN (")
        .push_bind_list(ids.iter())
        .push(")");
    Ok(())
}

/// One statement setting `updated_at` on every listed thread.
fn touch_threads(exec: &dyn Executor, ctx: &SchemaContext, thread_ids: &BTreeSet<String>, now: DateTime<Utc>) -> Result<()> {
    if thread_ids.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = thread_ids.iter().cloned().collect();
    let mut qb = ctx.builder();
    qb.push("UPDATE ")
        .push(&ctx.table(TableName::Threads.as_str())?)
        .push(" SET ")
        .push(&ctx.col("updated_at")?)
        .push(" = ")
        .push_bind(now);
    ids_in(ctx, &mut qb, "id", &ids)?;
    exec.run_statement(&qb.build())?;
    Ok(())
}

fn save_messages_tx(tx: &dyn Executor, ctx: &SchemaContext, messages: &[Message]) -> Result<()> {
    let thread_ids: BTreeSet<String> = messages.iter().map(|m| m.thread_id.clone()).collect();
    let wanted: Vec<String> = thread_ids.iter().cloned().collect();

    let mut existing_threads = ctx.builder();
    existing_threads
        .push("SELECT ")
        .push(&ctx.col("id")?)
        .push(" FROM ")
        .push(&ctx.table(TableName::Threads.as_str())?);
    ids_in(ctx, &mut existing_threads, "id", &wanted)?;
    let found = tx
        .run_query(&existing_threads.build())?
        .iter()
        .map(|row| row.text("id"))
        .collect::<Result<BTreeSet<_>>>()?;
    if let Some(missing) = thread_ids.difference(&found).next() {
        return Err(StorageError::user(
            "STORAGE_SAVE_MESSAGES_THREAD_NOT_FOUND",
            format!("Thread {missing} not found"),
        )
        .with_detail("threadId", missing.as_str()));
    }

    // messages already stored elsewhere are moving; their old thread changes too
    let message_ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
    let mut previous = ctx.builder();
    previous
        .push("SELECT ")
        .push(&ctx.select_list(&["id", "thread_id"])?)
        .push(" FROM ")
        .push(&ctx.table(TableName::Messages.as_str())?);
    ids_in(ctx, &mut previous, "id", &message_ids)?;
    let mut touched = thread_ids;
    for row in tx.run_query(&previous.build())? {
        touched.insert(row.text("thread_id")?);
    }

    for message in messages {
        upsert_record(
            tx,
            ctx,
            TableName::Messages.as_str(),
            &message_record(message),
            &["id"],
            &["thread_id", "resource_id", "role", "type", "content"],
        )?;
    }
    touch_threads(tx, ctx, &touched, Utc::now())?;
    debug!("Saved {} messages across {} threads", messages.len(), touched.len());
    Ok(())
}

fn update_messages_tx(tx: &dyn Executor, ctx: &SchemaContext, updates: &[MessageUpdate]) -> Result<Vec<Message>> {
    let ids: Vec<String> = updates.iter().map(|u| u.id.clone()).collect();
    let mut existing_query = message_select(ctx)?;
    ids_in(ctx, &mut existing_query, "id", &ids)?;
    let existing: HashMap<String, Message> = select_messages(tx, &existing_query.build())?
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect();
    if existing.is_empty() {
        return Ok(Vec::new());
    }

    let mut touched = BTreeSet::new();
    for update in updates {
        let Some(current) = existing.get(&update.id) else {
            debug!("Skipping update for unknown message {}", update.id);
            continue;
        };
        touched.insert(current.thread_id.clone());

        let mut assignments: Vec<(&str, SqlValue)> = Vec::new();
        if let Some(role) = update.role {
            assignments.push(("role", role.as_str().into()));
        }
        if let Some(message_type) = &update.message_type {
            assignments.push(("type", message_type.into()));
        }
        if let Some(thread_id) = &update.thread_id {
            touched.insert(thread_id.clone());
            assignments.push(("thread_id", thread_id.into()));
        }
        if let Some(content) = &update.content {
            let merged = merge_message_content(&current.content, content.clone());
            assignments.push(("content", SqlValue::Text(content_to_text(&merged))));
        }
        if assignments.is_empty() {
            continue;
        }

        let mut qb = ctx.builder();
        qb.push("UPDATE ").push(&ctx.table(TableName::Messages.as_str())?).push(" SET ");
        for (i, (column, value)) in assignments.into_iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(&ctx.col(column)?).push(" = ").push_bind(value);
        }
        qb.and_where().push(&ctx.col("id")?).push(" = ").push_bind(update.id.as_str());
        tx.run_statement(&qb.build())?;
    }

    touch_threads(tx, ctx, &touched, Utc::now())?;

    let updated_ids: Vec<String> = existing.into_keys().collect();
    let mut refreshed = message_select(ctx)?;
    ids_in(ctx, &mut refreshed, "id", &updated_ids)?;
    refreshed.push(" ORDER BY ").push(&recency(ctx)?);
    select_messages(tx, &refreshed.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::schema::MessageRole;
    use crate::memory_db::AgentStorage;
    use crate::sql::dialect::Dialect;
    use chrono::Duration;
    use serde_json::json;

    async fn storage() -> AgentStorage {
        let storage = AgentStorage::new_in_memory().unwrap();
        storage.init().await.unwrap();
        storage
    }

    fn message(id: &str, thread_id: &str, minutes: i64, content: Value) -> Message {
        Message {
            id: id.into(),
            thread_id: thread_id.into(),
            resource_id: "res-1".into(),
            role: MessageRole::User,
            message_type: "v2".into(),
            content,
            created_at: Utc::now() - Duration::days(1) + Duration::minutes(minutes),
        }
    }

    #[test]
    fn test_window_query_ranks_newest_first() {
        let ctx = SchemaContext::new(Dialect::Postgres, Some("tenant_a")).unwrap();
        let query = window_query(&ctx, "t1", &IncludeSpec::new("m5", 2, 1)).unwrap();
        assert!(query.sql.starts_with("WITH ordered AS (SELECT \"id\""));
        assert!(query.sql.contains(
            "ROW_NUMBER() OVER (ORDER BY \"created_at\" DESC, \"id\" DESC) AS row_num \
             FROM \"tenant_a\".\"agent_messages\" WHERE \"thread_id\" = $1"
        ));
        assert!(query.sql.contains("BETWEEN target.row_num - $3 AND target.row_num + $4"));
        assert_eq!(query.params[2], SqlValue::Integer(1));
        assert_eq!(query.params[3], SqlValue::Integer(2));
    }

    #[tokio::test]
    async fn test_save_and_page_messages() {
        let storage = storage().await;
        let store = &storage.conversations;
        store.save_thread(Thread::new("t1", "res-1", "first")).await.unwrap();
        let saved = store
            .save_messages(
                vec![message("m1", "t1", 0, json!("hello")), message("m2", "t1", 1, json!({"text": "hi"}))],
                MessageFormat::V2,
            )
            .await
            .unwrap();
        assert_eq!(saved.len(), 2);

        let page = store.get_messages_paginated(PaginatedMessagesArgs::new("t1", 0, 1)).await;
        assert_eq!(page.total, 2);
        assert!(page.has_more);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "m2");
        assert_eq!(page.items[0].content, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_save_messages_requires_existing_thread() {
        let storage = storage().await;
        let err = storage
            .conversations
            .save_messages(vec![message("m1", "nope", 0, json!("x"))], MessageFormat::V2)
            .await
            .unwrap_err();
        assert_eq!(err.id, "STORAGE_SAVE_MESSAGES_THREAD_NOT_FOUND");
        assert!(err.is_user());

        let mut orphan = message("m2", "t1", 0, json!("x"));
        orphan.resource_id.clear();
        let err = storage
            .conversations
            .save_messages(vec![orphan], MessageFormat::V2)
            .await
            .unwrap_err();
        assert_eq!(err.id, "STORAGE_SAVE_MESSAGES_MISSING_THREAD_OR_RESOURCE");
    }

    #[tokio::test]
    async fn test_update_messages_merges_content() {
        let storage = storage().await;
        let store = &storage.conversations;
        store.save_thread(Thread::new("t1", "res-1", "first")).await.unwrap();
        store
            .save_messages(
                vec![message("m1", "t1", 0, json!({"text": "a", "metadata": {"x": 1}}))],
                MessageFormat::V2,
            )
            .await
            .unwrap();

        let mut update = MessageUpdate::new("m1");
        update.content = Some(json!({"metadata": {"y": 2}}));
        let updated = store
            .update_messages(vec![update, MessageUpdate::new("missing")])
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].content, json!({"text": "a", "metadata": {"x": 1, "y": 2}}));

        let none = store.update_messages(vec![MessageUpdate::new("missing")]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_thread_is_a_user_error() {
        let storage = storage().await;
        let err = storage
            .conversations
            .update_thread("ghost", "title", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.id, "STORAGE_UPDATE_THREAD_NOT_FOUND");
    }

    #[tokio::test]
    #[allow(deprecated)]
    async fn test_legacy_get_messages_takes_the_latest() {
        let storage = storage().await;
        let store = &storage.conversations;
        store.save_thread(Thread::new("t1", "res-1", "first")).await.unwrap();
        let messages = (0..5).map(|i| message(&format!("m{i}"), "t1", i, json!(format!("msg {i}")))).collect();
        store.save_messages(messages, MessageFormat::V1).await.unwrap();

        let args = MessagesArgs { thread_id: "t1".into(), last: Some(2), ..Default::default() };
        let latest = store.get_messages(args).await.unwrap();
        let ids: Vec<&str> = latest.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m4"]);
        assert_eq!(latest[0].content, json!("msg 3"));
    }
}
