use std::collections::BTreeSet;

use agent_storage::memory_db::{DateRange, EvalResult, EvalRow, EvalType, Message, MessageRole, MessageUpdate, Thread};
use agent_storage::{
    AgentStorage, EvalQuery, IncludeSpec, MessageFormat, PageRequest, PaginatedMessagesArgs, StorageConfig,
    ThreadOrder,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

async fn file_storage() -> (TempDir, AgentStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = AgentStorage::new(StorageConfig::new(dir.path().join("agent.db"))).unwrap();
    storage.init().await.unwrap();
    (dir, storage)
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

fn message(id: &str, thread_id: &str, minute: i64) -> Message {
    Message {
        id: id.into(),
        thread_id: thread_id.into(),
        resource_id: "user-1".into(),
        role: MessageRole::User,
        message_type: "text".into(),
        content: json!({"parts": [{"type": "text", "text": id}]}),
        created_at: base_time() + Duration::minutes(minute),
    }
}

fn old_thread(id: &str) -> Thread {
    let mut thread = Thread::new(id, "user-1", id);
    thread.created_at = base_time() - Duration::days(30);
    thread.updated_at = thread.created_at;
    thread
}

/// Ten messages m1..m10, m10 newest.
async fn seeded_thread(storage: &AgentStorage) {
    storage.conversations.save_thread(old_thread("t1")).await.unwrap();
    let messages = (1..=10).map(|i| message(&format!("m{i}"), "t1", i)).collect();
    storage.conversations.save_messages(messages, MessageFormat::V2).await.unwrap();
}

fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}

#[tokio::test]
async fn upserting_the_same_message_keeps_one_row() {
    let (_dir, storage) = file_storage().await;
    storage.conversations.save_thread(old_thread("t1")).await.unwrap();

    let mut first = message("m1", "t1", 0);
    storage.conversations.save_messages(vec![first.clone()], MessageFormat::V2).await.unwrap();
    first.content = json!("edited");
    storage.conversations.save_messages(vec![first], MessageFormat::V2).await.unwrap();

    let page = storage.conversations.get_messages_paginated(PaginatedMessagesArgs::new("t1", 0, 10)).await;
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].content["content"], "edited");
}

#[tokio::test]
async fn moving_a_message_touches_both_threads() {
    let (_dir, storage) = file_storage().await;
    let store = &storage.conversations;
    let source = store.save_thread(old_thread("source")).await.unwrap();
    store.save_thread(old_thread("target")).await.unwrap();
    store.save_messages(vec![message("m1", "source", 0)], MessageFormat::V2).await.unwrap();

    // reset the source so the move itself must bump it
    store.save_thread(source.clone()).await.unwrap();
    store.save_messages(vec![message("m1", "target", 0)], MessageFormat::V2).await.unwrap();

    let source_after = store.get_thread_by_id("source").await.unwrap().unwrap();
    let target_after = store.get_thread_by_id("target").await.unwrap().unwrap();
    assert!(source_after.updated_at > source.updated_at);
    assert!(target_after.updated_at > source.updated_at);

    let in_source = store.get_messages_paginated(PaginatedMessagesArgs::new("source", 0, 10)).await;
    let in_target = store.get_messages_paginated(PaginatedMessagesArgs::new("target", 0, 10)).await;
    assert_eq!(in_source.total, 0);
    assert_eq!(ids(&in_target.items), vec!["m1"]);
}

#[tokio::test]
async fn content_updates_deep_merge_metadata() {
    let (_dir, storage) = file_storage().await;
    storage.conversations.save_thread(old_thread("t1")).await.unwrap();
    let mut original = message("m1", "t1", 0);
    original.content = json!({"format": 2, "parts": [{"type": "text", "text": "hi"}], "metadata": {"a": 1, "b": 1}});
    storage.conversations.save_messages(vec![original], MessageFormat::V2).await.unwrap();

    let mut update = MessageUpdate::new("m1");
    update.content = Some(json!({"metadata": {"b": 2, "c": 3}}));
    let updated = storage.conversations.update_messages(vec![update]).await.unwrap();

    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].content["metadata"], json!({"a": 1, "b": 2, "c": 3}));
    assert_eq!(updated[0].content["parts"][0]["text"], "hi");
}

#[tokio::test]
async fn include_window_spans_previous_and_next() {
    let (_dir, storage) = file_storage().await;
    seeded_thread(&storage).await;

    // newest first m10 is rank 1, so m6 is rank 5; ranks 4..=7 are m7, m6, m5, m4
    let mut args = PaginatedMessagesArgs::new("t1", 0, 0);
    args.include = vec![IncludeSpec::new("m6", 2, 1)];
    let page = storage.conversations.get_messages_paginated(args).await;
    assert_eq!(ids(&page.items), vec!["m4", "m5", "m6", "m7"]);
}

#[tokio::test]
async fn include_window_clips_at_thread_edges() {
    let (_dir, storage) = file_storage().await;
    seeded_thread(&storage).await;

    let mut newest = PaginatedMessagesArgs::new("t1", 0, 0);
    newest.include = vec![IncludeSpec::new("m10", 1, 5)];
    let page = storage.conversations.get_messages_paginated(newest).await;
    assert_eq!(ids(&page.items), vec!["m9", "m10"]);

    let mut oldest = PaginatedMessagesArgs::new("t1", 0, 0);
    oldest.include = vec![IncludeSpec::new("m1", 5, 1)];
    let page = storage.conversations.get_messages_paginated(oldest).await;
    assert_eq!(ids(&page.items), vec!["m1", "m2"]);
}

#[tokio::test]
async fn included_messages_are_not_repeated_by_the_page() {
    let (_dir, storage) = file_storage().await;
    seeded_thread(&storage).await;

    let mut args = PaginatedMessagesArgs::new("t1", 0, 3);
    args.include = vec![IncludeSpec::new("m9", 0, 1)];
    let page = storage.conversations.get_messages_paginated(args).await;
    let unique: BTreeSet<String> = ids(&page.items).into_iter().collect();
    assert_eq!(unique.len(), page.items.len());
    assert_eq!(page.total, 10);
    assert!(page.items.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test]
async fn scalar_content_reads_back_as_json() {
    let (_dir, storage) = file_storage().await;
    storage.conversations.save_thread(old_thread("t1")).await.unwrap();
    let messages = [("a", json!(42)), ("b", json!(true)), ("c", Value::Null)]
        .into_iter()
        .enumerate()
        .map(|(i, (id, content))| Message { content, ..message(id, "t1", i as i64) })
        .collect();
    storage.conversations.save_messages(messages, MessageFormat::V2).await.unwrap();

    let page = storage.conversations.get_messages_paginated(PaginatedMessagesArgs::new("t1", 0, 10)).await;
    let contents: Vec<&Value> = page.items.iter().map(|m| &m.content).collect();
    assert_eq!(contents, vec![&json!(42), &json!(true), &Value::Null]);
}

#[tokio::test]
async fn date_range_bounds_are_inclusive_and_counted() {
    let (_dir, storage) = file_storage().await;
    storage.conversations.save_thread(old_thread("t1")).await.unwrap();
    let messages = (0..5).map(|i| message(&format!("m{i}"), "t1", i)).collect();
    storage.conversations.save_messages(messages, MessageFormat::V2).await.unwrap();

    let mut args = PaginatedMessagesArgs::new("t1", 0, 10);
    args.date_range = DateRange::between(base_time() + Duration::minutes(1), base_time() + Duration::minutes(3));
    let page = storage.conversations.get_messages_paginated(args).await;
    assert_eq!(page.total, 3);
    assert_eq!(ids(&page.items), vec!["m1", "m2", "m3"]);
    assert!(!page.has_more);
}

#[tokio::test]
async fn moving_a_message_by_update_touches_both_threads() {
    let (_dir, storage) = file_storage().await;
    let store = &storage.conversations;
    let source = store.save_thread(old_thread("source")).await.unwrap();
    store.save_thread(old_thread("target")).await.unwrap();
    store.save_messages(vec![message("m1", "source", 0)], MessageFormat::V2).await.unwrap();
    store.save_thread(source.clone()).await.unwrap();
    store.save_thread(old_thread("target")).await.unwrap();

    let mut update = MessageUpdate::new("m1");
    update.thread_id = Some("target".into());
    let updated = store.update_messages(vec![update]).await.unwrap();
    assert_eq!(updated[0].thread_id, "target");

    let in_source = store.get_messages_paginated(PaginatedMessagesArgs::new("source", 0, 10)).await;
    let in_target = store.get_messages_paginated(PaginatedMessagesArgs::new("target", 0, 10)).await;
    assert_eq!(in_source.total, 0);
    assert_eq!(ids(&in_target.items), vec!["m1"]);

    let source_after = store.get_thread_by_id("source").await.unwrap().unwrap();
    let target_after = store.get_thread_by_id("target").await.unwrap().unwrap();
    assert!(source_after.updated_at > source.updated_at);
    assert!(target_after.updated_at > source.updated_at);
}

#[tokio::test]
async fn deleting_a_thread_removes_its_messages() {
    let (_dir, storage) = file_storage().await;
    seeded_thread(&storage).await;

    storage.conversations.delete_thread("t1").await.unwrap();
    assert!(storage.conversations.get_thread_by_id("t1").await.unwrap().is_none());
    let page = storage.conversations.get_messages_paginated(PaginatedMessagesArgs::new("t1", 0, 10)).await;
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn reads_degrade_to_empty_pages_when_the_table_is_gone() {
    let (_dir, storage) = file_storage().await;
    seeded_thread(&storage).await;
    storage.operations.drop_table("agent_messages").await.unwrap();

    let page = storage.conversations.get_messages_paginated(PaginatedMessagesArgs::new("t1", 1, 5)).await;
    assert!(page.items.is_empty());
    assert_eq!(page.total, 0);
    assert_eq!(page.page, 1);
    assert_eq!(page.per_page, 5);
    assert!(!page.has_more);

    let write = storage.conversations.save_messages(vec![message("m11", "t1", 11)], MessageFormat::V2).await;
    assert_eq!(write.unwrap_err().id, "STORAGE_SAVE_MESSAGES_FAILED");
}

#[tokio::test]
async fn thread_pages_cover_every_thread_once() {
    let (_dir, storage) = file_storage().await;
    for i in 0..7 {
        storage.conversations.save_thread(Thread::new(format!("t{i}"), "user-1", "title")).await.unwrap();
    }
    storage.conversations.save_thread(Thread::new("other", "user-2", "title")).await.unwrap();

    let mut seen = BTreeSet::new();
    let mut page_number = 0;
    loop {
        let page = storage
            .conversations
            .get_threads_by_resource_id_paginated("user-1", PageRequest::new(page_number, 3), ThreadOrder::default())
            .await;
        assert_eq!(page.total, 7);
        for thread in &page.items {
            assert!(seen.insert(thread.id.clone()));
        }
        if !page.has_more {
            break;
        }
        page_number += 1;
    }
    assert_eq!(seen.len(), 7);
    assert_eq!(page_number, 2);
}

fn eval(i: usize, test: bool) -> EvalRow {
    EvalRow {
        run_id: format!("run-{i}"),
        agent_name: "support-agent".into(),
        input: "question".into(),
        output: "answer".into(),
        result: EvalResult { score: i as f64 / 25.0, info: None },
        metric_name: "relevance".into(),
        instructions: "rate relevance".into(),
        test_info: test.then(|| json!({"testPath": format!("evals/{i}.test.ts")})),
        global_run_id: "global-1".into(),
        created_at: base_time() + Duration::seconds(i as i64),
    }
}

#[tokio::test]
async fn evals_split_into_test_and_live_pages() {
    let (_dir, storage) = file_storage().await;
    for i in 0..25 {
        storage.evals.save_eval(eval(i, i % 2 == 0)).await.unwrap();
    }

    let mut query = EvalQuery::page(0, 10);
    query.agent_name = Some("support-agent".into());
    query.eval_type = Some(EvalType::Test);
    let tests = storage.evals.get_evals(query.clone()).await;
    assert_eq!(tests.total, 13);
    assert_eq!(tests.items.len(), 10);
    assert!(tests.has_more);
    assert_eq!(tests.items[0].run_id, "run-24");

    query.eval_type = Some(EvalType::Live);
    query.page = 1;
    let live = storage.evals.get_evals(query).await;
    assert_eq!(live.total, 12);
    assert_eq!(live.items.len(), 2);
    assert!(!live.has_more);
    assert!(live.items.iter().all(|e| e.eval_type() == EvalType::Live));
}

#[tokio::test]
async fn eval_date_range_filters_the_count() {
    let (_dir, storage) = file_storage().await;
    for i in 0..10 {
        storage.evals.save_eval(eval(i, false)).await.unwrap();
    }

    let mut query = EvalQuery::page(0, 20);
    query.date_range = DateRange::between(base_time() + Duration::seconds(2), base_time() + Duration::seconds(5));
    let page = storage.evals.get_evals(query).await;
    assert_eq!(page.total, 4);
    let run_ids: Vec<&str> = page.items.iter().map(|e| e.run_id.as_str()).collect();
    assert_eq!(run_ids, vec!["run-5", "run-4", "run-3", "run-2"]);
}

#[tokio::test]
async fn automatic_indexes_survive_repeated_init() {
    let (_dir, storage) = file_storage().await;
    storage.init().await.unwrap();
    let created = storage.operations.create_automatic_indexes().await;
    assert_eq!(created.len(), 4);

    let indexes = storage.operations.list_indexes(Some("agent_messages")).await.unwrap();
    let names: Vec<&str> = indexes.iter().map(|i| i.name.as_str()).collect();
    assert!(names.contains(&"agent_messages_thread_id_createdat_idx"));
    assert_eq!(names.iter().filter(|n| n.ends_with("_createdat_idx")).count(), 1);
}

#[tokio::test]
async fn storage_reopens_with_existing_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("agent.db");
    {
        let storage = AgentStorage::new(StorageConfig::new(&path)).unwrap();
        storage.init().await.unwrap();
        storage.conversations.save_thread(Thread::new("t1", "user-1", "kept")).await.unwrap();
    }
    let storage = AgentStorage::new(StorageConfig::new(&path)).unwrap();
    storage.init().await.unwrap();
    let thread = storage.conversations.get_thread_by_id("t1").await.unwrap().unwrap();
    assert_eq!(thread.title, "kept");
    assert_eq!(thread.metadata, serde_json::Map::<String, Value>::new());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn message_pages_partition_the_thread(count in 0usize..30, per_page in 1usize..8) {
        tokio_test::block_on(async {
            let storage = AgentStorage::new_in_memory().unwrap();
            storage.init().await.unwrap();
            storage.conversations.save_thread(Thread::new("t1", "user-1", "t")).await.unwrap();
            let messages: Vec<Message> =
                (0..count).map(|i| message(&format!("m{i:02}"), "t1", i as i64)).collect();
            storage.conversations.save_messages(messages, MessageFormat::V2).await.unwrap();

            let mut seen = BTreeSet::new();
            let mut page_number = 0;
            loop {
                let page = storage
                    .conversations
                    .get_messages_paginated(PaginatedMessagesArgs::new("t1", page_number, per_page))
                    .await;
                prop_assert_eq!(page.total, count as u64);
                prop_assert!(page.items.len() <= per_page);
                for m in &page.items {
                    prop_assert!(seen.insert(m.id.clone()));
                }
                if !page.has_more {
                    break;
                }
                page_number += 1;
            }
            prop_assert_eq!(seen.len(), count);
            Ok(())
        })?;
    }
}
