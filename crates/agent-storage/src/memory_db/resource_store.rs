//! Resources: per-user working memory and metadata shared across threads
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Result, StorageResultExt};
use crate::memory_db::operations::upsert_record;
use crate::memory_db::schema::{Resource, TableName};
use crate::memory_db::{Database, SchemaContext};
use crate::sql::executor::{scoped_transaction, Executor};
use crate::sql::value::{Record, SqlRow, SqlValue};

const RESOURCE_COLUMNS: [&str; 5] = ["id", "working_memory", "metadata", "created_at", "updated_at"];

#[derive(Clone)]
pub struct ResourceStore {
    db: Arc<Database>,
}

impl ResourceStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn get_resource_by_id(&self, resource_id: &str) -> Result<Option<Resource>> {
        let resource_id = resource_id.to_string();
        self.db
            .run(move |exec, ctx| {
                find_resource(exec, ctx, &resource_id)
                    .classify("STORAGE_GET_RESOURCE_BY_ID_FAILED")
                    .detail("resourceId", resource_id.as_str())
            })
            .await
    }

    pub async fn save_resource(&self, resource: Resource) -> Result<Resource> {
        self.db
            .run(move |exec, ctx| {
                write_resource(exec, ctx, &resource)
                    .classify("STORAGE_SAVE_RESOURCE_FAILED")
                    .detail("resourceId", resource.id.as_str())?;
                Ok(resource)
            })
            .await
    }

    /// Replaces the working memory when given and merges `metadata` into the
    /// stored metadata. A missing resource is created.
    pub async fn update_resource(
        &self,
        resource_id: &str,
        working_memory: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Resource> {
        let resource_id = resource_id.to_string();
        self.db
            .run(move |exec, ctx| {
                scoped_transaction(exec, |tx| {
                    let now = Utc::now();
                    let mut resource = match find_resource(tx, ctx, &resource_id)? {
                        Some(existing) => existing,
                        None => {
                            debug!("Resource {} not found, creating it", resource_id);
                            Resource {
                                id: resource_id.clone(),
                                working_memory: None,
                                metadata: Map::new(),
                                created_at: now,
                                updated_at: now,
                            }
                        }
                    };
                    if working_memory.is_some() {
                        resource.working_memory = working_memory;
                    }
                    if let Some(metadata) = metadata {
                        resource.metadata.extend(metadata);
                    }
                    resource.updated_at = now;
                    write_resource(tx, ctx, &resource)?;
                    Ok(resource)
                })
                .classify("STORAGE_UPDATE_RESOURCE_FAILED")
                .detail("resourceId", resource_id.as_str())
            })
            .await
    }
}

fn resource_from_row(row: &SqlRow) -> Result<Resource> {
    Ok(Resource {
        id: row.text("id")?,
        working_memory: row.opt_text("working_memory")?,
        metadata: row.json_object("metadata")?,
        created_at: row.timestamp("created_at")?,
        updated_at: row.timestamp("updated_at")?,
    })
}

fn find_resource(exec: &dyn Executor, ctx: &SchemaContext, resource_id: &str) -> Result<Option<Resource>> {
    let mut qb = ctx.builder();
    qb.push("SELECT ")
        .push(&ctx.select_list(&RESOURCE_COLUMNS)?)
        .push(" FROM ")
        .push(&ctx.table(TableName::Resources.as_str())?)
        .and_where()
        .push(&ctx.col("id")?)
        .push(" = ")
        .push_bind(resource_id);
    exec.query_one(&qb.build())?.as_ref().map(resource_from_row).transpose()
}

fn write_resource(exec: &dyn Executor, ctx: &SchemaContext, resource: &Resource) -> Result<()> {
    let record = Record::from([
        ("id".to_string(), SqlValue::from(&resource.id)),
        ("working_memory".to_string(), SqlValue::from(resource.working_memory.clone())),
        ("metadata".to_string(), SqlValue::from(resource.metadata.clone())),
        ("created_at".to_string(), SqlValue::from(resource.created_at)),
        ("updated_at".to_string(), SqlValue::from(resource.updated_at)),
    ]);
    upsert_record(
        exec,
        ctx,
        TableName::Resources.as_str(),
        &record,
        &["id"],
        &["working_memory", "metadata", "updated_at"],
    )
}
