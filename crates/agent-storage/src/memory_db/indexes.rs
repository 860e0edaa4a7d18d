//! Index lifecycle: create, drop, list and the automatic composite indexes
use tracing::{debug, info, warn};

use crate::error::{Result, StorageResultExt};
use crate::memory_db::operations::StoreOperations;
use crate::memory_db::schema::TableName;
use crate::memory_db::SchemaContext;
use crate::sql::executor::Executor;
use crate::sql::identifier::Ident;
use crate::sql::schema::{IndexInfo, IndexSpec};

/// Composite indexes backing the hot read paths, named with the schema
/// prefix when one is configured.
pub fn automatic_indexes(ctx: &SchemaContext) -> Vec<IndexSpec> {
    [
        (TableName::Threads, ["resource_id", "created_at DESC"], "resourceid_createdat"),
        (TableName::Messages, ["thread_id", "created_at DESC"], "thread_id_createdat"),
        (TableName::Traces, ["name", "start_time DESC"], "name_starttime"),
        (TableName::Evals, ["agent_name", "created_at DESC"], "agent_name_created_at"),
    ]
    .into_iter()
    .map(|(table, columns, suffix)| {
        let name = ctx.index_name(&format!("{}_{suffix}_idx", table.as_str()));
        IndexSpec::new(name, table.as_str(), &columns)
    })
    .collect()
}

impl StoreOperations {
    pub async fn create_index(&self, index: IndexSpec) -> Result<()> {
        let name = index.name.clone();
        self.db
            .run(move |exec, ctx| {
                create_index_sync(exec, ctx, &index)
                    .classify("STORAGE_INDEX_CREATE_FAILED")
                    .detail("indexName", index.name.as_str())
            })
            .await?;
        debug!("Index {} ready", name);
        Ok(())
    }

    /// Dropping an index that does not exist succeeds.
    pub async fn drop_index(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.db
            .run(move |exec, ctx| {
                drop_index_sync(exec, ctx, &name)
                    .classify("STORAGE_INDEX_DROP_FAILED")
                    .detail("indexName", name.as_str())
            })
            .await
    }

    pub async fn list_indexes(&self, table: Option<&str>) -> Result<Vec<IndexInfo>> {
        let table = table.map(str::to_string);
        self.db
            .run(move |exec, ctx| {
                list_indexes_sync(exec, ctx, table.as_deref())
                    .classify("STORAGE_LIST_INDEXES_FAILED")
            })
            .await
    }

    /// Creates each automatic index independently. Failures are logged and
    /// skipped; the names that were created are returned.
    pub async fn create_automatic_indexes(&self) -> Vec<String> {
        let mut created = Vec::new();
        for index in automatic_indexes(self.db.context()) {
            let name = index.name.clone();
            match self.create_index(index).await {
                Ok(()) => created.push(name),
                Err(e) => warn!("Failed to create index {}: {}", name, e),
            }
        }
        created
    }
}

fn create_index_sync(exec: &dyn Executor, ctx: &SchemaContext, index: &IndexSpec) -> Result<()> {
    let validated = index.validate()?;
    let qualified = ctx.table(validated.table.as_str())?;
    let sql = ctx.dialect().create_index(&qualified, &validated)?;
    exec.run_script(&sql)
}

fn drop_index_sync(exec: &dyn Executor, ctx: &SchemaContext, name: &str) -> Result<()> {
    let ident = Ident::new(name)?;
    let Some(info) = list_indexes_sync(exec, ctx, None)?.into_iter().find(|i| i.name == name) else {
        debug!("Index {} not found, nothing to drop", name);
        return Ok(());
    };
    let qualified = ctx.table(&info.table)?;
    exec.run_script(&ctx.dialect().drop_index(ctx.schema(), &qualified, &ident))?;
    info!("Dropped index {} on {}", name, info.table);
    Ok(())
}

fn list_indexes_sync(exec: &dyn Executor, ctx: &SchemaContext, table: Option<&str>) -> Result<Vec<IndexInfo>> {
    let table = table.map(Ident::table).transpose()?;
    let rows = exec.run_query(&ctx.dialect().list_indexes(ctx.schema(), table.as_ref()))?;
    rows.iter()
        .map(|row| {
            Ok(IndexInfo::from_definition(
                row.text("name")?,
                row.text("table_name")?,
                row.text("definition")?,
            ))
        })
        .collect()
}
