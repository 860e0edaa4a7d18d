//! Schema creation and forward column migrations

use tracing::info;

use crate::error::Result;
use crate::memory_db::operations::StoreOperations;
use crate::memory_db::schema::TableName;

/// Creates every table that is missing and adds columns introduced after
/// the table was first created. Running it again is a no-op.
pub async fn initialize(ops: &StoreOperations) -> Result<()> {
    info!("Initializing agent storage schema...");

    for table in TableName::ALL {
        let schema = table.schema();
        ops.create_table(table.as_str(), &schema).await?;

        let migrated = table.migrated_columns();
        if !migrated.is_empty() {
            info!("Applying column migrations to {}...", table);
            ops.alter_table(table.as_str(), &schema, migrated).await?;
        }
    }

    info!("Agent storage schema is up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::Database;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_initialize_is_repeatable() {
        let ops = StoreOperations::new(Arc::new(Database::open_in_memory().unwrap()));
        initialize(&ops).await.unwrap();
        initialize(&ops).await.unwrap();
        for table in TableName::ALL {
            assert!(ops.has_column(table.as_str(), "created_at").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_initialize_adds_resource_id_to_legacy_messages() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.run(|exec, _| {
            exec.run_script(
                "CREATE TABLE agent_messages (
                    id TEXT PRIMARY KEY,
                    thread_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    type TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
            )
        })
        .await
        .unwrap();

        let ops = StoreOperations::new(db);
        assert!(!ops.has_column("agent_messages", "resource_id").await.unwrap());
        initialize(&ops).await.unwrap();
        assert!(ops.has_column("agent_messages", "resource_id").await.unwrap());
    }
}
