// agent-storage/crates/agent-storage/src/main.rs

#[cfg(feature = "cli")]
use agent_storage::{sql::IndexSpec, telemetry, AgentStorage, StorageConfig};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "agent-storage", about = "Administer an agent storage database")]
struct Cli {
    /// Overrides AGENT_STORAGE_DB_PATH.
    #[arg(long, global = true)]
    db: Option<std::path::PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Create tables, run column migrations and the automatic indexes
    Init,
    /// List indexes, optionally for one table
    ListIndexes {
        #[arg(long)]
        table: Option<String>,
    },
    /// Create the automatic composite indexes
    CreateIndexes,
    /// Create one index, e.g. `create-index idx agent_threads resource_id "created_at DESC"`
    CreateIndex {
        name: String,
        table: String,
        #[arg(required = true)]
        columns: Vec<String>,
        #[arg(long)]
        unique: bool,
    },
    DropIndex { name: String },
    /// Delete every row from a table
    ClearTable { table: String },
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info");
    let cli = Cli::parse();

    let config = match cli.db {
        Some(path) => StorageConfig::new(path),
        None => StorageConfig::from_env()?,
    };
    config.print_config();
    let storage = AgentStorage::new(config)?;

    match cli.command {
        Command::Init => storage.init().await?,
        Command::ListIndexes { table } => {
            for index in storage.operations.list_indexes(table.as_deref()).await? {
                println!(
                    "{}\t{}\t({}){}",
                    index.name,
                    index.table,
                    index.columns.join(", "),
                    if index.unique { "\tunique" } else { "" }
                );
            }
        }
        Command::CreateIndexes => {
            for name in storage.operations.create_automatic_indexes().await {
                println!("{name}");
            }
        }
        Command::CreateIndex { name, table, columns, unique } => {
            let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
            let mut spec = IndexSpec::new(name, &table, &columns);
            spec.unique = unique;
            storage.operations.create_index(spec).await?;
        }
        Command::DropIndex { name } => storage.operations.drop_index(&name).await?,
        Command::ClearTable { table } => storage.operations.clear_table(&table).await?,
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
