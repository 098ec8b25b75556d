//! Engram operator CLI
//!
//! Small operational surface over the storage layer: bootstrap a database,
//! print the schema as SQL, and run the structural messages migration that
//! cannot happen automatically.

use clap::{Parser, Subcommand};
use engram::migration::MigrationEngine;
use engram::schema::{ddl, tables};
use engram::store::PgStore;
use engram::StorageConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "engram", version, about = "Relational persistence for agentic memory")]
struct Cli {
    /// Backend connection string (falls back to DATABASE_URL)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Schema namespace to operate in
    #[arg(long, env = "ENGRAM_SCHEMA_NAME")]
    schema: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the backend and run all pending migrations
    Init,
    /// Print the bootstrap DDL for every managed table without connecting
    ExportSchema,
    /// Deduplicate historical message rows and install the id uniqueness
    /// constraint (required once on databases predating it)
    MigrateMessages,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::ExportSchema => {
            // pure: no connection needed
            let schema = cli.schema.as_deref();
            print!("{}", ddl::export_schema(schema));
            Ok(())
        }
        Command::Init => {
            let config = load_config(&cli)?;
            PgStore::connect(&config).await?;
            info!("schema is up to date");
            Ok(())
        }
        Command::MigrateMessages => {
            let config = load_config(&cli)?;
            // connect without the automatic migration pass: it refuses to
            // start while duplicate ids exist, which is the state this
            // command repairs
            let store = PgStore::connect_unmigrated(&config).await?;
            let engine = MigrationEngine::new(
                store.pool().clone(),
                store.schema().map(str::to_owned),
            );
            let report = engine.run_structural_migration(&tables::messages_table()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let mut config = StorageConfig::from_env()?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    if cli.schema.is_some() {
        config.schema_name = cli.schema.clone();
    }
    Ok(config)
}
