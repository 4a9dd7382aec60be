// ABOUTME: Entry point for the trellis binary.
// ABOUTME: Loads configuration, initializes tracing, opens the coordinator, and runs a maintenance command.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use trellis_context::{CoordinatorConfig, LifecycleCell, LifecycleManager};

/// Trellis - local persistence coordinator
#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Inspect or reset the local trellis store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print store location, schema, and object counts as JSON (default)
    Status,
    /// Delete the store and start over with an empty one
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trellis=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = CoordinatorConfig::from_env().context("invalid configuration")?;
    tracing::info!("trellis starting up (schema {})", config.schema_name);

    let cell = LifecycleCell::new(config);
    let manager = cell.current().await.context("failed to open store")?;

    match cli.command.unwrap_or(Command::Status) {
        Command::Status => {}
        Command::Reset => {
            manager.reset().await.context("failed to reset store")?;
        }
    }

    println!("{}", serde_json::to_string_pretty(&status(&manager)?)?);
    Ok(())
}

fn status(manager: &LifecycleManager) -> anyhow::Result<serde_json::Value> {
    let store = manager.store();
    let schema = store.schema();

    let mut counts = serde_json::Map::new();
    for entity in &schema.entities {
        let count = store
            .count(&entity.name)
            .with_context(|| format!("failed to count {}", entity.name))?;
        counts.insert(entity.name.clone(), count.into());
    }

    Ok(serde_json::json!({
        "store": store.path().display().to_string(),
        "schema": schema.name,
        "version": schema.version,
        "last_commit": store.last_seq()?,
        "generation": manager.generation(),
        "objects": counts,
    }))
}
