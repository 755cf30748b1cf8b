use clap::Parser;
use ledger_node::{LedgerNode, NodeConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ledgerd", version, about = "Mutual-credit ledger core bootstrap")]
struct Cli {
    /// PostgreSQL url for the ledger store.
    #[arg(long, env = "LEDGER_DATABASE_URL")]
    database_url: String,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 10, env = "LEDGER_PG_MAX_CONNECTIONS")]
    max_connections: u32,
    /// Seconds between recovery passes (spec §4.5).
    #[arg(long, env = "LEDGER_RECOVERY_INTERVAL_SECONDS")]
    recovery_interval_seconds: Option<u64>,
    /// Prepare lock TTL in seconds (spec §6).
    #[arg(long, env = "LEDGER_PREPARE_LOCK_TTL_SECONDS")]
    prepare_lock_ttl_seconds: Option<i64>,
    /// Seconds between integrity checkpoint passes (spec §4.2/§6).
    #[arg(long, env = "LEDGER_INTEGRITY_CHECKPOINT_INTERVAL_SECONDS")]
    integrity_checkpoint_interval_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "ledger_node=info,info".to_string()))
        .init();

    let cli = Cli::parse();

    let mut config = NodeConfig::new(cli.database_url);
    config.max_connections = cli.max_connections;
    if let Some(seconds) = cli.recovery_interval_seconds {
        config.engine.recovery_interval_seconds = seconds;
    }
    if let Some(seconds) = cli.prepare_lock_ttl_seconds {
        config.engine.prepare_lock_ttl_seconds = seconds;
    }
    if let Some(seconds) = cli.integrity_checkpoint_interval_seconds {
        config.engine.integrity_checkpoint_interval_seconds = seconds;
    }

    let node = LedgerNode::bootstrap(config).await?;
    let (recovery_task, recovery_stop_tx) = node.spawn_recovery();
    let (checkpoint_task, checkpoint_stop_tx) = node.spawn_integrity_checkpoints();

    info!("ledger-node running, awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping background loops");

    let _ = recovery_stop_tx.send(true);
    let _ = checkpoint_stop_tx.send(true);
    recovery_task.await?;
    checkpoint_task.await?;

    Ok(())
}
