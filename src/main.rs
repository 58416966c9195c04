/// Mention Rewards Service
///
/// Ingests social posts mentioning the campaign handle, computes tiered
/// per-author credit rewards on a daily cadence, and detects and repairs
/// data gaps caused by downtime.
///
/// The service:
/// - Polls the provider gateway on a fixed interval with paced sub-windows
/// - Persists per-component checkpoints in PostgreSQL
/// - Dispatches finished rewards to the credit ledger
/// - Exposes status, history and manual triggers over HTTP

use anyhow::Result;
use std::sync::Arc;

use mention_rewards::config::Config;
use mention_rewards::gateway::{GatewayClient, LedgerClient};
use mention_rewards::http_server::{self, AppState};
use mention_rewards::registry::{self, WorkerDeps};
use mention_rewards::store::PgStateStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    pretty_env_logger::init();

    log::info!("Starting Mention Rewards service...");

    // Load configuration from environment
    let cfg = Config::from_env()?;

    // Validate configuration and connections
    cfg.validate().await?;

    let store = Arc::new(PgStateStore::connect(&cfg.database_url).await?);
    store.ensure_schema().await?;

    let provider = Arc::new(GatewayClient::new(
        cfg.provider_base_url.clone(),
        cfg.provider_token.clone(),
    ));
    let ledger = Arc::new(LedgerClient::new(
        cfg.ledger_base_url.clone(),
        cfg.ledger_token.clone(),
    ));

    let campaign = cfg.campaign_handle.clone();
    let port = cfg.http_port;
    let config = cfg.shared();

    let deps = WorkerDeps {
        config: config.clone(),
        provider,
        ledger: ledger.clone(),
        identity: ledger,
        store,
    };
    let workers = registry::global().obtain(&campaign, &deps).await?;

    workers.ingest.start().await?;
    workers.rewards.start().await?;

    http_server::start_server(AppState { config, workers }, port).await
}
