use std::sync::Arc;

use anyhow::Context;
use reaction_relayer::{
    EvmLedger, LedgerClient, QueueStore, RelayObserver, RelayPool, RelayerConfig, RelayerService,
    SqliteQueue, TracingObserver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// One actor per configured wallet
    Pool,
    /// First wallet only, serial loop
    Single,
    /// Drain one batch, sweep, print the summary and exit
    Job,
}

fn parse_mode<I, S>(args: I) -> anyhow::Result<RunMode>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut mode = RunMode::Pool;
    for arg in args {
        mode = match arg.as_ref().trim().to_ascii_lowercase().as_str() {
            "pool" => RunMode::Pool,
            "single" => RunMode::Single,
            "job" => RunMode::Job,
            other => anyhow::bail!("unknown mode `{other}` (expected pool, single or job)"),
        };
    }
    Ok(mode)
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mode = parse_mode(std::env::args().skip(1))?;
    let config = RelayerConfig::from_env().context("loading RELAYER_* configuration")?;
    config.validate_ledger()?;

    let store: Arc<dyn QueueStore> = Arc::new(
        SqliteQueue::new(&config.database_url)
            .await
            .with_context(|| format!("opening queue at {}", config.database_url))?,
    );

    let ledgers = config
        .private_keys
        .iter()
        .map(|key| {
            EvmLedger::connect(
                &config.rpc_url,
                key,
                &config.contract_address,
                config.chain_id,
                config.rpc_timeout,
            )
            .map(|ledger| Arc::new(ledger) as Arc<dyn LedgerClient>)
        })
        .collect::<Result<Vec<_>, _>>()?;

    match ledgers[0].stats().await {
        Ok(stats) => tracing::info!("[STARTUP] Ledger stats: {}", serde_json::to_string(&stats)?),
        Err(e) => tracing::warn!("[STARTUP] Ledger stats unavailable: {}", e),
    }
    tracing::info!(
        "[STARTUP] {:?} mode, {} wallet(s), {} pending item(s)",
        mode,
        ledgers.len(),
        store.count_pending().await.unwrap_or_default()
    );

    let observer: Arc<dyn RelayObserver> = Arc::new(TracingObserver);

    match mode {
        RunMode::Job => {
            let service = RelayerService::new(config, store, ledgers[0].clone(), observer);
            let summary = service.run_scheduled_job().await;
            println!("{}", serde_json::to_string(&summary)?);
        }
        RunMode::Single => {
            let service = RelayerService::new(config, store, ledgers[0].clone(), observer);
            service.start().await?;
            wait_for_shutdown().await;
            service.stop().await;
        }
        RunMode::Pool => {
            let pool = RelayPool::spawn(&config, store, ledgers, observer)?;

            let mut status = pool.subscribe();
            let reporter = tokio::spawn(async move {
                while status.changed().await.is_ok() {
                    let snapshot = status.borrow_and_update().clone();
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => tracing::debug!("Wallet status: {}", json),
                        Err(e) => tracing::warn!("Unserializable wallet status: {}", e),
                    }
                }
            });

            wait_for_shutdown().await;
            pool.stop().await;
            drop(pool);
            let _ = reporter.await;
        }
    }

    Ok(())
}
