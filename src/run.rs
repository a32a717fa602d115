use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::watch;

use crate::adapters::mock::MockStrategy;
use crate::adapters::{StrategyAdapter, build_adapters};
use crate::api;
use crate::chain::mock::{MockAttestationClient, MockChainClient};
use crate::chain::relayer::HttpAttestationClient;
use crate::chain::{AttestationClient, ChainClient, build_chains};
use crate::compliance::{AllowAll, ComplianceChecker, DenyList};
use crate::config::EngineConfig;
use crate::engine::clock::SystemClock;
use crate::engine::{Collaborators, PaymentEngine};
use crate::ledger::EventStore;

/// CLI options for the `run` command.
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub db: PathBuf,
    pub listen: String,
    pub mock: bool,
}

/// Entry point for the `run` command: engine + background loops + API.
pub fn run(options: &RunOptions) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(run_async(options))
}

async fn run_async(options: &RunOptions) -> Result<()> {
    let config = match &options.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    println!("=== yield-rails run ===");
    println!("Ledger:   {}", options.db.display());
    println!("Listen:   {}", options.listen);
    println!("Mode:     {}", if options.mock { "mock collaborators" } else { "configured endpoints" });
    println!(
        "Policy:   {}/{}/{} bps user/merchant/protocol",
        config.distribution_policy.user_bps,
        config.distribution_policy.merchant_bps,
        config.distribution_policy.protocol_bps
    );
    println!();

    let store = EventStore::open(&options.db)?;
    let collaborators = if options.mock {
        mock_collaborators(&config)
    } else {
        build_collaborators(&config)?
    };
    let engine = PaymentEngine::new(config, store, collaborators).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.spawn_background(shutdown_rx.clone());

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        println!("\nshutting down");
        let _ = shutdown_tx.send(true);
    });

    api::serve(engine, &options.listen, shutdown_rx).await?;
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn build_collaborators(config: &EngineConfig) -> Result<Collaborators> {
    if config.strategies.is_empty() {
        bail!("config registers no strategies; add a strategies table or pass --mock");
    }
    if config.chains.is_empty() {
        bail!("config registers no chains; add a chains table or pass --mock");
    }
    let attestation_url = config
        .attestation_url
        .as_deref()
        .context("attestation_url is required without --mock")?;

    let adapters = build_adapters(&config.strategies)?;
    let chains = build_chains(&config.chains)?;
    let attestation: Arc<dyn AttestationClient> =
        Arc::new(HttpAttestationClient::new(attestation_url)?);

    Ok(Collaborators {
        chains,
        attestation,
        adapters,
        compliance: compliance_checker(config),
        clock: Arc::new(SystemClock),
    })
}

/// In-process collaborators for local runs: two chains, three strategies,
/// instant attestation.
fn mock_collaborators(config: &EngineConfig) -> Collaborators {
    let chains: Vec<Arc<dyn ChainClient>> = vec![
        Arc::new(MockChainClient::new("base")),
        Arc::new(MockChainClient::new("xrpl")),
    ];
    let adapters: Vec<Arc<dyn StrategyAdapter>> = vec![
        Arc::new(MockStrategy::new("tbill-prime", 400)),
        Arc::new(MockStrategy::new("delta-neutral-core", 650)),
        Arc::new(MockStrategy::new("lending-usdc", 310)),
    ];
    Collaborators {
        chains,
        attestation: Arc::new(MockAttestationClient::ready_after(1)),
        adapters,
        compliance: compliance_checker(config),
        clock: Arc::new(SystemClock),
    }
}

fn compliance_checker(config: &EngineConfig) -> Arc<dyn ComplianceChecker> {
    if config.compliance_denylist.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(DenyList::new(config.compliance_denylist.clone()))
    }
}
