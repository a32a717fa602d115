use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::ledger::EventStore;

/// Entry point for the `ledger` command: dump a payment's event stream.
pub fn run(db_path: &Path, payment_id: &str) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(run_async(db_path, payment_id))
}

async fn run_async(db_path: &Path, payment_id: &str) -> Result<()> {
    if !db_path.exists() {
        bail!("ledger not found at {}", db_path.display());
    }
    let store = EventStore::open(db_path)?;
    let events = store.load_events(payment_id).await?;
    if events.is_empty() {
        bail!("no events for payment {payment_id}");
    }

    for event in events {
        let payload = serde_json::to_string(&event.kind)?;
        println!(
            "{:>4}  {}  {:<22}  {}",
            event.seq,
            event.at.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.kind.name(),
            payload
        );
    }
    Ok(())
}
