use anyhow::Result;
use schemars::schema_for;
use serde_json::json;

use crate::api::handlers::{CancelPaymentRequest, ReleasePaymentRequest};
use crate::config::EngineConfig;
use crate::engine::CreatePayment;

/// Entry point for the `schema` command: JSON schemas of the command
/// payloads and the configuration file.
pub fn run() -> Result<()> {
    let schemas = json!({
        "create_payment": schema_for!(CreatePayment),
        "release_payment": schema_for!(ReleasePaymentRequest),
        "cancel_payment": schema_for!(CancelPaymentRequest),
        "engine_config": schema_for!(EngineConfig),
    });
    println!("{}", serde_json::to_string_pretty(&schemas)?);
    Ok(())
}
