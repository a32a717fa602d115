use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::model::{Amount, PositionRef};

use super::{AdapterError, AdapterHealth, StrategyAdapter, StrategyKind, StrategySettlement};

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AllocateRequest<'a> {
    op_id: &'a str,
    payment_id: &'a str,
    amount: Amount,
}

#[derive(Debug, Deserialize)]
struct AllocateResponse {
    position_ref: String,
}

#[derive(Debug, Serialize)]
struct WithdrawRequest<'a> {
    op_id: &'a str,
    position_ref: &'a str,
    amount: Amount,
}

#[derive(Debug, Deserialize)]
struct WithdrawResponse {
    reference: String,
    principal: Amount,
    #[serde(rename = "yield")]
    yield_paid: Amount,
}

#[derive(Debug, Deserialize)]
struct ApyResponse {
    apy_bps: u32,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    healthy: bool,
    #[serde(default)]
    latency_ms: u64,
}

// ── Adapter ──────────────────────────────────────────────────────────

/// Strategy adapter backed by an external HTTP endpoint. The T-bill,
/// delta-neutral, and lending variants share this client and differ only in
/// the configured endpoint; `kind` is carried for observability.
pub struct HttpStrategyAdapter {
    id: String,
    kind: StrategyKind,
    base_url: String,
    client: reqwest::Client,
}

impl HttpStrategyAdapter {
    pub fn new(id: &str, kind: StrategyKind, base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(HttpStrategyAdapter {
            id: id.to_string(),
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn remaining(deadline: Instant) -> Result<Duration, AdapterError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AdapterError::Transient("deadline already elapsed".into()));
        }
        Ok(remaining)
    }
}

/// Map a transport failure onto the retry classification: network errors,
/// timeouts, and 5xx/429 are transient; other 4xx are permanent.
fn classify(err: reqwest::Error) -> AdapterError {
    if let Some(status) = err.status() {
        if status.is_server_error() || status.as_u16() == 429 {
            return AdapterError::Transient(format!("status {status}"));
        }
        if status.is_client_error() {
            return AdapterError::Permanent(format!("status {status}"));
        }
    }
    AdapterError::Transient(err.to_string())
}

#[async_trait::async_trait]
impl StrategyAdapter for HttpStrategyAdapter {
    fn strategy_id(&self) -> &str {
        &self.id
    }

    async fn allocate(
        &self,
        op_id: &str,
        payment_id: &str,
        amount: Amount,
        deadline: Instant,
    ) -> Result<PositionRef, AdapterError> {
        let response = self
            .client
            .post(self.url("/positions"))
            .timeout(Self::remaining(deadline)?)
            .json(&AllocateRequest { op_id, payment_id, amount })
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<AllocateResponse>()
            .await
            .map_err(classify)?;
        tracing::debug!(
            strategy = %self.id,
            kind = self.kind.name(),
            payment = %payment_id,
            position = %response.position_ref,
            "allocated"
        );
        Ok(response.position_ref)
    }

    async fn withdraw(
        &self,
        op_id: &str,
        position_ref: &str,
        amount: Amount,
        deadline: Instant,
    ) -> Result<StrategySettlement, AdapterError> {
        let response = self
            .client
            .post(self.url("/withdrawals"))
            .timeout(Self::remaining(deadline)?)
            .json(&WithdrawRequest { op_id, position_ref, amount })
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<WithdrawResponse>()
            .await
            .map_err(classify)?;
        Ok(StrategySettlement {
            reference: response.reference,
            principal: response.principal,
            yield_paid: response.yield_paid,
        })
    }

    async fn current_apy(&self, deadline: Instant) -> Result<u32, AdapterError> {
        let response = self
            .client
            .get(self.url("/apy"))
            .timeout(Self::remaining(deadline)?)
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<ApyResponse>()
            .await
            .map_err(classify)?;
        Ok(response.apy_bps)
    }

    async fn health(&self, deadline: Instant) -> Result<AdapterHealth, AdapterError> {
        let started = Instant::now();
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(Self::remaining(deadline)?)
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<HealthResponse>()
            .await
            .map_err(classify)?;
        let latency_ms = if response.latency_ms > 0 {
            response.latency_ms
        } else {
            started.elapsed().as_millis() as u64
        };
        Ok(AdapterHealth { healthy: response.healthy, latency_ms })
    }
}
