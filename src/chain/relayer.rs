use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::model::{Amount, Distribution, EscrowRef, TxRef};

use super::{AttestationClient, AttestationStatus, ChainClient, ChainError};

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct DepositRequest<'a> {
    op_id: &'a str,
    user: &'a str,
    merchant: &'a str,
    amount: Amount,
    strategy_tag: &'a str,
}

#[derive(Debug, Deserialize)]
struct EscrowResponse {
    escrow_ref: EscrowRef,
}

#[derive(Debug, Serialize)]
struct ReleaseRequest<'a> {
    op_id: &'a str,
    principal: Amount,
    user_yield: Amount,
    merchant_yield: Amount,
    protocol_yield: Amount,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    op_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    tx_ref: TxRef,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    total_cost: Amount,
}

#[derive(Debug, Serialize)]
struct BurnRequest<'a> {
    op_id: &'a str,
    escrow_ref: &'a str,
    destination: &'a str,
}

#[derive(Debug, Serialize)]
struct MintRequest<'a> {
    op_id: &'a str,
    burn_tx: &'a str,
    attestation: &'a str,
    user: &'a str,
    merchant: &'a str,
    amount: Amount,
}

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    ready: bool,
    signature: Option<String>,
}

// ── Clients ──────────────────────────────────────────────────────────

/// Chain client speaking to a transaction relayer that fronts the escrow and
/// bridge contracts. The relayer confirms transactions before responding, so
/// a successful response is a confirmed reference.
pub struct HttpChainClient {
    id: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpChainClient {
    pub fn new(id: &str, base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(HttpChainClient {
            id: id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn remaining(deadline: Instant) -> Result<Duration, ChainError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ChainError::Transient("deadline already elapsed".into()));
        }
        Ok(remaining)
    }
}

fn classify(err: reqwest::Error) -> ChainError {
    if let Some(status) = err.status() {
        if status.is_client_error() && status.as_u16() != 429 {
            return ChainError::Rejected(format!("status {status}"));
        }
    }
    ChainError::Transient(err.to_string())
}

#[async_trait::async_trait]
impl ChainClient for HttpChainClient {
    fn chain_id(&self) -> &str {
        &self.id
    }

    async fn deposit(
        &self,
        op_id: &str,
        user: &str,
        merchant: &str,
        amount: Amount,
        strategy_tag: &str,
        deadline: Instant,
    ) -> Result<EscrowRef, ChainError> {
        let response = self
            .client
            .post(self.url("/escrow/deposits"))
            .timeout(Self::remaining(deadline)?)
            .json(&DepositRequest { op_id, user, merchant, amount, strategy_tag })
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<EscrowResponse>()
            .await
            .map_err(classify)?;
        Ok(response.escrow_ref)
    }

    async fn release(
        &self,
        op_id: &str,
        escrow_ref: &str,
        principal: Amount,
        distribution: &Distribution,
        deadline: Instant,
    ) -> Result<TxRef, ChainError> {
        let response = self
            .client
            .post(self.url(&format!("/escrow/{escrow_ref}/release")))
            .timeout(Self::remaining(deadline)?)
            .json(&ReleaseRequest {
                op_id,
                principal,
                user_yield: distribution.user_yield,
                merchant_yield: distribution.merchant_yield,
                protocol_yield: distribution.protocol_yield,
            })
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<TxResponse>()
            .await
            .map_err(classify)?;
        Ok(response.tx_ref)
    }

    async fn refund(
        &self,
        op_id: &str,
        escrow_ref: &str,
        deadline: Instant,
    ) -> Result<TxRef, ChainError> {
        let response = self
            .client
            .post(self.url(&format!("/escrow/{escrow_ref}/refund")))
            .timeout(Self::remaining(deadline)?)
            .json(&RefundRequest { op_id })
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<TxResponse>()
            .await
            .map_err(classify)?;
        Ok(response.tx_ref)
    }

    async fn quote_bridge(&self, destination: &str, amount: Amount) -> Result<Amount, ChainError> {
        let amount = amount.to_string();
        let response = self
            .client
            .get(self.url("/bridge/quote"))
            .query(&[("destination", destination), ("amount", amount.as_str())])
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<QuoteResponse>()
            .await
            .map_err(classify)?;
        Ok(response.total_cost)
    }

    async fn burn_for_bridge(
        &self,
        op_id: &str,
        escrow_ref: &str,
        destination: &str,
        deadline: Instant,
    ) -> Result<TxRef, ChainError> {
        let response = self
            .client
            .post(self.url("/bridge/burns"))
            .timeout(Self::remaining(deadline)?)
            .json(&BurnRequest { op_id, escrow_ref, destination })
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<TxResponse>()
            .await
            .map_err(classify)?;
        Ok(response.tx_ref)
    }

    async fn mint_from_bridge(
        &self,
        op_id: &str,
        burn_tx: &str,
        attestation: &str,
        user: &str,
        merchant: &str,
        amount: Amount,
        deadline: Instant,
    ) -> Result<EscrowRef, ChainError> {
        let response = self
            .client
            .post(self.url("/bridge/mints"))
            .timeout(Self::remaining(deadline)?)
            .json(&MintRequest { op_id, burn_tx, attestation, user, merchant, amount })
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<EscrowResponse>()
            .await
            .map_err(classify)?;
        Ok(response.escrow_ref)
    }
}

/// Attestation service client, polled until validator consensus is ready.
pub struct HttpAttestationClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAttestationClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(HttpAttestationClient { base_url: base_url.trim_end_matches('/').to_string(), client })
    }
}

#[async_trait::async_trait]
impl AttestationClient for HttpAttestationClient {
    async fn get_attestation(
        &self,
        burn_tx: &str,
        deadline: Instant,
    ) -> Result<AttestationStatus, ChainError> {
        let response = self
            .client
            .get(format!("{}/attestations/{burn_tx}", self.base_url))
            .timeout(HttpChainClient::remaining(deadline)?)
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?
            .json::<AttestationResponse>()
            .await
            .map_err(classify)?;
        Ok(AttestationStatus { ready: response.ready, signature: response.signature })
    }
}
