use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;

/// Derives the idempotency key for a charge attempt.
///
/// The key is a pure function of (order, attempt sequence): retrying the
/// same attempt over the network reuses the key, so the gateway deduplicates
/// and the order cannot be charged twice for one attempt.
pub fn derive_idempotency_key(order_id: Uuid, sequence: i32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("charge:{}:{}", order_id, sequence).as_bytes());
    hex::encode(hasher.finalize())
}

/// Outbound charge request
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub idempotency_key: String,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
}

/// A charge the gateway has acknowledged: its reference plus the hosted
/// payment page the customer is redirected to.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayCharge {
    pub gateway_reference: String,
    pub payment_url: String,
}

/// Ground-truth charge state as reported by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayChargeState {
    Succeeded,
    Failed,
    Pending,
    /// The gateway has no record of the key: the charge never happened.
    NotFound,
}

#[derive(Debug, Clone)]
pub struct GatewayChargeStatus {
    pub gateway_reference: Option<String>,
    pub state: GatewayChargeState,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("charge declined: {0}")]
    Declined(String),
    /// The call did not complete in time. The outcome is unknown, NOT a
    /// decline; reconciliation resolves it later.
    #[error("gateway call timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected gateway response: {0}")]
    Protocol(String),
}

/// Payment gateway seam. Production uses the HTTP adapter below; tests
/// script this trait directly.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Submits a charge and returns the hosted-payment handle.
    async fn charge(&self, request: ChargeRequest) -> Result<GatewayCharge, GatewayError>;

    /// Queries the gateway for the ground-truth state of a charge by its
    /// idempotency key.
    async fn lookup(&self, idempotency_key: &str) -> Result<GatewayChargeStatus, GatewayError>;
}

/// HTTP adapter for a hosted-checkout payment provider.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    payment_url: String,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    id: String,
    status: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String, secret: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            secret,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.payment_gateway_url.clone(),
            config.payment_gateway_secret.clone(),
            Duration::from_secs(config.charge_timeout_secs),
        )
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => builder.bearer_auth(secret),
            None => builder,
        }
    }

    fn map_transport_error(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Transport(err.to_string())
        }
    }

    fn parse_lookup_state(status: &str) -> Result<GatewayChargeState, GatewayError> {
        match status {
            "succeeded" => Ok(GatewayChargeState::Succeeded),
            "failed" | "declined" => Ok(GatewayChargeState::Failed),
            "pending" | "processing" => Ok(GatewayChargeState::Pending),
            other => Err(GatewayError::Protocol(format!(
                "unknown charge status '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn charge(&self, request: ChargeRequest) -> Result<GatewayCharge, GatewayError> {
        let url = format!("{}/v1/charges", self.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&request)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::Declined(detail));
        }
        if !status.is_success() {
            return Err(GatewayError::Protocol(format!(
                "charge returned HTTP {}",
                status
            )));
        }

        let body: ChargeResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;

        Ok(GatewayCharge {
            gateway_reference: body.id,
            payment_url: body.payment_url,
        })
    }

    #[instrument(skip(self))]
    async fn lookup(&self, idempotency_key: &str) -> Result<GatewayChargeStatus, GatewayError> {
        let url = format!("{}/v1/charges/by-key/{}", self.base_url, idempotency_key);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(GatewayChargeStatus {
                gateway_reference: None,
                state: GatewayChargeState::NotFound,
            });
        }
        if !response.status().is_success() {
            warn!("lookup returned HTTP {}", response.status());
            return Err(GatewayError::Protocol(format!(
                "lookup returned HTTP {}",
                response.status()
            )));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(e.to_string()))?;

        Ok(GatewayChargeStatus {
            gateway_reference: Some(body.id),
            state: Self::parse_lookup_state(&body.status)?,
        })
    }
}
