//! Payment Provider Adapter
//!
//! Thin wrapper around the external payment API. One operation: create a
//! transfer under a caller-supplied idempotency key. Every failure is
//! classified retryable/permanent at this boundary so the execution service
//! only ever sees structured codes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProviderError;

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// One money-movement request. The idempotency key is derived solely from
/// the transfer's own id, so a retried call can never move money twice.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    pub amount_cents: i64,
    pub destination: String,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTransfer {
    pub transfer_id: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<ProviderTransfer, ProviderError>;
}

/// HTTP adapter for the real provider.
pub struct HttpPaymentProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct WireTransfer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: Option<WireErrorBody>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    code: Option<String>,
}

impl HttpPaymentProvider {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent("playoff-backend/0.1")
            .build()
            .map_err(|e| ProviderError::Permanent {
                code: "client_build".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<ProviderTransfer, ProviderError> {
        let url = format!("{}/v1/transfers", self.base_url);
        debug!(
            idempotency_key = %request.idempotency_key,
            amount_cents = request.amount_cents,
            "dispatching provider transfer"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            let wire: WireTransfer = response.json().await.map_err(|e| {
                // Money may have moved; a retry under the same key is safe.
                ProviderError::Retryable {
                    code: "malformed_response".to_string(),
                    message: e.to_string(),
                }
            })?;
            return Ok(ProviderTransfer {
                transfer_id: wire.id,
            });
        }

        let code = response
            .json::<WireError>()
            .await
            .ok()
            .and_then(|w| w.error)
            .and_then(|b| b.code)
            .unwrap_or_else(|| format!("http_{}", status.as_u16()));

        warn!(status = %status, code = %code, "provider rejected transfer");
        Err(classify_status(status, code))
    }
}

fn classify_transport_error(e: reqwest::Error) -> ProviderError {
    let code = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connect"
    } else {
        "network"
    };
    ProviderError::Retryable {
        code: code.to_string(),
        message: e.to_string(),
    }
}

/// HTTP status classification: 5xx and 429 retryable, other 4xx permanent.
fn classify_status(status: StatusCode, code: String) -> ProviderError {
    let message = format!("provider returned {status}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Retryable { code, message }
    } else if status.is_client_error() {
        ProviderError::Permanent { code, message }
    } else {
        // Unclassifiable status: retrying is safer than dropping the payout.
        ProviderError::Retryable { code, message }
    }
}

/// Deterministic provider idempotency key for a transfer.
pub fn payout_idempotency_key(transfer_id: &str) -> String {
    format!("payout:{transfer_id}")
}

/// Per-attempt ledger idempotency key.
pub fn ledger_idempotency_key(transfer_id: &str, attempt: i64) -> String {
    format!("ledger:payout:{transfer_id}:{attempt}")
}
