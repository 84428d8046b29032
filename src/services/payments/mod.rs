//! Payment provider adapters.
//!
//! The checkout flow only talks to [`PaymentGateway`]; each provider is one
//! implementation of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod http_gateway;
pub mod sandbox_gateway;

pub use http_gateway::{HttpGatewayConfig, HttpPaymentGateway};
pub use sandbox_gateway::SandboxPaymentGateway;

/// Input for opening a hosted payment session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub order_id: Uuid,
    pub order_number: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub callback_url: String,
    pub description: String,
}

/// A session the shopper can be redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub redirect_url: String,
    pub session_token: String,
}

/// Outcome the provider reported on the shopper's return redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallbackStatus {
    #[default]
    Ok,
    Nok,
}

impl CallbackStatus {
    /// Case-insensitive; a missing status is treated as `OK` and left to `verify`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("nok") => CallbackStatus::Nok,
            _ => CallbackStatus::Ok,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    pub session_token: String,
    pub provider_reference: Option<String>,
    pub callback_status: CallbackStatus,
    /// Amount the order expects to have been captured
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified { transaction_id: String },
    Failed { reason: String },
}

/// Provider call failures. None of these say anything about whether the
/// shopper paid, so callers must never treat them as success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("payment provider unreachable: {0}")]
    Transport(String),
    #[error("payment provider timed out")]
    Timeout,
    #[error("payment provider rejected the request (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("payment provider sent an unexpected response: {0}")]
    InvalidResponse(String),
    #[error("payment provider temporarily disabled after repeated failures")]
    CircuitOpen,
}

/// Adapter over a redirect-style payment provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Short provider name recorded on payment attempts.
    fn provider_name(&self) -> &'static str;

    async fn request_session(
        &self,
        request: SessionRequest,
    ) -> Result<PaymentSession, ProviderError>;

    async fn verify(&self, request: VerifyRequest) -> Result<VerificationOutcome, ProviderError>;
}
