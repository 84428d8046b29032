use super::{
    CallbackStatus, PaymentGateway, PaymentSession, ProviderError, SessionRequest,
    VerificationOutcome, VerifyRequest,
};
use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError},
    config::AppConfig,
    errors::ServiceError,
    tracing::with_metrics,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Provider status code for a successful request or verification.
const CODE_OK: i64 = 100;
/// Provider status code for a verification that had already succeeded before.
const CODE_ALREADY_VERIFIED: i64 = 101;

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub merchant_id: String,
    pub redirect_base_url: String,
    pub timeout: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl HttpGatewayConfig {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let required = |value: &Option<String>, key: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ServiceError::InternalError(format!("{} is not configured", key)))
        };

        Ok(Self {
            base_url: required(&config.payment_api_base_url, "payment_api_base_url")?,
            merchant_id: required(&config.payment_merchant_id, "payment_merchant_id")?,
            redirect_base_url: required(
                &config.payment_redirect_base_url,
                "payment_redirect_base_url",
            )?,
            timeout: config.payment_request_timeout(),
            breaker: CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_failure_threshold,
                timeout: Duration::from_secs(config.circuit_breaker_timeout_secs),
                success_threshold: 1,
            },
        })
    }
}

#[derive(Serialize)]
struct SessionBody<'a> {
    merchant_id: &'a str,
    amount: i64,
    callback_url: &'a str,
    description: &'a str,
}

#[derive(Deserialize)]
struct SessionReply {
    code: i64,
    #[serde(default)]
    authority: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct VerifyBody<'a> {
    merchant_id: &'a str,
    amount: i64,
    authority: &'a str,
}

#[derive(Deserialize)]
struct VerifyReply {
    code: i64,
    #[serde(default)]
    ref_id: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Redirect-style provider spoken to over JSON.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: HttpGatewayConfig,
    breaker: CircuitBreaker,
}

impl HttpPaymentGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            breaker: CircuitBreaker::new("payment_provider", config.breaker.clone()),
            config,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ProviderError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProviderError::Transport(format!("HTTP {}", status)));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("HTTP {}: {}", status, e)))
    }

    /// Runs a provider call under the circuit breaker and call metrics.
    async fn guarded<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        match self
            .breaker
            .call(|| with_metrics(operation, call))
            .await
        {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::CircuitOpen(_)) => Err(ProviderError::CircuitOpen),
            Err(CircuitBreakerError::Inner(err)) => Err(err),
        }
    }
}

fn reference_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    fn provider_name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self, request), fields(order_number = %request.order_number, amount = request.amount))]
    async fn request_session(
        &self,
        request: SessionRequest,
    ) -> Result<PaymentSession, ProviderError> {
        let body = SessionBody {
            merchant_id: &self.config.merchant_id,
            amount: request.amount,
            callback_url: &request.callback_url,
            description: &request.description,
        };

        let reply: SessionReply = self
            .guarded("payment.request_session", || self.post_json("request", &body))
            .await?;

        match (reply.code, reply.authority) {
            (CODE_OK, Some(authority)) if !authority.trim().is_empty() => {
                debug!(%authority, "payment session opened");
                Ok(PaymentSession {
                    redirect_url: format!(
                        "{}/{}",
                        self.config.redirect_base_url.trim_end_matches('/'),
                        authority
                    ),
                    session_token: authority,
                })
            }
            (CODE_OK, _) => Err(ProviderError::InvalidResponse(
                "session reply is missing the authority".to_string(),
            )),
            (code, _) => Err(ProviderError::Rejected {
                code,
                message: reply.message.unwrap_or_else(|| "request rejected".to_string()),
            }),
        }
    }

    #[instrument(skip(self, request), fields(amount = request.amount))]
    async fn verify(&self, request: VerifyRequest) -> Result<VerificationOutcome, ProviderError> {
        if request.callback_status == CallbackStatus::Nok {
            return Ok(VerificationOutcome::Failed {
                reason: "payment was cancelled or declined".to_string(),
            });
        }

        let body = VerifyBody {
            merchant_id: &self.config.merchant_id,
            amount: request.amount,
            authority: &request.session_token,
        };

        let reply: VerifyReply = self
            .guarded("payment.verify", || self.post_json("verify", &body))
            .await?;

        match reply.code {
            CODE_OK | CODE_ALREADY_VERIFIED => reply
                .ref_id
                .and_then(reference_to_string)
                .map(|transaction_id| VerificationOutcome::Verified { transaction_id })
                .ok_or_else(|| {
                    ProviderError::InvalidResponse("verify reply is missing ref_id".to_string())
                }),
            code => {
                let reason = reply
                    .message
                    .unwrap_or_else(|| format!("provider verification code {}", code));
                warn!(code, %reason, "payment verification declined");
                Ok(VerificationOutcome::Failed { reason })
            }
        }
    }
}
