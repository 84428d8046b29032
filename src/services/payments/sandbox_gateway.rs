use super::{
    CallbackStatus, PaymentGateway, PaymentSession, ProviderError, SessionRequest,
    VerificationOutcome, VerifyRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

/// How long a sandbox session stays verifiable.
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct SandboxSession {
    amount: i64,
    transaction_id: Option<String>,
    opened_at: Instant,
}

/// In-process provider for local development.
///
/// The redirect URL points straight back at the callback with `Status=OK`, so
/// every session settles unless the shopper (or a test) sends `NOK`. Sessions
/// older than the TTL are dropped whenever a new one is opened.
#[derive(Debug)]
pub struct SandboxPaymentGateway {
    sessions: DashMap<String, SandboxSession>,
    session_ttl: Duration,
}

impl Default for SandboxPaymentGateway {
    fn default() -> Self {
        Self::with_session_ttl(DEFAULT_SESSION_TTL)
    }
}

impl SandboxPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_ttl(session_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            session_ttl,
        }
    }

    fn prune_expired(&self) {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.opened_at.elapsed() < self.session_ttl);
        let dropped = before.saturating_sub(self.sessions.len());
        if dropped > 0 {
            debug!(dropped, "expired sandbox sessions dropped");
        }
    }
}

#[async_trait]
impl PaymentGateway for SandboxPaymentGateway {
    fn provider_name(&self) -> &'static str {
        "sandbox"
    }

    async fn request_session(
        &self,
        request: SessionRequest,
    ) -> Result<PaymentSession, ProviderError> {
        let token = format!("SBX-{}", Uuid::new_v4().simple());

        let mut redirect = Url::parse(&request.callback_url).map_err(|e| ProviderError::Rejected {
            code: -1,
            message: format!("invalid callback url: {}", e),
        })?;
        redirect
            .query_pairs_mut()
            .append_pair("Authority", &token)
            .append_pair("Status", "OK");

        self.prune_expired();
        self.sessions.insert(
            token.clone(),
            SandboxSession {
                amount: request.amount,
                transaction_id: None,
                opened_at: Instant::now(),
            },
        );
        info!(order_number = %request.order_number, %token, "sandbox payment session opened");

        Ok(PaymentSession {
            redirect_url: redirect.into(),
            session_token: token,
        })
    }

    async fn verify(&self, request: VerifyRequest) -> Result<VerificationOutcome, ProviderError> {
        let failed = |reason: &str| -> Result<VerificationOutcome, ProviderError> {
            Ok(VerificationOutcome::Failed {
                reason: reason.to_string(),
            })
        };

        let Some(mut session) = self.sessions.get_mut(&request.session_token) else {
            return failed("unknown sandbox session");
        };

        if request.callback_status == CallbackStatus::Nok
            || request
                .provider_reference
                .as_deref()
                .is_some_and(|reference| reference.eq_ignore_ascii_case("NOK"))
        {
            return failed("payment declined in sandbox");
        }
        if session.amount != request.amount {
            return failed("amount does not match the session");
        }

        let transaction_id = session
            .transaction_id
            .get_or_insert_with(|| format!("SBX-TX-{}", Uuid::new_v4().simple()))
            .clone();

        Ok(VerificationOutcome::Verified { transaction_id })
    }
}
