#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{header, Method, Request},
    response::Response,
    Router,
};
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, Set};
use serde_json::{json, Value};
use storefront_checkout::{
    auth::AuthConfig,
    build_router,
    config::AppConfig,
    db::{self, DbConfig, DbPool},
    entities::coupon::{self, DiscountType},
    events::{self, EventHandler, EventSender, LoggingEventHandler},
    services::{
        commerce::{CartLine, CheckoutService},
        payments::{
            CallbackStatus, PaymentGateway, PaymentSession, ProviderError, SessionRequest,
            VerificationOutcome, VerifyRequest,
        },
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";

/// Scripted in-process provider.
///
/// Session requests fail while `fail_sessions` is non-zero; verification
/// succeeds unless the callback says `NOK` or the reference is `NOK`.
#[derive(Default)]
pub struct FakeGateway {
    fail_sessions: AtomicUsize,
    delay_ms: AtomicU64,
    issued: AtomicUsize,
    pub session_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn fail_next_sessions(&self, count: usize) {
        self.fail_sessions.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn verify_count(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    async fn maybe_stall(&self) {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn provider_name(&self) -> &'static str {
        "fake"
    }

    async fn request_session(
        &self,
        request: SessionRequest,
    ) -> Result<PaymentSession, ProviderError> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_stall().await;

        let scripted_failure = self
            .fail_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(ProviderError::Transport("connection refused".into()));
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("FAKE-{}-{}", request.order_number, n);
        Ok(PaymentSession {
            redirect_url: format!("https://pay.example.test/start/{}", token),
            session_token: token,
        })
    }

    async fn verify(&self, request: VerifyRequest) -> Result<VerificationOutcome, ProviderError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_stall().await;

        let declined = request.callback_status == CallbackStatus::Nok
            || request.provider_reference.as_deref() == Some("NOK");
        if declined {
            return Ok(VerificationOutcome::Failed {
                reason: "declined by issuer".into(),
            });
        }
        Ok(VerificationOutcome::Verified {
            transaction_id: format!("TX-{}", request.session_token),
        })
    }
}

/// Helper harness for spinning up the router over an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub user_id: Uuid,
    token: String,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a test application after applying `configure` to the defaults.
    pub async fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        configure(&mut cfg);

        let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(LoggingEventHandler)];
        let event_task = tokio::spawn(events::process_events(event_rx, handlers));

        let gateway = Arc::new(FakeGateway::default());
        let checkout = Arc::new(CheckoutService::new(
            db_arc.clone(),
            &cfg,
            gateway.clone(),
            event_sender.clone(),
        ));

        let auth = AuthConfig::new(&cfg.jwt_secret);
        let user_id = Uuid::new_v4();
        let token = auth
            .issue_token(user_id, chrono::Duration::hours(1))
            .expect("issue test token");

        let state = AppState {
            db: db_arc,
            config: Arc::new(cfg),
            event_sender,
            checkout,
            auth,
        };

        Self {
            router: build_router(state.clone()),
            state,
            gateway,
            user_id,
            token,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &DbPool {
        &self.state.db
    }

    pub fn checkout(&self) -> &CheckoutService {
        &self.state.checkout
    }

    /// Bearer token for a different shopper.
    pub fn token_for(&self, user_id: Uuid) -> String {
        self.state
            .auth
            .issue_token(user_id, chrono::Duration::hours(1))
            .expect("issue test token")
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("valid request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    pub async fn request_authenticated(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        let token = self.token.clone();
        self.request(method, uri, body, Some(&token)).await
    }

    pub async fn seed_coupon(&self, code: &str, discount_type: DiscountType, value: i64) -> coupon::Model {
        self.seed_coupon_with(code, discount_type, value, |_| {}).await
    }

    pub async fn seed_coupon_with(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: i64,
        configure: impl FnOnce(&mut coupon::ActiveModel),
    ) -> coupon::Model {
        let now = Utc::now();
        let mut model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            discount_type: Set(discount_type),
            value: Set(value),
            max_discount: Set(None),
            minimum_subtotal: Set(None),
            eligible_product_ids: Set(json!([])),
            is_active: Set(true),
            starts_at: Set(None),
            expires_at: Set(None::<DateTime<Utc>>),
            usage_limit: Set(None),
            usage_count: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        };
        configure(&mut model);
        model.insert(self.db()).await.expect("seed coupon")
    }
}

pub fn cart_line(sku: &str, unit_price: i64, quantity: i32) -> CartLine {
    CartLine {
        product_id: Uuid::new_v4(),
        variant_id: None,
        sku: sku.to_string(),
        name: format!("Product {}", sku),
        image: Some(format!("https://cdn.example.test/{}.jpg", sku)),
        unit_price,
        quantity,
        attributes: Default::default(),
    }
}

pub fn address_json() -> Value {
    json!({
        "recipient_name": "Sara Ahmadi",
        "phone": "+989121234567",
        "province": "Tehran",
        "city": "Tehran",
        "address_line": "No. 12, Azadi St.",
        "postal_code": "1234567890"
    })
}

/// Cart with a subtotal of 1,000,000 shipped by post.
pub fn standard_order_json() -> Value {
    json!({
        "items": [
            serde_json::to_value(cart_line("SKU-A", 250_000, 2)).expect("cart line json"),
            serde_json::to_value(cart_line("SKU-B", 500_000, 1)).expect("cart line json"),
        ],
        "shipping_method_id": "post",
        "shipping_address": address_json(),
    })
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
