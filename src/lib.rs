//! Storefront Checkout
//!
//! Checkout-to-payment order lifecycle: prices a cart, validates coupons,
//! persists the order and hands the shopper to a redirect-based payment
//! provider, then settles the order from the provider callback.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod repositories;
pub mod services;
pub mod tracing;

use axum::{
    extract::FromRef,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::AuthConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::commerce::CheckoutService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<EventSender>,
    pub checkout: Arc<CheckoutService>,
    pub auth: AuthConfig,
}

impl FromRef<AppState> for AuthConfig {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

// Common response wrappers
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success(data)
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Routes mounted under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    let checkout = Router::new()
        .route("/orders", post(handlers::checkout::place_order))
        .route(
            "/orders/:order_number/retry-payment",
            post(handlers::checkout::retry_payment),
        )
        .route(
            "/orders/:order_number/cancel",
            post(handlers::checkout::cancel_order),
        )
        .route(
            "/shipping-methods",
            get(handlers::checkout::list_shipping_methods),
        );

    let payments = Router::new()
        .route("/callback", get(handlers::payments::payment_callback))
        .route("/webhook", post(handlers::payments::payment_webhook));

    Router::new()
        .nest("/checkout", checkout)
        .nest("/payments", payments)
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:order_number", get(handlers::orders::get_order))
        .route("/addresses", post(handlers::checkout::save_address))
}

/// Full application router with health probes and per-request middleware.
///
/// CORS and the outer request timeout are layered on by the binary.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::liveness))
        .route("/status", get(handlers::health::status))
        .nest("/api/v1", api_v1_routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}
