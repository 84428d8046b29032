use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Stable, machine-readable error codes for the checkout flow.
///
/// Callers branch on these (coupon field error vs. payment retry banner) instead
/// of matching human-readable text, so the serialized names must never change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutErrorCode {
    EmptyCart,
    InvalidCartLine,
    InvalidShippingMethod,
    InvalidAddress,
    AddressNotFound,
    CouponNotFound,
    CouponExpired,
    CouponMinimumNotMet,
    CouponNotApplicableToItems,
    PricingMismatch,
    ValidationError,
    OrderCreateFailed,
    OrderNotFound,
    OrderAlreadyFinalized,
    PaymentRequestFailed,
    PaymentVerificationFailed,
    InvalidStateTransition,
}

impl CheckoutErrorCode {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::EmptyCart
            | Self::InvalidCartLine
            | Self::InvalidShippingMethod
            | Self::InvalidAddress
            | Self::ValidationError => StatusCode::BAD_REQUEST,
            Self::CouponNotFound
            | Self::CouponExpired
            | Self::CouponMinimumNotMet
            | Self::CouponNotApplicableToItems
            | Self::PricingMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            Self::AddressNotFound | Self::OrderNotFound => StatusCode::NOT_FOUND,
            Self::OrderAlreadyFinalized | Self::InvalidStateTransition => StatusCode::CONFLICT,
            Self::OrderCreateFailed => StatusCode::SERVICE_UNAVAILABLE,
            Self::PaymentRequestFailed => StatusCode::BAD_GATEWAY,
            Self::PaymentVerificationFailed => StatusCode::PAYMENT_REQUIRED,
        }
    }

    /// Whether the same request (or a retry-payment) can reasonably succeed later.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::OrderCreateFailed | Self::PaymentRequestFailed | Self::PaymentVerificationFailed
        )
    }
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found")
    pub error: String,
    /// Stable error code; present for checkout-flow failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<CheckoutErrorCode>,
    /// Human-readable error description
    pub message: String,
    /// Offending request field for input validation failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Order the failure relates to, so the client can offer retry-payment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("{code}: {message}")]
    Checkout {
        code: CheckoutErrorCode,
        message: String,
        field: Option<String>,
        order_number: Option<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Builds a checkout-flow error with a stable code.
    pub fn checkout(code: CheckoutErrorCode, message: impl Into<String>) -> Self {
        ServiceError::Checkout {
            code,
            message: message.into(),
            field: None,
            order_number: None,
        }
    }

    /// Builds a field-level input error.
    pub fn invalid_field(
        code: CheckoutErrorCode,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServiceError::Checkout {
            code,
            message: message.into(),
            field: Some(field.into()),
            order_number: None,
        }
    }

    /// Attaches the order number to a checkout error; other variants pass through.
    pub fn for_order(self, number: &str) -> Self {
        match self {
            ServiceError::Checkout {
                code,
                message,
                field,
                ..
            } => ServiceError::Checkout {
                code,
                message,
                field,
                order_number: Some(number.to_string()),
            },
            other => other,
        }
    }

    pub fn code(&self) -> Option<CheckoutErrorCode> {
        match self {
            ServiceError::Checkout { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            ServiceError::Checkout { code, .. } => code.retryable(),
            ServiceError::DatabaseError(_) | ServiceError::ExternalServiceError(_) => true,
            _ => false,
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Checkout { code, .. } => code.status_code(),
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::Checkout { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let (code, field, order_number) = match &self {
            ServiceError::Checkout {
                code,
                field,
                order_number,
                ..
            } => (Some(*code), field.clone(), order_number.clone()),
            _ => (None, None, None),
        };

        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code,
            message: self.response_message(),
            field,
            order_number,
            retryable: self.retryable(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

/// Helper for mapping a database error raised while writing a new order.
pub(crate) fn order_create_failed(err: DbErr) -> ServiceError {
    tracing::error!(error = %err, "order persistence failed");
    ServiceError::checkout(
        CheckoutErrorCode::OrderCreateFailed,
        "The order could not be saved, please try again",
    )
}
