use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    auth::CurrentUser,
    entities::customer_address,
    errors::ServiceError,
    handlers::orders::{OrderResponse, OrderSummary},
    services::commerce::{
        checkout_service::PaymentRedirect, shipping_service::ShippingMethod, PlaceOrderRequest,
        ShippingAddress,
    },
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Serialize)]
pub struct PlaceOrderResponse {
    pub order: OrderResponse,
    pub redirect_url: String,
}

/// POST /api/v1/checkout/orders
pub async fn place_order(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<PlaceOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let placed = state.checkout.place_order(user.user_id, payload).await?;
    info!(
        order_number = %placed.order.order.order_number,
        "checkout completed, redirecting to payment"
    );

    let body = PlaceOrderResponse {
        order: placed.order.into(),
        redirect_url: placed.redirect_url,
    };
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success_with_message(body, "Order placed")),
    ))
}

/// POST /api/v1/checkout/orders/:order_number/retry-payment
pub async fn retry_payment(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    user: CurrentUser,
) -> ApiResult<PaymentRedirect> {
    let redirect = state
        .checkout
        .retry_payment(&order_number, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(redirect)))
}

/// POST /api/v1/checkout/orders/:order_number/cancel
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    user: CurrentUser,
) -> ApiResult<OrderSummary> {
    let order = state.checkout.cancel(&order_number, user.user_id).await?;
    Ok(Json(ApiResponse::success_with_message(
        order.into(),
        "Order cancelled",
    )))
}

/// GET /api/v1/checkout/shipping-methods
pub async fn list_shipping_methods(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ShippingMethod>>> {
    Json(ApiResponse::success(
        state.checkout.shipping_methods().to_vec(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SaveAddressRequest {
    #[serde(flatten)]
    pub address: ShippingAddress,
    #[serde(default)]
    pub is_default: bool,
}

/// POST /api/v1/addresses
pub async fn save_address(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<SaveAddressRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let saved: customer_address::Model = state
        .checkout
        .addresses()
        .save(user.user_id, payload.address, payload.is_default)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(saved))))
}
