use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    auth::CurrentUser,
    entities::{
        order::{self, OrderStatus},
        order_item,
        payment_attempt::{self, PaymentAttemptStatus},
    },
    handlers::common::{PaginatedResponse, PaginationParams},
    repositories::order_repository::OrderDetails,
    ApiResponse, ApiResult, AppState,
};

#[derive(Debug, Serialize)]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub image: Option<String>,
    pub unit_price: i64,
    pub quantity: i32,
    pub line_total: i64,
    pub attributes: serde_json::Value,
}

impl From<order_item::Model> for OrderItemResponse {
    fn from(item: order_item::Model) -> Self {
        Self {
            product_id: item.product_id,
            variant_id: item.variant_id,
            sku: item.sku,
            name: item.name,
            image: item.image,
            unit_price: item.unit_price,
            quantity: item.quantity,
            line_total: item.line_total,
            attributes: item.attributes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentAttemptResponse {
    pub id: Uuid,
    pub provider: String,
    pub status: PaymentAttemptStatus,
    pub amount: i64,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<payment_attempt::Model> for PaymentAttemptResponse {
    fn from(attempt: payment_attempt::Model) -> Self {
        Self {
            id: attempt.id,
            provider: attempt.provider,
            status: attempt.status,
            amount: attempt.amount,
            transaction_id: attempt.transaction_id,
            failure_reason: attempt.failure_reason,
            created_at: attempt.created_at,
        }
    }
}

/// Order header as shown in listings.
#[derive(Debug, Serialize)]
pub struct OrderSummary {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub subtotal: i64,
    pub shipping_amount: i64,
    pub tax_amount: i64,
    pub discount_amount: i64,
    pub total_amount: i64,
    pub currency: String,
    pub shipping_method_id: String,
    pub shipping_method_name: String,
    pub shipping_address: serde_json::Value,
    pub coupon_code: Option<String>,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl From<order::Model> for OrderSummary {
    fn from(order: order::Model) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            status: order.status,
            subtotal: order.subtotal,
            shipping_amount: order.shipping_amount,
            tax_amount: order.tax_amount,
            discount_amount: order.discount_amount,
            total_amount: order.total_amount,
            currency: order.currency,
            shipping_method_id: order.shipping_method_id,
            shipping_method_name: order.shipping_method_name,
            shipping_address: order.shipping_address,
            coupon_code: order.coupon_code,
            payment_reference: order.payment_reference,
            created_at: order.created_at,
            paid_at: order.paid_at,
            cancelled_at: order.cancelled_at,
        }
    }
}

/// Full order with items and payment history.
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub summary: OrderSummary,
    pub items: Vec<OrderItemResponse>,
    pub payment_attempts: Vec<PaymentAttemptResponse>,
}

impl From<OrderDetails> for OrderResponse {
    fn from(details: OrderDetails) -> Self {
        Self {
            summary: details.order.into(),
            items: details.items.into_iter().map(Into::into).collect(),
            payment_attempts: details
                .payment_attempts
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }
}

/// GET /api/v1/orders
pub async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
    user: CurrentUser,
) -> ApiResult<PaginatedResponse<OrderSummary>> {
    let (page, per_page) = params.normalized();
    let (orders, total) = state
        .checkout
        .list_orders(user.user_id, page, per_page)
        .await?;

    let data = orders.into_iter().map(OrderSummary::from).collect();
    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        data, page, per_page, total,
    ))))
}

/// GET /api/v1/orders/:order_number
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    user: CurrentUser,
) -> ApiResult<OrderResponse> {
    let details = state
        .checkout
        .get_order(&order_number, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(details.into())))
}
