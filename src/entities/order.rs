use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a checkout order.
///
/// `Paid` and `Cancelled` are terminal. `PaymentFailed` is "pending with a
/// failed attempt" and may return to `PendingPayment` on retry.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[sea_orm(string_value = "PENDING_PAYMENT")]
    PendingPayment,
    #[sea_orm(string_value = "PAID")]
    Paid,
    #[sea_orm(string_value = "PAYMENT_FAILED")]
    PaymentFailed,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Cancelled)
    }

    /// Statuses from which a payment session may be requested or settled.
    pub fn awaiting_payment() -> [OrderStatus; 2] {
        [OrderStatus::PendingPayment, OrderStatus::PaymentFailed]
    }
}

/// The `orders` table.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Human-readable number, unique and stable once issued.
    #[sea_orm(unique)]
    pub order_number: String,

    pub owner_id: Uuid,
    pub status: OrderStatus,

    // Monetary snapshot in minor units; fixed at creation.
    pub subtotal: i64,
    pub shipping_amount: i64,
    pub tax_amount: i64,
    pub discount_amount: i64,
    pub total_amount: i64,
    pub currency: String,

    pub shipping_method_id: String,
    pub shipping_method_name: String,
    /// Copy of the address at checkout time.
    pub shipping_address: Json,
    #[sea_orm(nullable)]
    pub coupon_code: Option<String>,

    /// Session token of the attempt the shopper is currently paying through.
    #[sea_orm(nullable)]
    pub payment_session_token: Option<String>,
    /// Provider transaction id of the verified payment.
    #[sea_orm(nullable)]
    pub payment_reference: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub paid_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::payment_attempt::Entity")]
    PaymentAttempt,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::payment_attempt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentAttempt.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_paid_and_cancelled_are_terminal() {
        assert!(OrderStatus::Paid.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::PendingPayment.is_terminal());
        assert!(!OrderStatus::PaymentFailed.is_terminal());
    }

    #[test]
    fn status_strings_are_stable() {
        assert_eq!(OrderStatus::PendingPayment.to_string(), "PENDING_PAYMENT");
        assert_eq!(
            serde_json::to_value(OrderStatus::PaymentFailed).unwrap(),
            "PAYMENT_FAILED"
        );
    }
}
