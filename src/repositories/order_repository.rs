use chrono::{DateTime, Utc};
use rand::Rng;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseTransaction, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::order::{self, OrderStatus};
use crate::entities::order_item;
use crate::entities::payment_attempt::{self, PaymentAttemptStatus};
use crate::errors::{order_create_failed, CheckoutErrorCode, ServiceError};
use crate::repositories::{is_unique_violation, Repository};
use crate::services::commerce::address_service::ShippingAddress;
use crate::services::commerce::coupon_service::CouponService;
use crate::services::commerce::pricing_service::{CartLine, PriceBreakdown};

/// Source of human-readable order numbers.
pub trait OrderNumberGenerator: Send + Sync {
    fn generate(&self, now: DateTime<Utc>) -> String;
}

/// `{prefix}-{YYYYMMDD}-{NNNNNN}` with a random six digit suffix. Collisions are
/// caught by the unique index and retried.
#[derive(Debug, Clone)]
pub struct RandomOrderNumberGenerator {
    prefix: String,
}

impl RandomOrderNumberGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl OrderNumberGenerator for RandomOrderNumberGenerator {
    fn generate(&self, now: DateTime<Utc>) -> String {
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        format!("{}-{}-{:06}", self.prefix, now.format("%Y%m%d"), suffix)
    }
}

/// Snapshot of one cart line, ready to be written as an order item.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderItem {
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

impl NewOrderItem {
    pub fn from_cart_line(line: &CartLine) -> Result<Self, ServiceError> {
        Ok(Self {
            product_id: line.product_id,
            variant_id: line.variant_id,
            sku: line.sku.clone(),
            name: line.name.clone(),
            image: line.image.clone(),
            unit_price: line.unit_price,
            quantity: line.quantity,
            line_total: line.line_total()?,
            attributes: serde_json::Value::Object(line.attributes.clone()),
        })
    }
}

/// Everything needed to persist a new order in `PENDING_PAYMENT`.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub owner_id: Uuid,
    pub currency: String,
    pub price: PriceBreakdown,
    pub shipping_method_id: String,
    pub shipping_method_name: String,
    pub shipping_address: ShippingAddress,
    pub coupon_code: Option<String>,
    pub items: Vec<NewOrderItem>,
}

impl OrderDraft {
    /// Rejects drafts whose monetary snapshot does not add up.
    fn check(&self) -> Result<(), ServiceError> {
        let invalid = |message: &str| {
            ServiceError::checkout(CheckoutErrorCode::ValidationError, message.to_string())
        };

        if self.items.is_empty() {
            return Err(invalid("An order needs at least one item"));
        }

        let mut subtotal: i64 = 0;
        for item in &self.items {
            if item.quantity < 1 || item.unit_price < 0 {
                return Err(invalid("Order items need a positive quantity and a non-negative price"));
            }
            let expected = item.unit_price.checked_mul(i64::from(item.quantity));
            if expected != Some(item.line_total) {
                return Err(invalid("Order item line total does not match price times quantity"));
            }
            subtotal = subtotal
                .checked_add(item.line_total)
                .ok_or_else(|| invalid("Order amount exceeds the supported range"))?;
        }

        if subtotal != self.price.subtotal || !self.price.is_consistent() {
            return Err(invalid("Order totals are inconsistent"));
        }
        Ok(())
    }
}

/// An order with its items and payment history.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payment_attempts: Vec<payment_attempt::Model>,
}

/// Result of [`OrderRepository::mark_paid`].
#[derive(Debug, Clone)]
pub enum MarkPaidOutcome {
    /// This call moved the order to `PAID`.
    Transitioned {
        order: order::Model,
        coupon_redeemed: bool,
    },
    /// The order was already `PAID`; nothing changed.
    AlreadyPaid(order::Model),
}

impl MarkPaidOutcome {
    pub fn order(&self) -> &order::Model {
        match self {
            MarkPaidOutcome::Transitioned { order, .. } | MarkPaidOutcome::AlreadyPaid(order) => {
                order
            }
        }
    }
}

fn order_not_found() -> ServiceError {
    ServiceError::checkout(CheckoutErrorCode::OrderNotFound, "Order not found")
}

fn already_finalized(order: &order::Model) -> ServiceError {
    ServiceError::checkout(
        CheckoutErrorCode::OrderAlreadyFinalized,
        format!("Order is already {}", order.status),
    )
    .for_order(&order.order_number)
}

/// Persistence for orders and their payment attempts.
///
/// Every status change is a compare-and-swap on the current status, so two
/// concurrent callbacks for the same order cannot both win a transition.
#[derive(Clone)]
pub struct OrderRepository {
    db: Arc<DbPool>,
    numbers: Arc<dyn OrderNumberGenerator>,
    max_number_attempts: u32,
}

impl Repository for OrderRepository {
    fn get_db(&self) -> &DbPool {
        &self.db
    }
}

impl OrderRepository {
    pub fn new(
        db: Arc<DbPool>,
        numbers: Arc<dyn OrderNumberGenerator>,
        max_number_attempts: u32,
    ) -> Self {
        Self {
            db,
            numbers,
            max_number_attempts: max_number_attempts.max(1),
        }
    }

    /// Inserts the order and its items atomically in `PENDING_PAYMENT`.
    ///
    /// A colliding order number is regenerated up to `max_number_attempts` times.
    /// Nothing is left behind on failure.
    #[instrument(skip(self, draft), fields(owner_id = %draft.owner_id))]
    pub async fn create(&self, draft: OrderDraft) -> Result<OrderDetails, ServiceError> {
        draft.check()?;
        let address = serde_json::to_value(&draft.shipping_address)?;

        for attempt in 1..=self.max_number_attempts {
            let now = Utc::now();
            let order_number = self.numbers.generate(now);
            let txn = self.get_db().begin().await.map_err(order_create_failed)?;

            match Self::insert_order(&txn, &draft, &order_number, &address, now).await {
                Ok((order, items)) => {
                    txn.commit().await.map_err(order_create_failed)?;
                    info!(order_id = %order.id, %order_number, "order persisted");
                    return Ok(OrderDetails {
                        order,
                        items,
                        payment_attempts: Vec::new(),
                    });
                }
                Err(err) if is_unique_violation(&err) => {
                    txn.rollback().await.map_err(order_create_failed)?;
                    warn!(%order_number, attempt, "order number collision, regenerating");
                }
                Err(err) => {
                    if let Err(rollback_err) = txn.rollback().await {
                        warn!(error = %rollback_err, "rollback after failed order insert failed");
                    }
                    return Err(order_create_failed(err));
                }
            }
        }

        error!(
            attempts = self.max_number_attempts,
            "could not allocate a unique order number"
        );
        Err(ServiceError::checkout(
            CheckoutErrorCode::OrderCreateFailed,
            "The order could not be saved, please try again",
        ))
    }

    async fn insert_order(
        txn: &DatabaseTransaction,
        draft: &OrderDraft,
        order_number: &str,
        address: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(order::Model, Vec<order_item::Model>), DbErr> {
        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(order_number.to_string()),
            owner_id: Set(draft.owner_id),
            status: Set(OrderStatus::PendingPayment),
            subtotal: Set(draft.price.subtotal),
            shipping_amount: Set(draft.price.shipping_amount),
            tax_amount: Set(draft.price.tax_amount),
            discount_amount: Set(draft.price.discount_amount),
            total_amount: Set(draft.price.total_amount),
            currency: Set(draft.currency.clone()),
            shipping_method_id: Set(draft.shipping_method_id.clone()),
            shipping_method_name: Set(draft.shipping_method_name.clone()),
            shipping_address: Set(address.clone()),
            coupon_code: Set(draft.coupon_code.clone()),
            payment_session_token: Set(None),
            payment_reference: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            paid_at: Set(None),
            cancelled_at: Set(None),
        }
        .insert(txn)
        .await?;

        let mut items = Vec::with_capacity(draft.items.len());
        for (position, item) in draft.items.iter().enumerate() {
            let model = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(item.product_id),
                variant_id: Set(item.variant_id),
                sku: Set(item.sku.clone()),
                name: Set(item.name.clone()),
                image: Set(item.image.clone()),
                unit_price: Set(item.unit_price),
                quantity: Set(item.quantity),
                line_total: Set(item.line_total),
                attributes: Set(item.attributes.clone()),
                position: Set(i32::try_from(position).unwrap_or(i32::MAX)),
                created_at: Set(now),
            }
            .insert(txn)
            .await?;
            items.push(model);
        }

        Ok((order, items))
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find_by_id(id).one(self.get_db()).await?)
    }

    /// Owner-scoped lookup. An order owned by someone else reads as not found.
    #[instrument(skip(self))]
    pub async fn find_by_order_number(
        &self,
        order_number: &str,
        owner_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let order = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .filter(order::Column::OwnerId.eq(owner_id))
            .one(self.get_db())
            .await?
            .ok_or_else(order_not_found)?;

        self.load_details(order).await
    }

    pub async fn load_details(&self, order: order::Model) -> Result<OrderDetails, ServiceError> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::Position)
            .all(self.get_db())
            .await?;

        let payment_attempts = payment_attempt::Entity::find()
            .filter(payment_attempt::Column::OrderId.eq(order.id))
            .order_by_asc(payment_attempt::Column::CreatedAt)
            .all(self.get_db())
            .await?;

        Ok(OrderDetails {
            order,
            items,
            payment_attempts,
        })
    }

    /// Order history, newest first. `page` is 1-based.
    pub async fn list_for_owner(
        &self,
        owner_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<order::Model>, u64), ServiceError> {
        let paginator = order::Entity::find()
            .filter(order::Column::OwnerId.eq(owner_id))
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .paginate(self.get_db(), per_page.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((orders, total))
    }

    pub async fn find_attempt_by_token(
        &self,
        session_token: &str,
    ) -> Result<Option<payment_attempt::Model>, ServiceError> {
        Ok(payment_attempt::Entity::find()
            .filter(payment_attempt::Column::SessionToken.eq(session_token))
            .one(self.get_db())
            .await?)
    }

    /// Points the order at a freshly issued session and records a pending attempt.
    ///
    /// Moves `PAYMENT_FAILED` back to `PENDING_PAYMENT` and fails any attempt still
    /// pending from an earlier session. Rejects terminal orders.
    #[instrument(skip(self, session_token))]
    pub async fn record_session(
        &self,
        order_id: Uuid,
        provider: &str,
        session_token: &str,
        amount: i64,
    ) -> Result<payment_attempt::Model, ServiceError> {
        let now = Utc::now();
        let txn = self.get_db().begin().await?;

        let moved = order::Entity::update_many()
            .col_expr(
                order::Column::PaymentSessionToken,
                Expr::value(Some(session_token.to_string())),
            )
            .col_expr(order::Column::Status, Expr::value(OrderStatus::PendingPayment))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.is_in(OrderStatus::awaiting_payment()))
            .exec(&txn)
            .await?
            .rows_affected;

        if moved == 0 {
            let current = order::Entity::find_by_id(order_id).one(&txn).await?;
            txn.rollback().await?;
            return Err(match current {
                Some(order) => already_finalized(&order),
                None => order_not_found(),
            });
        }

        // Only the newest session may settle the order.
        Self::fail_pending_attempts(
            &txn,
            sea_orm::Condition::all().add(payment_attempt::Column::OrderId.eq(order_id)),
            "superseded",
            now,
        )
        .await?;

        let attempt = payment_attempt::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            provider: Set(provider.to_string()),
            session_token: Set(Some(session_token.to_string())),
            amount: Set(amount),
            status: Set(PaymentAttemptStatus::Pending),
            transaction_id: Set(None),
            failure_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok(attempt)
    }

    /// Records a session request that never produced a token. The order keeps
    /// its status so the shopper can retry.
    #[instrument(skip(self))]
    pub async fn record_failed_session(
        &self,
        order_id: Uuid,
        provider: &str,
        amount: i64,
        reason: &str,
    ) -> Result<payment_attempt::Model, ServiceError> {
        let now = Utc::now();
        let attempt = payment_attempt::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            provider: Set(provider.to_string()),
            session_token: Set(None),
            amount: Set(amount),
            status: Set(PaymentAttemptStatus::Failed),
            transaction_id: Set(None),
            failure_reason: Set(Some(reason.to_string())),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.get_db())
        .await?;
        Ok(attempt)
    }

    async fn fail_pending_attempts(
        txn: &DatabaseTransaction,
        filter: sea_orm::Condition,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DbErr> {
        Ok(payment_attempt::Entity::update_many()
            .col_expr(
                payment_attempt::Column::Status,
                Expr::value(PaymentAttemptStatus::Failed),
            )
            .col_expr(
                payment_attempt::Column::FailureReason,
                Expr::value(Some(reason.to_string())),
            )
            .col_expr(payment_attempt::Column::UpdatedAt, Expr::value(now))
            .filter(filter)
            .filter(payment_attempt::Column::Status.eq(PaymentAttemptStatus::Pending))
            .exec(txn)
            .await?
            .rows_affected)
    }

    /// `PENDING_PAYMENT | PAYMENT_FAILED -> PAID`, at most once per order.
    ///
    /// The winning call verifies the attempt and redeems the order's coupon in the
    /// same transaction. A repeat on a paid order changes nothing and returns
    /// [`MarkPaidOutcome::AlreadyPaid`].
    #[instrument(skip(self))]
    pub async fn mark_paid(
        &self,
        order_id: Uuid,
        attempt_id: Uuid,
        transaction_id: &str,
    ) -> Result<MarkPaidOutcome, ServiceError> {
        let now = Utc::now();
        let txn = self.get_db().begin().await?;

        let moved = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Paid))
            .col_expr(order::Column::PaidAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::PaymentReference,
                Expr::value(Some(transaction_id.to_string())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.is_in(OrderStatus::awaiting_payment()))
            .exec(&txn)
            .await?
            .rows_affected;

        if moved == 0 {
            let current = order::Entity::find_by_id(order_id).one(&txn).await?;
            return match current {
                Some(order) if order.status == OrderStatus::Paid => {
                    let superseded = Self::fail_pending_attempts(
                        &txn,
                        sea_orm::Condition::all().add(payment_attempt::Column::Id.eq(attempt_id)),
                        "superseded",
                        now,
                    )
                    .await?;
                    txn.commit().await?;
                    if superseded > 0 {
                        warn!(
                            %order_id,
                            %attempt_id,
                            %transaction_id,
                            "payment verified for an order that was already paid"
                        );
                    }
                    Ok(MarkPaidOutcome::AlreadyPaid(order))
                }
                Some(order) => {
                    txn.rollback().await?;
                    error!(
                        %order_id,
                        %transaction_id,
                        status = %order.status,
                        "payment verified for an order that can no longer be paid"
                    );
                    Err(already_finalized(&order))
                }
                None => {
                    txn.rollback().await?;
                    Err(order_not_found())
                }
            };
        }

        payment_attempt::Entity::update_many()
            .col_expr(
                payment_attempt::Column::Status,
                Expr::value(PaymentAttemptStatus::Verified),
            )
            .col_expr(
                payment_attempt::Column::TransactionId,
                Expr::value(Some(transaction_id.to_string())),
            )
            .col_expr(
                payment_attempt::Column::FailureReason,
                Expr::value(Option::<String>::None),
            )
            .col_expr(payment_attempt::Column::UpdatedAt, Expr::value(now))
            .filter(payment_attempt::Column::Id.eq(attempt_id))
            .filter(payment_attempt::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await?;

        Self::fail_pending_attempts(
            &txn,
            sea_orm::Condition::all()
                .add(payment_attempt::Column::OrderId.eq(order_id))
                .add(payment_attempt::Column::Id.ne(attempt_id)),
            "superseded",
            now,
        )
        .await?;

        let order = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(order_not_found)?;

        let coupon_redeemed = match order.coupon_code.as_deref() {
            Some(code) => CouponService::redeem(&txn, code).await?,
            None => false,
        };

        txn.commit().await?;
        info!(%order_id, order_number = %order.order_number, "order marked paid");

        Ok(MarkPaidOutcome::Transitioned {
            order,
            coupon_redeemed,
        })
    }

    /// Fails a pending attempt. The order moves `PENDING_PAYMENT -> PAYMENT_FAILED`
    /// only while that attempt is still the order's current session.
    #[instrument(skip(self))]
    pub async fn mark_payment_failed(
        &self,
        attempt_id: Uuid,
        reason: &str,
    ) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let txn = self.get_db().begin().await?;

        let attempt = payment_attempt::Entity::find_by_id(attempt_id)
            .one(&txn)
            .await?
            .ok_or_else(order_not_found)?;

        Self::fail_pending_attempts(
            &txn,
            sea_orm::Condition::all().add(payment_attempt::Column::Id.eq(attempt_id)),
            reason,
            now,
        )
        .await?;

        if let Some(token) = attempt.session_token.as_deref() {
            order::Entity::update_many()
                .col_expr(order::Column::Status, Expr::value(OrderStatus::PaymentFailed))
                .col_expr(order::Column::UpdatedAt, Expr::value(now))
                .filter(order::Column::Id.eq(attempt.order_id))
                .filter(order::Column::Status.eq(OrderStatus::PendingPayment))
                .filter(order::Column::PaymentSessionToken.eq(token))
                .exec(&txn)
                .await?;
        }

        let order = order::Entity::find_by_id(attempt.order_id)
            .one(&txn)
            .await?
            .ok_or_else(order_not_found)?;

        txn.commit().await?;
        Ok(order)
    }

    /// Explicit cancellation by the owner; legal only before payment.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        order_number: &str,
        owner_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let txn = self.get_db().begin().await?;

        let order = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .filter(order::Column::OwnerId.eq(owner_id))
            .one(&txn)
            .await?;
        let Some(order) = order else {
            txn.rollback().await?;
            return Err(order_not_found());
        };

        let moved = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
            .col_expr(order::Column::CancelledAt, Expr::value(Some(now)))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.is_in(OrderStatus::awaiting_payment()))
            .exec(&txn)
            .await?
            .rows_affected;

        if moved == 0 {
            let current = order::Entity::find_by_id(order.id)
                .one(&txn)
                .await?
                .unwrap_or(order);
            txn.rollback().await?;
            return Err(already_finalized(&current));
        }

        Self::fail_pending_attempts(
            &txn,
            sea_orm::Condition::all().add(payment_attempt::Column::OrderId.eq(order.id)),
            "order cancelled",
            now,
        )
        .await?;

        let cancelled = order::Entity::find_by_id(order.id)
            .one(&txn)
            .await?
            .ok_or_else(order_not_found)?;

        txn.commit().await?;
        info!(order_id = %cancelled.id, %order_number, "order cancelled");
        Ok(cancelled)
    }
}
