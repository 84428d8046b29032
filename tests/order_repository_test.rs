//! Order repository behaviour against a real (in-memory SQLite) schema:
//! order number allocation, status compare-and-swap and coupon redemption.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::json;
use storefront_checkout::{
    db::{self, DbConfig, DbPool},
    entities::{
        coupon::{self, DiscountType},
        order::OrderStatus,
        payment_attempt::{self, PaymentAttemptStatus},
    },
    errors::{CheckoutErrorCode, ServiceError},
    repositories::order_repository::{
        MarkPaidOutcome, NewOrderItem, OrderDraft, OrderNumberGenerator, OrderRepository,
    },
    services::commerce::{PricingCalculator, ShippingAddress},
};
use uuid::Uuid;

/// Hands out a fixed sequence of numbers, repeating the last one when exhausted.
struct ScriptedNumbers(Mutex<VecDeque<String>>);

impl ScriptedNumbers {
    fn new(numbers: &[&str]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(
            numbers.iter().map(|n| n.to_string()).collect(),
        )))
    }
}

impl OrderNumberGenerator for ScriptedNumbers {
    fn generate(&self, _now: DateTime<Utc>) -> String {
        let mut queue = self.0.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }
}

async fn database() -> Arc<DbPool> {
    let pool = db::establish_connection_with_config(&DbConfig::in_memory_sqlite())
        .await
        .expect("connect");
    db::run_migrations(&pool).await.expect("migrate");
    Arc::new(pool)
}

fn address() -> ShippingAddress {
    ShippingAddress {
        recipient_name: "Reza Karimi".into(),
        phone: "09121234567".into(),
        province: "Isfahan".into(),
        city: "Isfahan".into(),
        address_line: "Chaharbagh Ave, 4".into(),
        postal_code: "8173834511".into(),
    }
}

fn draft(owner_id: Uuid, coupon_code: Option<&str>, discount: i64) -> OrderDraft {
    let item = NewOrderItem {
        product_id: Uuid::new_v4(),
        variant_id: None,
        sku: "SKU-1".into(),
        name: "Tea pot".into(),
        image: None,
        unit_price: 200_000,
        quantity: 2,
        line_total: 400_000,
        attributes: json!({"color": "blue"}),
    };
    let price = PricingCalculator::new(900)
        .price(
            &[storefront_checkout::services::commerce::CartLine {
                product_id: item.product_id,
                variant_id: None,
                sku: item.sku.clone(),
                name: item.name.clone(),
                image: None,
                unit_price: item.unit_price,
                quantity: item.quantity,
                attributes: Default::default(),
            }],
            50_000,
            discount,
        )
        .unwrap();

    OrderDraft {
        owner_id,
        currency: "IRR".into(),
        price,
        shipping_method_id: "post".into(),
        shipping_method_name: "Post".into(),
        shipping_address: address(),
        coupon_code: coupon_code.map(str::to_string),
        items: vec![item],
    }
}

async fn seed_coupon(db: &DbPool, code: &str, usage_limit: Option<i32>) {
    let now = Utc::now();
    coupon::ActiveModel {
        id: Set(Uuid::new_v4()),
        code: Set(code.into()),
        discount_type: Set(DiscountType::Fixed),
        value: Set(10_000),
        max_discount: Set(None),
        minimum_subtotal: Set(None),
        eligible_product_ids: Set(json!([])),
        is_active: Set(true),
        starts_at: Set(None),
        expires_at: Set(None),
        usage_limit: Set(usage_limit),
        usage_count: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed coupon");
}

fn code_of(err: &ServiceError) -> Option<CheckoutErrorCode> {
    err.code()
}

#[tokio::test]
async fn colliding_order_numbers_are_regenerated() {
    let db = database().await;
    let numbers = ScriptedNumbers::new(&["ORD-20261018-000001", "ORD-20261018-000001", "ORD-20261018-000002"]);
    let repo = OrderRepository::new(db.clone(), numbers, 5);
    let owner = Uuid::new_v4();

    let first = repo.create(draft(owner, None, 0)).await.unwrap();
    let second = repo.create(draft(owner, None, 0)).await.unwrap();

    assert_eq!(first.order.order_number, "ORD-20261018-000001");
    assert_eq!(second.order.order_number, "ORD-20261018-000002");
    assert_eq!(second.items.len(), 1);
}

#[tokio::test]
async fn exhausted_number_attempts_fail_without_partial_rows() {
    let db = database().await;
    let repo = OrderRepository::new(db.clone(), ScriptedNumbers::new(&["ORD-1"]), 3);
    let owner = Uuid::new_v4();

    repo.create(draft(owner, None, 0)).await.unwrap();
    let err = repo.create(draft(owner, None, 0)).await.unwrap_err();

    assert_eq!(code_of(&err), Some(CheckoutErrorCode::OrderCreateFailed));
    assert!(err.retryable());
    let (orders, total) = repo.list_for_owner(owner, 1, 20).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(orders.len(), 1);
    let items = storefront_checkout::entities::order_item::Entity::find()
        .all(db.as_ref())
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn inconsistent_totals_are_a_validation_error() {
    let db = database().await;
    let repo = OrderRepository::new(db, ScriptedNumbers::new(&["ORD-1"]), 3);

    let mut tampered = draft(Uuid::new_v4(), None, 0);
    tampered.price.total_amount -= 1;
    let err = repo.create(tampered).await.unwrap_err();
    assert_eq!(code_of(&err), Some(CheckoutErrorCode::ValidationError));
}

#[tokio::test]
async fn lookups_are_scoped_to_the_owner() {
    let db = database().await;
    let repo = OrderRepository::new(db, ScriptedNumbers::new(&["ORD-OWNED"]), 3);
    let owner = Uuid::new_v4();
    repo.create(draft(owner, None, 0)).await.unwrap();

    let found = repo.find_by_order_number("ORD-OWNED", owner).await.unwrap();
    assert_eq!(found.order.owner_id, owner);
    assert_eq!(found.order.total_amount, 400_000 + 50_000 + 36_000);

    let err = repo
        .find_by_order_number("ORD-OWNED", Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(code_of(&err), Some(CheckoutErrorCode::OrderNotFound));
}

#[tokio::test]
async fn mark_paid_transitions_once_and_redeems_coupon_once() {
    let db = database().await;
    seed_coupon(&db, "TEN", Some(5)).await;
    let repo = OrderRepository::new(db.clone(), ScriptedNumbers::new(&["ORD-PAY"]), 3);
    let created = repo
        .create(draft(Uuid::new_v4(), Some("TEN"), 10_000))
        .await
        .unwrap();
    let order_id = created.order.id;

    let first = repo.record_session(order_id, "fake", "TOKEN-1", created.order.total_amount).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = repo.record_session(order_id, "fake", "TOKEN-2", created.order.total_amount).await.unwrap();

    let paid = repo.mark_paid(order_id, second.id, "TX-2").await.unwrap();
    assert_matches!(
        &paid,
        MarkPaidOutcome::Transitioned { coupon_redeemed: true, order } if order.status == OrderStatus::Paid
    );
    assert!(paid.order().paid_at.is_some());
    assert_eq!(paid.order().payment_reference.as_deref(), Some("TX-2"));

    // A late verification of the older session does not pay twice.
    let again = repo.mark_paid(order_id, first.id, "TX-1").await.unwrap();
    assert_matches!(&again, MarkPaidOutcome::AlreadyPaid(order) if order.payment_reference.as_deref() == Some("TX-2"));

    let coupon = coupon::Entity::find().one(db.as_ref()).await.unwrap().unwrap();
    assert_eq!(coupon.usage_count, 1);

    let details = repo.load_details(paid.order().clone()).await.unwrap();
    let statuses: Vec<_> = details.payment_attempts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![PaymentAttemptStatus::Failed, PaymentAttemptStatus::Verified]
    );
    assert_eq!(
        details.payment_attempts[0].failure_reason.as_deref(),
        Some("superseded")
    );
}

#[tokio::test]
async fn retry_while_pending_leaves_no_pending_attempts_once_paid() {
    let db = database().await;
    let repo = OrderRepository::new(db.clone(), ScriptedNumbers::new(&["ORD-RETRY"]), 3);
    let created = repo.create(draft(Uuid::new_v4(), None, 0)).await.unwrap();
    let id = created.order.id;
    let amount = created.order.total_amount;

    let first = repo.record_session(id, "fake", "TOK-A", amount).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = repo.record_session(id, "fake", "TOK-B", amount).await.unwrap();

    let first_now = payment_attempt::Entity::find_by_id(first.id)
        .one(db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_now.status, PaymentAttemptStatus::Failed);
    assert_eq!(first_now.failure_reason.as_deref(), Some("superseded"));

    // A pending row that slipped in beside the current session is retired on payment.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let now = Utc::now();
    payment_attempt::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(id),
        provider: Set("fake".into()),
        session_token: Set(Some("TOK-STRAY".into())),
        amount: Set(amount),
        status: Set(PaymentAttemptStatus::Pending),
        transaction_id: Set(None),
        failure_reason: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db.as_ref())
    .await
    .unwrap();

    let paid = repo.mark_paid(id, second.id, "TX-B").await.unwrap();
    assert_matches!(&paid, MarkPaidOutcome::Transitioned { .. });

    let details = repo.load_details(paid.order().clone()).await.unwrap();
    let attempts: Vec<_> = details
        .payment_attempts
        .iter()
        .map(|a| (a.session_token.as_deref(), a.status))
        .collect();
    assert_eq!(
        attempts,
        vec![
            (Some("TOK-A"), PaymentAttemptStatus::Failed),
            (Some("TOK-B"), PaymentAttemptStatus::Verified),
            (Some("TOK-STRAY"), PaymentAttemptStatus::Failed),
        ]
    );
}

#[tokio::test]
async fn concurrent_mark_paid_has_a_single_winner() {
    let db = database().await;
    let repo = OrderRepository::new(db, ScriptedNumbers::new(&["ORD-RACE"]), 3);
    let created = repo.create(draft(Uuid::new_v4(), None, 0)).await.unwrap();
    let attempt = repo
        .record_session(created.order.id, "fake", "TOKEN", created.order.total_amount)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        repo.mark_paid(created.order.id, attempt.id, "TX"),
        repo.mark_paid(created.order.id, attempt.id, "TX"),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, MarkPaidOutcome::Transitioned { .. }))
        .count();
    assert_eq!(winners, 1);
    assert!(outcomes.iter().all(|o| o.order().status == OrderStatus::Paid));
}

#[tokio::test]
async fn cancel_racing_payment_settles_exactly_one_way() {
    let db = database().await;
    let repo = OrderRepository::new(db, ScriptedNumbers::new(&["ORD-DUEL"]), 3);
    let owner = Uuid::new_v4();
    let created = repo.create(draft(owner, None, 0)).await.unwrap();
    let attempt = repo
        .record_session(created.order.id, "fake", "TOKEN", created.order.total_amount)
        .await
        .unwrap();

    let (paid, cancelled) = tokio::join!(
        repo.mark_paid(created.order.id, attempt.id, "TX"),
        repo.cancel("ORD-DUEL", owner),
    );

    let stored = repo.find_by_id(created.order.id).await.unwrap().unwrap();
    match stored.status {
        OrderStatus::Paid => {
            assert_matches!(paid, Ok(MarkPaidOutcome::Transitioned { .. }));
            let err = cancelled.unwrap_err();
            assert_eq!(code_of(&err), Some(CheckoutErrorCode::OrderAlreadyFinalized));
            assert!(stored.cancelled_at.is_none());
        }
        OrderStatus::Cancelled => {
            assert!(cancelled.is_ok());
            let err = paid.unwrap_err();
            assert_eq!(code_of(&err), Some(CheckoutErrorCode::OrderAlreadyFinalized));
            assert!(stored.paid_at.is_none());
        }
        other => panic!("unexpected status {other}"),
    }
}

#[tokio::test]
async fn exhausted_coupon_does_not_block_payment() {
    let db = database().await;
    seed_coupon(&db, "LAST", Some(1)).await;
    let repo = OrderRepository::new(
        db.clone(),
        ScriptedNumbers::new(&["ORD-A", "ORD-B"]),
        3,
    );

    let mut paid_outcomes = Vec::new();
    for _ in 0..2 {
        let created = repo
            .create(draft(Uuid::new_v4(), Some("LAST"), 10_000))
            .await
            .unwrap();
        let attempt = repo
            .record_session(created.order.id, "fake", &format!("T-{}", created.order.order_number), created.order.total_amount)
            .await
            .unwrap();
        paid_outcomes.push(repo.mark_paid(created.order.id, attempt.id, "TX").await.unwrap());
    }

    assert_matches!(paid_outcomes[0], MarkPaidOutcome::Transitioned { coupon_redeemed: true, .. });
    assert_matches!(paid_outcomes[1], MarkPaidOutcome::Transitioned { coupon_redeemed: false, .. });
    let coupon = coupon::Entity::find().one(db.as_ref()).await.unwrap().unwrap();
    assert_eq!(coupon.usage_count, 1);
}

#[tokio::test]
async fn payment_failure_only_applies_to_the_current_session() {
    let db = database().await;
    let repo = OrderRepository::new(db, ScriptedNumbers::new(&["ORD-FAIL"]), 3);
    let created = repo.create(draft(Uuid::new_v4(), None, 0)).await.unwrap();
    let id = created.order.id;
    let amount = created.order.total_amount;

    let old = repo.record_session(id, "fake", "OLD", amount).await.unwrap();
    let current = repo.record_session(id, "fake", "CURRENT", amount).await.unwrap();

    let order = repo.mark_payment_failed(old.id, "expired").await.unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);

    let order = repo.mark_payment_failed(current.id, "declined").await.unwrap();
    assert_eq!(order.status, OrderStatus::PaymentFailed);

    // Retry reopens the order with the same id and totals.
    repo.record_session(id, "fake", "RETRY", amount).await.unwrap();
    let reopened = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(reopened.status, OrderStatus::PendingPayment);
    assert_eq!(reopened.total_amount, amount);
    assert_eq!(reopened.payment_session_token.as_deref(), Some("RETRY"));
}

#[tokio::test]
async fn terminal_orders_reject_sessions_and_cancellation() {
    let db = database().await;
    let repo = OrderRepository::new(db, ScriptedNumbers::new(&["ORD-C"]), 3);
    let owner = Uuid::new_v4();
    let created = repo.create(draft(owner, None, 0)).await.unwrap();
    let id = created.order.id;

    let attempt = repo.record_session(id, "fake", "TOKEN", created.order.total_amount).await.unwrap();
    let cancelled = repo.cancel("ORD-C", owner).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    let err = repo.cancel("ORD-C", owner).await.unwrap_err();
    assert_eq!(code_of(&err), Some(CheckoutErrorCode::OrderAlreadyFinalized));

    let err = repo
        .record_session(id, "fake", "AFTER", created.order.total_amount)
        .await
        .unwrap_err();
    assert_eq!(code_of(&err), Some(CheckoutErrorCode::OrderAlreadyFinalized));

    let err = repo.mark_paid(id, attempt.id, "TX").await.unwrap_err();
    assert_eq!(code_of(&err), Some(CheckoutErrorCode::OrderAlreadyFinalized));

    let err = repo.cancel("ORD-C", Uuid::new_v4()).await.unwrap_err();
    assert_eq!(code_of(&err), Some(CheckoutErrorCode::OrderNotFound));
}
