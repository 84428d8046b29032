use crate::{
    db::DbPool,
    entities::coupon::{self, DiscountType},
    errors::{CheckoutErrorCode, ServiceError},
    services::commerce::pricing_service::{apply_basis_points, CartLine},
};
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::{Condition, Expr},
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Why a coupon cannot be applied to a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponRejection {
    NotFound,
    Expired,
    MinimumNotMet,
    NotApplicableToItems,
}

impl CouponRejection {
    pub fn code(self) -> CheckoutErrorCode {
        match self {
            CouponRejection::NotFound => CheckoutErrorCode::CouponNotFound,
            CouponRejection::Expired => CheckoutErrorCode::CouponExpired,
            CouponRejection::MinimumNotMet => CheckoutErrorCode::CouponMinimumNotMet,
            CouponRejection::NotApplicableToItems => CheckoutErrorCode::CouponNotApplicableToItems,
        }
    }

    fn message(self) -> &'static str {
        match self {
            CouponRejection::NotFound => "Coupon code not found",
            CouponRejection::Expired => "Coupon is expired or no longer available",
            CouponRejection::MinimumNotMet => "Cart subtotal is below the coupon minimum",
            CouponRejection::NotApplicableToItems => {
                "Coupon does not apply to any item in the cart"
            }
        }
    }
}

impl From<CouponRejection> for ServiceError {
    fn from(rejection: CouponRejection) -> Self {
        ServiceError::invalid_field(rejection.code(), "coupon_code", rejection.message())
    }
}

/// An accepted coupon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponDiscount {
    pub code: String,
    pub discount_amount: i64,
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Applies a coupon's rules to a cart. Side-effect free.
///
/// The discount base is the cart subtotal, or only the eligible lines when the
/// coupon is restricted to specific products. The result never exceeds the base.
pub fn evaluate(
    coupon: &coupon::Model,
    subtotal: i64,
    lines: &[CartLine],
    now: DateTime<Utc>,
) -> Result<CouponDiscount, CouponRejection> {
    if !coupon.is_active {
        return Err(CouponRejection::NotFound);
    }
    if coupon.starts_at.is_some_and(|starts| starts > now)
        || coupon.expires_at.is_some_and(|expires| expires <= now)
    {
        return Err(CouponRejection::Expired);
    }
    if coupon
        .usage_limit
        .is_some_and(|limit| coupon.usage_count >= limit)
    {
        return Err(CouponRejection::Expired);
    }
    if coupon
        .minimum_subtotal
        .is_some_and(|minimum| subtotal < minimum)
    {
        return Err(CouponRejection::MinimumNotMet);
    }

    let eligible: HashSet<Uuid> = coupon.eligible_products().into_iter().collect();
    let base = if eligible.is_empty() {
        subtotal
    } else {
        let eligible_lines: Vec<&CartLine> = lines
            .iter()
            .filter(|line| eligible.contains(&line.product_id))
            .collect();
        if eligible_lines.is_empty() {
            return Err(CouponRejection::NotApplicableToItems);
        }
        eligible_lines
            .iter()
            .map(|line| line.unit_price.saturating_mul(i64::from(line.quantity)))
            .fold(0i64, i64::saturating_add)
    };

    let raw = match coupon.discount_type {
        DiscountType::Fixed => coupon.value,
        DiscountType::Percentage => {
            let bps = u32::try_from(coupon.value.clamp(0, 10_000)).unwrap_or(0);
            apply_basis_points(base, bps).unwrap_or(base)
        }
    };

    let capped = coupon
        .max_discount
        .map_or(raw, |max| raw.min(max))
        .clamp(0, base.max(0));

    Ok(CouponDiscount {
        code: coupon.code.clone(),
        discount_amount: capped,
    })
}

#[derive(Debug, Clone)]
pub struct CouponService {
    db_pool: Arc<DbPool>,
}

impl CouponService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Looks the code up case-insensitively and checks it against the cart.
    #[instrument(skip(self, lines))]
    pub async fn validate(
        &self,
        code: &str,
        subtotal: i64,
        lines: &[CartLine],
    ) -> Result<CouponDiscount, ServiceError> {
        let normalized = normalize_code(code);
        if normalized.is_empty() {
            return Err(CouponRejection::NotFound.into());
        }

        let coupon = coupon::Entity::find()
            .filter(coupon::Column::Code.eq(normalized.as_str()))
            .one(&*self.db_pool)
            .await?
            .ok_or(CouponRejection::NotFound)?;

        Ok(evaluate(&coupon, subtotal, lines, Utc::now())?)
    }

    /// Consumes one use of a coupon. Runs inside the transaction that marks the
    /// order paid, so a redemption only ever happens for a captured payment.
    ///
    /// Returns `false` when the coupon reached its usage limit in the meantime;
    /// the payment has already been captured, so the caller keeps the order paid.
    pub async fn redeem<C: ConnectionTrait>(conn: &C, code: &str) -> Result<bool, DbErr> {
        let result = coupon::Entity::update_many()
            .col_expr(
                coupon::Column::UsageCount,
                Expr::col(coupon::Column::UsageCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .filter(
                Condition::any()
                    .add(coupon::Column::UsageLimit.is_null())
                    .add(
                        Expr::col(coupon::Column::UsageCount)
                            .lt(Expr::col(coupon::Column::UsageLimit)),
                    ),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(coupon = %code, "coupon could not be redeemed; usage limit reached or coupon removed");
            return Ok(false);
        }
        Ok(true)
    }
}
