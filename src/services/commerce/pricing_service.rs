use crate::errors::{CheckoutErrorCode, ServiceError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One cart line as submitted by the client. Prices are integer minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    #[serde(default)]
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    pub unit_price: i64,
    pub quantity: i32,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl CartLine {
    pub fn line_total(&self) -> Result<i64, ServiceError> {
        line_total(self.unit_price, self.quantity)
    }
}

/// Monetary snapshot of an order.
///
/// `total_amount == subtotal + shipping_amount + tax_amount - discount_amount`
/// always holds for values produced by [`PricingCalculator::price`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: i64,
    pub shipping_amount: i64,
    pub tax_amount: i64,
    pub discount_amount: i64,
    pub total_amount: i64,
}

impl PriceBreakdown {
    /// Re-checks the totals invariant without trusting whoever built the value.
    pub fn is_consistent(&self) -> bool {
        let parts_non_negative = self.subtotal >= 0
            && self.shipping_amount >= 0
            && self.tax_amount >= 0
            && self.discount_amount >= 0
            && self.total_amount >= 0;

        let expected = self
            .subtotal
            .checked_add(self.shipping_amount)
            .and_then(|v| v.checked_add(self.tax_amount))
            .and_then(|v| v.checked_sub(self.discount_amount));

        parts_non_negative && expected == Some(self.total_amount)
    }
}

fn overflow() -> ServiceError {
    ServiceError::checkout(
        CheckoutErrorCode::ValidationError,
        "Order amount exceeds the supported range",
    )
}

pub fn line_total(unit_price: i64, quantity: i32) -> Result<i64, ServiceError> {
    unit_price
        .checked_mul(i64::from(quantity))
        .ok_or_else(overflow)
}

/// `amount * bps / 10_000`, rounded half-up to a whole minor unit.
pub fn apply_basis_points(amount: i64, bps: u32) -> Option<i64> {
    let rate = Decimal::new(i64::from(bps), 4);
    Decimal::from(amount)
        .checked_mul(rate)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Pure pricing policy: identical input always yields identical output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingCalculator {
    tax_rate_bps: u32,
}

impl PricingCalculator {
    pub fn new(tax_rate_bps: u32) -> Self {
        Self { tax_rate_bps }
    }

    pub fn tax_rate_bps(&self) -> u32 {
        self.tax_rate_bps
    }

    pub fn subtotal(&self, lines: &[CartLine]) -> Result<i64, ServiceError> {
        lines.iter().try_fold(0i64, |acc, line| {
            acc.checked_add(line.line_total()?).ok_or_else(overflow)
        })
    }

    /// Tax is a fixed share of the subtotal; shipping is not taxed.
    pub fn tax_for(&self, subtotal: i64) -> Result<i64, ServiceError> {
        apply_basis_points(subtotal, self.tax_rate_bps).ok_or_else(overflow)
    }

    /// Prices a cart. The discount is clamped so the total never drops below zero;
    /// the clamped value is what `discount_amount` reports.
    pub fn price(
        &self,
        lines: &[CartLine],
        shipping_cost: i64,
        requested_discount: i64,
    ) -> Result<PriceBreakdown, ServiceError> {
        if shipping_cost < 0 || requested_discount < 0 {
            return Err(ServiceError::checkout(
                CheckoutErrorCode::ValidationError,
                "Shipping cost and discount must not be negative",
            ));
        }

        let subtotal = self.subtotal(lines)?;
        let tax_amount = self.tax_for(subtotal)?;
        let gross = subtotal
            .checked_add(shipping_cost)
            .and_then(|v| v.checked_add(tax_amount))
            .ok_or_else(overflow)?;

        let discount_amount = requested_discount.min(gross);

        Ok(PriceBreakdown {
            subtotal,
            shipping_amount: shipping_cost,
            tax_amount,
            discount_amount,
            total_amount: gross - discount_amount,
        })
    }
}
