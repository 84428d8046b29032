use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiscountType {
    /// `value` is an amount in minor units
    #[sea_orm(string_value = "fixed")]
    Fixed,
    /// `value` is in basis points of the discount base
    #[sea_orm(string_value = "percentage")]
    Percentage,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Stored upper-cased.
    #[sea_orm(unique)]
    pub code: String,
    pub discount_type: DiscountType,
    pub value: i64,
    #[sea_orm(nullable)]
    pub max_discount: Option<i64>,
    #[sea_orm(nullable)]
    pub minimum_subtotal: Option<i64>,
    /// JSON array of product UUIDs; empty means every product.
    pub eligible_product_ids: Json,
    pub is_active: bool,
    #[sea_orm(nullable)]
    pub starts_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub expires_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub usage_limit: Option<i32>,
    pub usage_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn eligible_products(&self) -> Vec<Uuid> {
        serde_json::from_value(self.eligible_product_ids.clone()).unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
