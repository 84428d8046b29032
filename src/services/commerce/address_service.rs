use crate::{
    db::DbPool,
    entities::customer_address,
    errors::{CheckoutErrorCode, ServiceError},
};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{7,15}$").expect("phone pattern is valid"));
static POSTAL_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Za-z][0-9A-Za-z -]{2,11}$").expect("postal code pattern is valid"));

/// Delivery address as snapshotted onto an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 120))]
    pub recipient_name: String,
    #[validate(regex = "PHONE_RE")]
    pub phone: String,
    #[validate(length(min = 1, max = 80))]
    pub province: String,
    #[validate(length(min = 1, max = 80))]
    pub city: String,
    #[validate(length(min = 1, max = 500))]
    pub address_line: String,
    #[validate(regex = "POSTAL_CODE_RE")]
    pub postal_code: String,
}

impl ShippingAddress {
    fn trimmed(self) -> Self {
        Self {
            recipient_name: self.recipient_name.trim().to_string(),
            phone: self.phone.trim().to_string(),
            province: self.province.trim().to_string(),
            city: self.city.trim().to_string(),
            address_line: self.address_line.trim().to_string(),
            postal_code: self.postal_code.trim().to_string(),
        }
    }

    /// Validates and reports the first offending field as `shipping_address.<field>`.
    pub fn checked(self) -> Result<Self, ServiceError> {
        let address = self.trimmed();
        if let Err(errors) = address.validate() {
            let mut fields: Vec<&str> = errors.field_errors().keys().copied().collect();
            fields.sort_unstable();
            let field = fields.first().copied().unwrap_or("shipping_address");
            return Err(ServiceError::invalid_field(
                CheckoutErrorCode::InvalidAddress,
                format!("shipping_address.{}", field),
                format!("Shipping address field '{}' is invalid", field),
            ));
        }
        Ok(address)
    }
}

impl From<customer_address::Model> for ShippingAddress {
    fn from(model: customer_address::Model) -> Self {
        Self {
            recipient_name: model.recipient_name,
            phone: model.phone,
            province: model.province,
            city: model.city,
            address_line: model.address_line,
            postal_code: model.postal_code,
        }
    }
}

/// Resolves the delivery address for a checkout, either inline or from the
/// caller's address book.
#[derive(Debug, Clone)]
pub struct AddressService {
    db_pool: Arc<DbPool>,
}

impl AddressService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Exactly one of `inline` and `saved_address_id` must be given.
    #[instrument(skip(self, inline))]
    pub async fn resolve(
        &self,
        owner_id: Uuid,
        inline: Option<ShippingAddress>,
        saved_address_id: Option<Uuid>,
    ) -> Result<ShippingAddress, ServiceError> {
        match (inline, saved_address_id) {
            (Some(address), None) => address.checked(),
            (None, Some(id)) => {
                let saved = customer_address::Entity::find_by_id(id)
                    .filter(customer_address::Column::OwnerId.eq(owner_id))
                    .one(&*self.db_pool)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::invalid_field(
                            CheckoutErrorCode::AddressNotFound,
                            "saved_address_id",
                            "Saved address not found",
                        )
                    })?;
                ShippingAddress::from(saved).checked()
            }
            (Some(_), Some(_)) => Err(ServiceError::invalid_field(
                CheckoutErrorCode::InvalidAddress,
                "shipping_address",
                "Provide either shipping_address or saved_address_id, not both",
            )),
            (None, None) => Err(ServiceError::invalid_field(
                CheckoutErrorCode::InvalidAddress,
                "shipping_address",
                "A shipping address is required",
            )),
        }
    }

    /// Adds an entry to the caller's address book.
    #[instrument(skip(self, address))]
    pub async fn save(
        &self,
        owner_id: Uuid,
        address: ShippingAddress,
        is_default: bool,
    ) -> Result<customer_address::Model, ServiceError> {
        let address = address.checked()?;
        let now = Utc::now();
        let model = customer_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(owner_id),
            recipient_name: Set(address.recipient_name),
            phone: Set(address.phone),
            province: Set(address.province),
            city: Set(address.city),
            address_line: Set(address.address_line),
            postal_code: Set(address.postal_code),
            is_default: Set(is_default),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(model.insert(&*self.db_pool).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use assert_matches::assert_matches;

    fn sample() -> ShippingAddress {
        ShippingAddress {
            recipient_name: "Sara Ahmadi".into(),
            phone: "+989121234567".into(),
            province: "Tehran".into(),
            city: "Tehran".into(),
            address_line: "No. 12, Azadi St.".into(),
            postal_code: "1415943953".into(),
        }
    }

    async fn service() -> AddressService {
        let pool = establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        AddressService::new(Arc::new(pool))
    }

    #[test]
    fn bad_phone_names_the_field() {
        let mut address = sample();
        address.phone = "call me".into();
        let err = address.checked().unwrap_err();
        assert_matches!(
            err,
            ServiceError::Checkout { code: CheckoutErrorCode::InvalidAddress, field: Some(ref f), .. }
                if f == "shipping_address.phone"
        );
    }

    #[test]
    fn whitespace_only_city_is_rejected() {
        let mut address = sample();
        address.city = "   ".into();
        assert!(address.checked().is_err());
    }

    #[tokio::test]
    async fn requires_exactly_one_source() {
        let svc = service().await;
        let owner = Uuid::new_v4();

        let neither = svc.resolve(owner, None, None).await.unwrap_err();
        assert_eq!(neither.code(), Some(CheckoutErrorCode::InvalidAddress));

        let both = svc
            .resolve(owner, Some(sample()), Some(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(both.code(), Some(CheckoutErrorCode::InvalidAddress));
    }

    #[tokio::test]
    async fn saved_address_is_scoped_to_its_owner() {
        let svc = service().await;
        let owner = Uuid::new_v4();
        let saved = svc.save(owner, sample(), true).await.unwrap();

        let resolved = svc.resolve(owner, None, Some(saved.id)).await.unwrap();
        assert_eq!(resolved, sample());

        let stranger = svc
            .resolve(Uuid::new_v4(), None, Some(saved.id))
            .await
            .unwrap_err();
        assert_eq!(stranger.code(), Some(CheckoutErrorCode::AddressNotFound));
    }
}
