use crate::{
    config::ShippingMethodConfig,
    errors::{CheckoutErrorCode, ServiceError},
};
use serde::Serialize;

/// A shipping method as quoted to the shopper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShippingMethod {
    pub id: String,
    pub name: String,
    pub cost: i64,
}

impl From<&ShippingMethodConfig> for ShippingMethod {
    fn from(config: &ShippingMethodConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            cost: config.cost,
        }
    }
}

/// Fixed catalog of shipping methods loaded from configuration.
#[derive(Debug, Clone)]
pub struct ShippingService {
    methods: Vec<ShippingMethod>,
}

impl ShippingService {
    pub fn new(methods: &[ShippingMethodConfig]) -> Self {
        Self {
            methods: methods.iter().map(ShippingMethod::from).collect(),
        }
    }

    pub fn list(&self) -> &[ShippingMethod] {
        &self.methods
    }

    pub fn resolve(&self, id: &str) -> Result<&ShippingMethod, ServiceError> {
        let id = id.trim();
        self.methods
            .iter()
            .find(|method| method.id == id)
            .ok_or_else(|| {
                ServiceError::invalid_field(
                    CheckoutErrorCode::InvalidShippingMethod,
                    "shipping_method_id",
                    format!("Unknown shipping method '{}'", id),
                )
            })
    }
}
