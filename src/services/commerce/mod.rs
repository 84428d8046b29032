/// Commerce services module - checkout business logic
pub mod address_service;
pub mod checkout_service;
pub mod coupon_service;
pub mod pricing_service;
pub mod shipping_service;

// Re-export services for convenience
pub use address_service::{AddressService, ShippingAddress};
pub use checkout_service::{CheckoutService, PlaceOrderRequest};
pub use coupon_service::CouponService;
pub use pricing_service::{CartLine, PriceBreakdown, PricingCalculator};
pub use shipping_service::ShippingService;
