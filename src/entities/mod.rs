pub mod coupon;
pub mod customer_address;
pub mod order;
pub mod order_item;
pub mod payment_attempt;
