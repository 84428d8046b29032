// Checkout flow
pub mod commerce;

// Payment provider adapters
pub mod payments;
