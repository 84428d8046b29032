//! Standalone runner for the schema the server applies on startup.
//!
//! The migrations themselves live in `storefront_checkout::migrator` so the
//! server, the integration tests and this CLI all share one definition.
pub use sea_orm_migration::prelude::*;
pub use storefront_checkout::migrator::Migrator;
