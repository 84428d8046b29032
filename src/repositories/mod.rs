use crate::db::DbPool;
use sea_orm::{DbErr, SqlErr};

pub mod order_repository;

/// Repository trait for common database operations
pub trait Repository {
    fn get_db(&self) -> &DbPool;
}

/// True when the error is a unique-key violation, e.g. an order-number collision.
pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}
