//! Command implementations: migrate, status, validate.

pub mod migrate;
pub mod status;
pub mod validate;
