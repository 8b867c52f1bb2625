//! Shared configuration, errors, and wire types for the relay services.

pub mod config;
pub mod error;
pub mod redis_pool;
pub mod types;
