//! Shared types and database helpers used by the Scribe API and billing crates.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{BillingInterval, ProrationMode, SubscriptionStatus};
