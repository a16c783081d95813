//! Application state

use std::sync::Arc;

use scribe_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state, created once at startup and cloned into every
/// handler. The pool and billing service live for the whole process.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Paddle billing service initialized");

        Ok(Self {
            pool,
            config,
            billing: Arc::new(billing),
        })
    }
}
