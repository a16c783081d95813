//! API server configuration

use anyhow::Context;

/// Configuration loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string (`DATABASE_URL`)
    pub database_url: String,
    /// Optional direct (non-pooled) URL for migrations (`DATABASE_DIRECT_URL`)
    pub database_direct_url: Option<String>,
    /// Listen address (`BIND_ADDRESS`, default `0.0.0.0:8080`)
    pub bind_address: String,
    /// HS256 secret for verifying bearer tokens issued by the auth layer
    /// (`JWT_SECRET`)
    pub jwt_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let database_direct_url = std::env::var("DATABASE_DIRECT_URL").ok();
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET not set")?;

        if jwt_secret.len() < 32 {
            anyhow::bail!("JWT_SECRET must be at least 32 bytes");
        }

        Ok(Self {
            database_url,
            database_direct_url,
            bind_address,
            jwt_secret,
        })
    }
}
