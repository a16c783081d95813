//! Plan catalog
//!
//! Plans are created and edited out-of-band; this module is strictly
//! read-only. A `NULL` allowance means unlimited, a `NULL` billing interval
//! marks the free tier.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Name of the fallback tier every user resolves to. Seeded by catalog
/// management; its absence is a configuration fault, not a runtime error.
pub const FREE_PLAN_NAME: &str = "Free";

/// Immutable catalog row defining entitlement allowances and price.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub upload_limit_mb: i32,
    /// Minutes of transcription per billing window; `None` = unlimited.
    pub transcription_minutes: Option<i32>,
    /// Summaries per billing window; `None` = unlimited.
    pub summarization_limit: Option<i32>,
    /// Document exports per billing window; `None` = unlimited.
    pub export_limit: Option<i32>,
    /// `None` for the free tier, else `month`/`year`.
    pub billing_interval: Option<String>,
    pub paddle_price_id: Option<String>,
    pub premium_templates: bool,
    pub archive_access: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.billing_interval.is_none()
    }
}

/// Read-only access to the plan catalog.
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM subscription_plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    pub async fn get_by_name(&self, name: &str) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM subscription_plans WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    /// The Free plan, or `None` when the catalog is unseeded.
    pub async fn free_plan(&self) -> BillingResult<Option<Plan>> {
        self.get_by_name(FREE_PLAN_NAME).await
    }

    /// Resolve a plan from the provider's price identifier. Used when
    /// adopting remote state during reconciliation.
    pub async fn get_by_price_id(&self, paddle_price_id: &str) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            "SELECT * FROM subscription_plans WHERE paddle_price_id = $1",
        )
        .bind(paddle_price_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    pub async fn list(&self) -> BillingResult<Vec<Plan>> {
        let plans =
            sqlx::query_as::<_, Plan>("SELECT * FROM subscription_plans ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(plans)
    }
}
