//! Tenant Context (C8): resolution, quota checks, isolation enforcement.
//! Modeled as the composable middleware chain Design Notes calls for —
//! `auth -> tenant -> rate-limit -> quota -> handler` — with each stage a
//! plain async function returning `Result<T, PipelineError>` rather than a
//! decorator, per the "no ambient globals" redesign note.

use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use uuid::Uuid;

use crate::config_db::ConfigDb;
use crate::error::{PipelineError, Result};
use crate::models::tenant::{QuotaKind, TenantContext, TenantStatus};

/// The authenticated principal + tenant contract consumed from the (external,
/// out-of-scope) RBAC/auth layer.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub permissions: Vec<String>,
}

impl Principal {
    pub fn has_permission(&self, perm: &str) -> bool {
        self.permissions.iter().any(|p| p == perm)
    }
}

/// Stage 1+2: `auth -> tenant`. Resolves a `Principal` into a full
/// `TenantContext`, rejecting unknown or suspended tenants for any
/// non-read-only operation (§4.8).
pub async fn resolve_tenant_context(
    config_db: &ConfigDb,
    principal: &Principal,
    read_only: bool,
) -> Result<TenantContext> {
    let tenant = config_db
        .get_tenant(principal.tenant_id)?
        .ok_or_else(|| PipelineError::NotFound(format!("tenant {}", principal.tenant_id)))?;

    if tenant.status == TenantStatus::Suspended && !read_only {
        return Err(PipelineError::Auth(format!(
            "tenant {} is suspended",
            tenant.id
        )));
    }

    Ok(TenantContext::from(&tenant))
}

/// Stage 3: `rate-limit`. One token bucket per tenant, built lazily and
/// cached by the caller (e.g. one `DashMap<Uuid, Arc<TenantRateLimiter>>` in
/// `AppState`). This type only wraps the `governor` limiter so call sites
/// don't import `governor` directly.
pub struct TenantRateLimiter {
    limiter: DefaultDirectRateLimiter,
}

impl TenantRateLimiter {
    pub fn new(per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(per_second.max(1).try_into().unwrap())
            .allow_burst(burst.max(1).try_into().unwrap());
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn check(&self) -> Result<()> {
        self.limiter
            .check()
            .map_err(|_| PipelineError::Transient(anyhow::anyhow!("tenant rate limit exceeded")))
    }
}

/// Stage 4: `quota`. Checked before any create-device/create-user/etc.
/// operation; `current_count + 1 <= max` (§3 invariant 6, §4.8).
pub fn check_quota(ctx: &TenantContext, kind: QuotaKind, current_count: u64) -> Result<()> {
    let max = match kind {
        QuotaKind::Devices => ctx.quotas.max_devices,
        QuotaKind::Users => ctx.quotas.max_users,
        QuotaKind::TelemetryPointsPerDay => ctx.quotas.max_telemetry_points_per_day,
    };
    if current_count + 1 > max {
        return Err(PipelineError::QuotaExceeded(format!(
            "{kind:?} quota exceeded for tenant {} ({current_count}/{max})",
            ctx.tenant_id
        )));
    }
    Ok(())
}

/// Runs the full chain for a mutating boundary call: auth is assumed done by
/// the caller (the `Principal` is already authenticated), so this covers
/// tenant -> rate-limit -> quota. `quota_check` is `None` for operations with
/// no associated quota (e.g. telemetry append, where the quota is enforced
/// per-day in aggregate by a separate counter, not per-call).
pub async fn enter(
    config_db: &ConfigDb,
    principal: &Principal,
    limiter: Option<&TenantRateLimiter>,
    quota_check: Option<(QuotaKind, u64)>,
) -> Result<TenantContext> {
    let ctx = resolve_tenant_context(config_db, principal, false).await?;

    if !ctx.is_active() {
        return Err(PipelineError::Auth(format!(
            "tenant {} is not active",
            ctx.tenant_id
        )));
    }

    if let Some(limiter) = limiter {
        limiter.check()?;
    }

    if let Some((kind, count)) = quota_check {
        check_quota(&ctx, kind, count)?;
    }

    Ok(ctx)
}

/// Tracks one rate limiter per tenant, constructed on first use.
pub struct TenantRateLimiters {
    per_tenant: dashmap::DashMap<Uuid, Arc<TenantRateLimiter>>,
    per_second: u32,
    burst: u32,
}

impl TenantRateLimiters {
    pub fn new(per_second: u32, burst: u32) -> Self {
        Self {
            per_tenant: dashmap::DashMap::new(),
            per_second,
            burst,
        }
    }

    pub fn get(&self, tenant_id: Uuid) -> Arc<TenantRateLimiter> {
        self.per_tenant
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(TenantRateLimiter::new(self.per_second, self.burst)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tenant::TenantQuotas;

    fn ctx(max_devices: u64) -> TenantContext {
        TenantContext {
            tenant_id: Uuid::new_v4(),
            tier: "pro".to_string(),
            status: TenantStatus::Active,
            features: vec![],
            quotas: TenantQuotas {
                max_devices,
                max_users: 10,
                max_telemetry_points_per_day: 1000,
            },
        }
    }

    #[test]
    fn quota_check_rejects_at_limit() {
        let ctx = ctx(5);
        assert!(check_quota(&ctx, QuotaKind::Devices, 4).is_ok());
        assert!(check_quota(&ctx, QuotaKind::Devices, 5).is_err());
    }

    #[test]
    fn rate_limiter_allows_burst() {
        let limiter = TenantRateLimiter::new(1, 5);
        for _ in 0..5 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }
}
