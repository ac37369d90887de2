use std::sync::Arc;

use prospector_core::{TenantId, TenantQuota};
use tracing::debug;
use uuid::Uuid;

use crate::store::JobStore;
use crate::PipelineError;

/// Per-tenant daily volume gate. Volume is the sum of requested `size` over
/// the tenant's jobs created on the store's current UTC day.
#[derive(Clone)]
pub struct QuotaGuard {
    store: Arc<dyn JobStore>,
    default_cap: i64,
}

impl QuotaGuard {
    pub fn new(store: Arc<dyn JobStore>, default_cap: i64) -> Self {
        Self { store, default_cap }
    }

    pub async fn snapshot(
        &self,
        tenant_id: TenantId,
        exclude_job: Option<Uuid>,
    ) -> Result<TenantQuota, PipelineError> {
        let used = self.store.quota_usage(tenant_id, exclude_job).await?;
        let daily_cap = self
            .store
            .daily_cap_override(tenant_id)
            .await?
            .unwrap_or(self.default_cap);
        Ok(TenantQuota {
            tenant_id,
            daily_cap,
            used,
        })
    }

    /// Fails closed: any request that would push usage past the cap is refused.
    pub async fn check_quota(
        &self,
        tenant_id: TenantId,
        requested: i64,
        exclude_job: Option<Uuid>,
    ) -> Result<TenantQuota, PipelineError> {
        let quota = self.snapshot(tenant_id, exclude_job).await?;
        debug!(tenant_id, used = quota.used, cap = quota.daily_cap, requested, "quota check");
        if !quota.allows(requested) {
            return Err(PipelineError::QuotaExceeded {
                used: quota.used,
                cap: quota.daily_cap,
                requested,
            });
        }
        Ok(quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryJobStore;
    use crate::test_support::new_job;

    #[tokio::test]
    async fn usage_counts_todays_jobs_except_the_checked_one() {
        let store = Arc::new(MemoryJobStore::new());
        let first = store.create_job(new_job(1, 200), 3).await.unwrap();
        store.create_job(new_job(1, 250), 3).await.unwrap();
        store.create_job(new_job(2, 400), 3).await.unwrap();

        let guard = QuotaGuard::new(store.clone(), 500);
        let quota = guard.check_quota(1, 50, None).await.unwrap();
        assert_eq!(quota.used, 450);

        let err = guard.check_quota(1, 51, None).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::QuotaExceeded { used: 450, cap: 500, requested: 51 }
        ));

        let quota = guard.check_quota(1, 200, Some(first.id)).await.unwrap();
        assert_eq!(quota.used, 250);
    }

    #[tokio::test]
    async fn tenant_override_replaces_default_cap() {
        let store = Arc::new(MemoryJobStore::new());
        store.set_daily_cap(9, 20).await;
        let guard = QuotaGuard::new(store.clone(), 500);
        assert!(guard.check_quota(9, 20, None).await.is_ok());
        assert!(guard.check_quota(9, 21, None).await.is_err());
        assert_eq!(guard.snapshot(10, None).await.unwrap().daily_cap, 500);
    }
}
