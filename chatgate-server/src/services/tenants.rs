use async_trait::async_trait;
use shared::config::server::QuotaConfig;

/// Resolves plan limits and group membership for a tenant.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Daily message limit of the tenant's plan, `None` when the tenant is
    /// unknown. Zero or less means unlimited.
    async fn daily_limit(&self, tenant_id: &str) -> anyhow::Result<Option<i64>>;

    /// Groups `user_id` belongs to inside the tenant.
    async fn group_ids(&self, user_id: &str, tenant_id: &str) -> anyhow::Result<Vec<String>>;

    /// Limit of the lowest tier, used for unscoped callers.
    fn default_limit(&self) -> i64;
}

/// Directory backed by the `quota` configuration section.
#[derive(Debug, Clone)]
pub struct ConfigTenantDirectory {
    quota: QuotaConfig,
}

impl ConfigTenantDirectory {
    /// Directory backed by the `quota` section of the config.
    pub fn new(quota: QuotaConfig) -> Self {
        Self { quota }
    }
}

#[async_trait]
impl TenantDirectory for ConfigTenantDirectory {
    async fn daily_limit(&self, tenant_id: &str) -> anyhow::Result<Option<i64>> {
        let Some(tenant) = self.quota.tenants.get(tenant_id) else {
            return Ok(None);
        };
        let limit = self
            .quota
            .tiers
            .get(&tenant.tier)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("tenant {tenant_id} references unknown tier {}", tenant.tier))?;
        Ok(Some(limit))
    }

    async fn group_ids(&self, user_id: &str, tenant_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .quota
            .tenants
            .get(tenant_id)
            .and_then(|tenant| tenant.groups.get(user_id))
            .cloned()
            .unwrap_or_default())
    }

    fn default_limit(&self) -> i64 {
        self.quota.default_limit()
    }
}
