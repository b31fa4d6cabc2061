use serde::Serialize;
use time::OffsetDateTime;

use super::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Healthy,
    Unhealthy,
}

impl PoolHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Unhealthy => "unhealthy",
        }
    }

    pub fn is_healthy(self) -> bool {
        matches!(self, PoolHealth::Healthy)
    }
}

/// Read-only snapshot of one resident pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub tenant_id: TenantId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used_at: OffsetDateTime,
    pub active_operations: usize,
    pub total_operations: u64,
    pub health: PoolHealth,
}
