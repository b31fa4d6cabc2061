use std::time::Duration;

use thiserror::Error;

use super::tenant::TenantId;

/// Failures surfaced by the pool manager to its callers.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The tenant's storage unit could not be provisioned. The registry slot
    /// stays empty so a later acquire retries creation.
    #[error("failed to create pool for tenant `{tenant}`: {message}")]
    Creation { tenant: TenantId, message: String },
    #[error("invalid tenant id `{raw}`: {reason}")]
    InvalidTenant { raw: String, reason: String },
    /// An operation failed against a live handle.
    #[error("operation failed for tenant `{tenant}`: {source}")]
    QueryExecution {
        tenant: TenantId,
        #[source]
        source: sqlx::Error,
    },
    /// A batch was aborted and rolled back; none of its effects persist.
    #[error("batch aborted for tenant `{tenant}`{}: {source}", step_suffix(.step))]
    Transaction {
        tenant: TenantId,
        /// Index of the failing step; `None` when begin or commit failed.
        step: Option<usize>,
        #[source]
        source: sqlx::Error,
    },
    #[error("operation for tenant `{tenant}` timed out after {after:?}")]
    Timeout { tenant: TenantId, after: Duration },
}

impl PoolError {
    pub fn creation(tenant: &TenantId, message: impl Into<String>) -> Self {
        Self::Creation {
            tenant: tenant.clone(),
            message: message.into(),
        }
    }

    pub fn invalid_tenant(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTenant {
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::Creation { .. } => "creation",
            PoolError::InvalidTenant { .. } => "invalid_tenant",
            PoolError::QueryExecution { .. } => "query_execution",
            PoolError::Transaction { .. } => "transaction",
            PoolError::Timeout { .. } => "timeout",
        }
    }
}

fn step_suffix(step: &Option<usize>) -> String {
    step.map(|index| format!(" at step {index}"))
        .unwrap_or_default()
}

/// True when the error means the handle itself is broken rather than the
/// statement that ran on it.
pub(crate) fn is_connection_fault(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
    )
}
