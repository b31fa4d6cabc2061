//! Tenant identifiers.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::error::PoolError;

const MAX_TENANT_ID_LEN: usize = 64;

/// Validated tenant identifier.
///
/// Only ASCII alphanumerics, `-` and `_` are accepted, so an id can be used
/// verbatim as a storage file name and as a cache key segment without
/// escaping. Two distinct ids therefore never map to the same file or the
/// same cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, PoolError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(PoolError::invalid_tenant(raw, "must not be empty"));
        }
        if raw.len() > MAX_TENANT_ID_LEN {
            return Err(PoolError::invalid_tenant(
                raw,
                format!("must be at most {MAX_TENANT_ID_LEN} characters"),
            ));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(PoolError::invalid_tenant(
                raw.clone(),
                format!("contains unsupported character `{bad}`"),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = PoolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_slug_like_ids() {
        for raw in ["acme", "acme-co", "tenant_42", "A1"] {
            assert_eq!(TenantId::parse(raw).expect("valid id").as_str(), raw);
        }
    }

    #[test]
    fn rejects_path_and_key_metacharacters() {
        for raw in ["", "../etc", "a/b", "acme:other", "acme*", "with space"] {
            assert!(
                matches!(TenantId::parse(raw), Err(PoolError::InvalidTenant { .. })),
                "`{raw}` should be rejected"
            );
        }
    }

    #[test]
    fn rejects_overlong_ids() {
        let raw = "a".repeat(MAX_TENANT_ID_LEN + 1);
        assert!(TenantId::parse(raw).is_err());
    }

    #[test]
    fn deserializes_through_validation() {
        let ok: TenantId = serde_json::from_str("\"acme\"").expect("valid id");
        assert_eq!(ok.as_str(), "acme");
        assert!(serde_json::from_str::<TenantId>("\"a:b\"").is_err());
    }
}
