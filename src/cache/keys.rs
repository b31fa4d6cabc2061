//! Cache key derivation.
//!
//! Keys are namespaced by owner so that a prefix delete can drop everything a
//! tenant (or one of its resource kinds) has cached without touching anyone
//! else:
//!
//! ```text
//! tenant:{tenant}:{kind}:{digest}
//! user:{user}:{kind}:{digest}
//! ```
//!
//! `digest` is the first 32 hex characters of a SHA-256 over the request
//! identity, so arbitrary paths and queries never leak into the key space.
//! `kind` and `user` are free-form, so `%` and `:` inside them are
//! percent-escaped before they join the key.

use std::{borrow::Cow, fmt};

use sha2::{Digest, Sha256};

use crate::pool::TenantId;

const DIGEST_HEX_LEN: usize = 32;

/// A fully derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a tenant-scoped read.
    pub fn tenant(tenant: &TenantId, kind: &str, identity: &str) -> Self {
        Self(format!(
            "{}{}",
            CacheScope::TenantResource {
                tenant: tenant.clone(),
                kind: kind.to_string(),
            }
            .prefix(),
            digest(identity)
        ))
    }

    /// Key for a user-scoped read.
    pub fn user(user: &str, kind: &str, identity: &str) -> Self {
        Self(format!(
            "{}{}:{}",
            CacheScope::User(user.to_string()).prefix(),
            segment(kind),
            digest(identity)
        ))
    }

    /// Key for a route read: identity is the path plus its normalized query.
    pub fn route(tenant: &TenantId, kind: &str, path: &str, query: Option<&str>) -> Self {
        let query = normalize_query(query.unwrap_or(""));
        let identity = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };
        Self::tenant(tenant, kind, &identity)
    }

    /// Use an already-formed key verbatim.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An invalidation target; every key derived inside a scope starts with its
/// [`prefix`](CacheScope::prefix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    Tenant(TenantId),
    TenantResource { tenant: TenantId, kind: String },
    User(String),
}

impl CacheScope {
    pub fn prefix(&self) -> String {
        match self {
            CacheScope::Tenant(tenant) => format!("tenant:{tenant}:"),
            CacheScope::TenantResource { tenant, kind } => {
                format!("tenant:{tenant}:{}:", segment(kind))
            }
            CacheScope::User(user) => format!("user:{}:", segment(user)),
        }
    }
}

/// Sort `key=value` pairs and drop empty ones so parameter order never
/// changes the derived key.
pub fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|pair| !pair.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}

/// Escape `%` and `:` so a free-form segment can never contain the key
/// separator. The mapping is injective, so distinct segments stay distinct.
fn segment(raw: &str) -> Cow<'_, str> {
    if !raw.contains([':', '%']) {
        return Cow::Borrowed(raw);
    }
    let mut escaped = String::with_capacity(raw.len() + 4);
    for ch in raw.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

fn digest(identity: &str) -> String {
    let hash = Sha256::digest(identity.as_bytes());
    let mut encoded = hex::encode(hash);
    encoded.truncate(DIGEST_HEX_LEN);
    encoded
}
