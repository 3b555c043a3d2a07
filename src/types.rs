//! Core types: Kid, domain normalization, key metadata, rotation policies.

use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Domain normalization
// ---------------------------------------------------------------------------

/// Canonical form of a domain identifier: surrounding whitespace trimmed,
/// uppercased. Every ingress point normalizes; everything downstream
/// (lookups, file paths, KID minting) sees only the canonical form.
pub fn normalize_domain(raw: &str) -> String {
    raw.trim().to_uppercase()
}

// ---------------------------------------------------------------------------
// Key identifiers
// ---------------------------------------------------------------------------

/// Key identifier: `<DOMAIN>-<YYYYMMDD>-<HHMMSS>-<8 hex chars>`.
///
/// The domain prefix makes a KID self-describing for routing. The date/time
/// portion is informational only; nothing orders keys by it. The hex suffix
/// comes from the OS RNG.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Kid(String);

impl Kid {
    /// Mint a fresh KID for a (normalized) domain.
    pub fn mint(domain: &str, now: DateTime<Utc>) -> Self {
        let mut suffix = [0u8; 4];
        OsRng.fill_bytes(&mut suffix);
        Self(format!(
            "{}-{}-{}",
            domain,
            now.format("%Y%m%d-%H%M%S"),
            hex::encode(suffix)
        ))
    }

    /// Wrap an existing identifier (persisted records, tests).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Kid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Key metadata
// ---------------------------------------------------------------------------

/// Per-KID metadata record. Lives in exactly one partition at a time:
/// origin (`expires_at == None`) or archive (`expires_at` populated).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub kid: Kid,
    pub domain: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyMetadata {
    /// Fresh origin-partition record for a just-generated key.
    pub fn origin(kid: Kid, domain: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            kid,
            domain: domain.into(),
            created_at,
            expires_at: None,
        }
    }

    /// A record is expired iff `expires_at <= now`. Origin records
    /// (`expires_at == None`) never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at <= now,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Rotation policy
// ---------------------------------------------------------------------------

/// Per-domain rotation policy. `next_rotation_at` is recomputed by the
/// rotation engine on commit, never by external callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationPolicy {
    pub domain: String,
    pub active_kid: Kid,
    pub rotation_interval_days: i64,
    pub rotated_at: DateTime<Utc>,
    pub next_rotation_at: DateTime<Utc>,
    pub enabled: bool,
    #[serde(default)]
    pub note: Option<String>,
}

impl RotationPolicy {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_rotation_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["  user ", "User", "SVC", "\tbilling\n"] {
            let once = normalize_domain(raw);
            assert_eq!(normalize_domain(&once), once);
        }
    }

    #[test]
    fn kid_embeds_domain_and_suffix() {
        let now = Utc::now();
        let kid = Kid::mint("USER", now);
        assert!(kid.as_str().starts_with("USER-"));
        let suffix = kid.as_str().rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn kids_are_unique() {
        let now = Utc::now();
        let a = Kid::mint("USER", now);
        let b = Kid::mint("USER", now);
        assert_ne!(a, b);
    }
}
