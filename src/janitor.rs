//! Retirement and reaping.
//!
//! `add_key_expiry` is the rotation engine's origin-to-archive move; the
//! cleanup pass reaps archived records whose expiry has passed, removing
//! the public PEM alongside. Per-item failures are logged and skipped,
//! never fatal.

use crate::audit::{AuditAction, AuditEvent, AuditSinkSync};
use crate::clock::Clock;
use crate::error::VaultError;
use crate::jwks::JwksBuilder;
use crate::keystore::KeyStore;
use crate::metadata::MetadataStore;
use crate::signer::Signer;
use crate::types::{Kid, KeyMetadata};
use chrono::Duration;
use std::sync::Arc;

/// Outcome of one cleanup pass.
#[derive(Clone, Debug, Default)]
pub struct CleanupReport {
    pub scanned: usize,
    pub removed: Vec<(String, String)>,
    pub failed: Vec<(String, String)>,
}

pub struct Janitor {
    keys: Arc<KeyStore>,
    meta: Arc<MetadataStore>,
    signer: Arc<Signer>,
    jwks: Arc<JwksBuilder>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSinkSync>,
    archive_ttl_ms: i64,
}

impl Janitor {
    pub fn new(
        keys: Arc<KeyStore>,
        meta: Arc<MetadataStore>,
        signer: Arc<Signer>,
        jwks: Arc<JwksBuilder>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSinkSync>,
        archive_ttl_ms: i64,
    ) -> Self {
        Self {
            keys,
            meta,
            signer,
            jwks,
            clock,
            audit,
            archive_ttl_ms,
        }
    }

    /// Reap every archived record with `expires_at <= now` together with
    /// its public key file. Continues past per-item failures.
    pub async fn run_cleanup(&self) -> CleanupReport {
        let now = self.clock.now();
        let mut report = CleanupReport::default();

        let archived = match self.meta.read_all_archived() {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "archive scan failed, skipping cleanup pass");
                return report;
            }
        };
        report.scanned = archived.len();

        for record in archived {
            if !record.is_expired(now) {
                continue;
            }
            let domain = record.domain.clone();
            let kid = record.kid.to_string();
            match self.reap_one(&record) {
                Ok(()) => {
                    tracing::info!(%domain, %kid, "expired key reaped");
                    report.removed.push((domain, kid));
                }
                Err(e) => {
                    tracing::warn!(%domain, %kid, error = %e, "cleanup item failed, continuing");
                    report.failed.push((kid, e.to_string()));
                }
            }
        }

        self.audit.record(AuditEvent::system_event(
            now,
            AuditAction::ArchiveReaped {
                removed: report.removed.len(),
                failed: report.failed.len(),
            },
        ));
        report
    }

    fn reap_one(&self, record: &KeyMetadata) -> Result<(), VaultError> {
        let kid = record.kid.as_str();
        self.delete_public(&record.domain, kid)?;
        self.delete_archived_metadata(kid)?;
        self.audit.record(AuditEvent::key_event(
            self.clock.now(),
            &record.domain,
            &record.kid,
            AuditAction::PublicKeyPurged {
                kid: kid.to_string(),
            },
        ));
        Ok(())
    }

    // -- per-key helpers (used by the rotation engine as well) --------------

    /// Move a key's metadata from origin to archive, stamping
    /// `expires_at = now + TTL + grace`. The archive write lands before the
    /// origin delete, so a crash in between leaves both records rather than
    /// neither.
    pub fn add_key_expiry(&self, domain: &str, kid: &Kid) -> Result<KeyMetadata, VaultError> {
        let mut record = self.meta.read_origin(domain, kid.as_str())?;
        record.expires_at = Some(self.clock.now() + Duration::milliseconds(self.archive_ttl_ms));
        self.meta.write_archive(kid.as_str(), &record)?;
        self.meta.delete_origin(domain, kid.as_str())?;
        self.audit.record(AuditEvent::key_event(
            self.clock.now(),
            domain,
            kid,
            AuditAction::KeyArchived {
                kid: kid.to_string(),
            },
        ));
        Ok(record)
    }

    /// Delete a public key file and evict every cache that may have derived
    /// from it.
    pub fn delete_public(&self, domain: &str, kid: &str) -> Result<(), VaultError> {
        self.keys.delete_public_key(domain, kid)?;
        self.jwks.evict(kid);
        self.signer.evict(kid);
        Ok(())
    }

    pub fn delete_private(&self, domain: &str, kid: &str) -> Result<(), VaultError> {
        self.keys.delete_private_key(domain, kid)?;
        self.signer.evict(kid);
        Ok(())
    }

    pub fn delete_origin_metadata(&self, domain: &str, kid: &str) -> Result<(), VaultError> {
        self.meta.delete_origin(domain, kid)
    }

    pub fn delete_archived_metadata(&self, kid: &str) -> Result<(), VaultError> {
        self.meta.delete_archived(kid)
    }
}
