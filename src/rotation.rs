//! Rotation engine: prepare/commit/rollback for a single domain.
//!
//! One invocation reports exactly one outcome: completed, skipped (lock not
//! acquired), or failed. Retry lives in the scheduler, never here. Ordering
//! inside an attempt is fixed: key material lands on disk before metadata
//! transitions, metadata before the policy-store commit, the commit before
//! any cache invalidation, so readers never see a policy state unbacked by
//! material on disk.

use crate::audit::{AuditAction, AuditEvent, AuditSinkSync};
use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::crypto::generate_rsa_keypair;
use crate::error::VaultError;
use crate::janitor::Janitor;
use crate::jwks::JwksBuilder;
use crate::keystore::KeyStore;
use crate::lock::LockManager;
use crate::metadata::MetadataStore;
use crate::policy::{PolicySession, PolicyStore};
use crate::registry::ActiveKidRegistry;
use crate::signer::Signer;
use crate::types::{normalize_domain, KeyMetadata, Kid};
use std::sync::Arc;

/// Extension hook: perform additional writes inside the rotation's policy
/// transaction. Returning an error aborts the enclosing rotation.
pub type SessionHook<'a> = &'a (dyn Fn(&mut PolicySession) -> Result<(), VaultError> + Send + Sync);

/// What a single rotation invocation reports.
#[derive(Clone, Debug)]
pub enum RotationOutcome {
    Completed {
        domain: String,
        new_kid: Kid,
        previous_kid: Kid,
    },
    Skipped {
        domain: String,
        reason: String,
    },
    Failed {
        domain: String,
        error: VaultError,
    },
}

impl RotationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn new_kid(&self) -> Option<&Kid> {
        match self {
            Self::Completed { new_kid, .. } => Some(new_kid),
            _ => None,
        }
    }
}

pub struct RotationEngine {
    keys: Arc<KeyStore>,
    meta: Arc<MetadataStore>,
    policies: Arc<dyn PolicyStore>,
    locks: Arc<LockManager>,
    registry: Arc<ActiveKidRegistry>,
    signer: Arc<Signer>,
    jwks: Arc<JwksBuilder>,
    janitor: Arc<Janitor>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSinkSync>,
    lock_ttl_secs: i64,
    rsa_modulus_bits: usize,
}

impl RotationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: Arc<KeyStore>,
        meta: Arc<MetadataStore>,
        policies: Arc<dyn PolicyStore>,
        locks: Arc<LockManager>,
        registry: Arc<ActiveKidRegistry>,
        signer: Arc<Signer>,
        jwks: Arc<JwksBuilder>,
        janitor: Arc<Janitor>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSinkSync>,
        config: &VaultConfig,
    ) -> Self {
        Self {
            keys,
            meta,
            policies,
            locks,
            registry,
            signer,
            jwks,
            janitor,
            clock,
            audit,
            lock_ttl_secs: config.lock_ttl_secs,
            rsa_modulus_bits: config.rsa_modulus_bits,
        }
    }

    /// Rotate one domain. Returns `Err` only for fatal invariant
    /// violations; everything else is an outcome.
    pub async fn rotate_domain(
        &self,
        domain: &str,
        hook: Option<SessionHook<'_>>,
    ) -> Result<RotationOutcome, VaultError> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Ok(RotationOutcome::Failed {
                domain,
                error: VaultError::validation("domain", "must not be empty"),
            });
        }

        let token = match self.locks.acquire(&domain, self.lock_ttl_secs) {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.audit.record(AuditEvent::domain_event(
                    self.clock.now(),
                    &domain,
                    AuditAction::RotationSkipped {
                        reason: "lock not acquired".to_string(),
                    },
                ));
                return Ok(RotationOutcome::Skipped {
                    domain,
                    reason: "lock not acquired".to_string(),
                });
            }
            Err(e) => {
                return Ok(RotationOutcome::Failed { domain, error: e });
            }
        };

        let result = self.rotate_locked(&domain, hook).await;
        if let Err(e) = self.locks.release(&domain, &token) {
            tracing::warn!(domain, error = %e, "lock release failed");
        }
        result
    }

    async fn rotate_locked(
        &self,
        domain: &str,
        hook: Option<SessionHook<'_>>,
    ) -> Result<RotationOutcome, VaultError> {
        let old_kid = match self.registry.get(domain) {
            Ok(Some(kid)) => Kid::new(kid),
            Ok(None) => {
                return Ok(RotationOutcome::Failed {
                    domain: domain.to_string(),
                    error: VaultError::validation(
                        "domain",
                        format!("no active key for {}; run initial setup instead", domain),
                    ),
                });
            }
            Err(e) => {
                return Ok(RotationOutcome::Failed {
                    domain: domain.to_string(),
                    error: e,
                });
            }
        };

        let new_kid = Kid::mint(domain, self.clock.now());
        tracing::info!(domain, %old_kid, %new_kid, "rotation starting");

        let mut session: Option<PolicySession> = None;
        match self
            .prepare_and_commit(domain, &old_kid, &new_kid, hook, &mut session)
            .await
        {
            Ok(()) => {
                self.finish_commit(domain, &old_kid, &new_kid);
                Ok(RotationOutcome::Completed {
                    domain: domain.to_string(),
                    new_kid,
                    previous_kid: old_kid,
                })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.rollback(domain, &old_kid, &new_kid, &mut session, &e)?;
                Ok(RotationOutcome::Failed {
                    domain: domain.to_string(),
                    error: e,
                })
            }
        }
    }

    /// Steps 2 (prepare) and 3.a-d (commit) of the protocol. Any error
    /// thrown from here sends the caller into rollback.
    async fn prepare_and_commit(
        &self,
        domain: &str,
        old_kid: &Kid,
        new_kid: &Kid,
        hook: Option<SessionHook<'_>>,
        session_slot: &mut Option<PolicySession>,
    ) -> Result<(), VaultError> {
        // Prepare: new material on disk, then the incumbent's metadata moves
        // origin -> archive. After this block both KIDs coexist on disk and
        // the policy store still names the old one.
        let pair = generate_rsa_keypair(self.rsa_modulus_bits)?;
        self.keys
            .save_key_pair(domain, new_kid.as_str(), &pair.public_pem, &pair.private_pem)?;
        let created_at = self.clock.now();
        self.meta.write_origin(
            domain,
            new_kid.as_str(),
            &KeyMetadata::origin(new_kid.clone(), domain, created_at),
        )?;
        self.audit.record(AuditEvent::key_event(
            created_at,
            domain,
            new_kid,
            AuditAction::KeyPairGenerated {
                kid: new_kid.to_string(),
            },
        ));

        self.janitor.add_key_expiry(domain, old_kid)?;

        // Commit precondition: the lock TTL bounds the attempt, so after a
        // long stall another process may have rotated already. Refuse to
        // commit over someone else's rotation.
        let policy = self
            .policies
            .find_by_domain(domain)?
            .ok_or_else(|| VaultError::not_found(format!("policy for domain {}", domain)))?;
        if policy.active_kid != *old_kid {
            return Err(VaultError::conflict(format!(
                "active kid for {} changed to {} mid-rotation",
                domain, policy.active_kid
            )));
        }

        let mut session = self.policies.session()?;
        session.start_transaction()?;
        let commit_result = (|| {
            self.policies.acknowledge_successful_rotation(
                domain,
                policy.rotation_interval_days,
                new_kid,
                self.clock.now(),
                &mut session,
            )?;
            if let Some(hook) = hook {
                hook(&mut session)?;
            }
            self.policies.commit_session(&mut session)
        })();
        *session_slot = Some(session);
        commit_result
    }

    /// Step 3.e: best-effort post-commit work, outside the transaction. The
    /// old private key goes away (its public stays for JWKS continuity),
    /// and every read-side cache holding either KID is invalidated.
    fn finish_commit(&self, domain: &str, old_kid: &Kid, new_kid: &Kid) {
        if let Err(e) = self.janitor.delete_private(domain, old_kid.as_str()) {
            tracing::warn!(domain, kid = %old_kid, error = %e, "old private key removal failed");
        } else {
            self.audit.record(AuditEvent::key_event(
                self.clock.now(),
                domain,
                old_kid,
                AuditAction::PrivateKeyPurged {
                    kid: old_kid.to_string(),
                },
            ));
        }
        for kid in [old_kid, new_kid] {
            self.signer.evict(kid.as_str());
            self.jwks.evict(kid.as_str());
        }
        self.registry.delete(domain);
        self.audit.record(AuditEvent::domain_event(
            self.clock.now(),
            domain,
            AuditAction::RotationCommitted {
                new_kid: new_kid.to_string(),
                previous_kid: old_kid.to_string(),
            },
        ));
        tracing::info!(domain, %new_kid, "rotation committed");
    }

    /// Undo a failed attempt. State-based rather than flag-based: inspect
    /// what prepare actually left behind and reverse it. A failure in here
    /// is a fatal condition.
    fn rollback(
        &self,
        domain: &str,
        old_kid: &Kid,
        new_kid: &Kid,
        session: &mut Option<PolicySession>,
        cause: &VaultError,
    ) -> Result<(), VaultError> {
        tracing::warn!(domain, %new_kid, cause = %cause, "rolling back rotation");

        let fatal = |step: &str, e: VaultError| {
            VaultError::fatal(format!("rollback {} failed for {}: {}", step, domain, e))
        };

        // The never-committed KID leaves no trace.
        self.keys
            .delete_private_key(domain, new_kid.as_str())
            .map_err(|e| fatal("new private delete", e))?;
        self.keys
            .delete_public_key(domain, new_kid.as_str())
            .map_err(|e| fatal("new public delete", e))?;
        self.meta
            .delete_origin(domain, new_kid.as_str())
            .map_err(|e| fatal("new origin delete", e))?;
        self.signer.evict(new_kid.as_str());
        self.jwks.evict(new_kid.as_str());

        // Restore the incumbent: if prepare already deleted its origin
        // record, rebuild it from the archived copy; either way the
        // premature archive record goes away.
        if !self.meta.origin_exists(domain, old_kid.as_str()) {
            match self.meta.read_archived(old_kid.as_str()) {
                Ok(mut record) => {
                    record.expires_at = None;
                    self.meta
                        .write_origin(domain, old_kid.as_str(), &record)
                        .map_err(|e| fatal("origin restore", e))?;
                }
                Err(e) if e.is_not_found() => {
                    return Err(VaultError::fatal(format!(
                        "rollback for {}: incumbent {} has neither origin nor archive metadata",
                        domain, old_kid
                    )));
                }
                Err(e) => return Err(fatal("archive read", e)),
            }
        }
        self.meta
            .delete_archived(old_kid.as_str())
            .map_err(|e| fatal("premature archive delete", e))?;

        if let Some(session) = session {
            if session.is_active() {
                self.policies
                    .abort_session(session)
                    .map_err(|e| fatal("session abort", e))?;
            }
        }

        // The policy store must still name the incumbent.
        match self.policies.find_by_domain(domain) {
            Ok(Some(policy)) if policy.active_kid == *old_kid => {}
            Ok(other) => {
                return Err(VaultError::fatal(format!(
                    "active kid mismatch after rollback for {}: expected {}, store has {:?}",
                    domain,
                    old_kid,
                    other.map(|p| p.active_kid)
                )));
            }
            Err(e) => return Err(fatal("policy verify", e)),
        }

        self.audit.record(
            AuditEvent::domain_event(
                self.clock.now(),
                domain,
                AuditAction::RotationRolledBack {
                    cause: cause.to_string(),
                },
            )
            .with_failure(),
        );
        Ok(())
    }
}
