//! Composition root and administrative facade.
//!
//! `Vault::new` builds the engine leaf-first: stores and caches, then the
//! read side, then janitor and engine, then the scheduler. Transports call
//! the methods here and nothing deeper.

use crate::audit::{AuditAction, AuditEvent, AuditSinkSync, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::VaultConfig;
use crate::crypto::generate_rsa_keypair;
use crate::error::VaultError;
use crate::janitor::{CleanupReport, Janitor};
use crate::jwks::{JwksBuilder, JwksDocument};
use crate::keystore::KeyStore;
use crate::lock::LockManager;
use crate::metadata::MetadataStore;
use crate::policy::{MemoryPolicyStore, PolicyStore};
use crate::registry::ActiveKidRegistry;
use crate::rotation::{RotationEngine, RotationOutcome, SessionHook};
use crate::scheduler::{CancelFlag, RotationScheduler, RotationSummary};
use crate::signer::{SignOptions, Signer};
use crate::types::{normalize_domain, KeyMetadata, Kid, RotationPolicy};
use chrono::Duration;
use serde_json::Value;
use std::sync::Arc;

/// Options for a domain's first policy.
#[derive(Clone, Debug)]
pub struct PolicyOptions {
    pub rotation_interval_days: i64,
    pub enabled: bool,
    pub note: Option<String>,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        Self {
            rotation_interval_days: crate::config::DEFAULT_ROTATION_INTERVAL_DAYS,
            enabled: true,
            note: None,
        }
    }
}

/// Outcome of `initial_setup_domain`: creating twice is not an error.
#[derive(Clone, Debug)]
pub enum SetupOutcome {
    Created { kid: Kid },
    AlreadyExists { domain: String },
}

impl SetupOutcome {
    pub fn kid(&self) -> Option<&Kid> {
        match self {
            Self::Created { kid } => Some(kid),
            Self::AlreadyExists { .. } => None,
        }
    }
}

pub struct Vault {
    config: VaultConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSinkSync>,
    keys: Arc<KeyStore>,
    meta: Arc<MetadataStore>,
    policies: Arc<dyn PolicyStore>,
    registry: Arc<ActiveKidRegistry>,
    signer: Arc<Signer>,
    jwks: Arc<JwksBuilder>,
    janitor: Arc<Janitor>,
    engine: Arc<RotationEngine>,
    scheduler: RotationScheduler,
}

impl Vault {
    /// Build with the in-process policy store, the wall clock and the
    /// tracing audit sink.
    pub fn with_defaults(config: VaultConfig) -> Result<Self, VaultError> {
        Self::new(
            config,
            Arc::new(MemoryPolicyStore::new()),
            Arc::new(SystemClock),
            Arc::new(TracingAuditSink),
        )
    }

    pub fn new(
        config: VaultConfig,
        policies: Arc<dyn PolicyStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSinkSync>,
    ) -> Result<Self, VaultError> {
        let keys = Arc::new(KeyStore::new(config.data_dir.join("keys"))?);
        let meta = Arc::new(MetadataStore::new(config.data_dir.join("meta"))?);
        let locks = Arc::new(LockManager::new(config.lock_capacity, clock.clone()));
        let registry = Arc::new(ActiveKidRegistry::new(
            policies.clone(),
            clock.clone(),
            config.local_cache_capacity,
            config.shared_cache_capacity,
            config.shared_cache_ttl_secs,
        ));
        let signer = Arc::new(Signer::new(
            registry.clone(),
            keys.clone(),
            clock.clone(),
            config.derived_key_cache_capacity,
            config.public_ttl_ms,
            config.max_payload_bytes,
            config.default_token_ttl_secs,
        ));
        let jwks = Arc::new(JwksBuilder::new(keys.clone(), config.local_cache_capacity));
        let janitor = Arc::new(Janitor::new(
            keys.clone(),
            meta.clone(),
            signer.clone(),
            jwks.clone(),
            clock.clone(),
            audit.clone(),
            config.archive_ttl_ms(),
        ));
        let engine = Arc::new(RotationEngine::new(
            keys.clone(),
            meta.clone(),
            policies.clone(),
            locks,
            registry.clone(),
            signer.clone(),
            jwks.clone(),
            janitor.clone(),
            clock.clone(),
            audit.clone(),
            &config,
        ));
        let scheduler =
            RotationScheduler::new(engine.clone(), policies.clone(), clock.clone(), audit.clone());

        // Sweep temp residue left by a crashed writer before serving.
        for domain in keys.domains()? {
            match keys.clean_tmp_residue(&domain) {
                Ok(0) => {}
                Ok(n) => tracing::info!(%domain, removed = n, "temp residue cleaned"),
                Err(e) => tracing::warn!(%domain, error = %e, "temp residue sweep failed"),
            }
        }

        Ok(Self {
            config,
            clock,
            audit,
            keys,
            meta,
            policies,
            registry,
            signer,
            jwks,
            janitor,
            engine,
            scheduler,
        })
    }

    // -- administrative surface --------------------------------------------

    /// Create the first key pair and policy for a domain. A second call for
    /// the same domain reports `AlreadyExists` instead of erroring.
    pub async fn initial_setup_domain(
        &self,
        domain: &str,
        opts: Option<PolicyOptions>,
    ) -> Result<SetupOutcome, VaultError> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Err(VaultError::validation("domain", "must not be empty"));
        }
        if self.policies.find_by_domain(&domain)?.is_some() {
            return Ok(SetupOutcome::AlreadyExists { domain });
        }

        let opts = opts.unwrap_or_default();
        if opts.rotation_interval_days < 1 {
            return Err(VaultError::validation(
                "rotationIntervalDays",
                "must be at least 1",
            ));
        }

        let now = self.clock.now();
        let kid = Kid::mint(&domain, now);
        let pair = generate_rsa_keypair(self.config.rsa_modulus_bits)?;
        self.keys
            .save_key_pair(&domain, kid.as_str(), &pair.public_pem, &pair.private_pem)?;
        self.meta.write_origin(
            &domain,
            kid.as_str(),
            &KeyMetadata::origin(kid.clone(), &domain, now),
        )?;

        let policy = RotationPolicy {
            domain: domain.clone(),
            active_kid: kid.clone(),
            rotation_interval_days: opts.rotation_interval_days,
            rotated_at: now,
            next_rotation_at: now + Duration::days(opts.rotation_interval_days),
            enabled: opts.enabled,
            note: opts.note,
        };
        if let Err(e) = self.policies.create_policy(policy) {
            // No policy will ever point at this attempt's material: discard
            // it before reporting, whatever the failure was. A conflict just
            // means another setup won the race.
            self.keys.delete_private_key(&domain, kid.as_str())?;
            self.keys.delete_public_key(&domain, kid.as_str())?;
            self.meta.delete_origin(&domain, kid.as_str())?;
            return match e {
                VaultError::Conflict { .. } => Ok(SetupOutcome::AlreadyExists { domain }),
                other => Err(other),
            };
        }
        self.registry.set(&domain, kid.as_str())?;

        self.audit.record(AuditEvent::key_event(
            now,
            &domain,
            &kid,
            AuditAction::DomainInitialized {
                kid: kid.to_string(),
            },
        ));
        self.audit.record(AuditEvent::domain_event(
            now,
            &domain,
            AuditAction::PolicyCreated,
        ));
        tracing::info!(%domain, %kid, "domain initialized");
        Ok(SetupOutcome::Created { kid })
    }

    /// Rotate one domain now, regardless of schedule.
    pub async fn rotate_domain(&self, domain: &str) -> Result<RotationOutcome, VaultError> {
        self.scheduler.trigger_domain_rotation(domain).await
    }

    /// Rotate one domain with a collaborating transactional hook.
    pub async fn rotate_domain_with_hook(
        &self,
        domain: &str,
        hook: SessionHook<'_>,
    ) -> Result<RotationOutcome, VaultError> {
        self.engine.rotate_domain(domain, Some(hook)).await
    }

    /// Immediate rotation of every currently due domain.
    pub async fn rotate(&self) -> Result<RotationSummary, VaultError> {
        self.scheduler.trigger_immediate_rotation().await
    }

    /// Cron entry: batch rotation with the bounded retry loop.
    pub async fn schedule_rotation(&self) -> Result<RotationSummary, VaultError> {
        self.scheduler.run_scheduled_rotation().await
    }

    /// Reap expired archived keys.
    pub async fn cleanup_expired_keys(&self) -> CleanupReport {
        self.janitor.run_cleanup().await
    }

    pub async fn get_jwks(&self, domain: &str) -> Result<JwksDocument, VaultError> {
        self.jwks.get_jwks(&normalize_domain(domain))
    }

    pub async fn sign(
        &self,
        domain: &str,
        payload: &Value,
        opts: SignOptions,
    ) -> Result<String, VaultError> {
        self.signer.sign(domain, payload, opts)
    }

    /// Bounded mutation of the scheduler knobs.
    pub fn configure(
        &self,
        retry_interval_ms: Option<u64>,
        max_retries: Option<u32>,
    ) -> Result<crate::config::SchedulerConfig, VaultError> {
        self.scheduler.configure(retry_interval_ms, max_retries)
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.scheduler.cancel_flag()
    }

    // -- collaborator access (transports, tests) ----------------------------

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn policies(&self) -> &Arc<dyn PolicyStore> {
        &self.policies
    }

    pub fn registry(&self) -> &ActiveKidRegistry {
        &self.registry
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keys
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.meta
    }

    pub fn scheduler_config(&self) -> crate::config::SchedulerConfig {
        self.scheduler.config()
    }
}
