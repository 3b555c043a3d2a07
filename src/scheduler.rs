//! Scheduled rotation driver.
//!
//! Enumerates due domains and pushes each through the engine sequentially,
//! then retries the whole batch while failures remain, up to the configured
//! attempt cap. Skips (lock contention) are not failures. Cancellation is
//! honored between domains and between attempts; an in-flight engine call
//! runs to completion.

use crate::audit::{AuditAction, AuditEvent, AuditSinkSync};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::VaultError;
use crate::policy::PolicyStore;
use crate::rotation::{RotationEngine, RotationOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cooperative cancellation signal, surfaced by the hosting process.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Aggregate of one batch pass over the due domains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RotationSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct RotationScheduler {
    engine: Arc<RotationEngine>,
    policies: Arc<dyn PolicyStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSinkSync>,
    config: Mutex<SchedulerConfig>,
    cancel: CancelFlag,
}

impl RotationScheduler {
    pub fn new(
        engine: Arc<RotationEngine>,
        policies: Arc<dyn PolicyStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSinkSync>,
    ) -> Self {
        Self {
            engine,
            policies,
            clock,
            audit,
            config: Mutex::new(SchedulerConfig::default()),
            cancel: CancelFlag::new(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn config(&self) -> SchedulerConfig {
        *self.config.lock().unwrap()
    }

    /// Bounded mutation of the retry knobs. Setting a knob to its current
    /// value is a no-op; out-of-range values are refused.
    pub fn configure(
        &self,
        retry_interval_ms: Option<u64>,
        max_retries: Option<u32>,
    ) -> Result<SchedulerConfig, VaultError> {
        let mut config = self.config.lock().unwrap();
        let mut updated = *config;
        if let Some(ms) = retry_interval_ms {
            updated.set_retry_interval(ms)?;
        }
        if let Some(retries) = max_retries {
            updated.set_max_retries(retries)?;
        }
        if updated != *config {
            *config = updated;
            self.audit.record(AuditEvent::system_event(
                self.clock.now(),
                AuditAction::SchedulerConfigured {
                    retry_interval_ms: updated.retry_interval_ms(),
                    max_retries: updated.max_retries(),
                },
            ));
        }
        Ok(updated)
    }

    /// Periodic entry point, called by the external cron collaborator.
    pub async fn run_scheduled_rotation(&self) -> Result<RotationSummary, VaultError> {
        self.ensure_successful_rotation().await
    }

    /// Rotate everything currently due, once, without the retry loop.
    pub async fn trigger_immediate_rotation(&self) -> Result<RotationSummary, VaultError> {
        self.rotate_due_domains().await
    }

    /// Rotate one domain regardless of its schedule (still lock-gated).
    pub async fn trigger_domain_rotation(
        &self,
        domain: &str,
    ) -> Result<RotationOutcome, VaultError> {
        self.engine.rotate_domain(domain, None).await
    }

    /// Batch loop: retry while any domain failed, up to `max_retries`
    /// attempts, sleeping `retry_interval_ms` in between. Stops early on
    /// cancellation or a clean pass.
    async fn ensure_successful_rotation(&self) -> Result<RotationSummary, VaultError> {
        let (max_retries, retry_interval_ms) = {
            let config = self.config.lock().unwrap();
            (config.max_retries(), config.retry_interval_ms())
        };

        let mut last = RotationSummary::default();
        for attempt in 1..=max_retries {
            if self.cancel.is_cancelled() {
                tracing::info!(attempt, "rotation cancelled before attempt");
                break;
            }
            last = self.rotate_due_domains().await?;
            if last.failed == 0 {
                return Ok(last);
            }
            tracing::warn!(
                attempt,
                failed = last.failed,
                succeeded = last.succeeded,
                skipped = last.skipped,
                "rotation attempt finished with failures"
            );
            if attempt < max_retries {
                tokio::time::sleep(Duration::from_millis(retry_interval_ms)).await;
            } else {
                tracing::error!(
                    failed = last.failed,
                    "giving up on rotation batch after {} attempts",
                    max_retries
                );
            }
        }
        Ok(last)
    }

    /// One pass: every enabled policy with `next_rotation_at <= now`,
    /// sequentially through the engine.
    async fn rotate_due_domains(&self) -> Result<RotationSummary, VaultError> {
        let now = self.clock.now();
        let due = self.policies.due_for_rotation(now)?;
        tracing::debug!(count = due.len(), "due domains enumerated");

        let mut summary = RotationSummary::default();
        for policy in due {
            if self.cancel.is_cancelled() {
                tracing::info!(domain = %policy.domain, "rotation cancelled mid-batch");
                break;
            }
            match self.engine.rotate_domain(&policy.domain, None).await? {
                RotationOutcome::Completed { .. } => summary.succeeded += 1,
                RotationOutcome::Skipped { .. } => summary.skipped += 1,
                RotationOutcome::Failed { domain, error } => {
                    tracing::warn!(%domain, error = %error, "domain rotation failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
