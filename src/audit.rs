//! Audit trail: every lifecycle mutation emits one structured event.

use crate::types::Kid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuditAction {
    KeyPairGenerated { kid: String },
    DomainInitialized { kid: String },
    RotationCommitted { new_kid: String, previous_kid: String },
    RotationSkipped { reason: String },
    RotationRolledBack { cause: String },
    KeyArchived { kid: String },
    PrivateKeyPurged { kid: String },
    PublicKeyPurged { kid: String },
    ArchiveReaped { removed: usize, failed: usize },
    PolicyCreated,
    PolicyUpdated,
    SchedulerConfigured { retry_interval_ms: u64, max_retries: u32 },
}

/// A structured audit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub domain: Option<String>,
    pub kid: Option<String>,
    pub action: AuditAction,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn domain_event(timestamp: DateTime<Utc>, domain: &str, action: AuditAction) -> Self {
        Self {
            timestamp,
            domain: Some(domain.to_string()),
            kid: None,
            action,
            success: true,
            detail: None,
        }
    }

    pub fn key_event(
        timestamp: DateTime<Utc>,
        domain: &str,
        kid: &Kid,
        action: AuditAction,
    ) -> Self {
        Self {
            timestamp,
            domain: Some(domain.to_string()),
            kid: Some(kid.to_string()),
            action,
            success: true,
            detail: None,
        }
    }

    pub fn system_event(timestamp: DateTime<Utc>, action: AuditAction) -> Self {
        Self {
            timestamp,
            domain: None,
            kid: None,
            action,
            success: true,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.success = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Where audit events go. Synchronous by design; async sinks buffer behind
/// interior mutability.
pub trait AuditSinkSync: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits events through `tracing`.
pub struct TracingAuditSink;

impl AuditSinkSync for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            timestamp = %event.timestamp,
            domain = ?event.domain,
            kid = ?event.kid,
            action = ?event.action,
            success = event.success,
            detail = ?event.detail,
            "audit"
        );
    }
}

/// Collects events in memory, for tests and introspection endpoints.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for_domain(&self, domain: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.domain.as_deref() == Some(domain))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSinkSync for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}
