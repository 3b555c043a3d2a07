//! Rotation policy store: transactional persistence of per-domain policies.
//!
//! The trait is the contract the engine sees; `MemoryPolicyStore` is the
//! in-process implementation. Sessions stage writes and apply them
//! atomically on commit; abort discards the stage. Production deployments
//! implement the trait against their database.

use crate::error::VaultError;
use crate::types::{Kid, RotationPolicy};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

pub const MS_PER_DAY: i64 = 86_400_000;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// A staged policy mutation. Collaborating transactional effects (the
/// engine's caller-supplied hook) stage through the same session.
#[derive(Clone, Debug)]
pub enum PolicyWrite {
    Upsert(RotationPolicy),
    RotationAck {
        domain: String,
        active_kid: Kid,
        rotated_at: DateTime<Utc>,
        next_rotation_at: DateTime<Utc>,
    },
    Delete(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Idle,
    Active,
    Committed,
    Aborted,
}

/// Transactional handle. Obtained from the store, written through the store
/// or directly via [`PolicySession::stage`], then committed or aborted.
pub struct PolicySession {
    id: u64,
    state: SessionState,
    staged: Vec<PolicyWrite>,
}

impl PolicySession {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            staged: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_transaction(&mut self) -> Result<(), VaultError> {
        if self.state != SessionState::Idle {
            return Err(VaultError::store(
                "policy transaction",
                "transaction already started",
            ));
        }
        self.state = SessionState::Active;
        Ok(())
    }

    /// Stage a write into the open transaction.
    pub fn stage(&mut self, write: PolicyWrite) -> Result<(), VaultError> {
        if self.state != SessionState::Active {
            return Err(VaultError::store(
                "policy transaction",
                "no open transaction on this session",
            ));
        }
        self.staged.push(write);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    fn take_staged(&mut self) -> Result<Vec<PolicyWrite>, VaultError> {
        if self.state != SessionState::Active {
            return Err(VaultError::store(
                "policy transaction",
                "no open transaction to commit",
            ));
        }
        Ok(std::mem::take(&mut self.staged))
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RotationDatesUpdate {
    pub domain: String,
    pub active_kid: Kid,
    pub rotated_at: DateTime<Utc>,
    pub next_rotation_at: DateTime<Utc>,
}

pub trait PolicyStore: Send + Sync {
    fn find_by_domain(&self, domain: &str) -> Result<Option<RotationPolicy>, VaultError>;

    /// Fails with `Conflict` when a policy for the domain already exists.
    fn create_policy(&self, policy: RotationPolicy) -> Result<(), VaultError>;

    fn update_policy(&self, policy: RotationPolicy) -> Result<(), VaultError>;

    fn delete_policy(&self, domain: &str) -> Result<(), VaultError>;

    fn set_enabled(&self, domain: &str, enabled: bool) -> Result<(), VaultError>;

    /// Enabled policies with `next_rotation_at <= now`.
    fn due_for_rotation(&self, now: DateTime<Utc>) -> Result<Vec<RotationPolicy>, VaultError>;

    fn session(&self) -> Result<PolicySession, VaultError>;

    fn commit_session(&self, session: &mut PolicySession) -> Result<(), VaultError>;

    fn abort_session(&self, session: &mut PolicySession) -> Result<(), VaultError>;

    /// Stage the rotation-date pair plus active kid inside the session.
    fn update_rotation_dates(
        &self,
        update: RotationDatesUpdate,
        session: &mut PolicySession,
    ) -> Result<(), VaultError> {
        session.stage(PolicyWrite::RotationAck {
            domain: update.domain,
            active_kid: update.active_kid,
            rotated_at: update.rotated_at,
            next_rotation_at: update.next_rotation_at,
        })
    }

    /// Stage `active_kid = new_kid`, `rotated_at = now`,
    /// `next_rotation_at = now + interval_days` inside the session.
    fn acknowledge_successful_rotation(
        &self,
        domain: &str,
        interval_days: i64,
        new_kid: &Kid,
        now: DateTime<Utc>,
        session: &mut PolicySession,
    ) -> Result<(), VaultError> {
        self.update_rotation_dates(
            RotationDatesUpdate {
                domain: domain.to_string(),
                active_kid: new_kid.clone(),
                rotated_at: now,
                next_rotation_at: now + Duration::milliseconds(interval_days * MS_PER_DAY),
            },
            session,
        )
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPolicyStore {
    policies: RwLock<HashMap<String, RotationPolicy>>,
    session_seq: AtomicU64,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(
        policies: &mut HashMap<String, RotationPolicy>,
        write: PolicyWrite,
    ) -> Result<(), VaultError> {
        match write {
            PolicyWrite::Upsert(policy) => {
                policies.insert(policy.domain.clone(), policy);
            }
            PolicyWrite::RotationAck {
                domain,
                active_kid,
                rotated_at,
                next_rotation_at,
            } => {
                let policy = policies.get_mut(&domain).ok_or_else(|| {
                    VaultError::store(
                        "policy commit",
                        format!("no policy for domain {} in transaction", domain),
                    )
                })?;
                policy.active_kid = active_kid;
                policy.rotated_at = rotated_at;
                policy.next_rotation_at = next_rotation_at;
            }
            PolicyWrite::Delete(domain) => {
                policies.remove(&domain);
            }
        }
        Ok(())
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn find_by_domain(&self, domain: &str) -> Result<Option<RotationPolicy>, VaultError> {
        Ok(self.policies.read().unwrap().get(domain).cloned())
    }

    fn create_policy(&self, policy: RotationPolicy) -> Result<(), VaultError> {
        let mut policies = self.policies.write().unwrap();
        if policies.contains_key(&policy.domain) {
            return Err(VaultError::conflict(format!(
                "policy for domain {}",
                policy.domain
            )));
        }
        policies.insert(policy.domain.clone(), policy);
        Ok(())
    }

    fn update_policy(&self, policy: RotationPolicy) -> Result<(), VaultError> {
        let mut policies = self.policies.write().unwrap();
        if !policies.contains_key(&policy.domain) {
            return Err(VaultError::not_found(format!(
                "policy for domain {}",
                policy.domain
            )));
        }
        policies.insert(policy.domain.clone(), policy);
        Ok(())
    }

    fn delete_policy(&self, domain: &str) -> Result<(), VaultError> {
        self.policies.write().unwrap().remove(domain);
        Ok(())
    }

    fn set_enabled(&self, domain: &str, enabled: bool) -> Result<(), VaultError> {
        let mut policies = self.policies.write().unwrap();
        let policy = policies
            .get_mut(domain)
            .ok_or_else(|| VaultError::not_found(format!("policy for domain {}", domain)))?;
        policy.enabled = enabled;
        Ok(())
    }

    fn due_for_rotation(&self, now: DateTime<Utc>) -> Result<Vec<RotationPolicy>, VaultError> {
        Ok(self
            .policies
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_due(now))
            .cloned()
            .collect())
    }

    fn session(&self) -> Result<PolicySession, VaultError> {
        Ok(PolicySession::new(
            self.session_seq.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn commit_session(&self, session: &mut PolicySession) -> Result<(), VaultError> {
        let staged = session.take_staged()?;
        let mut policies = self.policies.write().unwrap();
        // All-or-nothing: validate against a scratch copy, then swap.
        let mut scratch = policies.clone();
        for write in staged {
            Self::apply(&mut scratch, write)?;
        }
        *policies = scratch;
        session.state = SessionState::Committed;
        Ok(())
    }

    fn abort_session(&self, session: &mut PolicySession) -> Result<(), VaultError> {
        session.staged.clear();
        session.state = SessionState::Aborted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(domain: &str, kid: &str, due_in_days: i64) -> RotationPolicy {
        let now = Utc::now();
        RotationPolicy {
            domain: domain.to_string(),
            active_kid: Kid::new(kid),
            rotation_interval_days: 30,
            rotated_at: now,
            next_rotation_at: now + Duration::days(due_in_days),
            enabled: true,
            note: None,
        }
    }

    #[test]
    fn create_twice_conflicts() {
        let store = MemoryPolicyStore::new();
        store.create_policy(policy("USER", "USER-1", 30)).unwrap();
        let err = store.create_policy(policy("USER", "USER-2", 30)).unwrap_err();
        assert!(matches!(err, VaultError::Conflict { .. }));
    }

    #[test]
    fn due_query_filters_disabled_and_future() {
        let store = MemoryPolicyStore::new();
        store.create_policy(policy("DUE", "DUE-1", -1)).unwrap();
        store.create_policy(policy("LATER", "LATER-1", 5)).unwrap();
        store.create_policy(policy("OFF", "OFF-1", -1)).unwrap();
        store.set_enabled("OFF", false).unwrap();

        let due = store.due_for_rotation(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].domain, "DUE");
    }

    #[test]
    fn delete_then_recreate_is_allowed() {
        let store = MemoryPolicyStore::new();
        store.create_policy(policy("USER", "USER-1", 30)).unwrap();
        store.delete_policy("USER").unwrap();
        assert!(store.find_by_domain("USER").unwrap().is_none());
        store.create_policy(policy("USER", "USER-2", 30)).unwrap();
    }

    #[test]
    fn commit_applies_ack_and_abort_discards() {
        let store = MemoryPolicyStore::new();
        store.create_policy(policy("USER", "USER-1", -1)).unwrap();
        let now = Utc::now();

        let mut session = store.session().unwrap();
        session.start_transaction().unwrap();
        store
            .acknowledge_successful_rotation("USER", 30, &Kid::new("USER-2"), now, &mut session)
            .unwrap();
        store.commit_session(&mut session).unwrap();

        let updated = store.find_by_domain("USER").unwrap().unwrap();
        assert_eq!(updated.active_kid, Kid::new("USER-2"));
        assert_eq!(updated.rotated_at, now);
        assert_eq!(
            updated.next_rotation_at,
            now + Duration::milliseconds(30 * MS_PER_DAY)
        );

        let mut aborted = store.session().unwrap();
        aborted.start_transaction().unwrap();
        store
            .acknowledge_successful_rotation("USER", 30, &Kid::new("USER-3"), now, &mut aborted)
            .unwrap();
        store.abort_session(&mut aborted).unwrap();
        assert_eq!(
            store.find_by_domain("USER").unwrap().unwrap().active_kid,
            Kid::new("USER-2")
        );
    }

    #[test]
    fn ack_for_unknown_domain_fails_whole_commit() {
        let store = MemoryPolicyStore::new();
        store.create_policy(policy("USER", "USER-1", -1)).unwrap();

        let mut session = store.session().unwrap();
        session.start_transaction().unwrap();
        store
            .acknowledge_successful_rotation("USER", 30, &Kid::new("USER-2"), Utc::now(), &mut session)
            .unwrap();
        store
            .acknowledge_successful_rotation("GHOST", 30, &Kid::new("G-1"), Utc::now(), &mut session)
            .unwrap();
        assert!(store.commit_session(&mut session).is_err());
        // First staged write must not have leaked through.
        assert_eq!(
            store.find_by_domain("USER").unwrap().unwrap().active_kid,
            Kid::new("USER-1")
        );
    }
}
