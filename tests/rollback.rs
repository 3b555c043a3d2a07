//! Failure injection: commit failures roll back cleanly, the scheduler
//! retries bounded, cancellation stops the batch loop.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use signvault::{
    AuditAction, InMemoryAuditSink, ManualClock, MemoryPolicyStore, PolicySession, PolicyStore,
    RotationOutcome, RotationPolicy, SignOptions, Vault, VaultConfig, VaultError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Delegates to the in-process store but fails the next N commits and/or
/// the next M policy creations.
struct FailingPolicyStore {
    inner: MemoryPolicyStore,
    failures_left: AtomicUsize,
    create_failures_left: AtomicUsize,
}

impl FailingPolicyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryPolicyStore::new(),
            failures_left: AtomicUsize::new(failures),
            create_failures_left: AtomicUsize::new(0),
        }
    }

    fn failing_creates(failures: usize) -> Self {
        Self {
            inner: MemoryPolicyStore::new(),
            failures_left: AtomicUsize::new(0),
            create_failures_left: AtomicUsize::new(failures),
        }
    }
}

impl PolicyStore for FailingPolicyStore {
    fn find_by_domain(&self, domain: &str) -> Result<Option<RotationPolicy>, VaultError> {
        self.inner.find_by_domain(domain)
    }

    fn create_policy(&self, policy: RotationPolicy) -> Result<(), VaultError> {
        let left = self.create_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.create_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(VaultError::store("policy create", "injected create failure"));
        }
        self.inner.create_policy(policy)
    }

    fn update_policy(&self, policy: RotationPolicy) -> Result<(), VaultError> {
        self.inner.update_policy(policy)
    }

    fn delete_policy(&self, domain: &str) -> Result<(), VaultError> {
        self.inner.delete_policy(domain)
    }

    fn set_enabled(&self, domain: &str, enabled: bool) -> Result<(), VaultError> {
        self.inner.set_enabled(domain, enabled)
    }

    fn due_for_rotation(&self, now: DateTime<Utc>) -> Result<Vec<RotationPolicy>, VaultError> {
        self.inner.due_for_rotation(now)
    }

    fn session(&self) -> Result<PolicySession, VaultError> {
        self.inner.session()
    }

    fn commit_session(&self, session: &mut PolicySession) -> Result<(), VaultError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(VaultError::store("policy commit", "injected commit failure"));
        }
        self.inner.commit_session(session)
    }

    fn abort_session(&self, session: &mut PolicySession) -> Result<(), VaultError> {
        self.inner.abort_session(session)
    }
}

struct Setup {
    _dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
    audit: Arc<InMemoryAuditSink>,
    vault: Vault,
}

fn setup_with(store: Arc<dyn PolicyStore>) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let mut config = VaultConfig::new(dir.path());
    config.rsa_modulus_bits = 2048;
    let clock = Arc::new(ManualClock::starting_now());
    let audit = Arc::new(InMemoryAuditSink::new());
    let vault = Vault::new(config, store, clock.clone(), audit.clone()).unwrap();
    Setup {
        _dir: dir,
        clock,
        audit,
        vault,
    }
}

#[tokio::test]
async fn commit_failure_rolls_back_to_the_incumbent() {
    let store = Arc::new(FailingPolicyStore::new(1));
    let s = setup_with(store);

    let old_kid = s
        .vault
        .initial_setup_domain("svc", None)
        .await
        .unwrap()
        .kid()
        .unwrap()
        .clone();

    let outcome = s.vault.rotate_domain("svc").await.unwrap();
    match &outcome {
        RotationOutcome::Failed { error, .. } => {
            assert!(matches!(error, VaultError::Store { .. }));
        }
        other => panic!("expected failure, got {:?}", other),
    }

    // The incumbent is untouched: policy, material, metadata.
    let policy = s.vault.policies().find_by_domain("SVC").unwrap().unwrap();
    assert_eq!(policy.active_kid, old_kid);
    assert_eq!(
        s.vault.keystore().list_private_kids("SVC").unwrap(),
        vec![old_kid.to_string()]
    );
    assert_eq!(
        s.vault.keystore().list_public_kids("SVC").unwrap(),
        vec![old_kid.to_string()]
    );
    assert!(s.vault.metadata().origin_exists("SVC", old_kid.as_str()));
    // No premature archive record survives the rollback.
    assert!(!s.vault.metadata().archived_exists(old_kid.as_str()));

    // Signing still works with the incumbent.
    let token = s
        .vault
        .sign("svc", &json!({"sub": "x"}), SignOptions::default())
        .await
        .unwrap();
    assert!(token.contains('.'));

    // And a later attempt (store healthy again) succeeds.
    let outcome = s.vault.rotate_domain("svc").await.unwrap();
    assert!(outcome.is_completed());
}

#[tokio::test]
async fn failed_setup_leaves_no_orphaned_material() {
    let store = Arc::new(FailingPolicyStore::failing_creates(1));
    let s = setup_with(store);

    let err = s.vault.initial_setup_domain("svc", None).await.unwrap_err();
    assert!(matches!(err, VaultError::Store { .. }));

    // The minted key pair and its origin record were discarded with the
    // failed attempt.
    assert!(s.vault.keystore().list_private_kids("SVC").unwrap().is_empty());
    assert!(s.vault.keystore().list_public_kids("SVC").unwrap().is_empty());
    assert!(s.vault.metadata().list_origin_kids("SVC").unwrap().is_empty());
    assert!(s.vault.policies().find_by_domain("SVC").unwrap().is_none());

    // A retry starts clean and leaves exactly one key behind.
    let outcome = s.vault.initial_setup_domain("svc", None).await.unwrap();
    assert!(outcome.kid().is_some());
    assert_eq!(s.vault.keystore().list_private_kids("SVC").unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn scheduler_retries_up_to_the_cap_and_stops() {
    let store = Arc::new(FailingPolicyStore::new(usize::MAX));
    let s = setup_with(store);

    s.vault.initial_setup_domain("svc", None).await.unwrap();
    let interval = s
        .vault
        .policies()
        .find_by_domain("SVC")
        .unwrap()
        .unwrap()
        .rotation_interval_days;
    s.clock.advance(Duration::days(interval) + Duration::seconds(1));

    let summary = s.vault.schedule_rotation().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 0);

    // One rollback per attempt, no more than max_retries attempts.
    let rollbacks = s
        .audit
        .events()
        .iter()
        .filter(|e| matches!(e.action, AuditAction::RotationRolledBack { .. }))
        .count();
    assert_eq!(rollbacks as u32, s.vault.scheduler_config().max_retries());
}

#[tokio::test(start_paused = true)]
async fn retry_stops_once_a_pass_is_clean() {
    // First commit fails, the retry succeeds.
    let store = Arc::new(FailingPolicyStore::new(1));
    let s = setup_with(store);

    s.vault.initial_setup_domain("svc", None).await.unwrap();
    let interval = s
        .vault
        .policies()
        .find_by_domain("SVC")
        .unwrap()
        .unwrap()
        .rotation_interval_days;
    s.clock.advance(Duration::days(interval) + Duration::seconds(1));

    let summary = s.vault.schedule_rotation().await.unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.succeeded, 1);

    // Exactly one rollback happened before the clean pass.
    let rollbacks = s
        .audit
        .events()
        .iter()
        .filter(|e| matches!(e.action, AuditAction::RotationRolledBack { .. }))
        .count();
    assert_eq!(rollbacks, 1);
}

#[tokio::test]
async fn hook_error_aborts_the_rotation() {
    let s = setup_with(Arc::new(MemoryPolicyStore::new()));
    let old_kid = s
        .vault
        .initial_setup_domain("svc", None)
        .await
        .unwrap()
        .kid()
        .unwrap()
        .clone();

    let hook = |_session: &mut PolicySession| -> Result<(), VaultError> {
        Err(VaultError::store("collaborator", "refusing to co-sign"))
    };
    let outcome = s.vault.rotate_domain_with_hook("svc", &hook).await.unwrap();
    assert!(outcome.is_failed());

    let policy = s.vault.policies().find_by_domain("SVC").unwrap().unwrap();
    assert_eq!(policy.active_kid, old_kid);
    assert_eq!(s.vault.keystore().list_public_kids("SVC").unwrap().len(), 1);
}

#[tokio::test]
async fn hook_writes_commit_with_the_rotation() {
    let s = setup_with(Arc::new(MemoryPolicyStore::new()));
    s.vault.initial_setup_domain("svc", None).await.unwrap();

    // A collaborator records a shadow policy inside the same transaction.
    let shadow = {
        let mut p = s.vault.policies().find_by_domain("SVC").unwrap().unwrap();
        p.domain = "SVC-SHADOW".to_string();
        p.enabled = false;
        p.note = Some("written by collaborator".to_string());
        p
    };
    let hook = move |session: &mut PolicySession| -> Result<(), VaultError> {
        session.stage(signvault::PolicyWrite::Upsert(shadow.clone()))
    };
    let outcome = s.vault.rotate_domain_with_hook("svc", &hook).await.unwrap();
    assert!(outcome.is_completed());

    // Both effects landed atomically: the ack on SVC and the hook's write.
    let policy = s.vault.policies().find_by_domain("SVC").unwrap().unwrap();
    assert_eq!(Some(&policy.active_kid), outcome.new_kid());
    let shadow = s.vault.policies().find_by_domain("SVC-SHADOW").unwrap().unwrap();
    assert_eq!(shadow.note.as_deref(), Some("written by collaborator"));
}

#[tokio::test]
async fn cancellation_prevents_further_attempts() {
    let store = Arc::new(FailingPolicyStore::new(usize::MAX));
    let s = setup_with(store);

    s.vault.initial_setup_domain("svc", None).await.unwrap();
    let interval = s
        .vault
        .policies()
        .find_by_domain("SVC")
        .unwrap()
        .unwrap()
        .rotation_interval_days;
    s.clock.advance(Duration::days(interval) + Duration::seconds(1));

    s.vault.cancel_flag().cancel();
    let summary = s.vault.schedule_rotation().await.unwrap();
    assert_eq!(summary.succeeded + summary.failed + summary.skipped, 0);
}
