//! End-to-end lifecycle: setup, sign, rotate, expire, reap.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Duration;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::{BigUint, RsaPublicKey};
use serde_json::json;
use sha2::Sha256;
use signvault::{
    InMemoryAuditSink, ManualClock, MemoryPolicyStore, PolicySession, PolicyStore, SignOptions,
    Vault, VaultConfig, VaultError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Setup {
    _dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
    vault: Arc<Vault>,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let mut config = VaultConfig::new(dir.path());
    config.rsa_modulus_bits = 2048;
    let clock = Arc::new(ManualClock::starting_now());
    let vault = Vault::new(
        config,
        Arc::new(MemoryPolicyStore::new()),
        clock.clone(),
        Arc::new(InMemoryAuditSink::new()),
    )
    .unwrap();
    Setup {
        _dir: dir,
        clock,
        vault: Arc::new(vault),
    }
}

fn token_kid(token: &str) -> String {
    let header: serde_json::Value = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(token.split('.').next().unwrap())
            .unwrap(),
    )
    .unwrap();
    header["kid"].as_str().unwrap().to_string()
}

/// Verify a token's signature against a JWK from the published set.
fn verify_against_jwks(token: &str, jwks: &signvault::JwksDocument) -> bool {
    let kid = token_kid(token);
    let jwk = match jwks.keys.iter().find(|k| k.kid == kid) {
        Some(jwk) => jwk,
        None => return false,
    };
    let n = BigUint::from_bytes_be(&URL_SAFE_NO_PAD.decode(&jwk.n).unwrap());
    let e = BigUint::from_bytes_be(&URL_SAFE_NO_PAD.decode(&jwk.e).unwrap());
    let key = VerifyingKey::<Sha256>::new(RsaPublicKey::new(n, e).unwrap());

    let (signing_input, sig_b64) = token.rsplit_once('.').unwrap();
    let sig_bytes = URL_SAFE_NO_PAD.decode(sig_b64).unwrap();
    let signature = Signature::try_from(sig_bytes.as_slice()).unwrap();
    key.verify(signing_input.as_bytes(), &signature).is_ok()
}

#[tokio::test]
async fn setup_sign_and_publish() {
    let s = setup();

    let outcome = s.vault.initial_setup_domain("user", None).await.unwrap();
    let kid = outcome.kid().expect("first setup creates a key").clone();
    assert!(kid.as_str().starts_with("USER-"));

    let jwks = s.vault.get_jwks("user").await.unwrap();
    assert_eq!(jwks.keys.len(), 1);

    let token = s
        .vault
        .sign("user", &json!({"sub": "x"}), SignOptions::default())
        .await
        .unwrap();
    assert_eq!(token.split('.').count(), 3);
    assert_eq!(token_kid(&token), kid.to_string());
    assert!(verify_against_jwks(&token, &jwks));
}

#[tokio::test]
async fn rotation_keeps_old_tokens_verifiable() {
    let s = setup();
    let old_kid = s
        .vault
        .initial_setup_domain("user", None)
        .await
        .unwrap()
        .kid()
        .unwrap()
        .clone();

    let old_token = s
        .vault
        .sign("user", &json!({"sub": "x"}), SignOptions::default())
        .await
        .unwrap();

    let outcome = s.vault.rotate_domain("user").await.unwrap();
    let new_kid = outcome.new_kid().expect("rotation completes").clone();
    assert_ne!(new_kid, old_kid);

    // JWKS carries both keys; only the new private key remains on disk.
    let jwks = s.vault.get_jwks("user").await.unwrap();
    assert_eq!(jwks.keys.len(), 2);
    assert_eq!(
        s.vault.keystore().list_private_kids("USER").unwrap(),
        vec![new_kid.to_string()]
    );

    // A token signed before rotation still verifies against the set, and
    // fresh tokens carry the new kid.
    assert!(verify_against_jwks(&old_token, &jwks));
    let new_token = s
        .vault
        .sign("user", &json!({"sub": "x"}), SignOptions::default())
        .await
        .unwrap();
    assert_eq!(token_kid(&new_token), new_kid.to_string());
    assert!(verify_against_jwks(&new_token, &jwks));
}

#[tokio::test]
async fn expiry_then_cleanup_drops_the_retired_key() {
    let s = setup();
    let old_kid = s
        .vault
        .initial_setup_domain("user", None)
        .await
        .unwrap()
        .kid()
        .unwrap()
        .clone();
    let new_kid = s
        .vault
        .rotate_domain("user")
        .await
        .unwrap()
        .new_kid()
        .unwrap()
        .clone();

    let config = s.vault.config();
    s.clock
        .advance(Duration::milliseconds(config.public_ttl_ms + config.grace_ms + 1));

    let report = s.vault.cleanup_expired_keys().await;
    assert_eq!(report.removed.len(), 1);

    let jwks = s.vault.get_jwks("user").await.unwrap();
    assert_eq!(jwks.keys.len(), 1);
    assert_eq!(jwks.keys[0].kid, new_kid.to_string());
    assert!(!s.vault.metadata().archived_exists(old_kid.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rotations_yield_one_success_one_skip() {
    let s = setup();
    s.vault.initial_setup_domain("svc", None).await.unwrap();

    let in_txn = Arc::new(AtomicBool::new(false));
    let rival_done = Arc::new(AtomicBool::new(false));

    let holder = {
        let vault = s.vault.clone();
        let in_txn = in_txn.clone();
        let rival_done = rival_done.clone();
        tokio::spawn(async move {
            let hook = move |_session: &mut PolicySession| -> Result<(), VaultError> {
                // Keep the lock held until the rival has been refused.
                in_txn.store(true, Ordering::SeqCst);
                for _ in 0..500 {
                    if rival_done.load(Ordering::SeqCst) {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Ok(())
            };
            vault.rotate_domain_with_hook("svc", &hook).await
        })
    };

    let rival = {
        let vault = s.vault.clone();
        let in_txn = in_txn.clone();
        let rival_done = rival_done.clone();
        tokio::spawn(async move {
            for _ in 0..500 {
                if in_txn.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            let outcome = vault.rotate_domain("svc").await;
            rival_done.store(true, Ordering::SeqCst);
            outcome
        })
    };

    let held = holder.await.unwrap().unwrap();
    let refused = rival.await.unwrap().unwrap();

    assert!(held.is_completed(), "holder should rotate: {:?}", held);
    assert!(refused.is_skipped(), "rival should be skipped: {:?}", refused);

    // Exactly one acknowledged update.
    let policy = s.vault.policies().find_by_domain("SVC").unwrap().unwrap();
    assert_eq!(Some(&policy.active_kid), held.new_kid());
}
