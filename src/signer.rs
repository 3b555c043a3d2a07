//! Token signing read path.
//!
//! The token builder produces the compact signing input
//! (`base64url(header).base64url(claims)`); the signer owns the per-KID
//! prepared private keys and appends the RS256 signature segment. Tokens
//! never outlive the public TTL, so everything signed here stays
//! verifiable until its key's archive expiry.

use crate::cache::LruCache;
use crate::clock::Clock;
use crate::crypto::{prepare_signing_key, rs256_sign};
use crate::error::VaultError;
use crate::keystore::KeyStore;
use crate::registry::ActiveKidRegistry;
use crate::types::normalize_domain;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rsa::pkcs1v15::SigningKey;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Token assembly
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct TokenHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
}

/// Produces the signing input and joins the final token. Kept separate from
/// the signer so the encoding side stays a replaceable edge.
pub struct TokenBuilder;

impl TokenBuilder {
    pub fn signing_input(kid: &str, claims: &Map<String, Value>) -> Result<String, VaultError> {
        let header = TokenHeader {
            alg: "RS256",
            typ: "JWT",
            kid,
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| VaultError::store("token encode", e))?;
        let claims_json =
            serde_json::to_vec(claims).map_err(|e| VaultError::store("token encode", e))?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        ))
    }

    pub fn join(signing_input: &str, signature: &[u8]) -> String {
        format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature))
    }
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct SignOptions {
    /// Token lifetime when the payload does not carry its own `exp`.
    pub expires_in_secs: Option<i64>,
}

pub struct Signer {
    registry: Arc<ActiveKidRegistry>,
    keys: Arc<KeyStore>,
    clock: Arc<dyn Clock>,
    cache: Mutex<LruCache<String, Arc<SigningKey<Sha256>>>>,
    public_ttl_secs: i64,
    max_payload_bytes: usize,
    default_token_ttl_secs: i64,
}

impl Signer {
    pub fn new(
        registry: Arc<ActiveKidRegistry>,
        keys: Arc<KeyStore>,
        clock: Arc<dyn Clock>,
        cache_capacity: usize,
        public_ttl_ms: i64,
        max_payload_bytes: usize,
        default_token_ttl_secs: i64,
    ) -> Self {
        Self {
            registry,
            keys,
            clock,
            cache: Mutex::new(LruCache::new(cache_capacity)),
            public_ttl_secs: public_ttl_ms / 1000,
            max_payload_bytes,
            default_token_ttl_secs,
        }
    }

    /// Sign a claims payload for a domain with its current key.
    ///
    /// The payload must be a JSON object no larger than the configured cap.
    /// A payload-supplied `exp` is honored but may not put the token's
    /// lifetime past the public TTL; without one, `exp = iat + default`.
    pub fn sign(
        &self,
        domain: &str,
        payload: &Value,
        opts: SignOptions,
    ) -> Result<String, VaultError> {
        let domain = normalize_domain(domain);
        let object = payload
            .as_object()
            .ok_or_else(|| VaultError::validation("payload", "must be a JSON object"))?;

        let size = serde_json::to_vec(payload)
            .map_err(|e| VaultError::store("payload encode", e))?
            .len();
        if size > self.max_payload_bytes {
            return Err(VaultError::validation(
                "payload",
                format!("{} bytes exceeds cap of {}", size, self.max_payload_bytes),
            ));
        }

        let kid = self
            .registry
            .get(&domain)?
            .ok_or_else(|| {
                VaultError::validation(
                    "domain",
                    format!("no active signing key for {}", domain),
                )
            })?;

        let iat = self.clock.now().timestamp();
        let mut claims = object.clone();
        claims.insert("iat".to_string(), Value::from(iat));
        let exp = match claims.get("exp") {
            Some(value) => value
                .as_i64()
                .ok_or_else(|| VaultError::validation("exp", "must be an integer timestamp"))?,
            None => {
                let ttl = opts.expires_in_secs.unwrap_or(self.default_token_ttl_secs);
                let exp = iat + ttl;
                claims.insert("exp".to_string(), Value::from(exp));
                exp
            }
        };
        if exp <= iat {
            return Err(VaultError::validation("exp", "not after iat"));
        }
        if exp - iat > self.public_ttl_secs {
            return Err(VaultError::validation(
                "exp",
                format!(
                    "token lifetime {}s exceeds the {}s public TTL cap",
                    exp - iat,
                    self.public_ttl_secs
                ),
            ));
        }

        let key = self.signing_key(&domain, &kid)?;
        let signing_input = TokenBuilder::signing_input(&kid, &claims)?;
        let signature = rs256_sign(&key, signing_input.as_bytes());
        Ok(TokenBuilder::join(&signing_input, &signature))
    }

    pub fn evict(&self, kid: &str) {
        self.cache.lock().unwrap().remove(&kid.to_string());
    }

    fn signing_key(&self, domain: &str, kid: &str) -> Result<Arc<SigningKey<Sha256>>, VaultError> {
        if let Some(key) = self.cache.lock().unwrap().get(&kid.to_string()) {
            return Ok(key);
        }
        let pem = self.keys.load_private_key(domain, kid)?;
        let key = Arc::new(prepare_signing_key(&pem)?);
        self.cache.lock().unwrap().insert(kid.to_string(), key.clone());
        Ok(key)
    }
}
