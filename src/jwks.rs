//! JWKS publication: every public key still on disk for a domain, as a JWK
//! set. Derived JWKs are cached per KID; the rotation engine and janitor
//! evict entries when keys retire or expire.

use crate::cache::LruCache;
use crate::error::VaultError;
use crate::keystore::KeyStore;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

/// SPKI PEM -> JWK with base64url modulus and exponent.
pub fn pem_to_jwk(pem: &str, kid: &str) -> Result<Jwk, VaultError> {
    let public = RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| VaultError::store("public key parse", e))?;
    Ok(Jwk {
        kty: "RSA".to_string(),
        use_: "sig".to_string(),
        alg: "RS256".to_string(),
        kid: kid.to_string(),
        n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
    })
}

pub struct JwksBuilder {
    keys: Arc<KeyStore>,
    cache: Mutex<LruCache<String, Jwk>>,
}

impl JwksBuilder {
    pub fn new(keys: Arc<KeyStore>, cache_capacity: usize) -> Self {
        Self {
            keys,
            cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    /// The active public key plus every retired-but-unexpired one.
    /// A domain with no key material at all is a not-found error.
    pub fn get_jwks(&self, domain: &str) -> Result<JwksDocument, VaultError> {
        let kids = self.keys.list_public_kids(domain)?;
        if kids.is_empty() {
            return Err(VaultError::not_found(format!(
                "no public keys for domain {}",
                domain
            )));
        }
        let mut jwks = Vec::with_capacity(kids.len());
        for kid in kids {
            if let Some(jwk) = self.cache.lock().unwrap().get(&kid) {
                jwks.push(jwk);
                continue;
            }
            let pem = self.keys.load_public_key(domain, &kid)?;
            let jwk = pem_to_jwk(&pem, &kid)?;
            self.cache.lock().unwrap().insert(kid, jwk.clone());
            jwks.push(jwk);
        }
        Ok(JwksDocument { keys: jwks })
    }

    pub fn evict(&self, kid: &str) {
        self.cache.lock().unwrap().remove(&kid.to_string());
    }
}
