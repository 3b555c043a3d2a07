//! Configuration collaborator.
//!
//! Recognized environment options:
//!   REDIS_HOST / REDIS_PORT / REDIS_PASSWORD - shared cache & lock backend
//!   MONGO_DB_URI                             - policy store connection
//!   PORT                                     - transport listen port
//!   SIGNVAULT_DATA_DIR                       - key/metadata root directory
//!
//! The in-process store implementations ignore the connection options; they
//! are parsed and surfaced so deployments wiring real backends behind the
//! store traits see one config shape.

use crate::error::VaultError;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// System-wide constants
// ---------------------------------------------------------------------------

/// Maximum lifetime of a token signed by a given key; also the base of a
/// retired key's archive expiry. 30 days.
pub const KEY_PUBLIC_TTL_MS: i64 = 2_592_000_000;

/// Buffer after the public TTL before a retired public key is purged,
/// covering clock skew. 2 days.
pub const KEY_GRACE_MS: i64 = 172_800_000;

/// Single system-wide RSA modulus length.
pub const RSA_MODULUS_BITS: usize = 4096;

pub const MIN_RETRY_INTERVAL_MS: u64 = 60_000;
pub const MAX_RETRY_INTERVAL_MS: u64 = 3_600_000;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 300_000;

pub const MIN_MAX_RETRIES: u32 = 1;
pub const MAX_MAX_RETRIES: u32 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lock TTL: expected rotation time plus a five minute safety margin.
pub const DEFAULT_LOCK_TTL_SECS: i64 = 600;

/// Upper bound on locks held across the whole engine at once.
pub const DEFAULT_LOCK_CAPACITY: usize = 128;

pub const DEFAULT_SHARED_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_SHARED_CACHE_TTL_SECS: i64 = 300;
pub const DEFAULT_LOCAL_CACHE_CAPACITY: usize = 256;
pub const DEFAULT_DERIVED_KEY_CACHE_CAPACITY: usize = 64;

pub const DEFAULT_ROTATION_INTERVAL_DAYS: i64 = 30;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3_600;

// ---------------------------------------------------------------------------
// VaultConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct VaultConfig {
    pub data_dir: PathBuf,
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    pub redis_password: Option<String>,
    pub mongo_db_uri: Option<String>,
    pub port: u16,

    pub rsa_modulus_bits: usize,
    pub public_ttl_ms: i64,
    pub grace_ms: i64,

    pub lock_ttl_secs: i64,
    pub lock_capacity: usize,
    pub shared_cache_capacity: usize,
    pub shared_cache_ttl_secs: i64,
    pub local_cache_capacity: usize,
    pub derived_key_cache_capacity: usize,

    pub default_rotation_interval_days: i64,
    pub max_payload_bytes: usize,
    pub default_token_ttl_secs: i64,
}

impl VaultConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            redis_host: None,
            redis_port: None,
            redis_password: None,
            mongo_db_uri: None,
            port: 3000,
            rsa_modulus_bits: RSA_MODULUS_BITS,
            public_ttl_ms: KEY_PUBLIC_TTL_MS,
            grace_ms: KEY_GRACE_MS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            lock_capacity: DEFAULT_LOCK_CAPACITY,
            shared_cache_capacity: DEFAULT_SHARED_CACHE_CAPACITY,
            shared_cache_ttl_secs: DEFAULT_SHARED_CACHE_TTL_SECS,
            local_cache_capacity: DEFAULT_LOCAL_CACHE_CAPACITY,
            derived_key_cache_capacity: DEFAULT_DERIVED_KEY_CACHE_CAPACITY,
            default_rotation_interval_days: DEFAULT_ROTATION_INTERVAL_DAYS,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            default_token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
        }
    }

    /// Read the recognized environment options, falling back to defaults.
    pub fn from_env() -> Self {
        let data_dir =
            std::env::var("SIGNVAULT_DATA_DIR").unwrap_or_else(|_| "./signvault-data".into());
        let mut cfg = Self::new(data_dir);
        cfg.redis_host = std::env::var("REDIS_HOST").ok();
        cfg.redis_port = std::env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok());
        cfg.redis_password = std::env::var("REDIS_PASSWORD").ok();
        cfg.mongo_db_uri = std::env::var("MONGO_DB_URI").ok();
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            cfg.port = port;
        }
        cfg
    }

    pub fn archive_ttl_ms(&self) -> i64 {
        self.public_ttl_ms + self.grace_ms
    }
}

// ---------------------------------------------------------------------------
// Scheduler knobs (bounds enforced at set time)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    retry_interval_ms: u64,
    max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_interval_ms(&self) -> u64 {
        self.retry_interval_ms
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn set_retry_interval(&mut self, ms: u64) -> Result<(), VaultError> {
        if !(MIN_RETRY_INTERVAL_MS..=MAX_RETRY_INTERVAL_MS).contains(&ms) {
            return Err(VaultError::validation(
                "retryIntervalMs",
                format!(
                    "{} outside [{}, {}]",
                    ms, MIN_RETRY_INTERVAL_MS, MAX_RETRY_INTERVAL_MS
                ),
            ));
        }
        self.retry_interval_ms = ms;
        Ok(())
    }

    pub fn set_max_retries(&mut self, retries: u32) -> Result<(), VaultError> {
        if !(MIN_MAX_RETRIES..=MAX_MAX_RETRIES).contains(&retries) {
            return Err(VaultError::validation(
                "maxRetries",
                format!("{} outside [{}, {}]", retries, MIN_MAX_RETRIES, MAX_MAX_RETRIES),
            ));
        }
        self.max_retries = retries;
        Ok(())
    }
}
