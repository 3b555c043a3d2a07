//! # Signvault
//!
//! Domain-scoped RSA signing core: issues and rotates signing key pairs per
//! domain, signs compact tokens with the current key, and publishes active
//! plus recently retired public keys as a JWKS so outstanding tokens stay
//! verifiable until they expire.
//!
//! ## Quick Start
//!
//! ```ignore
//! use signvault::{SignOptions, Vault, VaultConfig};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let vault = Vault::with_defaults(VaultConfig::new("./signvault-data")).unwrap();
//!
//! let setup = vault.initial_setup_domain("user", None).await.unwrap();
//! let kid = setup.kid().unwrap();
//!
//! let token = vault
//!     .sign("user", &json!({"sub": "alice"}), SignOptions::default())
//!     .await
//!     .unwrap();
//!
//! let jwks = vault.get_jwks("user").await.unwrap();
//! assert_eq!(jwks.keys[0].kid, kid.to_string());
//! # });
//! ```
//!
//! ## What's NOT Provided
//!
//! - Token verification (issuance only)
//! - Symmetric or non-RSA key types
//! - Trust anchoring to an external CA
//! - Cross-region replication of the key store

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod janitor;
pub mod jwks;
pub mod keystore;
pub mod lock;
pub mod metadata;
pub mod policy;
pub mod registry;
pub mod rotation;
pub mod scheduler;
pub mod signer;
pub mod types;
pub mod vault;

// Re-export the main surface for convenience
pub use audit::{AuditAction, AuditEvent, AuditSinkSync, InMemoryAuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SchedulerConfig, VaultConfig};
pub use error::VaultError;
pub use janitor::{CleanupReport, Janitor};
pub use jwks::{Jwk, JwksBuilder, JwksDocument};
pub use keystore::KeyStore;
pub use lock::LockManager;
pub use metadata::MetadataStore;
pub use policy::{MemoryPolicyStore, PolicySession, PolicyStore, PolicyWrite, RotationDatesUpdate};
pub use registry::ActiveKidRegistry;
pub use rotation::{RotationEngine, RotationOutcome, SessionHook};
pub use scheduler::{CancelFlag, RotationScheduler, RotationSummary};
pub use signer::{SignOptions, Signer, TokenBuilder};
pub use types::{normalize_domain, KeyMetadata, Kid, RotationPolicy};
pub use vault::{PolicyOptions, SetupOutcome, Vault};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
