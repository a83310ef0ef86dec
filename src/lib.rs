//! Core library for a QKD Key Management Entity (KME) HTTPS front end
//! implementing the ETSI GS QKD 014 southbound interface.
//!
//! The binary entrypoint lives in `src/bin/kme_server.rs`; this crate
//! holds everything that can be exercised without a TLS listener.

pub mod model;
pub mod error;
pub mod crypto_random;
pub mod key_source;
pub mod sae_registry;
pub mod key_store;
pub mod key_pool;
pub mod pairing_ledger;
pub mod audit_log;
pub mod cert_resolver;
pub mod authz;
pub mod extensions;
pub mod config;
pub mod telemetry;
pub mod services;
pub mod http;
