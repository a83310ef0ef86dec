//! A4: CLI entrypoint. Loads configuration, wires every collaborator, and
//! serves the mTLS HTTPS front end.

use anyhow::{Context, Result};
use clap::Parser;
use kme_core::audit_log::RequestAuditLog;
use kme_core::authz::{AuthorizationPolicy, StatusQueryPolicy};
use kme_core::cert_resolver::CertificateResolver;
use kme_core::config::KmeConfig;
use kme_core::extensions::{AcceptAllHandler, ExtensionEngine};
use kme_core::http::tls::{rustls_config, MtlsAcceptor};
use kme_core::http::{build_router, AppState};
use kme_core::key_pool::{KeyPool, PoolLimits};
use kme_core::key_source::MockKeySource;
use kme_core::key_store::InMemoryKeyStore;
use kme_core::pairing_ledger::PairingLedger;
use kme_core::sae_registry::InMemorySaeRegistry;
use kme_core::services::key_request::KeyRequestService;
use kme_core::services::key_retrieval::KeyRetrievalService;
use kme_core::services::status::StatusService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "kme-server", about = "ETSI GS QKD 014 Key Management Entity")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "kme.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = KmeConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    kme_core::telemetry::init(config.general.log_format);

    let config = Arc::new(config);

    let sae_registry = Arc::new(InMemorySaeRegistry::new());
    let key_store = Arc::new(InMemoryKeyStore::new());
    let key_source = Arc::new(MockKeySource::new());

    let limits = PoolLimits {
        min_key_size: config.general.min_key_size,
        max_key_size: config.general.max_key_size,
        max_key_per_request: config.general.max_key_per_request,
        max_key_count: config.general.max_key_count,
        max_sae_id_count: config.general.max_sae_id_count,
        default_key_size: config.general.default_key_size,
    };
    let key_pool = Arc::new(KeyPool::new(
        key_store,
        key_source,
        limits,
        config.general.kme_id.clone(),
    ));

    let cert_resolver = Arc::new(CertificateResolver::new(config.tls.san_pattern.clone())?);
    let authz = Arc::new(AuthorizationPolicy::new(
        sae_registry.clone(),
        StatusQueryPolicy::RelationshipOnly,
    ));

    let mut extension_engine = ExtensionEngine::new();
    for binding in &config.extension_registry {
        extension_engine.register(
            binding.vendor.clone(),
            binding.extension_type.clone(),
            binding.version.clone(),
            Arc::new(AcceptAllHandler),
        );
    }
    let extension_engine = Arc::new(extension_engine);

    let pairing_ledger = Arc::new(PairingLedger::new());
    let audit_log = Arc::new(RequestAuditLog::new());

    let status_service = Arc::new(StatusService::new(
        key_pool.clone(),
        config.clone(),
        pairing_ledger.clone(),
    ));
    let key_request_service = Arc::new(KeyRequestService::new(
        key_pool.clone(),
        authz.clone(),
        extension_engine.clone(),
        config.clone(),
        pairing_ledger.clone(),
        audit_log.clone(),
    ));
    let key_retrieval_service = Arc::new(KeyRetrievalService::new(key_pool.clone(), authz.clone()));

    let state = Arc::new(AppState {
        config: config.clone(),
        cert_resolver,
        key_pool: key_pool.clone(),
        status_service,
        key_request_service,
        key_retrieval_service,
        authz,
        extensions: extension_engine,
        pairing_ledger,
        sae_registry,
        audit_log,
    });

    spawn_expiry_sweeper(key_pool);

    let app = build_router(state);
    let addr: SocketAddr = config
        .general
        .listen_addr
        .parse()
        .with_context(|| format!("parsing listen_addr '{}'", config.general.listen_addr))?;

    let tls_config = rustls_config(&config.tls).context("building TLS server configuration")?;
    let acceptor = MtlsAcceptor::new(tls_config);

    tracing::info!(%addr, kme_id = %config.general.kme_id, "starting KME server");

    axum_server::bind(addr)
        .acceptor(acceptor)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server loop exited")?;

    Ok(())
}

fn spawn_expiry_sweeper(pool: Arc<KeyPool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            match pool.sweep_expired().await {
                Ok(swept) if swept > 0 => {
                    tracing::debug!(swept, "expired keys swept from pool")
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "expiry sweep failed"),
            }
        }
    });
}
