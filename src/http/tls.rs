//! mTLS listener setup. The `axum_server::bind_rustls` pattern is grounded
//! on this codebase's `rofl-scheduler/src/serverd/mod.rs`; the
//! `rustls::ServerConfig` builder style follows
//! `rofl-proxy/src/http/tls.rs`'s use of `pki_types` and `CertifiedKey`,
//! extended here with client certificate verification since that file's
//! ACME listener accepts no client certs at all.

use crate::cert_resolver::{ClientAuthMode, VerifiedCertificate};
use crate::config::TlsConfig;
use axum::body::Body;
use axum::http::Request;
use axum_server::accept::Accept;
use axum_server::tls_rustls::RustlsConfig;
use futures_util::future::BoxFuture;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Service;

/// Extension inserted into every request's extensions map once the TLS
/// handshake completes, carrying the peer certificate if one was presented.
#[derive(Clone)]
pub struct PeerCertExtension(pub Option<VerifiedCertificate>);

pub fn build_server_config(tls: &TlsConfig) -> anyhow::Result<rustls::ServerConfig> {
    let cert_chain = load_cert_chain(&tls.cert)?;
    let key = load_private_key(&tls.key)?;

    let mut roots = RootCertStore::empty();
    for cert in load_cert_chain(&tls.client_ca)? {
        roots.add(cert)?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;

    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

pub fn rustls_config(tls: &TlsConfig) -> anyhow::Result<RustlsConfig> {
    Ok(RustlsConfig::from_config(Arc::new(build_server_config(
        tls,
    )?)))
}

fn load_cert_chain(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let bytes = fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut bytes.as_slice()).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

fn load_private_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let bytes = fs::read(path)?;
    rustls_pemfile::private_key(&mut bytes.as_slice())?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {path}"))
}

/// Wraps `axum_server`'s rustls acceptor to pull the verified peer
/// certificate off the completed handshake and stash it as a request
/// extension, so `CertificateResolver` can read it per request without
/// the router needing to know about the TLS layer at all.
#[derive(Clone)]
pub struct MtlsAcceptor {
    inner: axum_server::tls_rustls::RustlsAcceptor,
}

impl MtlsAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: axum_server::tls_rustls::RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for MtlsAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Body>> + Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = CertInjectingService<S>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = inner.accept(stream, service).await?;
            let (_, session) = stream.get_ref();
            let verified = session
                .peer_certificates()
                .and_then(|chain| chain.first())
                .map(|cert| VerifiedCertificate {
                    der: cert.as_ref().to_vec(),
                    mode: ClientAuthMode::DirectMutualTls,
                });
            Ok((
                stream,
                CertInjectingService {
                    inner: service,
                    verified,
                },
            ))
        })
    }
}

#[derive(Clone)]
pub struct CertInjectingService<S> {
    inner: S,
    verified: Option<VerifiedCertificate>,
}

impl<S> Service<Request<Body>> for CertInjectingService<S>
where
    S: Service<Request<Body>> + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        req.extensions_mut()
            .insert(PeerCertExtension(self.verified.clone()));
        self.inner.call(req)
    }
}
