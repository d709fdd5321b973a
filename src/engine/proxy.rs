//! HTTPS engine publishing the local root certificate at [`ROOTS_PATH`].
//!
//! Only the roots endpoint is served; everything else is 404.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use axum::Router;
use axum::body::Bytes;
use axum::http::{Request, StatusCode, header};
use axum::routing::get;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use super::Engine;
use crate::config::{CertPaths, DaemonConfig};

pub const ROOTS_PATH: &str = "/roots.pem";

/// PEM blobs loaded from disk.
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub root_pem: Vec<u8>,
}

impl TlsMaterial {
    pub fn load(paths: &CertPaths) -> Result<Self> {
        let read = |path: &std::path::Path| {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
        };
        Ok(Self {
            cert_pem: read(&paths.cert)?,
            key_pem: read(&paths.key)?,
            root_pem: read(&paths.root)?,
        })
    }
}

pub struct ProxyEngine {
    addr: SocketAddr,
    material: TlsMaterial,
}

impl ProxyEngine {
    pub fn new(addr: SocketAddr, material: TlsMaterial) -> Self {
        Self { addr, material }
    }

    /// `None` when no TLS material has been provisioned yet.
    pub fn from_config(cfg: &DaemonConfig) -> Result<Option<Self>> {
        let Some(paths) = crate::config::discover_certificate_paths(cfg) else {
            return Ok(None);
        };
        let material = TlsMaterial::load(&paths)?;
        Ok(Some(Self::new(
            SocketAddr::new(cfg.proxy.bind, cfg.proxy.port),
            material,
        )))
    }

    pub async fn bind(self) -> Result<BoundProxy> {
        let config = server_config(&self.material.cert_pem, &self.material.key_pem)?;
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS on {}", self.addr))?;
        Ok(BoundProxy {
            listener,
            router: roots_router(Bytes::from(self.material.root_pem)),
            config,
        })
    }
}

impl Engine for ProxyEngine {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn serve(self, cancel: CancellationToken) -> Result<()> {
        self.bind().await?.run(cancel).await
    }
}

pub struct BoundProxy {
    listener: TcpListener,
    router: Router,
    config: Arc<ServerConfig>,
}

impl BoundProxy {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        log::info!("HTTPS listening on https://{}", self.local_addr()?);
        serve_tls(self.listener, self.router, self.config, cancel).await;
        log::info!("HTTPS engine stopped");
        Ok(())
    }
}

/// Router answering `GET /roots.pem` with the root bundle.
pub fn roots_router(root_pem: Bytes) -> Router {
    Router::new()
        .route(
            ROOTS_PATH,
            get(move || {
                let body = root_pem.clone();
                async move { ([(header::CONTENT_TYPE, "application/x-pem-file")], body) }
            }),
        )
        .fallback(|| async { StatusCode::NOT_FOUND })
}

/// rustls server config from PEM-encoded chain and key (ring provider).
pub fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate PEM")?;
    if certs.is_empty() {
        bail!("no certificates found in PEM");
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("Failed to parse private key PEM")?
        .ok_or_else(|| anyhow!("no private key found in PEM"))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Certificate and key do not form a usable pair")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Accept TLS connections and hand each one to `router` until cancelled.
///
/// Open connections are asked to finish their current request once the
/// token fires.
pub async fn serve_tls(
    listener: TcpListener,
    router: Router,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
) {
    let acceptor = TlsAcceptor::from(config);
    let mut connections = tokio::task::JoinSet::new();

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::debug!("HTTPS accept error: {e}");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let cancel = cancel.clone();
        connections.spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    log::debug!("TLS handshake with {peer} failed: {e}");
                    return;
                }
            };
            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                router.clone().oneshot(request)
            });
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service);
            tokio::pin!(conn);

            let mut draining = false;
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            log::debug!("HTTPS connection from {peer} ended: {e}");
                        }
                        break;
                    }
                    _ = cancel.cancelled(), if !draining => {
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        });
        while connections.try_join_next().is_some() {}
    }

    while connections.join_next().await.is_some() {}
}
