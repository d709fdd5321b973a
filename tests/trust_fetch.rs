//! Trust-on-first-use fetch against the crate's own HTTPS serving path.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use devnetd::engine::ROOTS_PATH;
use devnetd::engine::proxy::{ProxyEngine, TlsMaterial, serve_tls, server_config};
use devnetd::error::FetchError;
use devnetd::trust::fetch::insecure_fetch_root_certificate;
use devnetd::trust::{FetchConfig, RootCertificate, short_text, trusted};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Material {
    root_pem: String,
    server_cert_pem: String,
    server_key_pem: String,
}

fn material() -> Material {
    let root_key = KeyPair::generate().unwrap();
    let mut root_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    root_params
        .distinguished_name
        .push(DnType::CommonName, "devnet integration root");
    root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let root = root_params.self_signed(&root_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let issuer = rcgen::Issuer::new(root_params, root_key);
    let server = server_params.signed_by(&server_key, &issuer).unwrap();

    Material {
        root_pem: root.pem(),
        server_cert_pem: server.pem(),
        server_key_pem: server_key.serialize_pem(),
    }
}

fn fetch_config(addr: SocketAddr) -> FetchConfig {
    FetchConfig {
        port: addr.port(),
        path: ROOTS_PATH.to_string(),
        timeout: Duration::from_secs(5),
    }
}

async fn serve_router(router: Router, m: &Material) -> (SocketAddr, CancellationToken) {
    let config = server_config(m.server_cert_pem.as_bytes(), m.server_key_pem.as_bytes()).unwrap();
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(serve_tls(listener, router, config, cancel.clone()));
    (addr, cancel)
}

#[tokio::test]
async fn fetches_root_from_proxy_engine() {
    let m = material();
    let engine = ProxyEngine::new(
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        TlsMaterial {
            cert_pem: m.server_cert_pem.clone().into_bytes(),
            key_pem: m.server_key_pem.clone().into_bytes(),
            root_pem: m.root_pem.clone().into_bytes(),
        },
    );
    let bound = engine.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(bound.run(cancel.clone()));

    let body = insecure_fetch_root_certificate(&fetch_config(addr), "127.0.0.1")
        .await
        .unwrap();
    assert_eq!(body, m.root_pem.as_bytes());

    let cert = RootCertificate::parse(&body).unwrap();
    assert!(short_text(&cert).unwrap().contains("devnet integration root"));
    assert!(!trusted(&cert));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn non_200_is_an_error_without_retry() {
    let m = material();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().fallback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { StatusCode::NOT_FOUND }
    });
    let (addr, cancel) = serve_router(router, &m).await;

    let err = insecure_fetch_root_certificate(&fetch_config(addr), "127.0.0.1")
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 404, .. }), "{err}");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    cancel.cancel();
}

#[tokio::test]
async fn connection_refused_is_transport_error() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = insecure_fetch_root_certificate(&fetch_config(addr), "127.0.0.1")
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport { .. }), "{err}");
}
