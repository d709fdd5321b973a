//! Parsed root certificates, summaries and trust checks.

use std::fmt::Write as _;
use std::path::Path;

use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::parse_x509_certificate;
use x509_parser::time::ASN1Time;

use crate::error::TrustError;

/// A single X.509 certificate, kept as DER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCertificate {
    der: Vec<u8>,
}

impl RootCertificate {
    /// Accepts PEM (first `CERTIFICATE` block wins) or raw DER.
    pub fn parse(bytes: &[u8]) -> Result<Self, TrustError> {
        let der = match pem::parse_many(bytes) {
            Ok(blocks) if !blocks.is_empty() => blocks
                .into_iter()
                .find(|block| block.tag() == "CERTIFICATE")
                .map(|block| block.into_contents())
                .ok_or_else(|| TrustError::Certificate("no CERTIFICATE block in PEM".into()))?,
            _ => bytes.to_vec(),
        };
        let cert = Self { der };
        cert.x509()?;
        Ok(cert)
    }

    pub fn read(path: &Path) -> Result<Self, TrustError> {
        let bytes = std::fs::read(path)
            .map_err(|e| TrustError::Certificate(format!("{}: {e}", path.display())))?;
        Self::parse(&bytes)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    fn x509(&self) -> Result<X509Certificate<'_>, TrustError> {
        parse_x509_certificate(&self.der)
            .map(|(_, cert)| cert)
            .map_err(|e| TrustError::Certificate(e.to_string()))
    }

    /// Lowercase hex of the raw serial number.
    pub fn serial_hex(&self) -> Result<String, TrustError> {
        Ok(hex::encode(self.x509()?.raw_serial()))
    }

    /// Colon-separated uppercase SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.der);
        digest
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

fn render_time(time: &ASN1Time) -> String {
    chrono::DateTime::from_timestamp(time.timestamp(), 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| time.timestamp().to_string())
}

/// Multi-line human summary of a certificate.
pub fn short_text(cert: &RootCertificate) -> Result<String, TrustError> {
    let x509 = cert.x509()?;
    let validity = x509.validity();
    let mut out = String::new();
    let lines = [
        ("Subject", x509.subject().to_string()),
        ("Issuer", x509.issuer().to_string()),
        ("Serial", hex::encode(x509.raw_serial())),
        ("Not before", render_time(&validity.not_before)),
        ("Not after", render_time(&validity.not_after)),
        ("CA", if x509.is_ca() { "yes" } else { "no" }.to_string()),
        ("SHA-256", cert.fingerprint()),
    ];
    for (key, value) in lines {
        writeln!(out, "{key:<11}{value}")
            .map_err(|e| TrustError::Certificate(format!("failed to format certificate: {e}")))?;
    }
    Ok(out)
}

/// Whether `cert` chains to the host's trust roots.
///
/// Failures of any kind, including an unreadable root store, yield `false`.
pub fn trusted(cert: &RootCertificate) -> bool {
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        log::debug!("skipping unreadable trust root: {e}");
    }
    trusted_with_roots(cert, &native.certs)
}

/// True when `cert` is currently valid and is either one of `roots` or
/// directly signed by one.
pub fn trusted_with_roots(cert: &RootCertificate, roots: &[CertificateDer<'_>]) -> bool {
    let Ok(x509) = cert.x509() else {
        return false;
    };
    if !x509.validity().is_valid() {
        return false;
    }

    roots.iter().any(|root| {
        if root.as_ref() == cert.der() {
            return true;
        }
        let Ok((_, issuer)) = parse_x509_certificate(root.as_ref()) else {
            return false;
        };
        issuer.subject().as_raw() == x509.issuer().as_raw()
            && issuer.validity().is_valid()
            && x509.verify_signature(Some(issuer.public_key())).is_ok()
    })
}
