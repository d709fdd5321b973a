//! Trust-on-first-use retrieval of the root certificate from a running daemon.
//!
//! This is the only network call in the crate that skips certificate
//! verification. The bytes it returns are unverified until compared
//! out-of-band (for example with `trust show` on both machines).

use std::time::Duration;

use crate::config::DaemonConfig;
use crate::engine::ROOTS_PATH;
use crate::error::FetchError;

/// Where the roots endpoint lives and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            path: ROOTS_PATH.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl FetchConfig {
    pub fn from_config(cfg: &DaemonConfig) -> Self {
        Self {
            port: cfg.proxy.port,
            timeout: Duration::from_secs(cfg.trust.fetch_timeout_secs),
            ..Self::default()
        }
    }

    pub fn url(&self, host: &str) -> String {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        format!("https://{host}:{}{}", self.port, self.path)
    }
}

/// GET the roots endpoint on `host` with certificate verification disabled.
///
/// One attempt, no retry. Anything other than `200 OK` is an error; on
/// success the body is returned byte for byte.
pub async fn insecure_fetch_root_certificate(
    config: &FetchConfig,
    host: &str,
) -> Result<Vec<u8>, FetchError> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .no_proxy()
        .timeout(config.timeout)
        .build()
        .map_err(FetchError::Client)?;

    let url = config.url(host);
    log::warn!("Fetching {url} without certificate verification");

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|source| FetchError::Transport {
            url: url.clone(),
            source,
        })?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(FetchError::Status {
            url,
            status: status.as_u16(),
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|source| FetchError::Transport {
            url: url.clone(),
            source,
        })?;
    log::info!("Fetched {} bytes from {url}", body.len());
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_brackets_ipv6_hosts() {
        let config = FetchConfig::default();
        assert_eq!(config.url("example.test"), "https://example.test:8443/roots.pem");
        assert_eq!(config.url("::1"), "https://[::1]:8443/roots.pem");
        assert_eq!(config.url("[::1]"), "https://[::1]:8443/roots.pem");
    }

    #[test]
    fn follows_daemon_config() {
        let mut cfg = DaemonConfig::default();
        cfg.proxy.port = 9443;
        cfg.trust.fetch_timeout_secs = 3;
        let config = FetchConfig::from_config(&cfg);
        assert_eq!(config.port, 9443);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.path, ROOTS_PATH);
    }
}
