use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Directory name used under the platform config and data directories.
pub const APP_DIR: &str = "devnet";

/// Top‑level daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Service manager label (launchd label / systemd unit stem).
    pub label: String,
    /// Reserved top-level domain served by the DNS engine.
    pub tld: String,
    /// Override for the resolver directory; `None` uses the platform default.
    pub resolver_dir: Option<PathBuf>,
    /// Delay between `start` and the liveness re-check.
    pub settle_delay_ms: u64,
    /// Connect timeout for the pre-install port probe.
    pub probe_timeout_ms: u64,
    /// Upper bound on engine shutdown after a termination signal.
    pub shutdown_timeout_secs: u64,
    pub dns: DnsConfig,
    pub proxy: ProxyConfig,
    pub trust: TrustConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub bind: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    /// Also listen on the IPv6 loopback address.
    pub ipv6: bool,
    /// Static answers. Empty means `example.<tld>` and `www.example.<tld>`.
    pub hosts: BTreeMap<String, IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Directory holding `server.crt`, `server.key` and `root.pem`.
    pub cert_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Prefix for trust-store nicknames and aliases.
    pub nickname: String,
    pub fetch_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            label: "dev.devnet.devnetd".into(),
            tld: "test".into(),
            resolver_dir: None,
            settle_delay_ms: 1000,
            probe_timeout_ms: 250,
            shutdown_timeout_secs: 5,
            dns: DnsConfig::default(),
            proxy: ProxyConfig::default(),
            trust: TrustConfig::default(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: 8053,
            tcp_port: 8053,
            ipv6: true,
            hosts: BTreeMap::new(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8443,
            cert_dir: None,
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            nickname: "devnet".into(),
            fetch_timeout_secs: 10,
        }
    }
}

impl DaemonConfig {
    /// Default config path: `<config_dir>/devnet/devnet.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(format!("{APP_DIR}.toml")))
    }

    /// Load from `path` (defaults when the file is absent), then apply
    /// environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            log::debug!("no config at {}, using defaults", path.display());
            Self::default()
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write the default configuration if `path` does not exist yet.
    pub fn write_default_if_missing(path: &Path) -> anyhow::Result<bool> {
        use anyhow::Context;

        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let body = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;
        fs::write(path, body).context("Failed to write config file")?;
        log::info!("Created default configuration at {}", path.display());
        Ok(true)
    }

    /// Apply every entry of [`ENV_BINDINGS`] whose key `lookup` resolves.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        for binding in ENV_BINDINGS {
            if let Some(value) = lookup(binding.key) {
                (binding.apply)(self, value.trim()).map_err(|reason| ConfigError::Invalid {
                    key: binding.key,
                    reason,
                })?;
                log::debug!("{} overrides configuration", binding.key);
            }
        }
        Ok(())
    }

    /// `DEVNET_*` variables that `lookup` resolves, keyed by name.
    pub fn env_overrides(lookup: impl Fn(&str) -> Option<String>) -> BTreeMap<String, String> {
        ENV_BINDINGS
            .iter()
            .filter_map(|binding| lookup(binding.key).map(|value| (binding.key.to_string(), value)))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.label.trim().is_empty() {
            return Err(invalid("label", "must not be empty"));
        }
        validate_tld(&self.tld).map_err(|reason| ConfigError::Invalid { key: "tld", reason })?;
        // the resolver override names this address as its nameserver
        if self.dns.bind.is_unspecified() {
            return Err(ConfigError::Invalid {
                key: "dns.bind",
                reason: format!("{} cannot be used as a nameserver address", self.dns.bind),
            });
        }
        if self.dns.udp_port == 0 || self.dns.tcp_port == 0 {
            return Err(invalid("dns", "ports must be non-zero"));
        }
        if self.trust.fetch_timeout_secs == 0 {
            return Err(invalid("trust.fetch_timeout_secs", "must be non-zero"));
        }
        if self.proxy.port == 0 {
            return Err(invalid("proxy.port", "must be non-zero"));
        }
        let suffix = format!(".{}", self.tld);
        for name in self.dns.hosts.keys() {
            if !name.to_ascii_lowercase().ends_with(&suffix) {
                return Err(ConfigError::Invalid {
                    key: "dns.hosts",
                    reason: format!("{name} is not under .{}", self.tld),
                });
            }
        }
        Ok(())
    }

    /// Static DNS answers, falling back to the two example hosts.
    pub fn dns_hosts(&self) -> BTreeMap<String, IpAddr> {
        if !self.dns.hosts.is_empty() {
            return self
                .dns
                .hosts
                .iter()
                .map(|(name, ip)| (name.trim_end_matches('.').to_ascii_lowercase(), *ip))
                .collect();
        }
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        BTreeMap::from([
            (format!("example.{}", self.tld), loopback),
            (format!("www.example.{}", self.tld), loopback),
        ])
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.proxy
            .cert_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("certs"))
    }
}

/// Per-user data directory (`<data_local_dir>/devnet`).
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join(APP_DIR)
}

/// TLS material served by the proxy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub root: PathBuf,
}

impl CertPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert: dir.join("server.crt"),
            key: dir.join("server.key"),
            root: dir.join("root.pem"),
        }
    }
}

/// Look for TLS material in the configured directory, then the system-wide one.
pub fn discover_certificate_paths(cfg: &DaemonConfig) -> Option<CertPaths> {
    let mut search = vec![cfg.cert_dir()];
    #[cfg(target_os = "macos")]
    search.push(PathBuf::from("/usr/local/var/devnet/certs"));
    #[cfg(target_os = "linux")]
    search.push(PathBuf::from("/var/lib/devnet/certs"));

    for dir in search {
        let paths = CertPaths::in_dir(&dir);
        if paths.cert.exists() && paths.key.exists() && paths.root.exists() {
            log::info!("Discovered TLS material in {}", dir.display());
            return Some(paths);
        }
    }
    log::info!("No TLS material found, the HTTPS roots endpoint will not start");
    None
}

struct EnvBinding {
    key: &'static str,
    apply: fn(&mut DaemonConfig, &str) -> Result<(), String>,
}

/// Environment overrides, applied in order after the file is read.
const ENV_BINDINGS: &[EnvBinding] = &[
    EnvBinding { key: "DEVNET_LABEL", apply: set_label },
    EnvBinding { key: "DEVNET_TLD", apply: set_tld },
    EnvBinding { key: "DEVNET_DNS_BIND", apply: set_dns_bind },
    EnvBinding { key: "DEVNET_DNS_PORT", apply: set_dns_port },
    EnvBinding { key: "DEVNET_DNS_IPV6", apply: set_dns_ipv6 },
    EnvBinding { key: "DEVNET_PROXY_PORT", apply: set_proxy_port },
    EnvBinding { key: "DEVNET_RESOLVER_DIR", apply: set_resolver_dir },
    EnvBinding { key: "DEVNET_SETTLE_MS", apply: set_settle_ms },
];

fn set_label(cfg: &mut DaemonConfig, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("must not be empty".into());
    }
    cfg.label = value.to_string();
    Ok(())
}

fn set_tld(cfg: &mut DaemonConfig, value: &str) -> Result<(), String> {
    validate_tld(value)?;
    cfg.tld = value.to_string();
    Ok(())
}

fn set_dns_bind(cfg: &mut DaemonConfig, value: &str) -> Result<(), String> {
    cfg.dns.bind = value.parse().map_err(|e| format!("{value:?}: {e}"))?;
    Ok(())
}

fn set_dns_port(cfg: &mut DaemonConfig, value: &str) -> Result<(), String> {
    let port = parse_port(value)?;
    cfg.dns.udp_port = port;
    cfg.dns.tcp_port = port;
    Ok(())
}

fn set_dns_ipv6(cfg: &mut DaemonConfig, value: &str) -> Result<(), String> {
    cfg.dns.ipv6 = parse_bool(value)?;
    Ok(())
}

fn set_proxy_port(cfg: &mut DaemonConfig, value: &str) -> Result<(), String> {
    cfg.proxy.port = parse_port(value)?;
    Ok(())
}

fn set_resolver_dir(cfg: &mut DaemonConfig, value: &str) -> Result<(), String> {
    let path = PathBuf::from(value);
    if !path.is_absolute() {
        return Err(format!("{value:?} is not an absolute path"));
    }
    cfg.resolver_dir = Some(path);
    Ok(())
}

fn set_settle_ms(cfg: &mut DaemonConfig, value: &str) -> Result<(), String> {
    cfg.settle_delay_ms = value.parse().map_err(|e| format!("{value:?}: {e}"))?;
    Ok(())
}

fn parse_port(value: &str) -> Result<u16, String> {
    match value.parse::<u16>() {
        Ok(0) => Err("port must be non-zero".into()),
        Ok(port) => Ok(port),
        Err(e) => Err(format!("{value:?}: {e}")),
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("{value:?} is not a boolean")),
    }
}

fn validate_tld(tld: &str) -> Result<(), String> {
    if tld.is_empty() {
        return Err("must not be empty".into());
    }
    if !tld
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!("{tld:?} must be a single lowercase label"));
    }
    Ok(())
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = DaemonConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.dns.udp_port, 8053);
        assert_eq!(cfg.proxy.port, 8443);
    }

    #[test]
    fn default_hosts_follow_tld() {
        let cfg = DaemonConfig {
            tld: "dev".into(),
            ..Default::default()
        };
        let hosts = cfg.dns_hosts();
        assert_eq!(hosts.len(), 2);
        assert!(hosts.contains_key("example.dev"));
        assert!(hosts.contains_key("www.example.dev"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = DaemonConfig::default();
        cfg.apply_env(env(&[
            ("DEVNET_TLD", "local-dev"),
            ("DEVNET_DNS_PORT", "5353"),
            ("DEVNET_DNS_IPV6", "off"),
        ]))
        .unwrap();
        assert_eq!(cfg.tld, "local-dev");
        assert_eq!(cfg.dns.udp_port, 5353);
        assert_eq!(cfg.dns.tcp_port, 5353);
        assert!(!cfg.dns.ipv6);
    }

    #[test]
    fn env_rejects_bad_values_with_key() {
        let mut cfg = DaemonConfig::default();
        let err = cfg.apply_env(env(&[("DEVNET_PROXY_PORT", "0")])).unwrap_err();
        assert!(err.to_string().contains("DEVNET_PROXY_PORT"));

        let err = cfg.apply_env(env(&[("DEVNET_TLD", "Not.A.Tld")])).unwrap_err();
        assert!(err.to_string().contains("DEVNET_TLD"));
    }

    #[test]
    fn unspecified_dns_bind_is_rejected() {
        for bind in ["0.0.0.0", "::"] {
            let mut cfg = DaemonConfig::default();
            cfg.apply_env(env(&[("DEVNET_DNS_BIND", bind)])).unwrap();
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("dns.bind"), "{err}");
        }
    }

    #[test]
    fn zero_fetch_timeout_is_rejected() {
        let mut cfg = DaemonConfig::default();
        cfg.trust.fetch_timeout_secs = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("trust.fetch_timeout_secs"), "{err}");
    }

    #[test]
    fn env_overrides_only_report_known_keys() {
        let overrides = DaemonConfig::env_overrides(env(&[
            ("DEVNET_DNS_PORT", "9053"),
            ("DEVNET_UNRELATED", "x"),
            ("HOME", "/home/dev"),
        ]));
        assert_eq!(
            overrides,
            BTreeMap::from([("DEVNET_DNS_PORT".to_string(), "9053".to_string())])
        );
    }

    #[test]
    fn hosts_must_live_under_tld() {
        let mut cfg = DaemonConfig::default();
        cfg.dns
            .hosts
            .insert("api.example.com".into(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_missing_file_uses_defaults_and_partial_file_merges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devnet.toml");

        let cfg = DaemonConfig::load(&path).unwrap();
        assert_eq!(cfg.tld, DaemonConfig::default().tld);

        fs::write(&path, "tld = \"box\"\n[dns]\nudp_port = 9053\n").unwrap();
        let cfg = DaemonConfig::load(&path).unwrap();
        assert_eq!(cfg.tld, "box");
        assert_eq!(cfg.dns.udp_port, 9053);
        assert_eq!(cfg.dns.tcp_port, 8053);
    }

    #[test]
    fn write_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devnet.toml");
        assert!(DaemonConfig::write_default_if_missing(&path).unwrap());
        assert!(!DaemonConfig::write_default_if_missing(&path).unwrap());

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: DaemonConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed, DaemonConfig::default());
    }
}
