//! Loopback port probe run before installation.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::time::Duration;

/// Transport a probe connects over. Only TCP handshakes are observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "TCP",
        })
    }
}

/// A port observed in use on loopback.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port {
    pub service: String,
    pub protocol: Protocol,
    pub number: u16,
}

impl Port {
    pub fn tcp(service: &str, number: u16) -> Self {
        Self {
            service: service.to_string(),
            protocol: Protocol::Tcp,
            number,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.service, self.protocol, self.number)
    }
}

/// Connects to each candidate port on `127.0.0.1` and `::1`.
///
/// A completed handshake means something owns the port. The stream is dropped
/// immediately; no bytes are exchanged.
#[derive(Debug, Clone)]
pub struct PortProbe {
    candidates: Vec<Port>,
    timeout: Duration,
}

impl PortProbe {
    pub fn new(candidates: Vec<Port>, timeout: Duration) -> Self {
        Self {
            candidates,
            timeout,
        }
    }

    /// HTTP on 80 and the DNS engine's TCP port.
    pub fn well_known(dns_port: u16, timeout: Duration) -> Self {
        Self::new(
            vec![Port::tcp("HTTP", 80), Port::tcp("DNS", dns_port)],
            timeout,
        )
    }

    pub fn ports_in_use(&self) -> BTreeSet<Port> {
        self.candidates
            .iter()
            .filter(|port| self.occupied(port.number))
            .cloned()
            .collect()
    }

    fn occupied(&self, number: u16) -> bool {
        [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ]
        .into_iter()
        .any(|ip| {
            let addr = SocketAddr::new(ip, number);
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    drop(stream);
                    log::debug!("{addr} accepted a probe connection");
                    true
                }
                Err(_) => false,
            }
        })
    }
}
