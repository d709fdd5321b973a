//! Static, non-recursive DNS engine for the reserved TLD.
//!
//! Answers A/AAAA for a fixed host map over UDP and TCP. Names under the TLD
//! that are not in the map get `NXDOMAIN`; names outside it get `REFUSED`.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::Engine;
use crate::config::DaemonConfig;

const DEFAULT_TTL: u32 = 60;
const MAX_UDP_MESSAGE: usize = 4096;

/// Fixed answers for hostnames under one TLD.
#[derive(Debug, Clone)]
pub struct StaticZone {
    tld: String,
    hosts: BTreeMap<String, IpAddr>,
    ttl: u32,
}

impl StaticZone {
    pub fn new(tld: &str, hosts: BTreeMap<String, IpAddr>) -> Self {
        Self {
            tld: tld.trim_matches('.').to_ascii_lowercase(),
            hosts: hosts
                .into_iter()
                .map(|(name, ip)| (normalize(&name), ip))
                .collect(),
            ttl: DEFAULT_TTL,
        }
    }

    fn contains(&self, name: &str) -> bool {
        name == self.tld || name.ends_with(&format!(".{}", self.tld))
    }

    /// Build the wire-format reply for a wire-format request.
    ///
    /// Returns `None` for undecodable input and for messages that are not
    /// queries; those are dropped silently.
    pub fn answer(&self, request: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(request) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("dropping malformed DNS message: {e}");
                return None;
            }
        };
        if request.message_type() != MessageType::Query {
            return None;
        }

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_authoritative(true)
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(false);

        if request.op_code() != OpCode::Query {
            response.set_response_code(ResponseCode::NotImp);
            return encode(&response);
        }

        let mut code = ResponseCode::NoError;
        for query in request.queries() {
            response.add_query(query.clone());
            let name = normalize(&query.name().to_ascii());
            if !self.contains(&name) {
                code = ResponseCode::Refused;
                continue;
            }
            match self.hosts.get(&name) {
                None => code = ResponseCode::NXDomain,
                Some(ip) => {
                    if let Some(rdata) = rdata_for(query.query_type(), *ip) {
                        response.add_answer(Record::from_rdata(
                            query.name().clone(),
                            self.ttl,
                            rdata,
                        ));
                    }
                }
            }
        }
        response.set_response_code(code);
        encode(&response)
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn rdata_for(query_type: RecordType, ip: IpAddr) -> Option<RData> {
    match (query_type, ip) {
        (RecordType::A | RecordType::ANY, IpAddr::V4(v4)) => Some(RData::A(A(v4))),
        (RecordType::AAAA | RecordType::ANY, IpAddr::V6(v6)) => Some(RData::AAAA(AAAA(v6))),
        _ => None,
    }
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| log::warn!("failed to encode DNS response: {e}"))
        .ok()
}

/// Listener settings plus the zone to serve.
#[derive(Debug, Clone)]
pub struct DnsEngine {
    bind: IpAddr,
    udp_port: u16,
    tcp_port: u16,
    ipv6: bool,
    zone: StaticZone,
}

impl DnsEngine {
    pub fn new(bind: IpAddr, udp_port: u16, tcp_port: u16, ipv6: bool, zone: StaticZone) -> Self {
        Self {
            bind,
            udp_port,
            tcp_port,
            ipv6,
            zone,
        }
    }

    pub fn from_config(cfg: &DaemonConfig) -> Self {
        Self::new(
            cfg.dns.bind,
            cfg.dns.udp_port,
            cfg.dns.tcp_port,
            cfg.dns.ipv6,
            StaticZone::new(&cfg.tld, cfg.dns_hosts()),
        )
    }

    /// Bind every socket up front so port conflicts surface before serving.
    pub async fn bind(self) -> Result<BoundDns> {
        let mut addrs = vec![self.bind];
        if self.ipv6 && !self.bind.is_ipv6() {
            addrs.push(IpAddr::V6(Ipv6Addr::LOCALHOST));
        }

        let mut udp = Vec::new();
        let mut tcp = Vec::new();
        for ip in addrs {
            let udp_addr = SocketAddr::new(ip, self.udp_port);
            let tcp_addr = SocketAddr::new(ip, self.tcp_port);
            let bound = async {
                let socket = UdpSocket::bind(udp_addr)
                    .await
                    .with_context(|| format!("Failed to bind DNS UDP on {udp_addr}"))?;
                let listener = TcpListener::bind(tcp_addr)
                    .await
                    .with_context(|| format!("Failed to bind DNS TCP on {tcp_addr}"))?;
                anyhow::Ok((socket, listener))
            }
            .await;
            match bound {
                Ok((socket, listener)) => {
                    udp.push(socket);
                    tcp.push(listener);
                }
                // IPv6 loopback is best-effort; hosts without it still serve IPv4.
                Err(e) if ip.is_ipv6() && ip != self.bind => {
                    log::warn!("Skipping IPv6 DNS listeners: {e:#}");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(BoundDns {
            udp,
            tcp,
            zone: Arc::new(self.zone),
        })
    }
}

impl Engine for DnsEngine {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn serve(self, cancel: CancellationToken) -> Result<()> {
        self.bind().await?.run(cancel).await
    }
}

/// Sockets bound by [`DnsEngine::bind`], ready to serve.
pub struct BoundDns {
    udp: Vec<UdpSocket>,
    tcp: Vec<TcpListener>,
    zone: Arc<StaticZone>,
}

impl BoundDns {
    pub fn udp_addrs(&self) -> Vec<SocketAddr> {
        self.udp.iter().filter_map(|s| s.local_addr().ok()).collect()
    }

    pub fn tcp_addrs(&self) -> Vec<SocketAddr> {
        self.tcp.iter().filter_map(|l| l.local_addr().ok()).collect()
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        for addr in self.udp_addrs() {
            log::info!("DNS listening on udp://{addr}");
        }
        for addr in self.tcp_addrs() {
            log::info!("DNS listening on tcp://{addr}");
        }

        let mut tasks = JoinSet::new();
        for socket in self.udp {
            tasks.spawn(serve_udp(socket, self.zone.clone(), cancel.clone()));
        }
        for listener in self.tcp {
            tasks.spawn(serve_tcp(listener, self.zone.clone(), cancel.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    cancel.cancel();
                    return Err(e);
                }
                Err(e) => {
                    cancel.cancel();
                    return Err(e).context("DNS listener task panicked");
                }
            }
        }
        log::info!("DNS engine stopped");
        Ok(())
    }
}

async fn serve_udp(socket: UdpSocket, zone: Arc<StaticZone>, cancel: CancellationToken) -> Result<()> {
    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer) = match received {
            Ok(r) => r,
            Err(e) => {
                log::debug!("DNS UDP receive error: {e}");
                continue;
            }
        };
        if let Some(reply) = zone.answer(&buf[..len])
            && let Err(e) = socket.send_to(&reply, peer).await
        {
            log::debug!("DNS UDP reply to {peer} failed: {e}");
        }
    }
}

async fn serve_tcp(listener: TcpListener, zone: Arc<StaticZone>, cancel: CancellationToken) -> Result<()> {
    let mut connections = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let zone = zone.clone();
                let cancel = cancel.clone();
                connections.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = serve_tcp_connection(stream, &zone) => {
                            if let Err(e) = result {
                                log::debug!("DNS TCP connection from {peer} ended: {e}");
                            }
                        }
                    }
                });
            }
            Err(e) => log::debug!("DNS TCP accept error: {e}"),
        }
        // reap finished connections
        while connections.try_join_next().is_some() {}
    }
    connections.shutdown().await;
    Ok(())
}

/// Length-prefixed messages, answered in order until the client closes.
async fn serve_tcp_connection(mut stream: TcpStream, zone: &StaticZone) -> std::io::Result<()> {
    loop {
        let len = match stream.read_u16().await {
            Ok(len) => usize::from(len),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut request = vec![0u8; len];
        stream.read_exact(&mut request).await?;

        let Some(reply) = zone.answer(&request) else {
            continue;
        };
        let reply_len = u16::try_from(reply.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "reply too large"))?;
        stream.write_u16(reply_len).await?;
        stream.write_all(&reply).await?;
        stream.flush().await?;
    }
}
