//! Round-robin name resolution for the HTTP engine.
//!
//! A [`Resolver`] rotates through a fixed list of name servers, one server per
//! lookup, and is handed to the HTTP client explicitly. With no servers it
//! falls back to the system resolver.

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Upper bound for a single exchange with one name server.
pub const DIAL_TIMEOUT: Duration = Duration::from_millis(2000);

const DNS_PORT: u16 = 53;
const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;
const MAX_UDP_MESSAGE: usize = 512;

/// Transport used to ask one specific name server for a host's addresses.
pub trait NameServerLookup: Send + Sync {
    fn lookup<'a>(
        &'a self,
        server: SocketAddr,
        host: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + 'a>>;
}

#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

struct Inner {
    servers: Vec<SocketAddr>,
    next: AtomicUsize,
    lookup: Arc<dyn NameServerLookup>,
}

impl Resolver {
    /// Resolver querying `servers` over UDP, bounded by [`DIAL_TIMEOUT`].
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self::with_lookup(servers, Arc::new(UdpLookup::new(DIAL_TIMEOUT)))
    }

    pub fn with_lookup(servers: Vec<SocketAddr>, lookup: Arc<dyn NameServerLookup>) -> Self {
        Self {
            inner: Arc::new(Inner {
                servers,
                next: AtomicUsize::new(0),
                lookup,
            }),
        }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.inner.servers
    }

    /// Next server in rotation, `None` when resolution is left to the system.
    pub fn next_server(&self) -> Option<SocketAddr> {
        let servers = &self.inner.servers;
        if servers.is_empty() {
            return None;
        }
        let idx = self.inner.next.fetch_add(1, Ordering::Relaxed);
        Some(servers[idx % servers.len()])
    }

    pub async fn lookup_host(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        match self.next_server() {
            Some(server) => {
                debug!("Resolving {} via {}", host, server);
                self.inner.lookup.lookup(server, host).await
            }
            None => Ok(tokio::net::lookup_host((host, 0))
                .await?
                .map(|addr| addr.ip())
                .collect()),
        }
    }
}

impl Resolve for Resolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let ips = resolver.lookup_host(name.as_str()).await?;
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

/// Parses `ip[:port]` entries; a missing port means 53.
pub fn parse_server_list<S: AsRef<str>>(raw: &[S]) -> io::Result<Vec<SocketAddr>> {
    raw.iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .map(|addr| {
            addr.parse::<SocketAddr>()
                .or_else(|_| addr.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("given resolver address {addr:?} has a wrong format"),
                    )
                })
        })
        .collect()
}

/// Plain DNS over UDP: asks for A records, then AAAA if there were none.
pub struct UdpLookup {
    timeout: Duration,
}

impl UdpLookup {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl NameServerLookup for UdpLookup {
    fn lookup<'a>(
        &'a self,
        server: SocketAddr,
        host: &'a str,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + 'a>> {
        Box::pin(async move {
            let exchange = async {
                let mut addrs = query(server, host, TYPE_A).await?;
                if addrs.is_empty() {
                    addrs = query(server, host, TYPE_AAAA).await?;
                }
                Ok::<_, io::Error>(addrs)
            };
            let addrs = tokio::time::timeout(self.timeout, exchange)
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("name server {server} did not answer for {host}"),
                    )
                })??;
            if addrs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {host}"),
                ));
            }
            Ok(addrs)
        })
    }
}

async fn query(server: SocketAddr, host: &str, qtype: u16) -> io::Result<Vec<IpAddr>> {
    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;

    let id: u16 = rand::random();
    socket.send(&encode_query(id, host, qtype)?).await?;

    let mut buf = [0u8; MAX_UDP_MESSAGE];
    let n = socket.recv(&mut buf).await?;
    decode_response(id, &buf[..n])
}

fn encode_query(id: u16, host: &str, qtype: u16) -> io::Result<Vec<u8>> {
    let mut msg = Vec::with_capacity(18 + host.len());
    msg.extend_from_slice(&id.to_be_bytes());
    // recursion desired
    msg.extend_from_slice(&0x0100u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&[0; 6]);
    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid host name {host:?}"),
            ));
        }
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&qtype.to_be_bytes());
    msg.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(msg)
}

fn decode_response(id: u16, msg: &[u8]) -> io::Result<Vec<IpAddr>> {
    let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed DNS response");
    let read_u16 = |pos: usize| -> io::Result<u16> {
        msg.get(pos..pos + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(malformed)
    };

    if read_u16(0)? != id {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "DNS response id mismatch",
        ));
    }
    let flags = read_u16(2)?;
    if flags & 0x8000 == 0 {
        return Err(malformed());
    }
    match flags & 0x000f {
        0 => {}
        3 => return Ok(Vec::new()),
        rcode => {
            return Err(io::Error::other(format!(
                "name server answered with rcode {rcode}"
            )))
        }
    }

    let questions = read_u16(4)?;
    let answers = read_u16(6)?;
    let mut pos = 12;
    for _ in 0..questions {
        pos = skip_name(msg, pos)? + 4;
    }

    let mut addrs = Vec::new();
    for _ in 0..answers {
        pos = skip_name(msg, pos)?;
        let rtype = read_u16(pos)?;
        let rdlen = read_u16(pos + 8)? as usize;
        let start = pos + 10;
        let rdata = msg.get(start..start + rdlen).ok_or_else(malformed)?;
        match (rtype, rdata.len()) {
            (TYPE_A, 4) => addrs.push(IpAddr::from([rdata[0], rdata[1], rdata[2], rdata[3]])),
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addrs.push(IpAddr::from(octets));
            }
            _ => {}
        }
        pos = start + rdlen;
    }
    Ok(addrs)
}

/// Returns the offset just past the (possibly compressed) name at `pos`.
fn skip_name(msg: &[u8], mut pos: usize) -> io::Result<usize> {
    loop {
        let len = *msg
            .get(pos)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "truncated DNS name"))?;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xc0 == 0xc0 => return Ok(pos + 2),
            l => pos += 1 + l as usize,
        }
    }
}
