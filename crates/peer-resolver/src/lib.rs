//! Turns the remote endpoint of an SMTP connection into the client
//! name and address strings used for logging and access control.
//!
//! Resolution is best-effort: a name is only reported when the reverse
//! (PTR) lookup of the address yields a name whose forward lookup
//! contains that same address. Anything else degrades to the
//! [UNKNOWN] sentinel along with a [PeerCode] that lets policy tell a
//! transient failure apart from an authoritative one.
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

mod resolver;

pub use resolver::{HickoryResolver, ResolveError, Resolver, TestResolver};

/// Placeholder for a client name, address or protocol that
/// could not be determined.
pub const UNKNOWN: &str = "unknown";

/// How much confidence policy may place in a resolved peer name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerCode {
    /// The name was forward-confirmed
    Ok,
    /// Resolution failed transiently; a retry may succeed
    Temp,
    /// Resolution failed authoritatively, or the names didn't match
    Perm,
}

impl PeerCode {
    /// The SMTP reply class that corresponds to this outcome
    pub const fn reply_class(&self) -> u16 {
        match self {
            Self::Ok => 2,
            Self::Temp => 4,
            Self::Perm => 5,
        }
    }
}

/// The remote end of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEndpoint {
    Inet(SocketAddr),
    /// A pre-opened local stream, such as stdin when
    /// the server is invoked by hand
    Local,
}

impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Inet(addr) => addr.fmt(fmt),
            Self::Local => write!(fmt, "<local stream>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerIdentity {
    pub name: String,
    pub addr: String,
    /// `name[addr]`, the form used in log lines
    pub namaddr: String,
    pub port: Option<u16>,
    pub code: PeerCode,
}

impl PeerIdentity {
    pub fn new(name: &str, addr: &str, port: Option<u16>, code: PeerCode) -> Self {
        Self {
            name: name.to_string(),
            addr: addr.to_string(),
            namaddr: format!("{name}[{addr}]"),
            port,
            code,
        }
    }

    /// The identity assigned to a session on a local stream
    pub fn local() -> Self {
        Self::new("localhost", "127.0.0.1", None, PeerCode::Ok)
    }

    /// The identity used before, or in place of, any resolution
    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN, None, PeerCode::Perm)
    }
}

/// Report v4-mapped v6 addresses in their v4 form
fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Resolve the name of the peer at `endpoint`.
/// This never fails; the whole process is bounded by `timeout`, after
/// which the peer is treated as having a transiently unknown name.
pub async fn resolve_peer(
    resolver: &dyn Resolver,
    endpoint: &PeerEndpoint,
    timeout: Duration,
) -> PeerIdentity {
    let sock = match endpoint {
        PeerEndpoint::Local => return PeerIdentity::local(),
        PeerEndpoint::Inet(sock) => sock,
    };
    let ip = normalize_ip(sock.ip());
    let addr = ip.to_string();
    let port = Some(sock.port());

    match tokio::time::timeout(timeout, confirm_name(resolver, ip)).await {
        Ok(Ok(name)) => {
            tracing::debug!("{name}[{addr}]: forward-confirmed");
            PeerIdentity::new(&name, &addr, port, PeerCode::Ok)
        }
        Ok(Err(code)) => PeerIdentity::new(UNKNOWN, &addr, port, code),
        Err(_) => {
            tracing::warn!("{addr}: name lookup timed out after {timeout:?}");
            PeerIdentity::new(UNKNOWN, &addr, port, PeerCode::Temp)
        }
    }
}

/// Find a PTR name for `ip` whose forward lookup includes `ip`.
async fn confirm_name(resolver: &dyn Resolver, ip: IpAddr) -> Result<String, PeerCode> {
    let names = match resolver.resolve_ptr(ip).await {
        Ok(names) => names,
        Err(err) => {
            tracing::debug!("{ip}: reverse lookup failed: {err:#}");
            return Err(code_for(&err));
        }
    };

    let mut outcome = PeerCode::Perm;
    for name in names {
        let name = name.trim_end_matches('.');
        if name.is_empty() {
            continue;
        }
        if name.parse::<IpAddr>().is_ok() {
            tracing::warn!("{ip}: numeric hostname {name} in PTR record");
            continue;
        }

        match resolver.resolve_ip(name).await {
            Ok(addrs) => {
                if addrs.into_iter().map(normalize_ip).any(|a| a == ip) {
                    return Ok(name.to_string());
                }
                tracing::warn!("hostname {name} does not resolve to address {ip}");
            }
            Err(err) => {
                tracing::debug!("{ip}: forward lookup of {name} failed: {err:#}");
                if err.is_transient() {
                    outcome = PeerCode::Temp;
                }
            }
        }
    }
    Err(outcome)
}

fn code_for(err: &ResolveError) -> PeerCode {
    if err.is_transient() {
        PeerCode::Temp
    } else {
        PeerCode::Perm
    }
}
