use crate::error::SessionError;
use peer_resolver::PeerEndpoint;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Describes the connection a session runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transport {
    pub peer: PeerEndpoint,
    pub local: Option<SocketAddr>,
}

impl Transport {
    pub fn inet(peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            peer: PeerEndpoint::Inet(peer),
            local: Some(local),
        }
    }

    /// A session on a pre-opened local stream, such as stdin
    pub fn local() -> Self {
        Self {
            peer: PeerEndpoint::Local,
            local: None,
        }
    }

    pub fn from_tcp_stream(stream: &TcpStream) -> Result<Self, SessionError> {
        Ok(Self::inet(stream.peer_addr()?, stream.local_addr()?))
    }

    pub fn is_local(&self) -> bool {
        matches!(self.peer, PeerEndpoint::Local)
    }
}

/// The identity of the process running a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub uid: u32,
}

impl ProcessIdentity {
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
        }
    }
}
