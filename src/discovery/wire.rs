//! Discovery datagram formats
//!
//! Probe:  `<session>:<reply host>:<reply port>` (UTF-8)
//! Reply:  `<manager host>:<manager port>` (UTF-8)
//!
//! Probes are split from the right so session names may contain `:`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Largest datagram read by either side
pub const MAX_DATAGRAM_SIZE: usize = 8192;

// ─────────────────────────────────────────────────────────────────
// Peer Address
// ─────────────────────────────────────────────────────────────────

/// Reachable relay address of a session manager
///
/// Ordered so that competing managers can agree on a winner
/// (lowest address keeps the session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<SocketAddr>()
            .map(Self)
            .map_err(|e| Error::malformed(format!("invalid address '{}': {}", s, e)))
    }
}

// ─────────────────────────────────────────────────────────────────
// Probe
// ─────────────────────────────────────────────────────────────────

/// Probe sent by a process looking for a session's manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMessage {
    /// Session the prober wants to join
    pub session: String,

    /// Where the manager should send its reply
    pub reply_to: SocketAddr,
}

impl ProbeMessage {
    pub fn new(session: impl Into<String>, reply_to: SocketAddr) -> Self {
        Self {
            session: session.into(),
            reply_to,
        }
    }

    /// Encode to the wire text form
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.session, self.reply_to.ip(), self.reply_to.port())
    }

    /// Parse a received datagram
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::malformed("probe is not valid UTF-8"))?;

        let mut parts = text.trim_end().rsplitn(3, ':');
        let port = parts.next().unwrap_or_default();
        let host = parts
            .next()
            .ok_or_else(|| Error::malformed(format!("probe '{}' has no reply host", text)))?;
        let session = parts
            .next()
            .ok_or_else(|| Error::malformed(format!("probe '{}' has no session name", text)))?;

        if session.is_empty() {
            return Err(Error::malformed("probe has an empty session name"));
        }

        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::malformed(format!("invalid reply host '{}'", host)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::malformed(format!("invalid reply port '{}'", port)))?;

        Ok(Self {
            session: session.to_string(),
            reply_to: SocketAddr::new(ip, port),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Reply
// ─────────────────────────────────────────────────────────────────

/// Reply from a manager whose session matched the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseMessage {
    pub manager: PeerAddress,
}

impl ResponseMessage {
    pub fn encode(&self) -> String {
        self.manager.to_string()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::malformed("reply is not valid UTF-8"))?;
        Ok(Self {
            manager: text.parse()?,
        })
    }
}
