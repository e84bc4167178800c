//! Discovery probe (client role)
//!
//! Sends a single probe and races the reply against a deadline. The reply
//! listener owns the ephemeral socket, so when the deadline wins the listener
//! future is dropped and the socket is closed with it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::SessionName;

use super::net::primary_ipv4;
use super::wire::{PeerAddress, ProbeMessage, ResponseMessage, MAX_DATAGRAM_SIZE};

/// How a probe is sent and how long it waits
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Discovery group (or a plain unicast address)
    pub group: SocketAddrV4,

    /// How long to wait for a manager to answer
    pub timeout: Duration,

    /// Pin the local address instead of resolving the primary interface
    pub interface: Option<Ipv4Addr>,

    /// Replies carrying this address are not counted (a manager's own responder)
    pub ignore: Option<PeerAddress>,
}

impl ProbeOptions {
    pub fn new(group: SocketAddrV4, timeout: Duration) -> Self {
        Self {
            group,
            timeout,
            interface: None,
            ignore: None,
        }
    }
}

/// Look for the manager of `session`
///
/// Returns `Ok(None)` when nobody answered before the deadline; that is the
/// signal to become the manager, not an error. The first usable reply wins.
/// Failing to pick an address, bind or send is a configuration error.
pub async fn discover(session: &SessionName, options: &ProbeOptions) -> Result<Option<PeerAddress>> {
    let socket = send_probe(session, options).await?;

    match tokio::time::timeout(options.timeout, await_reply(socket, options.ignore)).await {
        Ok(Ok(manager)) => {
            info!(session = %session, manager = %manager, "Manager found");
            Ok(Some(manager))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            info!(
                session = %session,
                timeout_ms = options.timeout.as_millis() as u64,
                "No manager response"
            );
            Ok(None)
        }
    }
}

/// Like [`discover`], but listens for the whole timeout and returns the
/// lowest manager address that answered
///
/// Used to settle a race between managers: every one of them converges on
/// the same winner no matter whose reply arrives first.
pub async fn discover_lowest(session: &SessionName, options: &ProbeOptions) -> Result<Option<PeerAddress>> {
    let socket = send_probe(session, options).await?;
    let deadline = tokio::time::Instant::now() + options.timeout;

    let mut lowest: Option<PeerAddress> = None;
    let mut answers = 0usize;
    loop {
        match tokio::time::timeout_at(deadline, await_reply_on(&socket, options.ignore)).await {
            Ok(Ok(manager)) => {
                answers += 1;
                lowest = Some(lowest.map_or(manager, |current| current.min(manager)));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }

    debug!(session = %session, answers = answers, lowest = ?lowest, "Discovery window closed");
    Ok(lowest)
}

/// Bind the ephemeral reply socket and send one probe from it
async fn send_probe(session: &SessionName, options: &ProbeOptions) -> Result<UdpSocket> {
    let local_ip = primary_ipv4(options.group, options.interface)?;
    let bind_addr = SocketAddr::from((local_ip, 0));
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|source| Error::BindFailed { addr: bind_addr, source })?;
    let reply_to = socket.local_addr()?;

    if options.group.ip().is_multicast() {
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(true)?;
    }

    let probe = ProbeMessage::new(session.as_str(), reply_to);
    let target = SocketAddr::V4(options.group);
    socket
        .send_to(probe.encode().as_bytes(), target)
        .await
        .map_err(|source| Error::SendFailed { addr: target, source })?;

    info!(session = %session, reply_to = %reply_to, group = %target, "Probing for session manager");
    Ok(socket)
}

/// Wait for the first usable reply; takes ownership of the socket
async fn await_reply(socket: UdpSocket, ignore: Option<PeerAddress>) -> Result<PeerAddress> {
    await_reply_on(&socket, ignore).await
}

async fn await_reply_on(socket: &UdpSocket, ignore: Option<PeerAddress>) -> Result<PeerAddress> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // ICMP port-unreachable surfaces here on some platforms
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(error = %e, "Ignoring reset on probe socket");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match ResponseMessage::parse(&buf[..n]) {
            Ok(reply) if Some(reply.manager) == ignore => {
                debug!(from = %src, "Ignoring own responder");
            }
            Ok(reply) => return Ok(reply.manager),
            Err(e) => warn!(from = %src, error = %e, "Discarding malformed reply"),
        }
    }
}
