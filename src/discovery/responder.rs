//! Discovery responder (manager role)
//!
//! Stateless: the only thing it knows is its own session name and the relay
//! address to hand out. Probes for other sessions sharing the group are left
//! unanswered.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::session::SessionName;

use super::net::bind_group_socket;
use super::wire::{PeerAddress, ProbeMessage, ResponseMessage, MAX_DATAGRAM_SIZE};

/// What happened to one inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Name matched, reply sent to the given address
    Answered(SocketAddr),

    /// Probe for another session
    Ignored(String),

    /// Not a probe
    Malformed,
}

/// Answers probes for one session
pub struct Responder {
    socket: UdpSocket,
    session: SessionName,
    advertise: PeerAddress,
}

impl Responder {
    /// Bind the discovery group and prepare to advertise `advertise`
    pub fn bind(
        session: SessionName,
        group: SocketAddrV4,
        interface: Option<Ipv4Addr>,
        advertise: PeerAddress,
    ) -> Result<Self> {
        let socket = bind_group_socket(group, interface)?;
        info!(session = %session, group = %group, advertise = %advertise, "Discovery responder bound");
        Ok(Self {
            socket,
            session,
            advertise,
        })
    }

    /// Address the responder is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the receive loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(error = %e, "Discovery responder stopped");
            }
        })
    }

    /// Receive loop; only an unrecoverable socket error ends it
    pub async fn run(self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    debug!(error = %e, "Ignoring reset on discovery socket");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.handle_datagram(&buf[..n], src).await;
        }
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) -> ProbeOutcome {
        let probe = match ProbeMessage::parse(data) {
            Ok(probe) => probe,
            Err(e) => {
                warn!(from = %src, error = %e, "Discarding malformed probe");
                return ProbeOutcome::Malformed;
            }
        };

        if probe.session != self.session.as_str() {
            debug!(from = %src, session = %probe.session, "Saw probe for another session");
            return ProbeOutcome::Ignored(probe.session);
        }

        let reply = ResponseMessage {
            manager: self.advertise,
        };
        match self.socket.send_to(reply.encode().as_bytes(), probe.reply_to).await {
            Ok(_) => debug!(to = %probe.reply_to, "Answered probe"),
            Err(e) => warn!(to = %probe.reply_to, error = %e, "Failed to answer probe"),
        }
        ProbeOutcome::Answered(probe.reply_to)
    }
}
