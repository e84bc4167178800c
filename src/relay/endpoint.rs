//! Relay endpoints
//!
//! An endpoint is anything that can hand payloads to the hub and accept
//! payloads fanned out by it: the local console or a remote WebSocket.
//! [`serve_endpoint`] is the single pump shared by every kind.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::hub::RelayHub;

/// Process-unique endpoint identity
pub type EndpointId = u64;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// What sits on the other end of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Local operator (stdin/stdout)
    Console,

    /// Follower process attached to this manager
    Follower,

    /// Browser viewing the session page
    Viewer,

    /// Connection from a follower to its manager
    Upstream,
}

impl EndpointKind {
    /// Whether the endpoint lives outside this process
    pub fn is_remote(&self) -> bool {
        !matches!(self, EndpointKind::Console)
    }

    /// Whether payloads from this endpoint are kept out of the session
    pub fn is_read_only(&self) -> bool {
        matches!(self, EndpointKind::Viewer)
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointKind::Console => "console",
            EndpointKind::Follower => "follower",
            EndpointKind::Viewer => "viewer",
            EndpointKind::Upstream => "upstream",
        };
        f.write_str(name)
    }
}

/// Why a relay link ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Departure {
    /// Plain end of the link
    #[default]
    Closed,

    /// The manager handed the session to another manager; look it up again
    SessionMoved,
}

// ─────────────────────────────────────────────────────────────────
// Endpoint Trait
// ─────────────────────────────────────────────────────────────────

/// A duplex text channel that can be attached to a [`RelayHub`]
///
/// `recv` must be cancel safe: the pump polls it alongside the outbound
/// queue and drops it whenever an outbound payload arrives first.
#[async_trait]
pub trait Endpoint: Send {
    /// Kind of participant behind this endpoint
    fn kind(&self) -> EndpointKind;

    /// Next inbound payload; `None` at end of stream
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Push one payload out to the participant
    async fn send(&mut self, payload: &str) -> Result<()>;

    /// How the peer ended the link, once `recv` has returned `None`
    fn peer_departure(&self) -> Departure {
        Departure::Closed
    }

    /// Release the transport after detaching, telling the peer why
    async fn close(&mut self, _departure: Departure) {}
}

// ─────────────────────────────────────────────────────────────────
// Handle held by the hub
// ─────────────────────────────────────────────────────────────────

/// Why a payload could not be queued for an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The endpoint's pump is gone
    Closed,

    /// The queue stayed full for the whole send timeout
    TimedOut,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryFailure::Closed => f.write_str("endpoint closed"),
            DeliveryFailure::TimedOut => f.write_str("outbound queue stalled"),
        }
    }
}

/// The hub's side of an attached endpoint: its identity and outbound queue
///
/// Clones share the queue. The queue closes once every clone is dropped.
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    id: EndpointId,
    kind: EndpointKind,
    outbound: mpsc::Sender<Arc<str>>,
    moved: Arc<AtomicBool>,
}

impl EndpointHandle {
    /// Allocate a new identity with a bounded outbound queue
    pub fn new(kind: EndpointKind, capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let id = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);
        let handle = Self {
            id,
            kind,
            outbound,
            moved: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    #[cfg(test)]
    pub(crate) fn set_id_for_test(&mut self, id: EndpointId) {
        self.id = id;
    }

    /// Set once the hub drops this endpoint because the session moved
    pub(crate) fn moved_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.moved)
    }

    pub(crate) fn mark_moved(&self) {
        self.moved.store(true, Ordering::Release);
    }

    /// Queue a payload, waiting up to `timeout` for room
    pub(crate) async fn deliver(
        &self,
        payload: Arc<str>,
        timeout: Duration,
    ) -> std::result::Result<(), DeliveryFailure> {
        self.outbound
            .send_timeout(payload, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => DeliveryFailure::TimedOut,
                mpsc::error::SendTimeoutError::Closed(_) => DeliveryFailure::Closed,
            })
    }
}

// ─────────────────────────────────────────────────────────────────
// Pump
// ─────────────────────────────────────────────────────────────────

/// Attach `endpoint` to `hub` and relay until either side ends
///
/// Inbound payloads are broadcast to everyone else; payloads fanned out to
/// this endpoint are written to it. While one of its payloads is still being
/// fanned out the endpoint is not read, so a fast sender is slowed to the
/// pace of the slowest attached reader instead of outrunning it.
///
/// End of stream, a transport failure, or the hub dropping the endpoint's
/// handle all end the pump, after which the endpoint is detached and closed.
/// A transport failure is returned as [`Error::Transport`] and affects
/// nobody else. On a clean end the peer's [`Departure`] is returned.
pub async fn serve_endpoint<E: Endpoint>(hub: Arc<RelayHub>, mut endpoint: E) -> Result<Departure> {
    let kind = endpoint.kind();
    let (handle, mut outbound) = EndpointHandle::new(kind, hub.queue_capacity());
    let id = handle.id();
    let moved = handle.moved_flag();
    hub.attach(handle)?;

    let mut fanout: Option<BoxFuture<'static, ()>> = None;

    let result = loop {
        tokio::select! {
            inbound = endpoint.recv(), if fanout.is_none() => match inbound {
                Ok(Some(payload)) if kind.is_read_only() => {
                    debug!(endpoint = id, bytes = payload.len(), "Dropping input from read-only endpoint");
                }
                Ok(Some(payload)) => {
                    let hub = Arc::clone(&hub);
                    fanout = Some(Box::pin(async move {
                        hub.broadcast(id, &payload).await;
                    }));
                }
                Ok(None) => {
                    debug!(endpoint = id, kind = %kind, "End of stream");
                    break Ok(());
                }
                Err(e) => break Err(e),
            },

            _ = async {
                if let Some(pending) = fanout.as_mut() {
                    pending.await;
                }
            }, if fanout.is_some() => {
                fanout = None;
            }

            queued = outbound.recv() => match queued {
                Some(payload) => {
                    if let Err(e) = endpoint.send(&payload).await {
                        break Err(e);
                    }
                }
                None => {
                    debug!(endpoint = id, kind = %kind, "Dropped by hub");
                    break Ok(());
                }
            },
        }
    };

    // The last payload read still reaches everyone else
    if let Some(pending) = fanout.take() {
        pending.await;
    }

    hub.detach(id);
    let departure = if moved.load(Ordering::Acquire) {
        Departure::SessionMoved
    } else {
        Departure::Closed
    };
    endpoint.close(departure).await;

    match result {
        Ok(()) => {
            info!(endpoint = id, kind = %kind, session = %hub.session(), "Endpoint detached");
            Ok(endpoint.peer_departure())
        }
        Err(e) => {
            warn!(endpoint = id, kind = %kind, error = %e, "Endpoint failed, detached");
            Err(Error::transport(id, e.to_string()))
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Test Support
// ─────────────────────────────────────────────────────────────────
