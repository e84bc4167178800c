//! Relay hub
//!
//! Owns the set of attached endpoints for one session and fans every
//! inbound payload out to all endpoints except the one it came from.
//!
//! - Registry is kept in attach order behind a single mutex; a broadcast
//!   snapshots it and never delivers to an endpoint detached before then
//! - Each endpoint has a bounded outbound queue. A full queue is waited on
//!   for up to the send timeout; only a queue that stays full that long, or
//!   one whose pump is gone, gets its endpoint detached
//! - Payloads are relayed verbatim; nothing is parsed or reframed

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::session::SessionName;

use super::endpoint::{DeliveryFailure, EndpointHandle, EndpointId, EndpointKind};

/// Default depth of each endpoint's outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default time a broadcast waits on one endpoint's full queue
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────

/// Result of a single broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Endpoints the payload was queued for
    pub delivered: usize,

    /// Endpoints dropped because delivery failed
    pub detached: Vec<(EndpointId, DeliveryFailure)>,
}

/// Counters since the hub was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub attached: usize,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
}

// ─────────────────────────────────────────────────────────────────
// Hub
// ─────────────────────────────────────────────────────────────────

/// Fan-out point for one session
pub struct RelayHub {
    session: SessionName,
    queue_capacity: usize,
    send_timeout: Duration,
    endpoints: Mutex<Vec<EndpointHandle>>,
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

impl RelayHub {
    /// Create an empty hub
    pub fn new(session: SessionName, queue_capacity: usize) -> Self {
        Self {
            session,
            queue_capacity: queue_capacity.max(1),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            endpoints: Mutex::new(Vec::new()),
            broadcasts: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        }
    }

    /// Bound how long one stalled endpoint can hold up a broadcast
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn session(&self) -> &SessionName {
        &self.session
    }

    /// Depth of the outbound queue given to new endpoints
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Add an endpoint to the broadcast set
    pub fn attach(&self, handle: EndpointHandle) -> Result<()> {
        let mut endpoints = self.endpoints.lock();
        if endpoints.iter().any(|e| e.id() == handle.id()) {
            return Err(Error::AlreadyAttached {
                endpoint: handle.id(),
            });
        }

        info!(
            session = %self.session,
            endpoint = handle.id(),
            kind = %handle.kind(),
            attached = endpoints.len() + 1,
            "Endpoint attached"
        );
        endpoints.push(handle);
        Ok(())
    }

    /// Remove an endpoint; returns whether it was attached
    ///
    /// Dropping the handle closes the endpoint's outbound queue, which ends
    /// its pump once the payloads already queued have been written.
    pub fn detach(&self, id: EndpointId) -> bool {
        let mut endpoints = self.endpoints.lock();
        let before = endpoints.len();
        endpoints.retain(|e| e.id() != id);
        let removed = endpoints.len() != before;
        if removed {
            debug!(session = %self.session, endpoint = id, "Endpoint removed from hub");
        }
        removed
    }

    /// Drop every endpoint that lives outside this process
    ///
    /// Used when the session moves to another manager; each dropped
    /// endpoint is closed with [`Departure::SessionMoved`](super::endpoint::Departure).
    pub fn detach_remote(&self) -> Vec<EndpointId> {
        let mut endpoints = self.endpoints.lock();
        let mut dropped = Vec::new();
        endpoints.retain(|e| {
            if e.kind().is_remote() {
                e.mark_moved();
                dropped.push(e.id());
                false
            } else {
                true
            }
        });
        if !dropped.is_empty() {
            info!(session = %self.session, count = dropped.len(), "Remote endpoints dropped");
        }
        dropped
    }

    /// Drop every endpoint
    pub fn close_all(&self) -> usize {
        let dropped: Vec<EndpointHandle> = std::mem::take(&mut *self.endpoints.lock());
        debug!(session = %self.session, count = dropped.len(), "Hub closed");
        dropped.len()
    }

    /// Queue `payload` for every endpoint except `from`
    ///
    /// Endpoints are served in attach order. A full queue is awaited, so a
    /// caller relaying a burst moves at the pace of the slowest reader.
    /// Endpoints that cannot take the payload within the send timeout are
    /// detached and listed in the report; the rest still receive it. A
    /// sender that is not (or no longer) attached is fine, its payload is
    /// still fanned out.
    pub async fn broadcast(&self, from: EndpointId, payload: &str) -> BroadcastReport {
        let payload: Arc<str> = Arc::from(payload);
        let targets: Vec<EndpointHandle> = self
            .endpoints
            .lock()
            .iter()
            .filter(|e| e.id() != from)
            .cloned()
            .collect();

        let mut report = BroadcastReport::default();
        for target in targets {
            // Detached while an earlier target was being waited on
            if !self.contains(target.id()) {
                continue;
            }
            match target.deliver(Arc::clone(&payload), self.send_timeout).await {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    if self.detach(target.id()) {
                        report.detached.push((target.id(), failure));
                    }
                }
            }
        }

        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.delivery_failures
            .fetch_add(report.detached.len() as u64, Ordering::Relaxed);

        for (id, failure) in &report.detached {
            warn!(session = %self.session, endpoint = id, reason = %failure, "Delivery failed, endpoint detached");
        }
        trace!(
            session = %self.session,
            from = from,
            bytes = payload.len(),
            delivered = report.delivered,
            "Broadcast"
        );

        report
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.endpoints.lock().iter().any(|e| e.id() == id)
    }

    /// Attached endpoint identities in attach order
    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.endpoints.lock().iter().map(|e| e.id()).collect()
    }

    /// Number of attached endpoints of one kind
    pub fn count_kind(&self, kind: EndpointKind) -> usize {
        self.endpoints
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            attached: self.len(),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}
