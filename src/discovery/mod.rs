//! Session discovery over UDP multicast
//!
//! A process looking for the manager of a session sends one probe to the
//! discovery group and waits a bounded time for an answer:
//! - A reply carries the manager's relay address, the prober becomes a follower
//! - Silence until the deadline means nobody manages the session yet
//!
//! Managers run a [`Responder`] for their lifetime, answering only probes that
//! name their own session.

pub mod net;
pub mod probe;
pub mod responder;
pub mod wire;

pub use probe::*;
pub use responder::*;
pub use wire::*;
pub use net::primary_ipv4;
