//! Relay layer
//!
//! Moves text payloads between the participants of one session:
//! - `hub`: the fan-out registry
//! - `endpoint`: the endpoint abstraction and the pump that drives it
//! - `console`, `socket`: the two endpoint kinds
//! - `server`, `viewer`: the manager's listener and browser page

pub mod console;
pub mod endpoint;
pub mod hub;
pub mod server;
pub mod socket;
pub mod viewer;

pub use console::stdio;
pub use endpoint::{serve_endpoint, Departure, Endpoint};
pub use hub::{RelayHub, DEFAULT_QUEUE_CAPACITY, DEFAULT_SEND_TIMEOUT};
pub use server::RelayServer;
pub use socket::{connect_upstream, UpstreamSocket};
