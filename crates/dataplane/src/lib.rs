//! Setu Dataplane - the concurrent UDP forwarding plane
//!
//! One dispatch worker per SO_REUSEPORT ingress socket pulls client
//! datagrams, assigns clients to slots, and forwards payloads to the
//! upstream server. One slot worker per slot pulls server replies and
//! reflects them to the client, directly through the public port or
//! tunneled through the accelerator. The stack module wires sockets
//! and threads together and tears them down in order.

pub mod dispatch;
pub mod echo;
pub mod envelope;
pub mod slot;
pub mod socket;
pub mod stack;

pub use envelope::{Envelope, ENVELOPE_BYTES};
pub use slot::{Slot, SlotState};
pub use socket::{create_udp_socket, is_recv_timeout, SocketMode, RECEIVE_TIMEOUT};
pub use stack::{AccelLink, DataPlane, ProxyStack};
