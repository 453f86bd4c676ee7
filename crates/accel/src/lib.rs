//! Setu Accel - accelerator integration
//!
//! The accelerator library is an external collaborator; everything the
//! proxy needs from it fits the two traits in `runtime`. The bridge
//! implements the handler side over the slot plane, and the loopback
//! runtime is a local stand-in that drives the same contract so the
//! proxy runs end-to-end on one machine.

pub mod bridge;
pub mod loopback;
pub mod runtime;

pub use bridge::{Bridge, BridgeWorker};
pub use loopback::LoopbackRuntime;
pub use runtime::{AcceleratorHandler, AcceleratorRuntime};
