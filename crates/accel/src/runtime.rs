//! Accelerator runtime contract
//!
//! The integration surface between the proxy and the acceleration
//! library. The proxy consumes the runtime operations below and
//! registers four callbacks, expressed here as the handler trait. The
//! pump passes the runtime back into every callback so handlers can
//! upgrade sessions from inside packet processing, the way the C
//! callback API allows.

use setu_common::Address;
use std::net::UdpSocket;
use std::sync::Arc;

/// Operations the proxy consumes from the acceleration library.
///
/// Construction corresponds to init/create-server (bind and public
/// addresses, datacenter string, private key); drop is term/destroy.
pub trait AcceleratorRuntime: Send + Sync {
    /// True once the runtime can carry sessions.
    fn ready(&self) -> bool;

    /// 8-byte salt issued at startup, used by chonkle generation on
    /// both endpoints.
    fn magic(&self) -> [u8; 8];

    /// The runtime's internal UDP socket. Slot workers send forward
    /// envelopes through this so tunneled frames originate from the
    /// accelerator's own port.
    fn socket(&self) -> &Arc<UdpSocket>;

    /// Promote a session onto the accelerated path. Returns a stable
    /// session identifier.
    fn upgrade_session(&self, address: &Address, user_id: &str) -> u64;

    /// Send a raw packet from the runtime's socket.
    fn send_packet(&self, to: &Address, data: &[u8]);

    /// Pump the runtime once: drain its socket, deliver callbacks.
    /// The bridge calls this at ~60 Hz.
    fn update(&self, handler: &mut dyn AcceleratorHandler);

    /// Drain any buffered outbound work before shutdown.
    fn flush(&self);
}

/// Callbacks the proxy registers with the runtime.
pub trait AcceleratorHandler: Send {
    /// One UDP datagram received on the runtime's bind socket.
    /// `data[begin..end]` is the packet; the handler may rewrite
    /// `from`, advance `begin` past a consumed prefix, or zero both
    /// cursors to suppress further runtime processing.
    fn packet_receive(
        &mut self,
        runtime: &dyn AcceleratorRuntime,
        from: &mut Address,
        data: &mut [u8],
        begin: &mut usize,
        end: &mut usize,
    );

    /// The runtime wants `data` delivered to a client. The handler
    /// owns the send and may rewrite the packet's checksums first.
    fn send_packet_to_address(
        &mut self,
        runtime: &dyn AcceleratorRuntime,
        to: &Address,
        data: &mut [u8],
    );

    /// A client->server payload decapsulated from the accelerated
    /// path.
    fn payload_receive(
        &mut self,
        runtime: &dyn AcceleratorRuntime,
        client: &Address,
        payload: &[u8],
    );

    /// The control plane switched a session between the direct and
    /// accelerated paths.
    fn route_update(
        &mut self,
        runtime: &dyn AcceleratorRuntime,
        client: &Address,
        accelerated: bool,
    );
}
