//! Slots and slot workers
//!
//! A slot is a long-lived outbound UDP socket bound to a globally
//! unique port, owned by one dispatch worker and lent to one client at
//! a time. The slot worker reads server replies off that socket and
//! returns them to the client: directly out a public ingress socket,
//! or wrapped in a forward envelope and tunneled through the
//! accelerator when the session has been upgraded.

use crate::envelope::{Envelope, ENVELOPE_BYTES};
use crate::socket::{create_udp_socket, is_recv_timeout, SocketMode, RECEIVE_TIMEOUT};
use crate::stack::DataPlane;
use parking_lot::Mutex;
use setu_common::{hash_address, Address, ProxyConfig, ProxyResult};
use setu_filter::packet_type;
use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Scratch headroom in front of every received payload: the 11-byte
/// envelope plus the passthrough byte. Prepending never copies.
pub const SLOT_HEADROOM: usize = ENVELOPE_BYTES + 1;

/// Client binding fields, guarded by the slot mutex. The critical
/// section is three fields wide; hold it only to snapshot or assign.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotState {
    pub allocated: bool,
    pub accelerated: bool,
    pub client_address: Address,
}

pub struct Slot {
    pub dispatch_index: usize,
    pub slot_index: usize,
    pub global_index: usize,
    pub socket: UdpSocket,
    pub state: Mutex<SlotState>,
}

impl Slot {
    /// Bind the slot socket at `slot_base_port + global_index` on the
    /// proxy bind IP.
    pub fn new(
        config: &ProxyConfig,
        dispatch_index: usize,
        slot_index: usize,
    ) -> ProxyResult<Slot> {
        let global_index = dispatch_index * config.num_slots_per_thread + slot_index;
        let bind_address = match config.proxy_bind_address {
            Address::Ipv4 { ip, .. } => Address::Ipv4 {
                ip,
                port: config.slot_port(global_index),
            },
            other => other,
        };
        let socket = create_udp_socket(
            &bind_address,
            SocketMode::Blocking {
                timeout: Some(RECEIVE_TIMEOUT),
            },
            false,
            config.socket_send_buffer_size,
            config.socket_receive_buffer_size,
        )?;
        Ok(Slot {
            dispatch_index,
            slot_index,
            global_index,
            socket,
            state: Mutex::new(SlotState::default()),
        })
    }

    /// Copy of the mutex-guarded fields.
    #[inline]
    pub fn snapshot(&self) -> SlotState {
        *self.state.lock()
    }
}

/// Slot worker loop: one per slot, blocking on the slot socket.
pub fn run_slot_worker(shared: Arc<DataPlane>, slot: Arc<Slot>) {
    let config = &shared.config;
    let server_address = Address::from(shared.server_addr);
    let mut scratch = vec![0u8; SLOT_HEADROOM + config.max_packet_size];

    trace!(
        dispatch = slot.dispatch_index,
        slot = slot.slot_index,
        "slot worker started"
    );

    loop {
        if shared.quit.load(Ordering::Relaxed) {
            break;
        }

        let (bytes, from) = match slot.socket.recv_from(&mut scratch[SLOT_HEADROOM..]) {
            Ok(received) => received,
            Err(error) if is_recv_timeout(&error) => continue,
            Err(_) => break,
        };
        if bytes == 0 {
            continue;
        }

        // only the upstream server talks to slot sockets
        if Address::from(from) != server_address {
            trace!(slot = slot.global_index, %from, "dropped packet from non-server source");
            continue;
        }

        let state = slot.snapshot();
        if !state.allocated {
            trace!(slot = slot.global_index, "dropped server packet, slot not allocated");
            continue;
        }

        if !state.accelerated {
            // direct return: prepend the passthrough byte and reply out
            // the public port so the client sees a stable remote address
            scratch[SLOT_HEADROOM - 1] = packet_type::PASSTHROUGH;
            let Some(client) = state.client_address.to_socket_addr() else {
                continue;
            };
            let ingress_index =
                (hash_address(&state.client_address) % config.num_threads as u64) as usize;
            if let Err(error) = shared.ingress_sockets[ingress_index]
                .send_to(&scratch[SLOT_HEADROOM - 1..SLOT_HEADROOM + bytes], client)
            {
                debug!(slot = slot.global_index, %error, "direct return send failed");
            }
        } else {
            // accelerated return: forward envelope, then the same
            // passthrough framing the direct path produces
            let envelope = Envelope {
                packet_type: packet_type::FORWARD_PACKET_TO_CLIENT,
                client: state.client_address,
                dispatch_index: slot.dispatch_index as u16,
                slot_index: slot.slot_index as u16,
            };
            if !envelope.write(&mut scratch[..ENVELOPE_BYTES]) {
                continue;
            }
            scratch[SLOT_HEADROOM - 1] = packet_type::PASSTHROUGH;
            if let Err(error) = shared
                .accel
                .socket
                .send_to(&scratch[..SLOT_HEADROOM + bytes], shared.accel.ingress)
            {
                debug!(slot = slot.global_index, %error, "accelerated return send failed");
            }
        }
    }

    trace!(
        dispatch = slot.dispatch_index,
        slot = slot.slot_index,
        "slot worker stopped"
    );
}
