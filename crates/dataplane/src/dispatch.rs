//! Dispatch workers
//!
//! One per public ingress socket. Classifies each client datagram:
//! passthrough payloads ride a slot to the upstream server, everything
//! else must survive the basic filter and is tunneled to the
//! accelerator behind the loopback envelope. The worker owns its
//! session table and the slot idle clocks; nothing else touches them.

use crate::envelope::{Envelope, ENVELOPE_BYTES};
use crate::slot::Slot;
use crate::socket::is_recv_timeout;
use crate::stack::DataPlane;
use setu_common::{time, Address};
use setu_filter::{basic_packet_filter, packet_type};
use setu_session::SessionTable;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Idle clock seed; far enough in the past that every slot starts
/// reclaimable, matching a fresh table.
const NEVER: f64 = -1_000_000_000.0;

pub struct DispatchWorker {
    index: usize,
    shared: Arc<DataPlane>,
    slots: Vec<Arc<Slot>>,
    table: SessionTable,
    slot_last_receive: Vec<f64>,
    last_swap: f64,
}

impl DispatchWorker {
    pub fn new(index: usize, shared: Arc<DataPlane>, slots: Vec<Arc<Slot>>) -> Self {
        let capacity = shared.config.session_table_capacity;
        let slot_count = slots.len();
        Self {
            index,
            shared,
            slots,
            table: SessionTable::new(capacity),
            slot_last_receive: vec![NEVER; slot_count],
            last_swap: time::now(),
        }
    }

    pub fn run(mut self) {
        let config = self.shared.config.clone();
        let socket = self.shared.ingress_sockets[self.index].clone();
        let mut scratch = vec![0u8; ENVELOPE_BYTES + config.max_packet_size];

        trace!(dispatch = self.index, "dispatch worker started");

        loop {
            if self.shared.quit.load(Ordering::Relaxed) {
                break;
            }

            let (bytes, from) = match socket.recv_from(&mut scratch[ENVELOPE_BYTES..]) {
                Ok(received) => received,
                Err(error) if is_recv_timeout(&error) => continue,
                Err(_) => break,
            };
            if bytes == 0 {
                continue;
            }

            let now = time::now();
            if now - self.last_swap >= config.slot_timeout_seconds / 2.0 {
                self.table.swap();
                self.last_swap = now;
            }

            let from = Address::from(from);
            if !from.is_ipv4() {
                continue;
            }

            if scratch[ENVELOPE_BYTES] == packet_type::PASSTHROUGH {
                self.handle_passthrough(&mut scratch, bytes, from, now);
            } else {
                self.handle_accelerator_packet(&mut scratch, bytes, from);
            }
        }

        trace!(dispatch = self.index, "dispatch worker stopped");
    }

    /// Opaque game payload: ride the client's slot to the server,
    /// allocating one on first contact.
    fn handle_passthrough(&mut self, scratch: &mut [u8], bytes: usize, from: Address, now: f64) {
        match self.table.get(&from) {
            Some(slot_index) => {
                let slot_index = slot_index as usize;
                let slot = &self.slots[slot_index];
                let allocated = slot.state.lock().allocated;
                if !allocated {
                    trace!(dispatch = self.index, slot = slot_index, "slot no longer allocated");
                    return;
                }
                self.forward_to_server(slot, scratch, bytes);
                self.slot_last_receive[slot_index] = now;
            }
            None => {
                let Some(slot_index) = self.find_idle_slot(now) else {
                    debug!(dispatch = self.index, client = %from, "no idle slot, dropping new client");
                    return;
                };
                let slot = self.slots[slot_index].clone();
                {
                    let mut state = slot.state.lock();
                    state.allocated = true;
                    state.accelerated = false;
                    state.client_address = from;
                }
                self.table.insert(from, slot_index as u32);
                self.slot_last_receive[slot_index] = now;
                debug!(dispatch = self.index, slot = slot_index, client = %from, "new client");

                self.forward_to_server(&slot, scratch, bytes);

                // notify the accelerator so it can upgrade the session;
                // the original packet rides behind the envelope
                self.tunnel_to_accelerator(
                    scratch,
                    bytes,
                    packet_type::PASSTHROUGH,
                    from,
                    slot_index,
                );
            }
        }
    }

    /// Typed accelerator packet: basic filter, then envelope and
    /// tunnel. Unknown clients must be seen as passthrough first.
    fn handle_accelerator_packet(&mut self, scratch: &mut [u8], bytes: usize, from: Address) {
        let data = &scratch[ENVELOPE_BYTES..ENVELOPE_BYTES + bytes];
        if !basic_packet_filter(data) {
            trace!(dispatch = self.index, client = %from, "basic filter rejected packet");
            return;
        }
        let Some(slot_index) = self.table.get(&from) else {
            trace!(dispatch = self.index, client = %from, "accelerator packet from unknown client");
            return;
        };
        let first_byte = scratch[ENVELOPE_BYTES];
        self.tunnel_to_accelerator(scratch, bytes, first_byte, from, slot_index as usize);
    }

    fn forward_to_server(&self, slot: &Slot, scratch: &[u8], bytes: usize) {
        if bytes <= 1 {
            return;
        }
        // strip the passthrough byte
        let payload = &scratch[ENVELOPE_BYTES + 1..ENVELOPE_BYTES + bytes];
        if let Err(error) = slot.socket.send_to(payload, self.shared.server_addr) {
            debug!(dispatch = self.index, slot = slot.slot_index, %error, "server forward failed");
        }
    }

    fn tunnel_to_accelerator(
        &self,
        scratch: &mut [u8],
        bytes: usize,
        envelope_type: u8,
        client: Address,
        slot_index: usize,
    ) {
        let envelope = Envelope {
            packet_type: envelope_type,
            client,
            dispatch_index: self.index as u16,
            slot_index: slot_index as u16,
        };
        if !envelope.write(&mut scratch[..ENVELOPE_BYTES]) {
            return;
        }
        let frame = &scratch[..ENVELOPE_BYTES + bytes];
        if let Err(error) = self.shared.ingress_sockets[self.index]
            .send_to(frame, self.shared.accel.ingress)
        {
            debug!(dispatch = self.index, %error, "accelerator tunnel send failed");
        }
    }

    /// First slot whose idle time has passed the timeout; None when the
    /// dispatch is saturated (the new client's packet is dropped and
    /// the client retries).
    fn find_idle_slot(&self, now: f64) -> Option<usize> {
        self.slot_last_receive
            .iter()
            .position(|&last| now - last >= self.shared.config.slot_timeout_seconds)
    }
}
