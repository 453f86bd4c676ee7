//! Accelerator bridge
//!
//! Implements the runtime callbacks over the slot plane: unwrapping
//! forward envelopes back out the public port, teaching the runtime
//! which client is behind each tunneled frame, detecting newly seen
//! sessions, forwarding decapsulated payloads to the server, and
//! flipping the per-slot accelerated flag on route updates. One bridge
//! worker thread pumps the runtime until shutdown.

use crate::runtime::{AcceleratorHandler, AcceleratorRuntime};
use setu_common::{hash_address, time, Address, ProxyConfig, ProxyError, ProxyResult};
use setu_dataplane::{DataPlane, Envelope, Slot, ENVELOPE_BYTES};
use setu_filter::{packet_type, stamp_packet, types::is_client_packet_type, MIN_FILTERED_PACKET_BYTES};
use setu_session::SessionTable;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace};

/// Bridge pump rate while idle.
const UPDATE_INTERVAL_SECONDS: f64 = 1.0 / 60.0;

pub struct Bridge {
    config: Arc<ProxyConfig>,
    ingress_sockets: Vec<Arc<UdpSocket>>,
    /// Every slot in global order, across all dispatch workers.
    slots: Vec<Arc<Slot>>,
    /// Client address -> global slot index. Exclusively owned.
    table: SessionTable,
    last_swap: f64,
    proxy_public_address: Address,
    server_addr: SocketAddr,
    magic: [u8; 8],
}

impl Bridge {
    /// Table capacity scales with the slot grid so a full deployment
    /// (16 x 1000 slots) stays under half load.
    pub fn new(shared: &DataPlane, slots: Vec<Arc<Slot>>, magic: [u8; 8]) -> Self {
        let capacity = (slots.len() * 4)
            .next_power_of_two()
            .max(shared.config.session_table_capacity);
        Self {
            config: shared.config.clone(),
            ingress_sockets: shared.ingress_sockets.clone(),
            slots,
            table: SessionTable::new(capacity),
            last_swap: time::now(),
            proxy_public_address: shared.config.proxy_public_address,
            server_addr: shared.server_addr,
            magic,
        }
    }

    fn ingress_for(&self, client: &Address) -> &UdpSocket {
        let index = (hash_address(client) % self.ingress_sockets.len() as u64) as usize;
        &self.ingress_sockets[index]
    }
}

impl AcceleratorHandler for Bridge {
    fn packet_receive(
        &mut self,
        runtime: &dyn AcceleratorRuntime,
        from: &mut Address,
        data: &mut [u8],
        begin: &mut usize,
        end: &mut usize,
    ) {
        let now = time::now();
        if now - self.last_swap >= self.config.slot_timeout_seconds {
            self.table.swap();
            self.last_swap = now;
        }

        if *end <= *begin || *end - *begin <= ENVELOPE_BYTES {
            *begin = 0;
            *end = 0;
            return;
        }

        let frame = &data[*begin..*end];
        let first_byte = frame[0];

        if first_byte == packet_type::FORWARD_PACKET_TO_CLIENT {
            // outbound-to-client frame from a slot worker: unwrap and
            // emit from the public port
            if let Some(envelope) = Envelope::read(frame) {
                if let Some(client) = envelope.client.to_socket_addr() {
                    let payload = &frame[ENVELOPE_BYTES..];
                    if let Err(error) = self.ingress_for(&envelope.client).send_to(payload, client)
                    {
                        debug!(%error, client = %envelope.client, "forward-to-client send failed");
                    }
                }
            }
            *begin = 0;
            *end = 0;
            return;
        }

        if is_client_packet_type(first_byte) {
            let Some(envelope) = Envelope::read(frame) else {
                *begin = 0;
                *end = 0;
                return;
            };
            let dispatch_index = envelope.dispatch_index as usize;
            let slot_index = envelope.slot_index as usize;
            if dispatch_index >= self.config.num_threads
                || slot_index >= self.config.num_slots_per_thread
            {
                trace!(dispatch = dispatch_index, slot = slot_index, "envelope indices out of range");
                *begin = 0;
                *end = 0;
                return;
            }
            let global_index =
                (dispatch_index * self.config.num_slots_per_thread + slot_index) as u32;

            // the runtime must see the client, not the proxy
            *from = envelope.client;

            if self.table.update(envelope.client, global_index) {
                let user_id = envelope.client.to_string();
                let session_id = runtime.upgrade_session(&envelope.client, &user_id);
                debug!(client = %envelope.client, session_id, "session upgraded");
            }

            // hand the runtime the original packet behind the envelope;
            // data[*begin] keeps the byte the dispatch worker wrote
            *begin += ENVELOPE_BYTES;
            return;
        }

        // not ours: relay/backend traffic the runtime handles itself
    }

    fn send_packet_to_address(
        &mut self,
        _runtime: &dyn AcceleratorRuntime,
        to: &Address,
        data: &mut [u8],
    ) {
        if data.is_empty() {
            return;
        }
        if data[0] != packet_type::PASSTHROUGH && data.len() >= MIN_FILTERED_PACKET_BYTES {
            // re-key the checksums as if the packet originated from the
            // proxy's public address, so relays' advanced filter holds
            stamp_packet(data, &self.magic, &self.proxy_public_address, to);
        }
        let Some(address) = to.to_socket_addr() else {
            return;
        };
        if let Err(error) = self.ingress_for(to).send_to(data, address) {
            debug!(%error, client = %to, "accelerator client send failed");
        }
    }

    fn payload_receive(
        &mut self,
        _runtime: &dyn AcceleratorRuntime,
        client: &Address,
        payload: &[u8],
    ) {
        let Some(global_index) = self.table.get(client) else {
            trace!(client = %client, "payload for unknown session");
            return;
        };
        let Some(slot) = self.slots.get(global_index as usize) else {
            return;
        };
        if let Err(error) = slot.socket.send_to(payload, self.server_addr) {
            debug!(%error, client = %client, "accelerated payload forward failed");
        }
    }

    fn route_update(
        &mut self,
        _runtime: &dyn AcceleratorRuntime,
        client: &Address,
        accelerated: bool,
    ) {
        let Some(global_index) = self.table.get(client) else {
            trace!(client = %client, "route update for unknown session");
            return;
        };
        let Some(slot) = self.slots.get(global_index as usize) else {
            return;
        };
        slot.state.lock().accelerated = accelerated;
        info!(client = %client.anonymized(), accelerated, "route updated");
    }
}

/// The thread hosting the accelerator runtime.
pub struct BridgeWorker {
    handle: JoinHandle<()>,
}

impl BridgeWorker {
    pub fn spawn(
        runtime: Arc<dyn AcceleratorRuntime>,
        mut bridge: Bridge,
        quit: Arc<AtomicBool>,
    ) -> ProxyResult<BridgeWorker> {
        let handle = std::thread::Builder::new()
            .name("accel".to_string())
            .spawn(move || {
                info!("accelerator bridge started");
                while !quit.load(Ordering::Relaxed) {
                    runtime.update(&mut bridge);
                    time::sleep(UPDATE_INTERVAL_SECONDS);
                }
                runtime.flush();
                info!("accelerator bridge stopped");
            })
            .map_err(|e| ProxyError::Thread(format!("bridge spawn: {}", e)))?;
        Ok(BridgeWorker { handle })
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}
