//! Loopback accelerator runtime
//!
//! A local stand-in for the acceleration library: one nonblocking UDP
//! socket on the loopback ingress, a random magic, and just enough
//! session state to drive the callback contract. Route flips and
//! accelerator-originated client packets are queued explicitly and
//! delivered on the next pump; upgrading a session never flips its
//! route by itself.

use crate::runtime::{AcceleratorHandler, AcceleratorRuntime};
use parking_lot::Mutex;
use setu_common::{fnv1a, Address, ProxyConfig, ProxyResult};
use setu_dataplane::{create_udp_socket, is_recv_timeout, SocketMode};
use setu_filter::{basic_packet_filter, packet_type, CHONKLE_BYTES, MIN_FILTERED_PACKET_BYTES, PITTLE_BYTES};
use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::sync::Arc;
use tracing::{debug, trace};

struct LoopbackState {
    sessions: HashMap<Address, u64>,
    upgrade_calls: u64,
    pending_routes: VecDeque<(Address, bool)>,
    pending_sends: VecDeque<(Address, Vec<u8>)>,
}

pub struct LoopbackRuntime {
    socket: Arc<UdpSocket>,
    magic: [u8; 8],
    max_packet_size: usize,
    state: Mutex<LoopbackState>,
}

impl LoopbackRuntime {
    /// Bind the accelerator ingress socket and issue a fresh magic.
    /// The datacenter string and private key are accepted for contract
    /// parity and otherwise opaque here.
    pub fn new(config: &ProxyConfig) -> ProxyResult<LoopbackRuntime> {
        let socket = create_udp_socket(
            &config.accelerator_bind_address,
            SocketMode::NonBlocking,
            false,
            config.socket_send_buffer_size,
            config.socket_receive_buffer_size,
        )?;
        debug!(
            bind = %config.accelerator_bind_address,
            public = %config.accelerator_public_address,
            datacenter = %config.accelerator_datacenter,
            "loopback accelerator ready"
        );
        Ok(LoopbackRuntime {
            socket: Arc::new(socket),
            magic: rand::random(),
            max_packet_size: config.max_packet_size,
            state: Mutex::new(LoopbackState {
                sessions: HashMap::new(),
                upgrade_calls: 0,
                pending_routes: VecDeque::new(),
                pending_sends: VecDeque::new(),
            }),
        })
    }

    /// Queue a direct/accelerated flip for delivery on the next pump.
    pub fn set_route(&self, client: Address, accelerated: bool) {
        self.state.lock().pending_routes.push_back((client, accelerated));
    }

    /// Queue an accelerator-originated packet toward a client; the
    /// handler rewrites its checksums and owns the send.
    pub fn send_to_client(&self, to: Address, packet: Vec<u8>) {
        self.state.lock().pending_sends.push_back((to, packet));
    }

    /// True once `upgrade_session` has been called for this client.
    pub fn has_session(&self, client: &Address) -> bool {
        self.state.lock().sessions.contains_key(client)
    }

    /// Total `upgrade_session` invocations.
    pub fn upgrade_count(&self) -> u64 {
        self.state.lock().upgrade_calls
    }

    /// Minimal processing of a tunneled inner packet once the handler
    /// has advanced past the envelope.
    fn process_inner(&self, handler: &mut dyn AcceleratorHandler, from: &Address, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match data[0] {
            // new-session notify payload; the envelope already did its job
            packet_type::PASSTHROUGH => {}
            packet_type::CLIENT_TO_SERVER => {
                if data.len() < MIN_FILTERED_PACKET_BYTES || !basic_packet_filter(data) {
                    trace!(client = %from, "tunneled payload failed filter");
                    return;
                }
                if !self.state.lock().sessions.contains_key(from) {
                    trace!(client = %from, "tunneled payload from unknown session");
                    return;
                }
                let payload = &data[1 + CHONKLE_BYTES..data.len() - PITTLE_BYTES];
                handler.payload_receive(self, from, payload);
            }
            // pings and stats are keepalive noise to the stand-in
            _ => {}
        }
    }
}

impl AcceleratorRuntime for LoopbackRuntime {
    fn ready(&self) -> bool {
        true
    }

    fn magic(&self) -> [u8; 8] {
        self.magic
    }

    fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    fn upgrade_session(&self, address: &Address, user_id: &str) -> u64 {
        let session_id = fnv1a(user_id.as_bytes());
        let mut state = self.state.lock();
        state.upgrade_calls += 1;
        state.sessions.insert(*address, session_id);
        debug!(client = %address, session_id, "loopback session upgraded");
        session_id
    }

    fn send_packet(&self, to: &Address, data: &[u8]) {
        let Some(address) = to.to_socket_addr() else {
            return;
        };
        let _ = self.socket.send_to(data, address);
    }

    fn update(&self, handler: &mut dyn AcceleratorHandler) {
        // envelope + passthrough headroom on top of the payload budget
        let mut buffer = vec![0u8; self.max_packet_size + 12];
        loop {
            let (bytes, source) = match self.socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(error) if is_recv_timeout(&error) => break,
                Err(_) => break,
            };
            if bytes == 0 {
                continue;
            }
            let mut from = Address::from(source);
            let mut begin = 0usize;
            let mut end = bytes;
            handler.packet_receive(self, &mut from, &mut buffer[..bytes], &mut begin, &mut end);
            if begin < end {
                self.process_inner(handler, &from, &buffer[begin..end]);
            }
        }

        let (routes, sends) = {
            let mut state = self.state.lock();
            (
                state.pending_routes.drain(..).collect::<Vec<_>>(),
                state.pending_sends.drain(..).collect::<Vec<_>>(),
            )
        };
        for (client, accelerated) in routes {
            handler.route_update(self, &client, accelerated);
        }
        for (to, mut packet) in sends {
            handler.send_packet_to_address(self, &to, &mut packet);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runtime(port: u16) -> LoopbackRuntime {
        let config = ProxyConfig {
            accelerator_bind_address: Address::ipv4([127, 0, 0, 1], port),
            socket_send_buffer_size: 65536,
            socket_receive_buffer_size: 65536,
            ..ProxyConfig::default()
        };
        LoopbackRuntime::new(&config).unwrap()
    }

    #[test]
    fn send_packet_uses_the_runtime_socket() {
        let runtime = test_runtime(47412);
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let to = Address::from(receiver.local_addr().unwrap());

        runtime.send_packet(&to, b"hello");

        let mut buf = [0u8; 16];
        let (bytes, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..bytes], b"hello");
        assert_eq!(
            from.port(),
            runtime.socket().local_addr().unwrap().port(),
            "packet originates from the runtime socket"
        );
    }

    #[test]
    fn upgrade_is_recorded_and_stable() {
        let runtime = test_runtime(47410);
        let client = Address::ipv4([127, 0, 0, 1], 55010);
        let id1 = runtime.upgrade_session(&client, &client.to_string());
        let id2 = runtime.upgrade_session(&client, &client.to_string());
        assert_eq!(id1, id2);
        assert!(runtime.has_session(&client));
        assert_eq!(runtime.upgrade_count(), 2);
    }

    #[test]
    fn queued_work_reaches_the_handler() {
        struct Recorder {
            routes: Vec<(Address, bool)>,
            sends: Vec<Address>,
        }
        impl AcceleratorHandler for Recorder {
            fn packet_receive(
                &mut self,
                _rt: &dyn AcceleratorRuntime,
                _from: &mut Address,
                _data: &mut [u8],
                _begin: &mut usize,
                _end: &mut usize,
            ) {
            }
            fn send_packet_to_address(
                &mut self,
                _rt: &dyn AcceleratorRuntime,
                to: &Address,
                _data: &mut [u8],
            ) {
                self.sends.push(*to);
            }
            fn payload_receive(
                &mut self,
                _rt: &dyn AcceleratorRuntime,
                _client: &Address,
                _payload: &[u8],
            ) {
            }
            fn route_update(
                &mut self,
                _rt: &dyn AcceleratorRuntime,
                client: &Address,
                accelerated: bool,
            ) {
                self.routes.push((*client, accelerated));
            }
        }

        let runtime = test_runtime(47411);
        let client = Address::ipv4([127, 0, 0, 1], 55020);
        runtime.set_route(client, true);
        runtime.send_to_client(client, vec![0u8; 4]);

        let mut recorder = Recorder {
            routes: Vec::new(),
            sends: Vec::new(),
        };
        runtime.update(&mut recorder);
        assert_eq!(recorder.routes, vec![(client, true)]);
        assert_eq!(recorder.sends, vec![client]);
    }
}
