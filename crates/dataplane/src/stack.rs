//! Proxy stack assembly
//!
//! Builds the ingress sockets, the slot grid, and the worker threads,
//! and joins them in the shutdown order: dispatch first (no new slot
//! assignments), then slots. The accelerator bridge thread is owned by
//! the caller and joined after both.

use crate::dispatch::DispatchWorker;
use crate::slot::{run_slot_worker, Slot};
use crate::socket::{create_udp_socket, SocketMode, RECEIVE_TIMEOUT};
use setu_common::{ProxyConfig, ProxyError, ProxyResult};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Handle into the accelerator runtime that the data plane needs:
/// its outbound socket and its loopback ingress address.
#[derive(Clone)]
pub struct AccelLink {
    pub socket: Arc<UdpSocket>,
    pub ingress: SocketAddr,
}

/// Read-only state shared by every worker thread.
pub struct DataPlane {
    pub config: Arc<ProxyConfig>,
    /// SO_REUSEPORT ingress sockets, one per dispatch worker. Slot
    /// workers and the bridge send return traffic through these too,
    /// selected by client address hash.
    pub ingress_sockets: Vec<Arc<UdpSocket>>,
    pub accel: AccelLink,
    pub server_addr: SocketAddr,
    pub quit: Arc<AtomicBool>,
}

pub struct ProxyStack {
    shared: Arc<DataPlane>,
    slots: Vec<Arc<Slot>>,
    dispatch_handles: Vec<JoinHandle<()>>,
    slot_handles: Vec<JoinHandle<()>>,
}

impl ProxyStack {
    /// Bind every socket and start every worker thread. Any failure
    /// here is fatal to the process.
    pub fn start(
        config: Arc<ProxyConfig>,
        accel: AccelLink,
        quit: Arc<AtomicBool>,
    ) -> ProxyResult<ProxyStack> {
        config.validate()?;

        let server_addr = config
            .server_address
            .to_socket_addr()
            .ok_or_else(|| ProxyError::Config("server_address is unset".to_string()))?;

        let mut ingress_sockets = Vec::with_capacity(config.num_threads);
        for _ in 0..config.num_threads {
            let socket = create_udp_socket(
                &config.proxy_bind_address,
                SocketMode::Blocking {
                    timeout: Some(RECEIVE_TIMEOUT),
                },
                true,
                config.socket_send_buffer_size,
                config.socket_receive_buffer_size,
            )?;
            ingress_sockets.push(Arc::new(socket));
        }
        info!(
            threads = config.num_threads,
            bind = %config.proxy_bind_address,
            "ingress sockets ready"
        );

        let mut slots = Vec::with_capacity(config.total_slots());
        for dispatch_index in 0..config.num_threads {
            for slot_index in 0..config.num_slots_per_thread {
                slots.push(Arc::new(Slot::new(&config, dispatch_index, slot_index)?));
            }
        }
        info!(slots = slots.len(), base_port = config.slot_base_port, "slot sockets ready");

        let shared = Arc::new(DataPlane {
            config: config.clone(),
            ingress_sockets,
            accel,
            server_addr,
            quit,
        });

        let mut slot_handles = Vec::with_capacity(slots.len());
        for slot in &slots {
            let shared = shared.clone();
            let slot = slot.clone();
            let name = format!("slot-{}-{}", slot.dispatch_index, slot.slot_index);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || run_slot_worker(shared, slot))
                .map_err(|e| ProxyError::Thread(format!("slot worker spawn: {}", e)))?;
            slot_handles.push(handle);
        }

        let mut dispatch_handles = Vec::with_capacity(config.num_threads);
        for dispatch_index in 0..config.num_threads {
            let begin = dispatch_index * config.num_slots_per_thread;
            let end = begin + config.num_slots_per_thread;
            let worker =
                DispatchWorker::new(dispatch_index, shared.clone(), slots[begin..end].to_vec());
            let handle = std::thread::Builder::new()
                .name(format!("dispatch-{}", dispatch_index))
                .spawn(move || worker.run())
                .map_err(|e| ProxyError::Thread(format!("dispatch worker spawn: {}", e)))?;
            dispatch_handles.push(handle);
        }

        Ok(ProxyStack {
            shared,
            slots,
            dispatch_handles,
            slot_handles,
        })
    }

    #[must_use]
    pub fn shared(&self) -> Arc<DataPlane> {
        self.shared.clone()
    }

    /// All slots in global order, for the accelerator bridge.
    #[must_use]
    pub fn slots(&self) -> Vec<Arc<Slot>> {
        self.slots.clone()
    }

    /// Join workers in shutdown order: dispatch, then slots. Set the
    /// quit flag first; every worker notices within one receive
    /// timeout.
    pub fn join(self) {
        debug!("joining dispatch workers");
        for handle in self.dispatch_handles {
            let _ = handle.join();
        }
        debug!("joining slot workers");
        for handle in self.slot_handles {
            let _ = handle.join();
        }
        info!("data plane stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use setu_common::Address;
    use std::sync::atomic::Ordering;

    fn test_config(public_port: u16, slot_base: u16) -> Arc<ProxyConfig> {
        Arc::new(ProxyConfig {
            num_threads: 2,
            num_slots_per_thread: 3,
            slot_base_port: slot_base,
            proxy_bind_address: Address::ipv4([127, 0, 0, 1], public_port),
            proxy_public_address: Address::ipv4([127, 0, 0, 1], public_port),
            server_address: Address::ipv4([127, 0, 0, 1], 47299),
            socket_send_buffer_size: 65536,
            socket_receive_buffer_size: 65536,
            ..ProxyConfig::default()
        })
    }

    fn test_accel_link(port: u16) -> AccelLink {
        let socket = create_udp_socket(
            &Address::ipv4([127, 0, 0, 1], 0),
            SocketMode::NonBlocking,
            false,
            65536,
            65536,
        )
        .unwrap();
        AccelLink {
            socket: Arc::new(socket),
            ingress: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[test]
    fn starts_and_stops_cleanly() {
        let quit = Arc::new(AtomicBool::new(false));
        let stack = ProxyStack::start(
            test_config(47200, 47210),
            test_accel_link(47290),
            quit.clone(),
        )
        .unwrap();
        assert_eq!(stack.slots().len(), 6);
        assert_eq!(stack.shared().ingress_sockets.len(), 2);
        quit.store(true, Ordering::Relaxed);
        stack.join();
    }

    #[test]
    fn rejects_invalid_config() {
        let quit = Arc::new(AtomicBool::new(false));
        let mut config = (*test_config(47230, 47240)).clone();
        config.num_threads = 0;
        let result = ProxyStack::start(Arc::new(config), test_accel_link(47291), quit);
        assert!(result.is_err());
    }
}
