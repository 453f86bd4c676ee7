//! Process-wide proxy configuration
//!
//! Built once at startup from flags and environment, validated, then
//! shared read-only behind an `Arc` by every worker. There is no
//! dynamic reconfiguration.

use crate::address::Address;
use crate::error::{ProxyError, ProxyResult};

/// Hard cap on dispatch workers (and SO_REUSEPORT ingress sockets).
pub const MAX_DISPATCH_THREADS: usize = 16;

/// Wire MTU budget for a single datagram.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// Session table capacity; must stay a power of two.
pub const DEFAULT_SESSION_TABLE_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Dispatch worker count, one SO_REUSEPORT ingress socket each.
    pub num_threads: usize,
    /// Slots (outbound sockets) owned by each dispatch worker.
    pub num_slots_per_thread: usize,
    /// Slot `i` of dispatch `d` binds `slot_base_port + d * num_slots_per_thread + i`.
    pub slot_base_port: u16,
    pub max_packet_size: usize,
    /// Idle TTL before a slot may be reassigned to a new client.
    pub slot_timeout_seconds: f64,
    pub socket_send_buffer_size: usize,
    pub socket_receive_buffer_size: usize,
    /// Per-dispatch session table capacity (power of two).
    pub session_table_capacity: usize,
    /// Public ingress bind address shared by all dispatch workers.
    pub proxy_bind_address: Address,
    /// Address clients reach the proxy on; salt for outgoing checksum rewrites.
    pub proxy_public_address: Address,
    /// Bind address for echo-server mode.
    pub server_bind_address: Address,
    /// Upstream game server.
    pub server_address: Address,
    /// Loopback ingress of the accelerator runtime.
    pub accelerator_bind_address: Address,
    /// Address the accelerator advertises to remote relays.
    pub accelerator_public_address: Address,
    /// Opaque datacenter tag handed to the accelerator runtime.
    pub accelerator_datacenter: String,
    /// Opaque private key handed to the accelerator runtime.
    pub accelerator_private_key: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            num_threads: detect_num_threads(),
            num_slots_per_thread: default_slots_per_thread(),
            slot_base_port: 50000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            slot_timeout_seconds: 60.0,
            socket_send_buffer_size: default_socket_buffer_size(),
            socket_receive_buffer_size: default_socket_buffer_size(),
            session_table_capacity: DEFAULT_SESSION_TABLE_CAPACITY,
            proxy_bind_address: Address::ipv4([0, 0, 0, 0], 65000),
            proxy_public_address: Address::ipv4([127, 0, 0, 1], 65000),
            server_bind_address: Address::ipv4([0, 0, 0, 0], 40000),
            server_address: Address::ipv4([127, 0, 0, 1], 40000),
            accelerator_bind_address: Address::ipv4([127, 0, 0, 1], 45000),
            accelerator_public_address: Address::ipv4([127, 0, 0, 1], 45000),
            accelerator_datacenter: "local".to_string(),
            accelerator_private_key: String::new(),
        }
    }
}

impl ProxyConfig {
    /// Total slot count across all dispatch workers.
    #[inline]
    #[must_use]
    pub fn total_slots(&self) -> usize {
        self.num_threads * self.num_slots_per_thread
    }

    /// Globally unique port for a slot.
    #[inline]
    #[must_use]
    pub fn slot_port(&self, global_index: usize) -> u16 {
        self.slot_base_port.wrapping_add(global_index as u16)
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.num_threads == 0 || self.num_threads > MAX_DISPATCH_THREADS {
            return Err(ProxyError::Config(format!(
                "num_threads must be in 1..={}, got {}",
                MAX_DISPATCH_THREADS, self.num_threads
            )));
        }
        if self.num_slots_per_thread == 0 {
            return Err(ProxyError::Config(
                "num_slots_per_thread must be non-zero".to_string(),
            ));
        }
        if !self.session_table_capacity.is_power_of_two() {
            return Err(ProxyError::Config(format!(
                "session_table_capacity must be a power of two, got {}",
                self.session_table_capacity
            )));
        }
        if self.max_packet_size == 0 {
            return Err(ProxyError::Config("max_packet_size must be non-zero".to_string()));
        }
        if self.slot_timeout_seconds <= 0.0 {
            return Err(ProxyError::Config(
                "slot_timeout_seconds must be positive".to_string(),
            ));
        }
        let top_port = self.slot_base_port as usize + self.total_slots() - 1;
        if top_port > u16::MAX as usize {
            return Err(ProxyError::Config(format!(
                "slot ports overflow: base {} + {} slots",
                self.slot_base_port,
                self.total_slots()
            )));
        }
        for (name, address) in [
            ("proxy_bind_address", &self.proxy_bind_address),
            ("proxy_public_address", &self.proxy_public_address),
            ("server_bind_address", &self.server_bind_address),
            ("server_address", &self.server_address),
            ("accelerator_bind_address", &self.accelerator_bind_address),
            ("accelerator_public_address", &self.accelerator_public_address),
        ] {
            if !address.is_ipv4() {
                return Err(ProxyError::Config(format!(
                    "{} must be IPv4, got {}",
                    name, address
                )));
            }
        }
        Ok(())
    }
}

/// CPU count capped at [`MAX_DISPATCH_THREADS`].
#[must_use]
pub fn detect_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DISPATCH_THREADS)
}

fn default_slots_per_thread() -> usize {
    if cfg!(target_os = "linux") {
        1000
    } else {
        10
    }
}

fn default_socket_buffer_size() -> usize {
    if cfg!(target_os = "linux") {
        10_000_000
    } else {
        1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ProxyConfig::default().validate().unwrap();
    }

    #[test]
    fn thread_detection_is_capped() {
        let n = detect_num_threads();
        assert!(n >= 1 && n <= MAX_DISPATCH_THREADS);
    }

    #[test]
    fn rejects_zero_threads() {
        let config = ProxyConfig {
            num_threads: 0,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_table() {
        let config = ProxyConfig {
            session_table_capacity: 4095,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_slot_port_overflow() {
        let config = ProxyConfig {
            num_threads: 2,
            num_slots_per_thread: 1000,
            slot_base_port: 65000,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_ipv6_endpoints() {
        let config = ProxyConfig {
            server_address: "[::1]:40000".parse().unwrap(),
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn slot_ports_are_globally_unique() {
        let config = ProxyConfig {
            num_threads: 2,
            num_slots_per_thread: 4,
            slot_base_port: 10000,
            ..ProxyConfig::default()
        };
        let mut seen = std::collections::HashSet::new();
        for global in 0..config.total_slots() {
            assert!(seen.insert(config.slot_port(global)));
        }
        assert_eq!(config.slot_port(5), 10005);
    }
}
