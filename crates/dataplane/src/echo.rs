//! Echo server mode
//!
//! Stands in for the upstream game server during load tests: the same
//! SO_REUSEPORT worker layout as the proxy, each thread reflecting
//! every datagram straight back to its source.

use crate::socket::{create_udp_socket, is_recv_timeout, SocketMode, RECEIVE_TIMEOUT};
use setu_common::{ProxyConfig, ProxyError, ProxyResult};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace};

pub struct EchoServer {
    handles: Vec<JoinHandle<()>>,
}

impl EchoServer {
    pub fn start(config: Arc<ProxyConfig>, quit: Arc<AtomicBool>) -> ProxyResult<EchoServer> {
        let mut handles = Vec::with_capacity(config.num_threads);
        for index in 0..config.num_threads {
            let socket = create_udp_socket(
                &config.server_bind_address,
                SocketMode::Blocking {
                    timeout: Some(RECEIVE_TIMEOUT),
                },
                true,
                config.socket_send_buffer_size,
                config.socket_receive_buffer_size,
            )?;
            let quit = quit.clone();
            let max_packet_size = config.max_packet_size;
            let handle = std::thread::Builder::new()
                .name(format!("server-{}", index))
                .spawn(move || echo_worker(index, socket, max_packet_size, quit))
                .map_err(|e| ProxyError::Thread(format!("echo worker spawn: {}", e)))?;
            handles.push(handle);
        }
        info!(
            threads = config.num_threads,
            bind = %config.server_bind_address,
            "echo server ready"
        );
        Ok(EchoServer { handles })
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
        info!("echo server stopped");
    }
}

fn echo_worker(index: usize, socket: UdpSocket, max_packet_size: usize, quit: Arc<AtomicBool>) {
    let mut buffer = vec![0u8; max_packet_size];
    loop {
        if quit.load(Ordering::Relaxed) {
            break;
        }
        let (bytes, from) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(error) if is_recv_timeout(&error) => continue,
            Err(_) => break,
        };
        if bytes == 0 {
            continue;
        }
        trace!(server = index, bytes, %from, "reflecting packet");
        if let Err(error) = socket.send_to(&buffer[..bytes], from) {
            debug!(server = index, %error, "reflect send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use setu_common::Address;
    use std::time::Duration;

    #[test]
    fn reflects_datagrams() {
        let config = Arc::new(ProxyConfig {
            num_threads: 1,
            server_bind_address: Address::ipv4([127, 0, 0, 1], 47310),
            socket_send_buffer_size: 65536,
            socket_receive_buffer_size: 65536,
            ..ProxyConfig::default()
        });
        let quit = Arc::new(AtomicBool::new(false));
        let server = EchoServer::start(config, quit.clone()).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client.send_to(b"ping", "127.0.0.1:47310").unwrap();

        let mut buf = [0u8; 16];
        let (bytes, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..bytes], b"ping");
        assert_eq!(from.port(), 47310);

        quit.store(true, Ordering::Relaxed);
        server.join();
    }
}
