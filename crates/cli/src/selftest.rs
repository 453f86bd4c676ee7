//! In-process self-test suite (MODE=test)
//!
//! Property checks for the session table, packet filter, and address
//! utilities, followed by seeded end-to-end scenarios over loopback
//! sockets. Runs inside the shipped binary so a deployment can vet
//! itself without a test toolchain; exits nonzero on any failure.

use anyhow::{bail, Result};
use setu_accel::{AcceleratorRuntime, Bridge, BridgeWorker, LoopbackRuntime};
use setu_common::{fnv1a, Address, ProxyConfig};
use setu_dataplane::{AccelLink, Envelope, ProxyStack, ENVELOPE_BYTES};
use setu_filter::{
    advanced_packet_filter, basic_packet_filter, packet_type, stamp_packet,
};
use setu_session::SessionTable;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Check = fn() -> Result<(), String>;

pub fn run() -> Result<()> {
    println!("setu self test");

    let suites: &[(&str, Check)] = &[
        ("address utilities", address_checks),
        ("fnv hash", fnv_checks),
        ("session table", session_table_checks),
        ("packet filter", filter_checks),
        ("direct passthrough round trip", direct_round_trip_scenario),
        ("new client slot allocation", slot_allocation_scenario),
        ("filter drop", filter_drop_scenario),
        ("session upgrade", session_upgrade_scenario),
        ("route update flips return path", route_update_scenario),
        ("idle eviction", idle_eviction_scenario),
    ];

    let mut failures = 0;
    for (name, check) in suites {
        match check() {
            Ok(()) => println!("   passed: {}", name),
            Err(reason) => {
                println!("   FAILED: {}: {}", name, reason);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} self test(s) failed", failures);
    }
    println!("all self tests passed");
    Ok(())
}

fn check(condition: bool, what: &str) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(what.to_string())
    }
}

fn err<E: std::fmt::Display>(error: E) -> String {
    error.to_string()
}

// ---------------------------------------------------------------
// property checks

fn address_checks() -> Result<(), String> {
    for input in ["1.2.3.4:5000", "10.0.0.1", "[::1]:9000"] {
        let parsed: Address = input.parse().map_err(err)?;
        let reparsed: Address = parsed.to_string().parse().map_err(err)?;
        check(parsed == reparsed, "parse/format round trip")?;
    }

    let a = Address::ipv4([1, 2, 3, 4], 80);
    let b = Address::ipv4([1, 2, 3, 4], 80);
    let c: Address = "[::1.2.3.4]:80".parse().map_err(err)?;
    check(a == a, "equality reflexive")?;
    check(a == b && b == a, "equality symmetric")?;
    check(a != c, "different tags compare unequal")?;
    check(Address::None.to_string() == "NONE", "none formatting")?;
    check("junk".parse::<Address>().is_err(), "garbage rejected")?;
    Ok(())
}

fn fnv_checks() -> Result<(), String> {
    check(fnv1a(b"") == 0xCBF2_9CE4_8422_2325, "empty input yields offset basis")?;
    check(fnv1a(b"foobar") == 0x8594_4171_F739_67E8, "known vector")?;
    Ok(())
}

fn session_table_checks() -> Result<(), String> {
    let capacity = 64;
    let mut table = SessionTable::new(capacity);

    // |K| <= C/2 all retrievable
    for i in 0..(capacity / 2) as u16 {
        table.insert(Address::ipv4([127, 0, 0, 1], 20000 + i), u32::from(i));
    }
    for i in 0..(capacity / 2) as u16 {
        let value = table.get(&Address::ipv4([127, 0, 0, 1], 20000 + i));
        check(value == Some(u32::from(i)), "half-full retrieval")?;
    }

    let key = Address::ipv4([127, 0, 0, 1], 55001);
    let mut table = SessionTable::new(capacity);
    table.insert(key, 7);
    table.swap();
    check(table.get(&key) == Some(7), "survives one swap")?;

    let mut table = SessionTable::new(capacity);
    table.insert(key, 7);
    table.swap();
    table.swap();
    check(table.get(&key).is_none(), "gone after two swaps")?;

    // promotion keeps a touched entry alive across the next swap
    let mut table = SessionTable::new(capacity);
    table.insert(key, 7);
    table.swap();
    check(table.get(&key) == Some(7), "previous-epoch hit")?;
    table.swap();
    check(table.get(&key) == Some(7), "promoted entry survives")?;

    let mut table = SessionTable::new(capacity);
    check(table.update(key, 1), "update inserts new key")?;
    check(!table.update(key, 2), "update sees existing key")?;
    check(table.get(&key) == Some(1), "update keeps first value")?;
    Ok(())
}

fn filter_checks() -> Result<(), String> {
    let from = Address::ipv4([127, 0, 0, 1], 55000);
    let to = Address::ipv4([127, 0, 0, 1], 65000);
    let magic = [7u8, 6, 5, 4, 3, 2, 1, 0];

    let mut data = vec![0u8; 64];
    data[0] = packet_type::CLIENT_TO_SERVER;
    for (i, byte) in data.iter_mut().enumerate().skip(16).take(46) {
        *byte = i as u8;
    }
    stamp_packet(&mut data, &magic, &from, &to);

    check(basic_packet_filter(&data), "stamped packet passes basic")?;
    check(
        advanced_packet_filter(&data, &magic, &from, &to),
        "stamped packet passes advanced",
    )?;

    for index in 1..16 {
        let mut tampered = data.clone();
        tampered[index] ^= 0x08;
        check(
            !advanced_packet_filter(&tampered, &magic, &from, &to),
            "chonkle tamper rejected",
        )?;
    }
    let mut tampered = data.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x08;
    check(
        !advanced_packet_filter(&tampered, &magic, &from, &to),
        "pittle tamper rejected",
    )?;
    check(
        !advanced_packet_filter(&data[..63], &magic, &from, &to),
        "length change rejected",
    )?;

    check(basic_packet_filter(&[0u8]), "passthrough passes basic")?;
    check(!basic_packet_filter(&[]), "empty rejected")?;
    let mut zeroed = data.clone();
    for byte in &mut zeroed[1..16] {
        *byte = 0;
    }
    check(!basic_packet_filter(&zeroed), "zeroed chonkle rejected")?;
    Ok(())
}

// ---------------------------------------------------------------
// seeded end-to-end scenarios

struct Harness {
    quit: Arc<AtomicBool>,
    stack: Option<ProxyStack>,
    bridge: Option<BridgeWorker>,
    runtime: Option<Arc<LoopbackRuntime>>,
}

impl Harness {
    /// Full stack with the loopback runtime and bridge attached.
    fn with_accelerator(config: ProxyConfig) -> Result<Harness, String> {
        let config = Arc::new(config);
        let quit = Arc::new(AtomicBool::new(false));
        let runtime = Arc::new(LoopbackRuntime::new(&config).map_err(err)?);
        let link = AccelLink {
            socket: runtime.socket().clone(),
            ingress: config
                .accelerator_bind_address
                .to_socket_addr()
                .ok_or("accelerator bind address unset")?,
        };
        let stack = ProxyStack::start(config, link, quit.clone()).map_err(err)?;
        let bridge = Bridge::new(&stack.shared(), stack.slots(), runtime.magic());
        let bridge = BridgeWorker::spawn(runtime.clone(), bridge, quit.clone()).map_err(err)?;
        Ok(Harness {
            quit,
            stack: Some(stack),
            bridge: Some(bridge),
            runtime: Some(runtime),
        })
    }

    /// Stack only; accelerator frames land on the returned observer
    /// socket instead of a runtime.
    fn with_observer(config: ProxyConfig) -> Result<(Harness, UdpSocket), String> {
        let config = Arc::new(config);
        let quit = Arc::new(AtomicBool::new(false));
        let observer = UdpSocket::bind(
            config
                .accelerator_bind_address
                .to_socket_addr()
                .ok_or("accelerator bind address unset")?,
        )
        .map_err(err)?;
        observer
            .set_read_timeout(Some(Duration::from_millis(300)))
            .map_err(err)?;
        let outbound = UdpSocket::bind("127.0.0.1:0").map_err(err)?;
        let link = AccelLink {
            socket: Arc::new(outbound),
            ingress: observer.local_addr().map_err(err)?,
        };
        let stack = ProxyStack::start(config, link, quit.clone()).map_err(err)?;
        Ok((
            Harness {
                quit,
                stack: Some(stack),
                bridge: None,
                runtime: None,
            },
            observer,
        ))
    }

    fn runtime(&self) -> &Arc<LoopbackRuntime> {
        self.runtime.as_ref().expect("harness has no runtime")
    }

    /// Port of the slot currently serving `client`, if any.
    fn slot_port_for(&self, client: &Address) -> Option<u16> {
        let stack = self.stack.as_ref()?;
        for slot in stack.slots() {
            let state = slot.snapshot();
            if state.allocated && state.client_address == *client {
                return slot.socket.local_addr().ok().map(|a| a.port());
            }
        }
        None
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(stack) = self.stack.take() {
            stack.join();
        }
        if let Some(bridge) = self.bridge.take() {
            bridge.join();
        }
    }
}

fn scenario_config(
    proxy_port: u16,
    slot_base_port: u16,
    server_port: u16,
    accelerator_port: u16,
) -> ProxyConfig {
    ProxyConfig {
        num_threads: 1,
        num_slots_per_thread: 4,
        slot_base_port,
        proxy_bind_address: Address::ipv4([0, 0, 0, 0], proxy_port),
        proxy_public_address: Address::ipv4([127, 0, 0, 1], proxy_port),
        server_address: Address::ipv4([127, 0, 0, 1], server_port),
        accelerator_bind_address: Address::ipv4([127, 0, 0, 1], accelerator_port),
        accelerator_public_address: Address::ipv4([127, 0, 0, 1], accelerator_port),
        socket_send_buffer_size: 1_000_000,
        socket_receive_buffer_size: 1_000_000,
        ..ProxyConfig::default()
    }
}

fn bind_client(port: u16) -> Result<UdpSocket, String> {
    let socket = UdpSocket::bind(("127.0.0.1", port)).map_err(err)?;
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .map_err(err)?;
    Ok(socket)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Scenario: one passthrough packet out, one reply back, all on the
/// documented literal ports.
fn direct_round_trip_scenario() -> Result<(), String> {
    let harness = Harness::with_accelerator(scenario_config(65000, 10000, 40000, 43050))?;
    let server = bind_client(40000)?;
    let client = bind_client(55000)?;

    client
        .send_to(&[0, b'a', b'b', b'c'], ("127.0.0.1", 65000))
        .map_err(err)?;

    let mut buf = [0u8; 64];
    let (bytes, from) = server.recv_from(&mut buf).map_err(|e| format!("server recv: {}", e))?;
    check(&buf[..bytes] == b"abc", "server payload")?;
    check(from.port() == 10000, "server sees the first slot port")?;

    server.send_to(b"xyz", from).map_err(err)?;
    let (bytes, from) = client.recv_from(&mut buf).map_err(|e| format!("client recv: {}", e))?;
    check(&buf[..bytes] == [0, b'x', b'y', b'z'], "client payload")?;
    check(from.port() == 65000, "reply comes from the public port")?;

    drop(harness);
    Ok(())
}

/// Scenario: two new clients land in two distinct slots, and the
/// mapping is stable per client.
fn slot_allocation_scenario() -> Result<(), String> {
    let harness = Harness::with_accelerator(scenario_config(43110, 43120, 43140, 43150))?;
    let server = bind_client(43140)?;
    let client1 = bind_client(55001)?;
    let client2 = bind_client(55002)?;

    let mut buf = [0u8; 64];
    client1.send_to(&[0, 1], ("127.0.0.1", 43110)).map_err(err)?;
    let (_, from1) = server.recv_from(&mut buf).map_err(err)?;
    client2.send_to(&[0, 2], ("127.0.0.1", 43110)).map_err(err)?;
    let (_, from2) = server.recv_from(&mut buf).map_err(err)?;

    check(from1.port() != from2.port(), "distinct slots")?;
    check(
        (43120..43124).contains(&from1.port()) && (43120..43124).contains(&from2.port()),
        "slot ports in range",
    )?;

    // the table keeps each client on its slot
    client1.send_to(&[0, 3], ("127.0.0.1", 43110)).map_err(err)?;
    let (_, again) = server.recv_from(&mut buf).map_err(err)?;
    check(again.port() == from1.port(), "mapping is stable")?;
    drop(harness);
    Ok(())
}

/// Scenario: a non-passthrough packet with a zeroed chonkle dies at
/// the dispatch basic filter; no envelope reaches the accelerator.
fn filter_drop_scenario() -> Result<(), String> {
    let (harness, observer) = Harness::with_observer(scenario_config(43210, 43220, 43240, 43250))?;
    let client = bind_client(55005)?;
    let client_address = Address::ipv4([127, 0, 0, 1], 55005);

    // sanity: a passthrough from a new client produces a notify frame
    client.send_to(&[0, 9], ("127.0.0.1", 43210)).map_err(err)?;
    let mut buf = [0u8; 64];
    let (bytes, _) = observer
        .recv_from(&mut buf)
        .map_err(|e| format!("notify frame missing: {}", e))?;
    check(bytes == ENVELOPE_BYTES + 2, "notify frame length")?;
    let envelope = Envelope::read(&buf[..bytes]).ok_or("notify envelope unreadable")?;
    check(envelope.packet_type == packet_type::PASSTHROUGH, "notify type")?;
    check(envelope.client == client_address, "notify client")?;
    check(buf[ENVELOPE_BYTES] == 0, "original first byte preserved")?;

    // zeroed chonkle: silently dropped, nothing tunneled
    let mut junk = [0u8; 32];
    junk[0] = packet_type::CLIENT_TO_SERVER;
    client.send_to(&junk, ("127.0.0.1", 43210)).map_err(err)?;
    check(
        observer.recv_from(&mut buf).is_err(),
        "filtered packet must not reach the accelerator",
    )?;

    drop(harness);
    Ok(())
}

/// Scenario: the first passthrough upgrades the session exactly once.
fn session_upgrade_scenario() -> Result<(), String> {
    let harness = Harness::with_accelerator(scenario_config(43310, 43320, 43340, 43350))?;
    let server = bind_client(43340)?;
    let client = bind_client(55010)?;
    let client_address = Address::ipv4([127, 0, 0, 1], 55010);

    client.send_to(&[0, 1], ("127.0.0.1", 43310)).map_err(err)?;
    let runtime = harness.runtime().clone();
    check(
        wait_until(Duration::from_secs(2), || runtime.upgrade_count() == 1),
        "upgrade_session invoked once",
    )?;
    check(runtime.has_session(&client_address), "session recorded")?;

    // further passthrough traffic must not re-upgrade
    client.send_to(&[0, 2], ("127.0.0.1", 43310)).map_err(err)?;
    client.send_to(&[0, 3], ("127.0.0.1", 43310)).map_err(err)?;
    std::thread::sleep(Duration::from_millis(200));
    check(runtime.upgrade_count() == 1, "no repeat upgrade")?;

    let mut buf = [0u8; 64];
    let _ = server.recv_from(&mut buf);
    drop(harness);
    Ok(())
}

/// Scenario: a route update flips the slot to the accelerated return
/// path, and replies still reach the client through the tunnel.
fn route_update_scenario() -> Result<(), String> {
    let harness = Harness::with_accelerator(scenario_config(43410, 43420, 43440, 43450))?;
    let server = bind_client(43440)?;
    let client = bind_client(55010)?;
    let client_address = Address::ipv4([127, 0, 0, 1], 55010);

    client.send_to(&[0, 1], ("127.0.0.1", 43410)).map_err(err)?;
    let mut buf = [0u8; 64];
    let (_, slot_addr) = server.recv_from(&mut buf).map_err(err)?;

    let runtime = harness.runtime().clone();
    check(
        wait_until(Duration::from_secs(2), || runtime.upgrade_count() == 1),
        "session upgraded",
    )?;

    runtime.set_route(client_address, true);
    let accelerated = wait_until(Duration::from_secs(2), || {
        harness
            .stack
            .as_ref()
            .map(|stack| {
                stack.slots().iter().any(|slot| {
                    let state = slot.snapshot();
                    state.allocated
                        && state.client_address == client_address
                        && state.accelerated
                })
            })
            .unwrap_or(false)
    });
    check(accelerated, "slot flipped to accelerated")?;
    check(
        harness.slot_port_for(&client_address) == Some(slot_addr.port()),
        "slot identity unchanged",
    )?;

    // the reply now rides the accelerator tunnel and still arrives
    // with passthrough framing from the public port
    server.send_to(b"pong", slot_addr).map_err(err)?;
    let (bytes, from) = client
        .recv_from(&mut buf)
        .map_err(|e| format!("accelerated reply missing: {}", e))?;
    check(&buf[..bytes] == [0, b'p', b'o', b'n', b'g'], "tunneled payload")?;
    check(from.port() == 43410, "reply still from the public port")?;

    drop(harness);
    Ok(())
}

/// Scenario: an idle slot is reclaimed by a new client, and the old
/// client re-enters as new once its table entry ages out.
fn idle_eviction_scenario() -> Result<(), String> {
    let mut config = scenario_config(43510, 43520, 43540, 43550);
    config.slot_timeout_seconds = 1.0;
    let harness = Harness::with_accelerator(config)?;
    let server = bind_client(43540)?;
    let client1 = bind_client(55001)?;
    let client3 = bind_client(55003)?;

    let mut buf = [0u8; 64];
    client1.send_to(&[0, 1], ("127.0.0.1", 43510)).map_err(err)?;
    let (_, from1) = server.recv_from(&mut buf).map_err(err)?;
    check(from1.port() == 43520, "first client takes the first slot")?;

    // let the slot idle past the timeout
    std::thread::sleep(Duration::from_millis(1250));
    client3.send_to(&[0, 3], ("127.0.0.1", 43510)).map_err(err)?;
    let (_, from3) = server.recv_from(&mut buf).map_err(err)?;
    check(from3.port() == from1.port(), "idle slot reclaimed by new client")?;

    // one more epoch so the first client's table entry dies too
    std::thread::sleep(Duration::from_millis(600));
    client3.send_to(&[0, 4], ("127.0.0.1", 43510)).map_err(err)?;
    let (_, from3b) = server.recv_from(&mut buf).map_err(err)?;
    check(from3b.port() == from3.port(), "reclaimed slot is stable")?;

    client1.send_to(&[0, 5], ("127.0.0.1", 43510)).map_err(err)?;
    let (_, from1b) = server.recv_from(&mut buf).map_err(err)?;
    check(
        from1b.port() != from3.port(),
        "returning client is treated as new",
    )?;
    check(
        (43520..43524).contains(&from1b.port()),
        "returning client lands in an idle slot",
    )?;

    drop(harness);
    Ok(())
}
