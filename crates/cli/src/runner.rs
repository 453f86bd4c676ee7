// runner.rs
use anyhow::{Context, Result};
use setu_accel::{AcceleratorRuntime, Bridge, BridgeWorker, LoopbackRuntime};
use setu_common::{time, ProxyConfig};
use setu_dataplane::echo::EchoServer;
use setu_dataplane::{AccelLink, ProxyStack};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::args::{Cli, Mode};

pub fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(cli.to_config());
    config.validate().context("invalid configuration")?;

    match cli.mode {
        Mode::Proxy => run_proxy(config),
        Mode::Server => run_server(config),
        Mode::Test => crate::selftest::run(),
    }
}

fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let quit = Arc::new(AtomicBool::new(false));
    let flag = quit.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
        .context("failed to install interrupt handler")?;
    Ok(quit)
}

fn run_proxy(config: Arc<ProxyConfig>) -> Result<()> {
    info!("setu proxy");
    info!(
        threads = config.num_threads,
        slots_per_thread = config.num_slots_per_thread,
        bind = %config.proxy_bind_address,
        server = %config.server_address,
        "configuration"
    );

    let quit = install_interrupt_handler()?;

    let runtime = Arc::new(
        LoopbackRuntime::new(&config).context("failed to start accelerator runtime")?,
    );
    while !runtime.ready() {
        if quit.load(Ordering::Relaxed) {
            return Ok(());
        }
        time::sleep(0.1);
    }
    let accel_link = AccelLink {
        socket: runtime.socket().clone(),
        ingress: config
            .accelerator_bind_address
            .to_socket_addr()
            .context("accelerator bind address is unset")?,
    };

    let stack = ProxyStack::start(config.clone(), accel_link, quit.clone())
        .context("failed to start proxy stack")?;
    let bridge = Bridge::new(&stack.shared(), stack.slots(), runtime.magic());
    let bridge_worker =
        BridgeWorker::spawn(runtime, bridge, quit.clone()).context("failed to start bridge")?;

    info!("ready");
    while !quit.load(Ordering::Relaxed) {
        time::sleep(1.0);
    }

    info!("shutting down");
    stack.join();
    bridge_worker.join();
    info!("done");
    Ok(())
}

fn run_server(config: Arc<ProxyConfig>) -> Result<()> {
    info!("setu echo server");

    let quit = install_interrupt_handler()?;
    let server = EchoServer::start(config, quit.clone()).context("failed to start echo server")?;

    while !quit.load(Ordering::Relaxed) {
        time::sleep(1.0);
    }

    info!("shutting down");
    server.join();
    info!("done");
    Ok(())
}
