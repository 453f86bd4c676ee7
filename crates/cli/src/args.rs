use clap::{Parser, ValueEnum};
use setu_common::{Address, ProxyConfig};

#[derive(Parser)]
#[command(name = "setu")]
#[command(version = "0.1.0")]
#[command(about = "Accelerated UDP reverse proxy", long_about = None)]
pub struct Cli {
    /// Run mode: the proxy itself, an echo server standing in for the
    /// upstream, or the in-process self-test suite
    #[arg(long, env = "MODE", value_enum, default_value_t = Mode::Proxy)]
    pub mode: Mode,

    /// Dispatch worker count (and ingress socket count); defaults to
    /// the CPU count capped at 16
    #[arg(long, env = "NUM_THREADS")]
    pub num_threads: Option<usize>,

    /// Slots owned by each dispatch worker
    #[arg(long, env = "NUM_SLOTS_PER_THREAD")]
    pub num_slots_per_thread: Option<usize>,

    /// UDP port of the first slot socket
    #[arg(long, env = "SLOT_BASE_PORT")]
    pub slot_base_port: Option<u16>,

    /// Seconds of client silence before a slot is reclaimed
    #[arg(long, env = "SLOT_TIMEOUT_SECONDS")]
    pub slot_timeout_seconds: Option<f64>,

    /// Public address clients reach the proxy on
    #[arg(long, env = "PROXY_ADDRESS")]
    pub proxy_address: Option<Address>,

    /// Ingress bind address shared by the dispatch workers
    #[arg(long, env = "PROXY_BIND_ADDRESS")]
    pub proxy_bind_address: Option<Address>,

    /// Upstream game server
    #[arg(long, env = "SERVER_ADDRESS")]
    pub server_address: Option<Address>,

    /// Bind address for echo-server mode
    #[arg(long, env = "SERVER_BIND_ADDRESS")]
    pub server_bind_address: Option<Address>,

    /// Address the accelerator advertises to relays
    #[arg(long, env = "ACCELERATOR_ADDRESS")]
    pub accelerator_address: Option<Address>,

    /// Loopback ingress of the accelerator runtime
    #[arg(long, env = "ACCELERATOR_BIND_ADDRESS")]
    pub accelerator_bind_address: Option<Address>,

    /// Datacenter tag handed to the accelerator runtime
    #[arg(long, env = "ACCELERATOR_DATACENTER")]
    pub accelerator_datacenter: Option<String>,

    /// Private key handed to the accelerator runtime
    #[arg(long, env = "ACCELERATOR_PRIVATE_KEY", hide_env_values = true)]
    pub accelerator_private_key: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Proxy,
    Server,
    Test,
}

impl Cli {
    /// Overlay the parsed flags and environment onto the platform
    /// defaults.
    pub fn to_config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        if let Some(num_threads) = self.num_threads {
            config.num_threads = num_threads;
        }
        if let Some(num_slots) = self.num_slots_per_thread {
            config.num_slots_per_thread = num_slots;
        }
        if let Some(port) = self.slot_base_port {
            config.slot_base_port = port;
        }
        if let Some(timeout) = self.slot_timeout_seconds {
            config.slot_timeout_seconds = timeout;
        }
        if let Some(address) = self.proxy_address {
            config.proxy_public_address = address;
        }
        if let Some(address) = self.proxy_bind_address {
            config.proxy_bind_address = address;
        }
        if let Some(address) = self.server_address {
            config.server_address = address;
        }
        if let Some(address) = self.server_bind_address {
            config.server_bind_address = address;
        }
        if let Some(address) = self.accelerator_address {
            config.accelerator_public_address = address;
        }
        if let Some(address) = self.accelerator_bind_address {
            config.accelerator_bind_address = address;
        }
        if let Some(datacenter) = &self.accelerator_datacenter {
            config.accelerator_datacenter = datacenter.clone();
        }
        if let Some(private_key) = &self.accelerator_private_key {
            config.accelerator_private_key = private_key.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["setu"]);
        assert_eq!(cli.mode, Mode::Proxy);
        let config = cli.to_config();
        config.validate().unwrap();
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "setu",
            "--mode",
            "server",
            "--num-threads",
            "2",
            "--server-address",
            "127.0.0.1:40001",
            "--slot-base-port",
            "11000",
        ]);
        assert_eq!(cli.mode, Mode::Server);
        let config = cli.to_config();
        assert_eq!(config.num_threads, 2);
        assert_eq!(config.slot_base_port, 11000);
        assert_eq!(
            config.server_address,
            Address::ipv4([127, 0, 0, 1], 40001)
        );
    }

    #[test]
    fn bad_address_is_rejected() {
        assert!(Cli::try_parse_from(["setu", "--server-address", "nonsense"]).is_err());
    }
}
