use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use icyconfig::{parse_duration, Config};

#[derive(Clone, Debug, Parser)]
#[command(name = "icycat", version = env!("CARGO_PKG_VERSION"), about, long_about = None)]
pub struct Cli {
    /// Stream to relay: http(s):// URL, file:// URL or local path
    pub source: Option<String>,

    /// Output: "-" for stdout, a file path, a .ts file or udp://host:port[?pkt_size=N]
    #[arg(short, long)]
    pub output: Option<String>,

    /// User-Agent sent to the upstream server
    #[arg(short = 'A', long)]
    pub user_agent: Option<String>,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Default UDP datagram size, rounded down to a multiple of 188
    #[arg(long)]
    pub packet_size: Option<usize>,

    /// Reconnect floor and stall watchdog (e.g. 500ms, 5s, 1m)
    #[arg(short, long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Reconnect even after the source ends cleanly
    #[arg(long)]
    pub restart_on_eof: bool,

    /// Serve bandwidth metrics over HTTP
    #[arg(long)]
    pub metrics: bool,

    /// Metrics port (implies --metrics)
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Metrics listen address, e.g. 127.0.0.1:9100 (implies --metrics)
    #[arg(long)]
    pub metrics_address: Option<String>,

    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Les options passées en ligne de commande l'emportent sur le fichier et l'environnement
    pub fn apply(&self, config: &mut Config) {
        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        if let Some(ua) = &self.user_agent {
            config.user_agent = ua.clone();
        }
        if self.quiet {
            config.quiet = true;
        }
        if let Some(size) = self.packet_size {
            config.packet_size = size;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if self.restart_on_eof {
            config.restart_on_eof = true;
        }
        if self.metrics {
            config.metrics.enabled = true;
        }
        if let Some(port) = self.metrics_port {
            config.metrics.port = port;
            config.metrics.enabled = true;
        }
        if let Some(address) = &self.metrics_address {
            config.metrics.address = Some(address.clone());
            config.metrics.enabled = true;
        }
    }
}
