extern crate tokio;

use clap::Parser;

pub mod client;
pub mod config;
pub mod manager;
pub mod protos;
pub mod radar;
pub mod receiver;
pub mod session;
pub mod stats;
pub mod util;

use radar::legend::ColorScheme;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PACKAGE: &str = env!("CARGO_PKG_NAME");

#[derive(Parser, Clone, Debug)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Host name or address of the radar server
    #[arg(long)]
    pub host: Option<String>,

    /// Port of the radar server
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Seconds between discovery polls while the server is reachable
    #[arg(short, long)]
    pub discovery_interval: Option<u64>,

    /// Seconds between connection attempts while the server is unreachable
    #[arg(short, long)]
    pub reconnect_interval: Option<u64>,

    /// Milliseconds to wait before reopening a dropped spoke stream
    #[arg(long, default_value_t = 5000)]
    pub spoke_backoff: u64,

    /// Milliseconds between manager polls
    #[arg(long, default_value_t = 100)]
    pub poll_interval: u64,

    /// Color scheme for the intensity lookup table
    #[arg(short, long, value_enum)]
    pub scheme: Option<ColorScheme>,

    /// Seconds between statistics reports, 0 disables them
    #[arg(long, default_value_t = 10)]
    pub stats_interval: u64,

    /// Do not read or write the settings file
    #[arg(long, default_value_t = false)]
    pub no_persist: bool,
}
