//! Command line interface for the `umyproxy` binary.
//!
//! Kept free of crate imports so `build.rs` can render the man page from it.

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Command line arguments for the `umyproxy` binary.
#[derive(Debug, Parser)]
#[command(
    name = "umyproxy",
    version,
    about = "Pooling MySQL proxy listening on a local Unix socket"
)]
pub struct Cli {
    /// MySQL server host.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// MySQL server port.
    #[arg(long, default_value_t = 3306)]
    pub port: u16,

    /// Path of the Unix socket clients connect to.
    #[arg(long, default_value = "/tmp/umyproxy.socket")]
    pub socket: PathBuf,

    /// Maximum number of backend connections [default: number of CPUs].
    #[arg(long)]
    pub size: Option<usize>,

    /// Seconds a backend connection may sit unused before it is discarded.
    #[arg(long, default_value_t = 3600)]
    pub life: u64,

    /// Milliseconds to wait for a backend connection when the pool is full.
    #[arg(long, default_value_t = 3000)]
    pub wait: u64,

    /// Milliseconds to wait when dialing the MySQL server.
    #[arg(long, default_value_t = 2000)]
    pub connect_timeout: u64,

    /// Seconds to wait for backend connections to be returned on shutdown.
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Largest accepted message, in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub max_packet: usize,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}
