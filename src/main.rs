//! `umyproxy` binary: parse flags, build the pool, and serve until Ctrl+C.

mod cli;

use std::{num::NonZeroUsize, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use umyproxy::{
    backend::TcpConnector,
    codec::PacketCodec,
    pool::{Pool, PoolOptions},
    server::{ProxyConfig, ProxyServer},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    init_logging(cli.debug);

    #[cfg(feature = "metrics")]
    if let Some(addr) = cli.metrics_addr {
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => info!(%addr, "serving metrics"),
            Err(e) => {
                error!(error = %e, "failed to install metrics exporter");
                return ExitCode::FAILURE;
            }
        }
    }

    let codec = PacketCodec::new(cli.max_packet);
    let options = PoolOptions::default()
        .with_max_size(
            cli.size
                .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get)),
        )
        .with_max_lifetime(Duration::from_secs(cli.life))
        .with_wait_timeout(Duration::from_millis(cli.wait))
        .normalized();
    let connector = TcpConnector::new(cli.host, cli.port)
        .with_connect_timeout(Duration::from_millis(cli.connect_timeout))
        .with_codec(codec);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %cli.socket.display(),
        backend = %connector.address(),
        pool_size = options.max_size,
        max_lifetime = ?options.max_lifetime,
        wait_timeout = ?options.wait_timeout,
        "starting umyproxy"
    );

    let pool = Arc::new(Pool::new(connector, options));
    let config = ProxyConfig::default()
        .with_socket_path(cli.socket)
        .with_shutdown_timeout(Duration::from_secs(cli.shutdown_timeout))
        .with_codec(codec);

    let result = match ProxyServer::bind(config, pool) {
        Ok(server) => server.run().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            info!("umyproxy stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "umyproxy failed");
            ExitCode::FAILURE
        }
    }
}

/// Install the global subscriber; `RUST_LOG` overrides the default level.
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
