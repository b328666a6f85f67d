//! ringframe: an io_uring frame server
//!
//! Accepts TCP connections, decodes length-prefixed chunk frames, reassembles
//! multi-chunk transactions and echoes each completed transaction back to
//! its sender.
//!
//! Features:
//! - One shared io_uring completion queue drained by a pool of dispatch threads
//! - Pooled receive and send buffers
//! - Configuration via CLI arguments or TOML file

use ringframe::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        ring_size = config.ring_size,
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        "Starting ringframe server"
    );

    run(config)
}

#[cfg(target_os = "linux")]
fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    use ringframe::protocols::frame::EchoHandler;
    use ringframe::runtime::AcceptListener;
    use std::sync::Arc;
    use tracing::debug;

    let listener = AcceptListener::new(config.listener_config()?)?;

    let echo = Arc::new(EchoHandler::new(config.chunk_size, config.max_transaction_size));
    echo.attach(&listener);

    listener.events().on_accepted(|ctx| {
        debug!(conn_id = ctx.key().get(), peer = ?ctx.peer_addr(), "Client connected");
    });
    listener.events().on_disconnected(|ctx, cause| match cause {
        Some(e) => debug!(conn_id = ctx.key().get(), error = %e, "Client disconnected"),
        None => debug!(conn_id = ctx.key().get(), "Client disconnected"),
    });

    let addr = listener.start()?;
    info!(addr = %addr, "Server ready");

    listener.wait();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_config: Config) -> Result<(), Box<dyn std::error::Error>> {
    Err(Box::new(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "Unsupported platform: io_uring requires Linux",
    )))
}
