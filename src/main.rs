//! Forwarding HTTP CONNECT tunnel client: reads a JSON configuration file,
//! starts whichever local entrypoints it names, and tunnels every accepted
//! connection through a single upstream HTTP/HTTPS proxy.
//!
//! Grounded on the teacher's own signal-handling (`ctrlc`, matching
//! `system/signal.rs`'s intent without the `unsafe static mut`) and the
//! sibling CLI tooling's `clap`-derive convention.

mod addr;
mod bogusdns;
mod config;
mod entry;
mod error;
mod gfwlist;
mod logging;
mod pool;
mod proxy;
mod tunnel;
mod upstream;

use clap::Parser;

use config::Config;
use proxy::Proxy;

#[derive(Parser, Debug)]
#[command(name = "tunnelfront", about = "Forwarding HTTP CONNECT tunnel client")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(|| config::default_path().to_string());

    let cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration from {config_path:?}: {e}");
            std::process::exit(1);
        }
    };

    logging::init(&cfg);
    log::info!("starting tunnelfront (config: {config_path})");

    let proxy = match Proxy::start(cfg).await {
        Ok(proxy) => proxy,
        Err(e) => {
            log::error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    wait_for_shutdown_signal().await;
    proxy.shutdown().await;
}

/// Waits for the first `SIGINT` (via `ctrlc`, the teacher's own
/// signal-handling crate) to begin graceful shutdown; a second `SIGTERM`
/// received afterward forces an immediate exit, since a stuck splice task
/// should not be able to block the process from ever terminating.
async fn wait_for_shutdown_signal() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    ctrlc::set_handler(move || {
        log::info!("SIGINT received, starting graceful shutdown");
        if let Some(tx) = tx.lock().ok().and_then(|mut guard| guard.take()) {
            let _ = tx.send(());
        }
    })
    .expect("failed to install SIGINT handler");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = rx => {}
        _ = sigterm.recv() => {
            log::info!("SIGTERM received, starting graceful shutdown");
        }
    }

    tokio::spawn(async move {
        sigterm.recv().await;
        log::warn!("second SIGTERM received, forcing immediate exit");
        std::process::exit(130);
    });
}
