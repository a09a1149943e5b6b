//! Skiff message bus server.
//!
//! Binary name: `skiffd`
//!
//! Parses CLI arguments, initializes the persister and bus, attaches the
//! WebSocket and HTTP poll transports, and serves until interrupted. The
//! optional demo flags register example channel handlers and a periodic
//! broadcast so the bus can be exercised without an embedding application.

mod http;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use skiff_core::bus::Bus;
use skiff_core::persist::Persister;
use skiff_core::transport::TransportBindings;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use http::HttpTransport;
use ws::WsTransport;

#[derive(Debug, Parser)]
#[command(name = "skiffd", about = "Multi-transport message bus server", version)]
struct Cli {
    /// Bind address for the WebSocket session transport.
    #[arg(long, default_value = "127.0.0.1:8081")]
    ws_addr: String,

    /// Bind address for the HTTP poll transport.
    #[arg(long, default_value = "127.0.0.1:8082")]
    http_addr: String,

    /// SQLite database URL, or "memory" for the in-memory persister.
    #[arg(long, env = "SKIFF_DB_URL", default_value = "sqlite://skiff.db?mode=rwc")]
    db_url: String,

    /// Base URI the transports are mounted under.
    #[arg(long, default_value = "/_skiff")]
    base_uri: String,

    /// Register the demo channels ("echo" and "count").
    #[arg(long)]
    demo: bool,

    /// Broadcast a ping on this channel every five seconds.
    #[arg(long)]
    heartbeat: Option<String>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "info,skiff=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    match cli.db_url.as_str() {
        "memory" => run(Arc::new(skiff_infra::MemoryPersister::new()), cli).await,
        url => run(Arc::new(skiff_infra::SqlitePersister::new(url)), cli).await,
    }
}

async fn run<P: Persister + 'static>(persister: Arc<P>, cli: Cli) -> anyhow::Result<()> {
    let mut bus = Bus::new(Arc::clone(&persister));

    if cli.demo {
        register_demo_channels(&bus);
    }

    bus.add_transport(Arc::new(WsTransport::new(
        cli.base_uri.clone(),
        bus.inbound(),
    )));
    bus.add_transport(Arc::new(HttpTransport::new(
        cli.base_uri.clone(),
        bus.inbound(),
        Arc::clone(&persister),
    )));

    let bindings = TransportBindings::new()
        .bind(WsTransport::NAME, cli.ws_addr.clone())
        .bind(HttpTransport::<P>::NAME, cli.http_addr.clone());

    let bus = Arc::new(bus);

    if let Some(channel) = cli.heartbeat.clone() {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(err) = bus.broadcast(&channel, "ping").await {
                    warn!(%err, "heartbeat broadcast failed");
                }
            }
        });
    }

    info!(ws = %cli.ws_addr, http = %cli.http_addr, "starting skiffd");
    tokio::select! {
        served = bus.start(bindings) => served?,
        _ = shutdown_signal() => info!("shutting down"),
    }

    Ok(())
}

/// Example handlers mirroring a typical embedding application: an echo
/// channel, and a slow counter that streams ten numbered responses followed
/// by a final ping.
fn register_demo_channels<P: Persister + 'static>(bus: &Bus<P>) {
    bus.add_channel("echo", |body, responses, done| async move {
        let _ = responses.send(body).await;
        let _ = done.send(());
    });

    bus.add_channel("count", |_body, responses, done| async move {
        for x in 0..10 {
            let _ = responses.send(x.to_string()).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let _ = responses.send("ping".to_string()).await;
        let _ = done.send(());
    });
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
