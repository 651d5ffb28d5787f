use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use listpad_server::{ServerState, server};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Args {
    /// Address to bind. The `PORT` environment variable overrides the port.
    #[clap(long, default_value = "0.0.0.0:3000")]
    host: SocketAddr,
    #[clap(short, long, default_value = "data")]
    storage: PathBuf,
    /// Hide development endpoints. Also implied by NODE_ENV=production.
    #[clap(long)]
    production: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut host = args.host;
    if let Ok(port) = std::env::var("PORT")
        && let Ok(port) = port.parse()
    {
        host.set_port(port);
    }
    let production =
        args.production || std::env::var("NODE_ENV").is_ok_and(|env| env == "production");

    let state = Arc::new(
        ServerState::new(args.storage, production)
            .await
            .expect("Init server state"),
    );

    info!("Starting server on http://{}", host);

    let listener = tokio::net::TcpListener::bind(host)
        .await
        .expect("Unable to bind to host");
    axum::serve(
        listener,
        server(state.clone()).layer(TraceLayer::new_for_http()),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    info!("Server has shut down");
    state.persist().await;
}

async fn shutdown_signal() {
    let ctrl_c = async { signal::ctrl_c().await.expect("Listen for ctrl-c") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Install SIGTERM handler")
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
