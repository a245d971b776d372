mod config;
mod gateway;
mod midwares;
mod relay;
mod route_handlers;

use std::{net::SocketAddr, sync::Arc};
use clap::Parser;
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{load_file_config, Args, TableCatalog};
use gateway::Gateway;
use midwares::app_state::AppState;
use route_handlers::{cors_layer, router};

#[tokio::main]
async fn main() {
  // a missing .env is fine, the environment may already be set
  let _ = dotenvy::dotenv();

  tracing_subscriber::registry()
    .with(tracing_subscriber::EnvFilter::new(
      std::env::var("RUST_LOG").unwrap_or_else(|_| "frontview=info,tower_http=info".into()),
    ))
    .with(tracing_subscriber::fmt::layer())
    .init();

  let args = Args::parse();

  let file_config = match load_file_config(&args.config) {
    Ok(config) => config,
    Err(e) => {
      error!("{}", e);
      std::process::exit(1);
    }
  };
  let catalog = match TableCatalog::new(file_config.tables.clone()) {
    Ok(catalog) => catalog,
    Err(e) => {
      error!("invalid table catalog: {}", e);
      std::process::exit(1);
    }
  };

  let gateway = Arc::new(Gateway::new(args.connections(&file_config)));
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let state = AppState {
    gateway: gateway.clone(),
    catalog: Arc::new(catalog),
    settings: Arc::new(file_config.gateway.clone()),
    relay: file_config.stream.relay_settings(),
    shutdown: shutdown_rx,
  };

  let app = router(state).layer(cors_layer(args.allowed_origin.as_deref()));

  let listener = TcpListener::bind(&args.bind).await.expect("failed to start tcp listener");
  info!(bind = %args.bind, tables = file_config.tables.len(), "frontview backend listening");

  if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
  {
    error!("server error: {}", e);
  }

  gateway.close().await;
  info!("shutdown complete");
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
  let ctrl_c = async {
    if let Err(e) = signal::ctrl_c().await {
      error!("failed to listen for ctrl-c: {}", e);
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut sig) => {
        sig.recv().await;
      },
      Err(e) => error!("failed to install SIGTERM handler: {}", e),
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
  info!("shutdown signal received, draining connections");
  // ends open event streams so the drain can finish
  let _ = shutdown_tx.send(true);
}
