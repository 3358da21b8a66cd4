//! hearthd -- the bridge daemon.
//!
//! Loads configuration from the environment, starts the controller
//! (remote probe, hub link, broker link, routines, health loop), serves
//! the local HTTP/WebSocket surface, and shuts everything down on ctrl-c.

mod server;

use tracing::{error, info};

use hearth_core::Controller;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match hearth_config::load() {
        Ok(config) => config,
        Err(e) => {
            // The one fatal path: unrecoverable startup misconfiguration.
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };
    let local_port = config.local_port;

    let controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "failed to build controller");
            std::process::exit(1);
        }
    };

    if let Err(e) = controller.run().await {
        error!(error = %e, "failed to start controller");
        std::process::exit(1);
    }

    let app = server::router(controller.clone());
    let bind_addr = format!("0.0.0.0:{local_port}");
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind_addr, error = %e, "failed to bind local server");
            std::process::exit(1);
        }
    };
    info!(bind_addr, "local server running");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "local server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    controller.shutdown().await;
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hearthd=info,hearth_core=info,hearth_api=info"));

    fmt().with_env_filter(filter).init();
}
