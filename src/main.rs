use anyhow::Result;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use fleetlink::analytics::Analytics;
use fleetlink::cloud::CloudClient;
use fleetlink::config::Config;
use fleetlink::link::server::LinkServer;
use fleetlink::link::session::SessionRegistry;
use fleetlink::logbook::LogBook;
use fleetlink::web::server::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Arc::new(Config::load()?);
    setup_logging(&config.general.log_level);
    info!("gateway starting...");

    let cloud = Arc::new(CloudClient::new(&config.cloud.base_url));
    let logbook = Arc::new(LogBook::new(&config.logbook.dir));
    let analytics = Analytics::start(Arc::new(config.analytics.clone()));
    let registry = SessionRegistry::new(analytics, Arc::clone(&logbook));

    let (shutdown_tx, _) = broadcast::channel(1);

    let link_server = Arc::new(
        LinkServer::bind(
            &config,
            Arc::clone(&registry),
            Arc::clone(&cloud),
            Arc::clone(&logbook),
        )
        .await?,
    );
    let web_server = WebServer::new(Arc::clone(&config), Arc::clone(&registry), cloud);

    spawn_link_server(link_server, shutdown_tx.subscribe());
    spawn_web_server(web_server, shutdown_tx.subscribe());

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("shutdown signal received, stopping services...");
            let _ = shutdown_tx.send(());
        }
        Err(err) => {
            error!("failed to listen for shutdown signal: {}", err);
        }
    }

    info!("all services stopped, shutting down");
    Ok(())
}

fn spawn_link_server(server: Arc<LinkServer>, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        tokio::select! {
            result = server.run() => {
                if let Err(e) = result {
                    error!("link server error: {}", e);
                }
            }
            _ = shutdown.recv() => {
                info!("shutting down link server...");
            }
        }
    });
}

fn spawn_web_server(server: WebServer, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        tokio::select! {
            result = server.start() => {
                if let Err(e) = result {
                    error!("web server error: {}", e);
                    std::process::exit(1);
                }
            }
            _ = shutdown.recv() => {
                info!("shutting down web server...");
            }
        }
    });
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(filter)
        .try_init()
        .expect("failed to initialize logging");
}
