use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

use crate::cloud::CloudClient;
use crate::config::Config;
use crate::link::session::SessionRegistry;
use crate::web::routes::{self, AppState};

pub struct WebServer {
    config: Arc<Config>,
    state: AppState,
}

impl WebServer {
    pub fn new(config: Arc<Config>, registry: Arc<SessionRegistry>, cloud: Arc<CloudClient>) -> Self {
        Self {
            config,
            state: AppState { registry, cloud },
        }
    }

    pub async fn start(&self) -> Result<()> {
        // The panic guard turns any handler programming error into a 500
        // while the process and every session stay alive.
        let app = routes::router(self.state.clone()).layer(CatchPanicLayer::new());

        let host = self.config.web.host.clone();
        let port = self.config.web.port;
        info!("starting web server on http://{}:{}", host, port);

        let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port))
            .await
            .context(format!("failed to bind to port {}", port))?;
        axum::serve(listener, app)
            .await
            .context("failed to serve")?;
        Ok(())
    }
}
