use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use tracing::info;

use crate::bridge::BridgeCore;
use crate::config::Config;

pub mod handlers;
pub mod metrics;

use self::handlers::health::health;
use self::metrics::metrics_endpoint;

#[derive(Clone)]
pub struct WebState {
    pub bridge: Arc<BridgeCore>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

pub fn create_router(metrics_enabled: bool) -> Router {
    let router = Router::new().push(Router::with_path("health").get(health));
    if metrics_enabled {
        router.push(Router::with_path("metrics").get(metrics_endpoint))
    } else {
        router
    }
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(config: Arc<Config>, bridge: Arc<BridgeCore>) -> Self {
        let _ = WEB_STATE.set(WebState {
            bridge,
            started_at: Instant::now(),
        });
        metrics::Metrics::init();

        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.bridge.bind_address, self.config.bridge.port
        );
        info!(
            "starting web server on {} metrics={}",
            bind_addr, self.config.metrics.enabled
        );

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor)
            .serve(create_router(self.config.metrics.enabled))
            .await;

        Ok(())
    }
}
