use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::facade::CloudApi;
use crate::api::routes::create_router;
use crate::core::lifecycle::Subsystem;

struct Running {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    addr: SocketAddr,
}

/// Facade HTTP server with graceful shutdown.
pub struct ApiServer {
    bind: String,
    api: CloudApi,
    running: Mutex<Option<Running>>,
}

impl ApiServer {
    pub fn new(bind: impl Into<String>, api: CloudApi) -> Self {
        Self {
            bind: bind.into(),
            api,
            running: Mutex::new(None),
        }
    }

    /// Bound address once started (useful with port 0).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }
}

#[async_trait]
impl Subsystem for ApiServer {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("cannot bind facade on {}", self.bind))?;
        let addr = listener.local_addr()?;
        let app = create_router(self.api.clone());
        let (shutdown, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                error!(event = "API_SERVER_ERROR", error = %e, "Facade server stopped with error");
            }
        });

        info!(event = "API_LISTENING", addr = %addr, "Facade API listening");
        *running = Some(Running { shutdown, handle, addr });
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(running) = self.running.lock().await.take() {
            let _ = running.shutdown.send(());
            running.handle.await.context("facade server task")?;
            info!(event = "API_STOPPED", "Facade API stopped");
        }
        Ok(())
    }
}
