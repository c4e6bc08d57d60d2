//! Manager: owns the shared client and shutdown token, and runs one
//! dispatcher per registered controller.

use std::sync::Arc;

use anyhow::Result;
use kube::Client;
use provis_core::ObjectKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::{spawn_dispatcher, Options};
use crate::Controller;

pub struct Manager {
    client: Client,
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Manager {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Cancelled when the manager shuts down; event sources and in-flight
    /// reconciles observe it as their ambient ctx.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wire a controller to its event source under the given options.
    pub fn register(
        &mut self,
        controller: Arc<dyn Controller>,
        source: mpsc::Receiver<ObjectKey>,
        opts: Options,
    ) {
        let name = controller.name();
        info!(
            controller = name,
            max_concurrent = opts.max_concurrent,
            "controller registered"
        );
        let handle = spawn_dispatcher(controller, source, opts, self.shutdown.clone());
        self.tasks.push((name, handle));
    }

    /// Block until the shutdown token fires, then join the dispatchers.
    pub async fn run(self) -> Result<()> {
        self.shutdown.cancelled().await;
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(controller = name, error = %e, "dispatcher join failed");
            }
        }
        info!("manager stopped");
        Ok(())
    }
}
