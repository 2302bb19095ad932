use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::app::services::ApplicationServices;
use crate::platform::k8s::KubeletEvent;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        let services = app.services();

        // Start device health probe task
        if let Some(health_probe) = services.health_probe.clone() {
            let token = self.cancellation_token.clone();
            let health_probe_task = tokio::spawn(async move {
                tracing::info!("Starting device health probe task");
                health_probe.run(token).await;
                tracing::info!("Device health probe task completed");
            });
            self.tasks.push(health_probe_task);
        }

        // kubelet restarts are detected by one task and handled by another,
        // so a slow restart never blocks filesystem events
        let (kubelet_event_sender, kubelet_event_receiver) = mpsc::channel::<KubeletEvent>(8);

        let kubelet_watcher_task = self.spawn_kubelet_watcher_task(services, kubelet_event_sender);
        self.tasks.push(kubelet_watcher_task);

        let restart_handler_task =
            self.spawn_restart_handler_task(services.clone(), kubelet_event_receiver);
        self.tasks.push(restart_handler_task);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        // Set up signal handling for graceful shutdown
        let signal_handler = {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        if self.tasks.is_empty() {
            signal_handler.await?;
            tracing::info!("Shutdown signal received");
            return Ok(());
        }

        tokio::select! {
            // Wait for shutdown signal
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.shutdown(Duration::from_secs(30)).await;
            }
            // Wait for any task to complete unexpectedly
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, remaining) = result;
                drop(remaining);
                self.shutdown(Duration::from_secs(30)).await;
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
                return Err(anyhow::anyhow!("background task exited unexpectedly"));
            }
        }

        Ok(())
    }

    /// Cancel all tasks and wait for them, giving up after `timeout`.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.cancellation_token.cancel();

        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if task.is_finished() {
                    continue;
                }
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_kubelet_watcher_task(
        &self,
        services: &ApplicationServices,
        kubelet_event_sender: mpsc::Sender<KubeletEvent>,
    ) -> JoinHandle<()> {
        let kubelet_watcher = services.kubelet_watcher.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting kubelet watcher task");
            if let Err(e) = kubelet_watcher.run(kubelet_event_sender, token).await {
                tracing::error!("Kubelet watcher failed: {e:?}");
            } else {
                tracing::info!("Kubelet watcher completed");
            }
        })
    }

    fn spawn_restart_handler_task(
        &self,
        services: ApplicationServices,
        mut kubelet_event_receiver: mpsc::Receiver<KubeletEvent>,
    ) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting kubelet restart handler task");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = kubelet_event_receiver.recv() => {
                        match event {
                            Some(KubeletEvent::Restarted) => {
                                if let Err(e) = services.restart().await {
                                    tracing::error!(
                                        "Failed to re-register after kubelet restart: {e:?}"
                                    );
                                    return;
                                }
                                tracing::info!("Device plugin re-registered after kubelet restart");
                            }
                            None => break,
                        }
                    }
                }
            }
            tracing::info!("Kubelet restart handler task completed");
        })
    }
}
