use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    /// Create new application with explicit service dependencies
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    /// Get access to services
    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    /// Get daemon arguments
    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Serve the plugin socket and register with kubelet.
    ///
    /// Failing to serve or to register within the retry budget is fatal.
    pub async fn start(&self) -> Result<()> {
        tracing::info!("Starting device plugin...");
        self.services
            .serve_and_register()
            .await
            .map_err(|report| anyhow::anyhow!("device plugin failed to start: {report:?}"))?;
        tracing::info!("Device plugin registered with kubelet");
        Ok(())
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        tracing::info!("Starting all application tasks...");

        // Create task manager
        let mut tasks = Tasks::new();

        // Start all background tasks
        if let Err(e) = tasks.spawn_all_tasks(self) {
            tracing::error!("Failed to spawn application tasks: {}", e);
            return Err(e);
        }

        // Wait for tasks to complete or receive shutdown signal
        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Gracefully shutdown application
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");

        self.services
            .device_plugin
            .stop()
            .await
            .map_err(|report| anyhow::anyhow!("device plugin did not stop cleanly: {report:?}"))?;

        tracing::info!("Application shutdown completed");
        Ok(())
    }

    /// Shut down after `run` and hand back its outcome.
    ///
    /// A shutdown failure is logged; when `outcome` is already an error it
    /// is the one returned.
    pub async fn shutdown_with(&self, outcome: Result<()>) -> Result<()> {
        match (outcome, self.shutdown().await) {
            (Err(e), Err(shutdown_error)) => {
                tracing::error!("Shutdown after failure also failed: {shutdown_error:?}");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}
