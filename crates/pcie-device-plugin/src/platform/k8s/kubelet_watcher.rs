//! Kubelet restart detection.
//!
//! When kubelet restarts it wipes the device plugin directory and recreates
//! its registration socket. Plugins must then serve again and re-register.

use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::PluginError;

/// Kubelet lifecycle events relevant to the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeletEvent {
    /// kubelet recreated its registration socket
    Restarted,
}

pub struct KubeletWatcher {
    plugin_dir: PathBuf,
    kubelet_socket_name: String,
}

impl KubeletWatcher {
    pub fn new(plugin_dir: impl Into<PathBuf>, kubelet_socket_name: impl Into<String>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            kubelet_socket_name: kubelet_socket_name.into(),
        }
    }

    /// Whether a filesystem event is kubelet creating its socket.
    pub fn is_kubelet_restart(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_))
            && event.paths.iter().any(|path| {
                path.file_name()
                    .is_some_and(|name| name == self.kubelet_socket_name.as_str())
            })
    }

    /// Watch the plugin directory and forward kubelet restarts to `events`
    /// until cancelled or the receiver goes away.
    #[tracing::instrument(skip(self, events, cancellation_token), fields(dir = %self.plugin_dir.display()))]
    pub async fn run(
        &self,
        events: mpsc::Sender<KubeletEvent>,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<PluginError>> {
        let (fs_tx, mut fs_rx) = mpsc::channel(16);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    debug!("filesystem event: {:?}", event);
                    // notify calls back on its own thread, outside the runtime
                    let _ = fs_tx.blocking_send(event);
                }
                Err(e) => error!("filesystem watch error: {:?}", e),
            },
            Config::default(),
        )
        .change_context_lazy(|| PluginError::Watch {
            path: self.plugin_dir.clone(),
        })?;

        watcher
            .watch(&self.plugin_dir, RecursiveMode::NonRecursive)
            .change_context_lazy(|| PluginError::Watch {
                path: self.plugin_dir.clone(),
            })?;
        info!("watching for kubelet restarts");

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("kubelet watcher shutdown requested");
                    break;
                }
                event = fs_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if self.is_kubelet_restart(&event) {
                        info!("kubelet socket recreated, kubelet restarted");
                        if events.send(KubeletEvent::Restarted).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        drop(watcher);
        Ok(())
    }
}
