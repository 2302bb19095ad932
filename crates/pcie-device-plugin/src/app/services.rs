use std::sync::Arc;

use error_stack::Report;
use tracing::info;

use crate::domain::snapshot::SnapshotPublisher;
use crate::platform::health::HealthProbe;
use crate::platform::k8s::KubeletRegistrar;
use crate::platform::k8s::KubeletWatcher;
use crate::platform::k8s::PcieDevicePlugin;
use crate::platform::k8s::PluginError;
use crate::platform::sysfs::DeviceRegistry;

/// Application dependencies - simple struct with Arc-wrapped services
#[derive(Clone)]
pub struct ApplicationServices {
    pub registry: DeviceRegistry,
    /// kept alive for the whole run so watch streams never see the source close
    pub publisher: SnapshotPublisher,
    pub device_plugin: Arc<PcieDevicePlugin>,
    pub registrar: Arc<KubeletRegistrar>,
    /// `None` when health probing is disabled
    pub health_probe: Option<Arc<HealthProbe>>,
    pub kubelet_watcher: Arc<KubeletWatcher>,
}

impl ApplicationServices {
    /// Start serving, then announce the plugin to kubelet.
    pub async fn serve_and_register(&self) -> Result<(), Report<PluginError>> {
        self.device_plugin.start().await?;
        self.registrar
            .register(&self.device_plugin.registration_descriptor())
            .await?;
        self.device_plugin.mark_registered().await
    }

    /// Serve on a fresh socket and register again after kubelet restarted.
    pub async fn restart(&self) -> Result<(), Report<PluginError>> {
        info!("restarting device plugin after kubelet restart");
        self.device_plugin.stop().await?;
        self.serve_and_register().await
    }
}
