use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::app::core::Application;
use crate::app::services::ApplicationServices;
use crate::config::DaemonArgs;
use crate::domain::allocation::AllocationEngine;
use crate::domain::snapshot;
use crate::platform::health::HealthProbe;
use crate::platform::k8s::KubeletRegistrar;
use crate::platform::k8s::KubeletWatcher;
use crate::platform::k8s::PcieDevicePlugin;
use crate::platform::k8s::PluginConfig;
use crate::platform::k8s::RetryPolicy;
use crate::platform::sysfs::DeviceRegistry;
use crate::platform::sysfs::RegistryConfig;
use crate::platform::sysfs::VfioPathResolver;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    /// Create new application builder
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    ///
    /// Runs the initial device discovery, which fails the build when the
    /// device directory cannot be enumerated.
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.daemon_args;

        let registry = DeviceRegistry::new(RegistryConfig::from(args));
        let initial = {
            let registry = registry.clone();
            tokio::task::spawn_blocking(move || registry.discover()).await?
        }
        .map_err(|report| anyhow::anyhow!("initial device discovery failed: {report:?}"))?;
        tracing::info!(
            devices = initial.len(),
            root = %registry.root().display(),
            "discovered PCI devices"
        );
        for device in initial.iter() {
            tracing::info!(
                device_id = %device.id,
                vendor = %device.vendor,
                product = %device.product,
                iommu_group = ?device.iommu_group,
                "discovered device"
            );
        }

        let (publisher, reader) = snapshot::channel(initial);

        let allocator = Arc::new(AllocationEngine::new(VfioPathResolver::new(
            &args.vfio_dev_dir,
        )));
        let device_plugin = PcieDevicePlugin::new(PluginConfig::from(args), reader, allocator);

        let registrar = Arc::new(KubeletRegistrar::new(
            args.kubelet_socket_path(),
            RetryPolicy::from(args),
        ));

        let health_probe = if args.health_check_interval_secs > 0 {
            Some(Arc::new(HealthProbe::new(
                registry.clone(),
                publisher.clone(),
                Duration::from_secs(args.health_check_interval_secs),
            )))
        } else {
            tracing::info!("device health probing disabled");
            None
        };

        let kubelet_watcher = Arc::new(KubeletWatcher::new(
            &args.device_plugin_dir,
            args.kubelet_socket_name.clone(),
        ));

        let services = ApplicationServices {
            registry,
            publisher,
            device_plugin,
            registrar,
            health_probe,
            kubelet_watcher,
        };

        Ok(Application::new(services, self.daemon_args))
    }
}
