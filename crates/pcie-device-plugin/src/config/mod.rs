pub mod cli;
pub mod daemon;

use std::time::Duration;

use crate::platform::k8s::PluginConfig;
use crate::platform::k8s::RetryPolicy;
use crate::platform::sysfs::RegistryConfig;

impl From<&daemon::DaemonArgs> for PluginConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            pre_start_required: args.pre_start_required,
            self_check_timeout: Duration::from_secs(args.self_check_timeout_secs.max(1)),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            ..PluginConfig::new(args.socket_path(), args.resource_name.clone())
        }
    }
}

impl From<&daemon::DaemonArgs> for RetryPolicy {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            max_attempts: args.registration_max_attempts.max(1),
            initial_backoff: Duration::from_millis(args.registration_initial_backoff_ms),
            max_backoff: Duration::from_millis(args.registration_max_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

impl From<&daemon::DaemonArgs> for RegistryConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        RegistryConfig::new(&args.pci_devices_path).with_vendor_filter(args.vendors.clone())
    }
}

impl From<&cli::DiscoverArgs> for RegistryConfig {
    fn from(args: &cli::DiscoverArgs) -> Self {
        RegistryConfig::new(&args.pci_devices_path).with_vendor_filter(args.vendors.clone())
    }
}

pub use cli::*;
pub use daemon::*;
