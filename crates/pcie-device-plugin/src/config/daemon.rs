use std::path::PathBuf;

use clap::Parser;

use crate::platform::k8s::DEFAULT_DEVICE_PLUGIN_DIR;
use crate::platform::k8s::DEFAULT_RESOURCE_NAME;
use crate::platform::k8s::DEFAULT_SOCKET_NAME;
use crate::platform::k8s::KUBELET_SOCKET_NAME;
use crate::platform::sysfs::DEFAULT_PCI_DEVICES_PATH;
use crate::platform::sysfs::DEFAULT_VFIO_DEV_DIR;

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "DP_DEVICE_PLUGIN_DIR",
        default_value = DEFAULT_DEVICE_PLUGIN_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet device plugin directory holding the kubelet and plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        default_value = DEFAULT_SOCKET_NAME,
        help = "File name of the plugin socket inside the device plugin directory"
    )]
    pub socket_name: String,

    #[arg(
        long,
        default_value = KUBELET_SOCKET_NAME,
        help = "File name of the kubelet registration socket inside the device plugin directory"
    )]
    pub kubelet_socket_name: String,

    #[arg(
        long,
        env = "DP_RESOURCE_NAME",
        default_value = DEFAULT_RESOURCE_NAME,
        help = "Extended resource name advertised to kubelet, e.g. pcie.com/device"
    )]
    pub resource_name: String,

    #[arg(
        long,
        default_value = DEFAULT_PCI_DEVICES_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory enumerating PCI devices"
    )]
    pub pci_devices_path: PathBuf,

    #[arg(
        long,
        default_value = DEFAULT_VFIO_DEV_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding VFIO group device nodes"
    )]
    pub vfio_dev_dir: PathBuf,

    #[arg(
        long = "vendor",
        value_name = "VENDOR_ID",
        help = "Only advertise devices of this vendor id, e.g. 0x10de (repeatable, default all vendors)"
    )]
    pub vendors: Vec<String>,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds between device health probes, 0 disables probing"
    )]
    pub health_check_interval_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Registration attempts before giving up, including the first one"
    )]
    pub registration_max_attempts: u32,

    #[arg(
        long,
        default_value = "500",
        help = "Delay after the first failed registration attempt in milliseconds"
    )]
    pub registration_initial_backoff_ms: u64,

    #[arg(
        long,
        default_value = "30000",
        help = "Upper bound for the delay between registration attempts in milliseconds"
    )]
    pub registration_max_backoff_ms: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds to wait for the plugin socket to answer after binding"
    )]
    pub self_check_timeout_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds to wait for in-flight calls when stopping the plugin"
    )]
    pub shutdown_grace_secs: u64,

    #[arg(
        long,
        help = "Ask kubelet to call PreStartContainer before starting containers",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub pre_start_required: bool,

    #[arg(
        long,
        env = "PCIE_DP_LOG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Write logs to this file with daily rotation instead of stderr"
    )]
    pub log_path: Option<PathBuf>,
}

impl DaemonArgs {
    pub fn socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.socket_name)
    }

    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.kubelet_socket_name)
    }
}
