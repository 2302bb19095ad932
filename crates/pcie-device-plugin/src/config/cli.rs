use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

use crate::config::daemon::DaemonArgs;
use crate::platform::sysfs::DEFAULT_PCI_DEVICES_PATH;

#[derive(Parser)]
#[command(about, long_about, version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(Box<DaemonArgs>),
    /// List the PCI devices the plugin would advertise and exit
    Discover(DiscoverArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct DiscoverArgs {
    #[arg(
        long,
        default_value = DEFAULT_PCI_DEVICES_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory enumerating PCI devices"
    )]
    pub pci_devices_path: PathBuf,

    #[arg(
        long = "vendor",
        value_name = "VENDOR_ID",
        help = "Only list devices of this vendor id (repeatable)"
    )]
    pub vendors: Vec<String>,

    #[arg(long, help = "Print devices as JSON")]
    pub json: bool,
}
