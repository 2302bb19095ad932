use anyhow::Result;
use clap::Parser;
use pcie_device_plugin::app::ApplicationBuilder;
use pcie_device_plugin::config::Cli;
use pcie_device_plugin::config::Commands;
use pcie_device_plugin::config::DaemonArgs;
use pcie_device_plugin::config::DiscoverArgs;
use pcie_device_plugin::domain::device::DeviceSnapshot;
use pcie_device_plugin::logging;
use pcie_device_plugin::sysfs::DeviceRegistry;
use pcie_device_plugin::sysfs::RegistryConfig;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Discover(discover_args) => run_discover(discover_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_path.as_deref());
    setup_global_hooks();

    tracing::info!(
        "Starting PCIe device plugin {} for resource {}",
        env!("CARGO_PKG_VERSION"),
        daemon_args.resource_name
    );

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    let result = app.run().await;
    // the socket is removed even when startup or a task failed
    app.shutdown_with(result).await
}

fn run_discover(discover_args: DiscoverArgs) -> Result<()> {
    let _guard = logging::init(None);
    setup_global_hooks();

    let registry = DeviceRegistry::new(RegistryConfig::from(&discover_args));
    let snapshot = registry
        .discover()
        .map_err(|report| anyhow::anyhow!("device discovery failed: {report:?}"))?;

    if discover_args.json {
        let devices: Vec<_> = snapshot.iter().collect();
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else {
        print_table(&snapshot);
    }
    Ok(())
}

fn print_table(snapshot: &DeviceSnapshot) {
    println!(
        "{:<14} {:<8} {:<8} {:<7} {:<5} HEALTH",
        "ID", "VENDOR", "DEVICE", "IOMMU", "NUMA"
    );
    for device in snapshot.iter() {
        println!(
            "{:<14} {:<8} {:<8} {:<7} {:<5} {}",
            device.id,
            device.vendor,
            device.product,
            device.iommu_group.as_deref().unwrap_or("-"),
            device
                .numa_node
                .map(|node| node.to_string())
                .unwrap_or_else(|| "-".to_string()),
            device.health
        );
    }
}
