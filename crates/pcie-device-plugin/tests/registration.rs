mod common;

use std::path::Path;
use std::time::Duration;

use clap::Parser;
use common::eventually;
use common::pci_entry;
use common::plugin_client;
use common::MockKubelet;
use common::WAIT;
use futures::StreamExt;
use pcie_device_plugin::app::tasks::Tasks;
use pcie_device_plugin::app::Application;
use pcie_device_plugin::app::ApplicationBuilder;
use pcie_device_plugin::config::DaemonArgs;
use pcie_device_plugin::k8s::api::DevicePluginOptions;
use pcie_device_plugin::k8s::api::Empty;
use pcie_device_plugin::k8s::KubeletRegistrar;
use pcie_device_plugin::k8s::PluginState;
use pcie_device_plugin::k8s::RegistrationDescriptor;
use pcie_device_plugin::k8s::RetryPolicy;
use similar_asserts::assert_eq;
use test_log::test;
use tokio::time::timeout;

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(200),
        jitter: 0.0,
    }
}

fn descriptor() -> RegistrationDescriptor {
    RegistrationDescriptor::new(
        "pcie.sock".to_string(),
        "pcie.com/device".to_string(),
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: true,
        },
    )
}

/// Lay out a plugin directory and a sysfs tree with two devices.
fn node_layout(root: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let plugin_dir = root.join("device-plugins");
    let pci_root = root.join("sys").join("devices");
    std::fs::create_dir_all(&plugin_dir).expect("create plugin dir");
    std::fs::create_dir_all(&pci_root).expect("create pci root");
    pci_entry(&pci_root, "0000:3b:00.0", "0x10de", "0x20b0", "11");
    pci_entry(&pci_root, "0000:af:00.0", "0x10de", "0x20b0", "12");
    (plugin_dir, pci_root)
}

async fn build_app(plugin_dir: &Path, pci_root: &Path, health_interval_secs: u64) -> Application {
    let health_interval = health_interval_secs.to_string();
    let args = DaemonArgs::try_parse_from([
        "daemon",
        "--device-plugin-dir",
        plugin_dir.to_str().expect("utf-8 path"),
        "--pci-devices-path",
        pci_root.to_str().expect("utf-8 path"),
        "--health-check-interval-secs",
        health_interval.as_str(),
        "--registration-initial-backoff-ms",
        "100",
        "--registration-max-backoff-ms",
        "200",
        "--shutdown-grace-secs",
        "1",
    ])
    .expect("daemon args parse");

    ApplicationBuilder::new(args)
        .build()
        .await
        .expect("application builds")
}

#[test(tokio::test)]
async fn registers_exactly_once_with_descriptor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kubelet_socket = dir.path().join("kubelet.sock");
    let kubelet = MockKubelet::serve(&kubelet_socket);
    let registrar = KubeletRegistrar::new(&kubelet_socket, fast_retries(3));

    registrar
        .register(&descriptor())
        .await
        .expect("registration succeeds");

    let requests = kubelet.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].version, "v1beta1");
    assert_eq!(requests[0].endpoint, "pcie.sock");
    assert_eq!(requests[0].resource_name, "pcie.com/device");
    assert_eq!(
        requests[0]
            .options
            .as_ref()
            .map(|o| o.get_preferred_allocation_available),
        Some(true)
    );
    assert_eq!(registrar.attempts(), 1);

    kubelet.stop().await;
}

#[test(tokio::test)]
async fn registration_retries_until_kubelet_appears() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kubelet_socket = dir.path().join("kubelet.sock");
    let registrar = KubeletRegistrar::new(&kubelet_socket, fast_retries(10))
        .with_connect_timeout(Duration::from_millis(200));

    let late_kubelet = {
        let kubelet_socket = kubelet_socket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            MockKubelet::serve(&kubelet_socket)
        })
    };

    registrar
        .register(&descriptor())
        .await
        .expect("registration succeeds once kubelet is up");
    assert!(registrar.attempts() > 1);

    let kubelet = late_kubelet.await.expect("mock kubelet started");
    assert_eq!(kubelet.request_count(), 1);
    kubelet.stop().await;
}

#[test(tokio::test)]
async fn application_start_serves_then_registers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (plugin_dir, pci_root) = node_layout(dir.path());
    let kubelet = MockKubelet::serve(&plugin_dir.join("kubelet.sock"));

    let app = build_app(&plugin_dir, &pci_root, 0).await;
    app.start().await.expect("application starts");

    assert_eq!(kubelet.request_count(), 1);
    assert_eq!(
        app.services().device_plugin.state().await,
        PluginState::Registered
    );

    let mut client = plugin_client(&plugin_dir.join("pcie.sock")).await;
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("watch call")
        .into_inner();
    let first = timeout(WAIT, stream.next())
        .await
        .expect("initial push in time")
        .expect("stream open")
        .expect("initial push ok");
    let ids: Vec<_> = first.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["0000:3b:00.0", "0000:af:00.0"]);

    app.shutdown().await.expect("application stops");
    assert!(!plugin_dir.join("pcie.sock").exists());
    kubelet.stop().await;
}

#[test(tokio::test)]
async fn application_start_fails_without_kubelet() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (plugin_dir, pci_root) = node_layout(dir.path());

    let args = DaemonArgs::try_parse_from([
        "daemon",
        "--device-plugin-dir",
        plugin_dir.to_str().expect("utf-8 path"),
        "--pci-devices-path",
        pci_root.to_str().expect("utf-8 path"),
        "--registration-max-attempts",
        "2",
        "--registration-initial-backoff-ms",
        "10",
    ])
    .expect("daemon args parse");
    let app = ApplicationBuilder::new(args)
        .build()
        .await
        .expect("application builds");

    assert!(app.start().await.is_err());

    app.shutdown().await.expect("application stops");
    assert!(!plugin_dir.join("pcie.sock").exists());
}

#[test(tokio::test)]
async fn startup_error_survives_failed_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (plugin_dir, pci_root) = node_layout(dir.path());

    let args = DaemonArgs::try_parse_from([
        "daemon",
        "--device-plugin-dir",
        plugin_dir.to_str().expect("utf-8 path"),
        "--pci-devices-path",
        pci_root.to_str().expect("utf-8 path"),
        "--registration-max-attempts",
        "1",
        "--shutdown-grace-secs",
        "1",
    ])
    .expect("daemon args parse");
    let app = ApplicationBuilder::new(args)
        .build()
        .await
        .expect("application builds");

    let outcome = app.start().await;
    assert!(outcome.is_err());

    // a directory in place of the socket makes cleanup fail
    let socket = plugin_dir.join("pcie.sock");
    std::fs::remove_file(&socket).expect("remove socket");
    std::fs::create_dir(&socket).expect("create dir in place of socket");

    let error = app
        .shutdown_with(outcome)
        .await
        .expect_err("startup failure is reported");
    assert!(
        error.to_string().contains("failed to start"),
        "unexpected error: {error}"
    );
}

#[test(tokio::test)]
async fn application_build_fails_on_missing_device_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let args = DaemonArgs::try_parse_from([
        "daemon",
        "--device-plugin-dir",
        dir.path().to_str().expect("utf-8 path"),
        "--pci-devices-path",
        dir.path().join("missing").to_str().expect("utf-8 path"),
    ])
    .expect("daemon args parse");

    assert!(ApplicationBuilder::new(args).build().await.is_err());
}

#[test(tokio::test)]
async fn kubelet_restart_triggers_new_registration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (plugin_dir, pci_root) = node_layout(dir.path());
    let kubelet = MockKubelet::serve(&plugin_dir.join("kubelet.sock"));

    let app = build_app(&plugin_dir, &pci_root, 0).await;
    app.start().await.expect("application starts");
    let mut tasks = Tasks::new();
    tasks.spawn_all_tasks(&app).expect("tasks spawn");

    // let the directory watch settle before kubelet goes away
    tokio::time::sleep(Duration::from_millis(200)).await;
    let kubelet = kubelet.restart().await;

    assert!(eventually(|| kubelet.request_count() == 2).await);
    let plugin = app.services().device_plugin.clone();
    let mut registered = false;
    for _ in 0..100 {
        if plugin.state().await == PluginState::Registered {
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(registered);

    let mut client = plugin_client(&plugin_dir.join("pcie.sock")).await;
    client
        .get_device_plugin_options(Empty {})
        .await
        .expect("plugin serves on the new socket");

    tasks.shutdown(WAIT).await;
    app.shutdown().await.expect("application stops");
    kubelet.stop().await;
}

#[test(tokio::test)]
async fn health_probe_reports_removed_device_to_watchers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (plugin_dir, pci_root) = node_layout(dir.path());
    let kubelet = MockKubelet::serve(&plugin_dir.join("kubelet.sock"));

    let app = build_app(&plugin_dir, &pci_root, 1).await;
    app.start().await.expect("application starts");
    let mut tasks = Tasks::new();
    tasks.spawn_all_tasks(&app).expect("tasks spawn");

    let mut client = plugin_client(&plugin_dir.join("pcie.sock")).await;
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("watch call")
        .into_inner();
    let first = timeout(WAIT, stream.next())
        .await
        .expect("initial push in time")
        .expect("stream open")
        .expect("initial push ok");
    assert!(first.devices.iter().all(|d| d.health == "Healthy"));

    std::fs::remove_dir_all(pci_root.join("0000:af:00.0")).expect("remove device entry");

    let update = timeout(WAIT, stream.next())
        .await
        .expect("update in time")
        .expect("stream open")
        .expect("update ok");
    let health: Vec<_> = update
        .devices
        .iter()
        .map(|d| (d.id.as_str(), d.health.as_str()))
        .collect();
    assert_eq!(
        health,
        vec![("0000:3b:00.0", "Healthy"), ("0000:af:00.0", "Unhealthy")]
    );

    tasks.shutdown(WAIT).await;
    app.shutdown().await.expect("application stops");
    kubelet.stop().await;
}
