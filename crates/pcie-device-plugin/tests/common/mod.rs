#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use pcie_device_plugin::k8s::api::device_plugin_client::DevicePluginClient;
use pcie_device_plugin::k8s::api::registration_server::Registration;
use pcie_device_plugin::k8s::api::registration_server::RegistrationServer;
use pcie_device_plugin::k8s::api::Empty;
use pcie_device_plugin::k8s::api::RegisterRequest;
use pcie_device_plugin::k8s::connect_uds;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;
use tonic::Response;
use tonic::Status;

pub const WAIT: Duration = Duration::from_secs(5);

/// Create a sysfs-like PCI device entry under `root`.
pub fn pci_entry(root: &Path, address: &str, vendor: &str, product: &str, iommu_group: &str) {
    let entry = root.join(address);
    fs::create_dir_all(&entry).expect("create entry dir");
    fs::write(entry.join("vendor"), format!("{vendor}\n")).expect("write vendor");
    fs::write(entry.join("device"), format!("{product}\n")).expect("write device");
    let group = root.join("..").join("iommu_groups").join(iommu_group);
    fs::create_dir_all(&group).expect("create iommu group dir");
    symlink(&group, entry.join("iommu_group")).expect("link iommu group");
}

pub async fn plugin_client(socket: &Path) -> DevicePluginClient<Channel> {
    let channel = connect_uds(socket, WAIT)
        .await
        .expect("connect to plugin socket");
    DevicePluginClient::new(channel)
}

/// Poll `check` until it holds or `WAIT` passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Records every registration it receives.
#[derive(Clone, Default)]
struct RecordingRegistration {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for RecordingRegistration {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// A stand-in for kubelet's registration socket.
pub struct MockKubelet {
    socket: PathBuf,
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl MockKubelet {
    pub fn serve(socket: &Path) -> Self {
        Self::serve_recording(socket, Arc::default())
    }

    fn serve_recording(socket: &Path, requests: Arc<Mutex<Vec<RegisterRequest>>>) -> Self {
        let _ = fs::remove_file(socket);
        let listener = UnixListener::bind(socket).expect("bind mock kubelet socket");
        let service = RecordingRegistration {
            requests: requests.clone(),
        };
        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();

        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RegistrationServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    server_shutdown.cancelled().await;
                })
                .await
                .expect("mock kubelet serves");
        });

        Self {
            socket: socket.to_path_buf(),
            requests,
            shutdown,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<RegisterRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    /// Stop serving and remove the socket, keeping the recorded requests.
    pub async fn stop(self) -> Arc<Mutex<Vec<RegisterRequest>>> {
        self.shutdown.cancel();
        let _ = self.handle.await;
        let _ = fs::remove_file(&self.socket);
        self.requests
    }

    /// Simulate a kubelet restart: the socket disappears and comes back.
    pub async fn restart(self) -> Self {
        let socket = self.socket.clone();
        let requests = self.stop().await;
        Self::serve_recording(&socket, requests)
    }
}
