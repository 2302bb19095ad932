use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::api::device_plugin_client::DevicePluginClient;
use super::api::device_plugin_server::DevicePlugin;
use super::api::device_plugin_server::DevicePluginServer;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::ContainerPreferredAllocationResponse;
use super::api::DevicePluginOptions;
use super::api::DeviceSpec;
use super::api::Empty;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::connect_uds;
use super::registration::RegistrationDescriptor;
use super::watch;
use super::PluginError;
use super::DEFAULT_DEVICE_PLUGIN_DIR;
use super::DEFAULT_RESOURCE_NAME;
use super::DEFAULT_SOCKET_NAME;
use crate::domain::allocation::AllocationEngine;
use crate::domain::allocation::AllocationError;
use crate::domain::allocation::ContainerAllocation;
use crate::domain::snapshot::SnapshotReader;

/// metadata key carrying the allocation failure condition
pub const ALLOCATION_ERROR_METADATA: &str = "allocation-error";

/// Device plugin settings.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// unix socket the plugin serves on, inside kubelet's device plugin directory
    pub socket_path: PathBuf,
    /// resource name (e.g. "pcie.com/device")
    pub resource_name: String,
    pub pre_start_required: bool,
    /// how long startup waits for the socket to answer
    pub self_check_timeout: Duration,
    /// how long shutdown waits for in-flight calls
    pub shutdown_grace: Duration,
}

impl PluginConfig {
    pub fn new(socket_path: impl Into<PathBuf>, resource_name: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            resource_name: resource_name.into(),
            pre_start_required: false,
            self_check_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// socket file name kubelet dials back, relative to its plugin directory
    pub fn endpoint(&self) -> String {
        self.socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn options(&self) -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: self.pre_start_required,
            get_preferred_allocation_available: true,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self::new(
            Path::new(DEFAULT_DEVICE_PLUGIN_DIR).join(DEFAULT_SOCKET_NAME),
            DEFAULT_RESOURCE_NAME,
        )
    }
}

/// Lifecycle of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PluginState {
    Unstarted,
    Listening,
    Registered,
    Stopped,
}

struct RunningServer {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl RunningServer {
    /// Stop accepting calls, end watch streams and wait for the server task,
    /// aborting it once `grace` has passed.
    async fn terminate(mut self, grace: Duration) {
        self.shutdown.cancel();
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(Ok(()))) => info!("gRPC server stopped"),
            Ok(Ok(Err(e))) => warn!("gRPC server exited with error: {e}"),
            Ok(Err(e)) => warn!("gRPC server task failed: {e}"),
            Err(_) => {
                warn!("gRPC server did not stop within {grace:?}, aborting");
                self.handle.abort();
            }
        }
    }
}

struct Lifecycle {
    state: PluginState,
    server: Option<RunningServer>,
}

/// PCIe Device Plugin for Kubernetes
///
/// One instance owns one socket path and one resource name. Instances are
/// independent, so several can run side by side on different sockets.
pub struct PcieDevicePlugin {
    config: PluginConfig,
    snapshot: SnapshotReader,
    allocator: Arc<AllocationEngine>,
    lifecycle: Mutex<Lifecycle>,
}

impl PcieDevicePlugin {
    /// create a new PCIe Device Plugin instance
    pub fn new(
        config: PluginConfig,
        snapshot: SnapshotReader,
        allocator: Arc<AllocationEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            snapshot,
            allocator,
            lifecycle: Mutex::new(Lifecycle {
                state: PluginState::Unstarted,
                server: None,
            }),
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<AllocationEngine> {
        &self.allocator
    }

    pub async fn state(&self) -> PluginState {
        self.lifecycle.lock().await.state
    }

    /// The descriptor sent to kubelet when registering this instance.
    pub fn registration_descriptor(&self) -> RegistrationDescriptor {
        RegistrationDescriptor::new(
            self.config.endpoint(),
            self.config.resource_name.clone(),
            self.config.options(),
        )
    }

    /// start device plugin server
    ///
    /// Removes a stale socket left by a previous instance, binds the socket,
    /// serves gRPC on a background task and returns once a client connection
    /// to the socket has been answered.
    pub async fn start(&self) -> Result<(), Report<PluginError>> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.state {
            PluginState::Unstarted | PluginState::Stopped => {}
            state => {
                return Err(Report::new(PluginError::InvalidState {
                    operation: "start",
                    state,
                }))
            }
        }

        let socket_path = &self.config.socket_path;
        info!("start device plugin server: {}", socket_path.display());

        // a socket that still accepts connections belongs to a live instance
        if socket_is_live(socket_path).await {
            return Err(Report::new(PluginError::SocketInUse {
                path: socket_path.clone(),
            }));
        }

        // clean up old socket file if it exists
        remove_socket(socket_path).change_context_lazy(|| PluginError::SocketCleanup {
            path: socket_path.clone(),
        })?;

        let listener = UnixListener::bind(socket_path).change_context_lazy(|| {
            PluginError::SocketBind {
                path: socket_path.clone(),
            }
        })?;

        let shutdown = CancellationToken::new();
        let service = DevicePluginService::new(
            self.config.options(),
            self.snapshot.clone(),
            self.allocator.clone(),
            shutdown.clone(),
        );

        info!("gRPC server is bound to: {}", socket_path.display());

        let server_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        server_shutdown.cancelled().await;
                        info!("shutting down gRPC server");
                    },
                )
                .await
        });
        let server = RunningServer { shutdown, handle };

        if let Err(report) = self.self_check().await {
            error!("device plugin socket is not serving: {report:?}");
            server.terminate(self.config.shutdown_grace).await;
            if let Err(e) = remove_socket(socket_path) {
                warn!("failed to remove socket after failed start: {e:?}");
            }
            lifecycle.state = PluginState::Stopped;
            return Err(report);
        }

        lifecycle.server = Some(server);
        lifecycle.state = PluginState::Listening;
        info!("device plugin server is ready");
        Ok(())
    }

    /// Dial our own socket and make one call through it.
    async fn self_check(&self) -> Result<(), Report<PluginError>> {
        let timeout = self.config.self_check_timeout;
        let check = async {
            let channel = connect_uds(&self.config.socket_path, timeout)
                .await
                .map_err(|e| format!("cannot connect: {e}"))?;
            DevicePluginClient::new(channel)
                .get_device_plugin_options(Request::new(Empty {}))
                .await
                .map_err(|status| format!("options call failed: {}", status.message()))?;
            Ok::<(), String>(())
        };

        match tokio::time::timeout(timeout, check).await {
            Ok(Ok(())) => {
                debug!("device plugin socket self-check passed");
                Ok(())
            }
            Ok(Err(message)) => Err(Report::new(PluginError::SelfCheck { message })),
            Err(_) => Err(Report::new(PluginError::SelfCheck {
                message: format!("no answer within {timeout:?}"),
            })),
        }
    }

    /// Record a successful registration with kubelet.
    pub async fn mark_registered(&self) -> Result<(), Report<PluginError>> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != PluginState::Listening {
            return Err(Report::new(PluginError::InvalidState {
                operation: "register",
                state: lifecycle.state,
            }));
        }
        lifecycle.state = PluginState::Registered;
        Ok(())
    }

    /// stop device plugin server
    ///
    /// Ends all watch streams, waits for the server within the shutdown grace
    /// period and removes the socket file. Stopping a stopped plugin does
    /// nothing.
    pub async fn stop(&self) -> Result<(), Report<PluginError>> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == PluginState::Stopped {
            debug!("device plugin already stopped");
            return Ok(());
        }

        info!(state = %lifecycle.state, "stopping device plugin server");
        let was_serving = lifecycle.server.is_some();
        if let Some(server) = lifecycle.server.take() {
            server.terminate(self.config.shutdown_grace).await;
        }
        lifecycle.state = PluginState::Stopped;

        if was_serving {
            remove_socket(&self.config.socket_path).change_context_lazy(|| {
                PluginError::Shutdown {
                    message: format!(
                        "socket {} could not be removed",
                        self.config.socket_path.display()
                    ),
                }
            })?;
        }
        info!("device plugin server stopped");
        Ok(())
    }
}

/// Whether something still accepts connections on `path`.
async fn socket_is_live(path: &Path) -> bool {
    match tokio::net::UnixStream::connect(path).await {
        Ok(_) => true,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("treating {} as stale: {e}", path.display());
            }
            false
        }
    }
}

/// Remove a socket file, treating a missing file as already removed.
fn remove_socket(path: &Path) -> Result<(), Report<io::Error>> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed socket file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Report::new(e)),
    }
}

/// DevicePlugin service implementation
/// provide core device management functionality
#[derive(Debug)]
pub struct DevicePluginService {
    options: DevicePluginOptions,
    snapshot: SnapshotReader,
    allocator: Arc<AllocationEngine>,
    /// cancelled when the owning plugin stops
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        options: DevicePluginOptions,
        snapshot: SnapshotReader,
        allocator: Arc<AllocationEngine>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            options,
            snapshot,
            allocator,
            cancellation_token,
        }
    }
}

fn into_container_response(allocation: ContainerAllocation) -> ContainerAllocateResponse {
    let devices = allocation
        .devices
        .into_iter()
        .map(|spec| DeviceSpec {
            container_path: spec.container_path,
            host_path: spec.host_path,
            permissions: spec.permissions,
        })
        .collect();

    ContainerAllocateResponse {
        envs: HashMap::new(),
        mounts: Vec::new(),
        devices,
        annotations: HashMap::new(),
        cdi_devices: Vec::new(),
    }
}

/// Translate an allocation failure into a gRPC status.
pub fn allocation_status(error: &AllocationError) -> Status {
    let mut status = match error {
        AllocationError::UnknownDevice { .. } => Status::not_found(error.to_string()),
        AllocationError::DeviceUnhealthy { .. } | AllocationError::UnresolvableHostPath { .. } => {
            Status::failed_precondition(error.to_string())
        }
        AllocationError::DuplicateDevice { .. } => Status::invalid_argument(error.to_string()),
    };
    status.metadata_mut().insert(
        ALLOCATION_ERROR_METADATA,
        MetadataValue::from_static(error.condition()),
    );
    status
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.options.clone()))
    }

    type ListAndWatchStream = watch::DeviceStream;

    /// list and watch device state changes
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let stream = watch::watch_devices(&self.snapshot, self.cancellation_token.clone());
        Ok(Response::new(stream))
    }

    /// get preferred device allocation
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);

        // no preference, kubelet falls back to its own selection
        let container_responses = req
            .container_requests
            .iter()
            .map(|_| ContainerPreferredAllocationResponse { device_ids: vec![] })
            .collect();
        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    /// allocate devices to container
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices to container: {:?}", req);

        let requests: Vec<Vec<String>> = req
            .container_requests
            .into_iter()
            .map(|container_req| container_req.devices_ids)
            .collect();

        let snapshot = self.snapshot.current();
        let allocations = match self.allocator.allocate(&snapshot, &requests) {
            Ok(allocations) => allocations,
            Err(report) => {
                warn!("device allocation rejected: {report:?}");
                return Err(allocation_status(report.current_context()));
            }
        };

        let response = AllocateResponse {
            container_responses: allocations
                .into_iter()
                .map(into_container_response)
                .collect(),
        };

        info!(
            containers = response.container_responses.len(),
            "device allocation completed"
        );
        Ok(Response::new(response))
    }

    /// pre-start container
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        let req = request.into_inner();
        debug!("pre-start container processing: {:?}", req);

        Ok(Response::new(PreStartContainerResponse {}))
    }
}
