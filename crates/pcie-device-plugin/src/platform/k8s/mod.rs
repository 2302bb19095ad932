//! Kubelet device plugin integration.
//!
//! - [`device_plugin`]: the gRPC server kubelet calls into, and its socket lifecycle
//! - [`watch`]: per-watcher `ListAndWatch` streams
//! - [`registration`]: the handshake announcing the plugin to kubelet
//! - [`kubelet_watcher`]: detects kubelet restarts that require re-registration

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use core::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use derive_more::Display;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

pub mod device_plugin;
pub mod kubelet_watcher;
pub mod registration;
pub mod watch;

pub use device_plugin::PcieDevicePlugin;
pub use device_plugin::PluginConfig;
pub use device_plugin::PluginState;
pub use kubelet_watcher::KubeletEvent;
pub use kubelet_watcher::KubeletWatcher;
pub use registration::KubeletRegistrar;
pub use registration::RegistrationDescriptor;
pub use registration::RetryPolicy;

/// device plugin API version spoken by this plugin
pub const API_VERSION: &str = "v1beta1";
pub const DEFAULT_DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins/";
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";
pub const DEFAULT_SOCKET_NAME: &str = "pcie.sock";
pub const DEFAULT_RESOURCE_NAME: &str = "pcie.com/device";

/// Errors raised by the plugin service, registration and kubelet watching.
#[derive(Debug, Display)]
pub enum PluginError {
    #[display("failed to remove stale socket {}", path.display())]
    SocketCleanup { path: PathBuf },
    #[display("device plugin socket {} is served by another instance", path.display())]
    SocketInUse { path: PathBuf },
    #[display("failed to bind device plugin socket {}", path.display())]
    SocketBind { path: PathBuf },
    #[display("device plugin socket self-check failed: {message}")]
    SelfCheck { message: String },
    #[display("registration with kubelet failed after {attempts} attempt(s): {message}")]
    Registration { attempts: u32, message: String },
    #[display("cannot {operation} device plugin in state {state}")]
    InvalidState {
        operation: &'static str,
        state: PluginState,
    },
    #[display("device plugin shutdown incomplete: {message}")]
    Shutdown { message: String },
    #[display("failed to watch kubelet socket directory {}", path.display())]
    Watch { path: PathBuf },
}

impl Error for PluginError {}

/// Connect a gRPC channel to a Unix domain socket.
pub async fn connect_uds(
    socket_path: &Path,
    connect_timeout: Duration,
) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();

    // the URI is a placeholder, the connector always dials the socket
    Endpoint::from_static("http://tonic")
        .connect_timeout(connect_timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                let stream = UnixStream::connect(socket_path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
}
