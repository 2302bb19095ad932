//! Registration handshake with kubelet.

use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use error_stack::Report;
use rand::Rng;
use tonic::Request;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::api::registration_client::RegistrationClient;
use super::api::DevicePluginOptions;
use super::api::RegisterRequest;
use super::connect_uds;
use super::PluginError;
use super::API_VERSION;

/// What the plugin announces to kubelet.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationDescriptor {
    pub version: String,
    /// socket file name, relative to kubelet's device plugin directory
    pub endpoint: String,
    pub resource_name: String,
    pub options: DevicePluginOptions,
}

impl RegistrationDescriptor {
    pub fn new(endpoint: String, resource_name: String, options: DevicePluginOptions) -> Self {
        Self {
            version: API_VERSION.to_string(),
            endpoint,
            resource_name,
            options,
        }
    }

    fn to_request(&self) -> RegisterRequest {
        RegisterRequest {
            version: self.version.clone(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource_name.clone(),
            options: Some(self.options.clone()),
        }
    }
}

/// Exponential backoff for registration attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// total number of attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// fraction of the delay randomly added or removed
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (0-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay with jitter to avoid every plugin on a node retrying in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt).as_secs_f64();
        let jitter_range = base * self.jitter.clamp(0.0, 1.0);
        if jitter_range <= 0.0 {
            return Duration::from_secs_f64(base);
        }

        let offset = rand::rng().random_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

/// Performs the registration handshake against kubelet's registration socket.
#[derive(Debug)]
pub struct KubeletRegistrar {
    kubelet_socket: PathBuf,
    policy: RetryPolicy,
    connect_timeout: Duration,
    attempts: AtomicU32,
}

impl KubeletRegistrar {
    pub fn new(kubelet_socket: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            kubelet_socket: kubelet_socket.into(),
            policy,
            connect_timeout: Duration::from_secs(5),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Total number of registration attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// register device plugin with kubelet
    ///
    /// Retries with backoff while kubelet is unreachable or rejects the
    /// request, and fails once the retry policy is exhausted.
    #[instrument(skip(self, descriptor), fields(
        kubelet_socket = %self.kubelet_socket.display(),
        resource_name = %descriptor.resource_name
    ))]
    pub async fn register(
        &self,
        descriptor: &RegistrationDescriptor,
    ) -> Result<(), Report<PluginError>> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            info!(
                attempt = attempt + 1,
                max_attempts,
                endpoint = %descriptor.endpoint,
                "registering device plugin with kubelet"
            );

            match self.try_register(descriptor).await {
                Ok(()) => {
                    info!("successfully registered device plugin with kubelet");
                    return Ok(());
                }
                Err(message) => {
                    warn!(attempt = attempt + 1, "registration attempt failed: {message}");
                    last_error = message;
                }
            }

            if attempt + 1 < max_attempts {
                let delay = self.policy.delay(attempt);
                info!("retrying registration in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }

        Err(Report::new(PluginError::Registration {
            attempts: max_attempts,
            message: last_error,
        }))
    }

    async fn try_register(&self, descriptor: &RegistrationDescriptor) -> Result<(), String> {
        // create UDS client connection
        let channel = connect_uds(&self.kubelet_socket, self.connect_timeout)
            .await
            .map_err(|e| format!("cannot connect to kubelet: {e}"))?;
        let mut client = RegistrationClient::new(channel);

        client
            .register(Request::new(descriptor.to_request()))
            .await
            .map_err(|status| format!("kubelet rejected registration: {}", status.message()))?;
        Ok(())
    }
}
