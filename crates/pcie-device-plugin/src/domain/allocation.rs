//! Allocation decisions for container device requests.

use core::error::Error;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;

use derive_more::Display;
use error_stack::Report;
use tracing::debug;
use tracing::warn;

use crate::domain::device::Device;
use crate::domain::device::DeviceSnapshot;

/// cgroup permissions granted on every allocated device node
pub const DEVICE_PERMISSIONS: &str = "mrw";

/// Reasons an allocation request is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum AllocationError {
    #[display("device {device_id} is not advertised by this plugin")]
    UnknownDevice { device_id: String },
    #[display("device {device_id} is unhealthy")]
    DeviceUnhealthy { device_id: String },
    #[display("device {device_id} is listed more than once for one container")]
    DuplicateDevice { device_id: String },
    #[display("device {device_id} has no host device node to grant")]
    UnresolvableHostPath { device_id: String },
}

impl Error for AllocationError {}

impl AllocationError {
    /// Machine-readable name of the failure condition.
    pub fn condition(&self) -> &'static str {
        match self {
            Self::UnknownDevice { .. } => "UnknownDevice",
            Self::DeviceUnhealthy { .. } => "DeviceUnhealthy",
            Self::DuplicateDevice { .. } => "DuplicateDevice",
            Self::UnresolvableHostPath { .. } => "UnresolvableHostPath",
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Self::UnknownDevice { device_id }
            | Self::DeviceUnhealthy { device_id }
            | Self::DuplicateDevice { device_id }
            | Self::UnresolvableHostPath { device_id } => device_id,
        }
    }
}

/// Maps a device to the device special file granted to the container.
pub trait HostPathResolver: Send + Sync {
    fn resolve(&self, device: &Device) -> Option<PathBuf>;
}

/// Access to one host device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAccessSpec {
    pub container_path: String,
    pub host_path: String,
    pub permissions: String,
}

/// Devices granted to one container, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerAllocation {
    pub devices: Vec<DeviceAccessSpec>,
}

/// Decides allocations against the current snapshot and keeps track of
/// which allocation last received each device.
pub struct AllocationEngine {
    resolver: Box<dyn HostPathResolver>,
    reservations: Mutex<HashMap<String, u64>>,
    next_sequence: AtomicU64,
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("reservations", &self.reservations)
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

impl AllocationEngine {
    pub fn new(resolver: impl HostPathResolver + 'static) -> Self {
        Self {
            resolver: Box::new(resolver),
            reservations: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Allocate devices for each container request.
    ///
    /// `requests[i]` lists the device ids for container `i`; on success the
    /// result has the same length and `result[i]` answers `requests[i]`.
    /// The whole call fails if any single device cannot be granted, in which
    /// case no reservation is recorded.
    pub fn allocate(
        &self,
        snapshot: &DeviceSnapshot,
        requests: &[Vec<String>],
    ) -> Result<Vec<ContainerAllocation>, Report<AllocationError>> {
        let mut granted = HashSet::new();
        let mut allocations = Vec::with_capacity(requests.len());

        for (index, device_ids) in requests.iter().enumerate() {
            let mut seen = HashSet::new();
            let mut devices = Vec::with_capacity(device_ids.len());
            for device_id in device_ids {
                if !seen.insert(device_id.as_str()) {
                    return Err(Report::new(AllocationError::DuplicateDevice {
                        device_id: device_id.clone(),
                    })
                    .attach_printable(format!("container request #{index}")));
                }
                devices.push(
                    self.grant(snapshot, device_id)
                        .map_err(|e| e.attach_printable(format!("container request #{index}")))?,
                );
            }
            granted.extend(seen);
            allocations.push(ContainerAllocation { devices });
        }

        self.reserve(granted.into_iter());
        Ok(allocations)
    }

    fn grant(
        &self,
        snapshot: &DeviceSnapshot,
        device_id: &str,
    ) -> Result<DeviceAccessSpec, Report<AllocationError>> {
        let device = snapshot
            .get(device_id)
            .ok_or_else(|| AllocationError::UnknownDevice {
                device_id: device_id.to_string(),
            })?;

        if !device.is_healthy() {
            return Err(Report::new(AllocationError::DeviceUnhealthy {
                device_id: device_id.to_string(),
            }));
        }

        let host_path = self.resolver.resolve(device).ok_or_else(|| {
            AllocationError::UnresolvableHostPath {
                device_id: device_id.to_string(),
            }
        })?;
        let host_path = host_path.to_string_lossy().into_owned();

        debug!(device_id, host_path = %host_path, "granting device");
        Ok(DeviceAccessSpec {
            container_path: host_path.clone(),
            host_path,
            permissions: DEVICE_PERMISSIONS.to_string(),
        })
    }

    fn reserve<'a>(&self, device_ids: impl Iterator<Item = &'a str>) {
        let mut reservations = self
            .reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // taken under the lock so sequence order matches reservation order
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        for device_id in device_ids {
            // kubelet re-allocates devices on container restart and never
            // releases them, so a re-grant replaces the previous owner
            if let Some(previous) = reservations.insert(device_id.to_string(), sequence) {
                warn!(
                    device_id,
                    previous_allocation = previous,
                    allocation = sequence,
                    "device granted again"
                );
            }
        }
    }

    /// Sequence number of the allocation that last received `device_id`.
    pub fn reservation(&self, device_id: &str) -> Option<u64> {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .copied()
    }

    pub fn reserved_count(&self) -> usize {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
