//! PCI device discovery from sysfs.
//!
//! Every entry under the PCI devices directory (normally
//! `/sys/bus/pci/devices`) is named after the device's PCI address and
//! exposes `vendor` and `device` attribute files. Entries whose attributes
//! cannot be read are skipped; only a failure to enumerate the directory
//! itself is an error.

use core::error::Error;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::warn;

use crate::domain::allocation::HostPathResolver;
use crate::domain::device::Device;
use crate::domain::device::DeviceSnapshot;

pub const DEFAULT_PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";
pub const DEFAULT_VFIO_DEV_DIR: &str = "/dev/vfio";

/// Errors raised while reading the hardware registry.
#[derive(Debug, Display)]
pub enum RegistryError {
    #[display("cannot enumerate hardware registry at {}", path.display())]
    RootUnreadable { path: PathBuf },
    #[display("cannot read attributes of registry entry {}", path.display())]
    EntryUnreadable { path: PathBuf },
}

impl Error for RegistryError {}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// directory holding one entry per PCI device
    pub root: PathBuf,
    /// vendor ids to advertise; empty means every vendor
    pub vendor_filter: Vec<String>,
}

impl RegistryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            vendor_filter: Vec::new(),
        }
    }

    pub fn with_vendor_filter(mut self, vendors: Vec<String>) -> Self {
        self.vendor_filter = vendors;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PCI_DEVICES_PATH)
    }
}

/// Enumerates PCI devices into immutable snapshots.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    config: RegistryConfig,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Scan the registry and build a snapshot of every readable entry.
    ///
    /// All discovered devices start out healthy.
    #[tracing::instrument(skip(self), fields(root = %self.config.root.display()))]
    pub fn discover(&self) -> Result<DeviceSnapshot, Report<RegistryError>> {
        let root = &self.config.root;
        let entries = fs::read_dir(root).change_context(RegistryError::RootUnreadable {
            path: root.clone(),
        })?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("failed to read registry entry under {}: {e}", root.display());
                    continue;
                }
            };

            match self.read_entry(&entry.path()) {
                Ok(Some(device)) => {
                    debug!(
                        device_id = %device.id,
                        vendor = %device.vendor,
                        product = %device.product,
                        iommu_group = ?device.iommu_group,
                        "discovered device"
                    );
                    devices.push(device);
                }
                Ok(None) => {}
                Err(report) => warn!("skipping registry entry: {report:?}"),
            }
        }

        let snapshot: DeviceSnapshot = devices.into_iter().collect();
        debug!(count = snapshot.len(), "device discovery completed");
        Ok(snapshot)
    }

    /// Read one entry. `Ok(None)` means the entry is filtered out by vendor.
    fn read_entry(&self, path: &Path) -> Result<Option<Device>, Report<RegistryError>> {
        let id = match path.file_name() {
            Some(name) => name.to_string_lossy().trim().to_string(),
            None => {
                return Err(Report::new(RegistryError::EntryUnreadable {
                    path: path.to_path_buf(),
                })
                .attach_printable("entry has no name"))
            }
        };

        let vendor = read_attribute(&path.join("vendor")).change_context_lazy(|| {
            RegistryError::EntryUnreadable {
                path: path.to_path_buf(),
            }
        })?;
        let product = read_attribute(&path.join("device")).change_context_lazy(|| {
            RegistryError::EntryUnreadable {
                path: path.to_path_buf(),
            }
        })?;

        if !self.matches_vendor(&vendor) {
            debug!(device_id = %id, vendor = %vendor, "vendor not selected, skipping");
            return Ok(None);
        }

        let mut device = Device::new(id, vendor, product);
        device.iommu_group = read_iommu_group(path);
        device.numa_node = read_numa_node(path);
        Ok(Some(device))
    }

    fn matches_vendor(&self, vendor: &str) -> bool {
        self.config.vendor_filter.is_empty()
            || self
                .config
                .vendor_filter
                .iter()
                .any(|v| v.eq_ignore_ascii_case(vendor))
    }
}

fn read_attribute(path: &Path) -> Result<String, Report<io::Error>> {
    let value = fs::read_to_string(path)
        .map_err(Report::new)
        .attach_printable_lazy(|| format!("attribute file {}", path.display()))?;
    Ok(value.trim().to_string())
}

/// `iommu_group` is a symlink to `/sys/kernel/iommu_groups/<n>`.
fn read_iommu_group(entry: &Path) -> Option<String> {
    let target = fs::read_link(entry.join("iommu_group")).ok()?;
    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// sysfs reports `-1` when the platform has no NUMA information.
fn read_numa_node(entry: &Path) -> Option<i64> {
    let value = fs::read_to_string(entry.join("numa_node")).ok()?;
    value.trim().parse::<i64>().ok().filter(|node| *node >= 0)
}

/// Resolves devices to their VFIO group node, e.g. `/dev/vfio/42`.
#[derive(Debug, Clone)]
pub struct VfioPathResolver {
    dev_dir: PathBuf,
}

impl VfioPathResolver {
    pub fn new(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
        }
    }
}

impl Default for VfioPathResolver {
    fn default() -> Self {
        Self::new(DEFAULT_VFIO_DEV_DIR)
    }
}

impl HostPathResolver for VfioPathResolver {
    fn resolve(&self, device: &Device) -> Option<PathBuf> {
        device
            .iommu_group
            .as_ref()
            .map(|group| self.dev_dir.join(group))
    }
}
