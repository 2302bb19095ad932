use std::collections::BTreeMap;

use derive_more::Display;
use serde::Serialize;

/// Health of an advertised device, as reported to kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
pub enum DeviceHealth {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

/// A PCI device advertised under the plugin's resource name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// PCI address of the device, e.g. `0000:3b:00.0`
    pub id: String,
    pub health: DeviceHealth,
    /// vendor id as read from sysfs, e.g. `0x10de`
    pub vendor: String,
    /// device (product) id as read from sysfs
    pub product: String,
    /// IOMMU group the device belongs to, if any
    pub iommu_group: Option<String>,
    /// NUMA node the device is attached to, if known
    pub numa_node: Option<i64>,
}

impl Device {
    /// create a healthy device with no topology or IOMMU information
    pub fn new(id: impl Into<String>, vendor: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            health: DeviceHealth::Healthy,
            vendor: vendor.into(),
            product: product.into(),
            iommu_group: None,
            numa_node: None,
        }
    }

    pub fn with_iommu_group(mut self, group: impl Into<String>) -> Self {
        self.iommu_group = Some(group.into());
        self
    }

    pub fn with_numa_node(mut self, node: i64) -> Self {
        self.numa_node = Some(node);
        self
    }

    pub fn with_health(mut self, health: DeviceHealth) -> Self {
        self.health = health;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.health == DeviceHealth::Healthy
    }
}

/// Immutable point-in-time view of all advertisable devices.
///
/// Devices are keyed by id, so identifiers are unique and iteration order is
/// stable. A snapshot is never mutated once published; changes produce a new
/// snapshot that replaces the old one wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    devices: BTreeMap<String, Device>,
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn healthy_count(&self) -> usize {
        self.iter().filter(|d| d.is_healthy()).count()
    }
}

impl FromIterator<Device> for DeviceSnapshot {
    /// Later devices with an id already present are ignored.
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        let mut devices = BTreeMap::new();
        for device in iter {
            devices.entry(device.id.clone()).or_insert(device);
        }
        Self { devices }
    }
}
