//! Periodic device health probing.
//!
//! The probe re-runs discovery on a fixed interval and publishes the result
//! through the snapshot publisher, which is the only path by which device
//! health changes after startup.

use std::time::Duration;

use tokio::select;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::domain::device::DeviceHealth;
use crate::domain::device::DeviceSnapshot;
use crate::domain::snapshot::SnapshotPublisher;
use crate::platform::sysfs::DeviceRegistry;

pub struct HealthProbe {
    registry: DeviceRegistry,
    publisher: SnapshotPublisher,
    interval: Duration,
}

impl HealthProbe {
    pub fn new(registry: DeviceRegistry, publisher: SnapshotPublisher, interval: Duration) -> Self {
        Self {
            registry,
            publisher,
            interval,
        }
    }

    /// Merge a fresh scan into the previous snapshot.
    ///
    /// Scanned devices are healthy. Devices that were advertised before but
    /// are missing from the scan stay advertised as unhealthy, so kubelet
    /// stops scheduling onto them instead of seeing them vanish. A failed
    /// scan (`None`) marks every known device unhealthy.
    pub fn reconcile(previous: &DeviceSnapshot, scanned: Option<&DeviceSnapshot>) -> DeviceSnapshot {
        let Some(scanned) = scanned else {
            return previous
                .iter()
                .cloned()
                .map(|d| d.with_health(DeviceHealth::Unhealthy))
                .collect();
        };

        let lost = previous
            .iter()
            .filter(|d| !scanned.contains(&d.id))
            .cloned()
            .map(|d| d.with_health(DeviceHealth::Unhealthy));

        scanned.iter().cloned().chain(lost).collect()
    }

    /// Run one discovery pass. Returns whether a new snapshot was published.
    pub async fn probe_once(&self) -> bool {
        let registry = self.registry.clone();
        let scanned = match tokio::task::spawn_blocking(move || registry.discover()).await {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(report)) => {
                error!("health probe could not enumerate devices: {report:?}");
                None
            }
            Err(e) => {
                error!("health probe task failed: {e}");
                return false;
            }
        };

        let previous = self.publisher.current();
        let next = Self::reconcile(&previous, scanned.as_ref());

        for device in next.iter() {
            let was = previous.get(&device.id).map(|d| d.health);
            if was != Some(device.health) {
                warn!(
                    device_id = %device.id,
                    from = ?was,
                    to = %device.health,
                    "device health changed"
                );
            }
        }

        let changed = self.publisher.publish(next);
        debug!(changed, "health probe completed");
        changed
    }

    #[tracing::instrument(skip(self, cancellation_token), fields(interval = ?self.interval))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("starting device health probe");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately and startup has just scanned
        ticker.tick().await;

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("device health probe shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::device::Device;
    use crate::domain::snapshot;
    use crate::platform::sysfs::fixture::pci_entry;
    use crate::platform::sysfs::RegistryConfig;

    fn devices(entries: &[(&str, DeviceHealth)]) -> DeviceSnapshot {
        entries
            .iter()
            .map(|(id, health)| Device::new(*id, "0x1", "0x2").with_health(*health))
            .collect()
    }

    #[test]
    fn reconcile_marks_lost_devices_unhealthy() {
        let previous = devices(&[("a", DeviceHealth::Healthy), ("b", DeviceHealth::Healthy)]);
        let scanned = devices(&[("a", DeviceHealth::Healthy), ("c", DeviceHealth::Healthy)]);

        let next = HealthProbe::reconcile(&previous, Some(&scanned));

        assert_eq!(
            next,
            devices(&[
                ("a", DeviceHealth::Healthy),
                ("b", DeviceHealth::Unhealthy),
                ("c", DeviceHealth::Healthy),
            ])
        );
    }

    #[test]
    fn reconcile_restores_reappearing_devices() {
        let previous = devices(&[("a", DeviceHealth::Unhealthy)]);
        let scanned = devices(&[("a", DeviceHealth::Healthy)]);

        let next = HealthProbe::reconcile(&previous, Some(&scanned));

        assert_eq!(next, devices(&[("a", DeviceHealth::Healthy)]));
    }

    #[test]
    fn reconcile_failed_scan_marks_everything_unhealthy() {
        let previous = devices(&[("a", DeviceHealth::Healthy), ("b", DeviceHealth::Healthy)]);

        let next = HealthProbe::reconcile(&previous, None);

        assert_eq!(next.healthy_count(), 0);
        assert_eq!(next.len(), 2);
    }

    #[test(tokio::test)]
    async fn probe_publishes_removed_device_as_unhealthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("devices");
        pci_entry(&root, "0000:01:00.0", Some("0x10de"), Some("0x2330"), Some("1"));
        pci_entry(&root, "0000:02:00.0", Some("0x10de"), Some("0x2330"), Some("2"));

        let registry = DeviceRegistry::new(RegistryConfig::new(&root));
        let initial = registry.discover().expect("initial discovery");
        let (publisher, reader) = snapshot::channel(initial);
        let mut updates = reader.subscribe();
        updates.borrow_and_update();

        let probe = HealthProbe::new(registry, publisher, Duration::from_secs(60));
        assert!(!probe.probe_once().await, "nothing changed yet");

        fs::remove_dir_all(root.join("0000:02:00.0")).expect("remove entry");
        assert!(probe.probe_once().await);

        updates.changed().await.expect("publisher alive");
        let current = reader.current();
        assert_eq!(
            current.get("0000:02:00.0").map(|d| d.health),
            Some(DeviceHealth::Unhealthy)
        );
        assert_eq!(
            current.get("0000:01:00.0").map(|d| d.health),
            Some(DeviceHealth::Healthy)
        );
    }

    #[test(tokio::test)]
    async fn run_stops_on_cancellation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = DeviceRegistry::new(RegistryConfig::new(dir.path()));
        let (publisher, _reader) = snapshot::channel(DeviceSnapshot::new());
        let probe = HealthProbe::new(registry, publisher, Duration::from_millis(10));

        let token = CancellationToken::new();
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), probe.run(token))
            .await
            .expect("probe should stop promptly");
    }
}
