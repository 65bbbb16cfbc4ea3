//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Latest-record-per-device map folded from the telemetry stream.
//!
//! Each consumer owns its own `FleetState` and registers it as a telemetry
//! listener; the map outlives reconnects but not its owner.
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::ObserverError;
use crate::geo::{Coordinate, DistanceCache};
use crate::registry::Listener;
use crate::status::HelmetStatus;
use crate::wire::TelemetryRecord;

/// Latest record for one device and when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    /// Most recent record, stored whole.
    pub record: TelemetryRecord,
    /// Local receipt time.
    pub received_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    /// Classified status of the latest record.
    pub fn status(&self) -> HelmetStatus {
        self.record.helmet_status()
    }

    /// Last GPS fix, if any.
    pub fn position(&self) -> Option<Coordinate> {
        self.record.position()
    }
}

/// Headline counts for a dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    /// Devices heard from.
    pub total: usize,
    /// Devices whose latest record carries a status.
    pub online: usize,
    /// Devices whose latest record is an alarm.
    pub sos: usize,
}

/// Device id to latest snapshot, in first-seen order.
#[derive(Debug, Default)]
pub struct FleetState {
    devices: RwLock<IndexMap<String, DeviceSnapshot>>,
}

impl FleetState {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a record in, stamped with the current time.
    pub fn apply(&self, record: TelemetryRecord) {
        self.apply_at(record, Utc::now());
    }

    /// Fold a record in with an explicit receipt time. Replaces any previous
    /// snapshot for the device wholesale.
    pub fn apply_at(&self, record: TelemetryRecord, received_at: DateTime<Utc>) {
        let device_id = record.device_id.clone();
        self.devices.write().insert(
            device_id,
            DeviceSnapshot {
                record,
                received_at,
            },
        );
    }

    /// Snapshot for one device.
    pub fn get(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices.read().get(device_id).cloned()
    }

    /// Number of devices heard from.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Whether no device has reported yet.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Known device ids in first-seen order.
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    /// Headline counts.
    pub fn summary(&self) -> FleetSummary {
        let devices = self.devices.read();
        devices.values().fold(
            FleetSummary {
                total: devices.len(),
                ..FleetSummary::default()
            },
            |mut summary, snapshot| {
                if !snapshot.record.status.trim().is_empty() {
                    summary.online += 1;
                }
                if snapshot.status() == HelmetStatus::Sos {
                    summary.sos += 1;
                }
                summary
            },
        )
    }

    /// Devices whose latest record is an alarm.
    pub fn sos_devices(&self) -> Vec<String> {
        self.devices
            .read()
            .iter()
            .filter(|(_, snapshot)| snapshot.status() == HelmetStatus::Sos)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Distance in kilometres from `origin` to every device; `None` for
    /// devices without a fix.
    pub fn distances_from(
        &self,
        origin: Coordinate,
        cache: &DistanceCache,
    ) -> Vec<(String, Option<f64>)> {
        self.devices
            .read()
            .iter()
            .map(|(id, snapshot)| {
                (
                    id.clone(),
                    cache.distance_km(Some(origin), snapshot.position()),
                )
            })
            .collect()
    }

    /// Devices not heard from since `cutoff`.
    pub fn silent_since(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.devices
            .read()
            .iter()
            .filter(|(_, snapshot)| snapshot.received_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forget one device.
    pub fn remove(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices.write().shift_remove(device_id)
    }

    /// Forget every device.
    pub fn clear(&self) {
        self.devices.write().clear();
    }
}

impl Listener<TelemetryRecord> for FleetState {
    fn on_event(&self, record: &TelemetryRecord) -> Result<(), ObserverError> {
        self.apply(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::wire::decode_telemetry;

    fn record(frame: &str) -> TelemetryRecord {
        decode_telemetry(frame).expect("valid frame")
    }

    #[test]
    fn newer_record_replaces_the_old_one_wholesale() {
        let fleet = FleetState::new();
        fleet.apply(record("H-01,0,1.0,0.5,13.7367,100.5231,80"));
        fleet.apply(record("H-01,1,abc,0.7,,,N/A"));

        let snapshot = fleet.get("H-01").expect("device known");
        assert_eq!(fleet.len(), 1);
        assert_eq!(snapshot.status(), HelmetStatus::Sos);
        assert!(snapshot.record.g_force.is_nan());
        assert_eq!(snapshot.position(), None);
        assert_eq!(snapshot.record.heart_rate, None);
    }

    #[test]
    fn summary_counts_online_and_alarms() {
        let fleet = FleetState::new();
        fleet.apply(record("H-01,0,0,0,13.7,100.5,80"));
        fleet.apply(record("H-02,SOS,0,0,13.7,100.5,90"));
        fleet.apply(record("H-03,,0,0,13.7,100.5,70"));
        fleet.apply(record("H-04,1,0,0,13.7,100.5,0"));

        assert_eq!(
            fleet.summary(),
            FleetSummary {
                total: 4,
                online: 3,
                sos: 2,
            }
        );
        assert_eq!(fleet.sos_devices(), vec!["H-02".to_owned(), "H-04".to_owned()]);
    }

    #[test]
    fn distances_skip_devices_without_a_fix() {
        let fleet = FleetState::new();
        fleet.apply(record("H-01,0,0,0,13.741,100.53,80"));
        fleet.apply(record("H-02,0,0,0,north,100.53,80"));
        let cache = DistanceCache::default();

        let distances = fleet.distances_from(Coordinate::new(13.736717, 100.523186), &cache);
        assert_eq!(
            distances,
            vec![("H-01".to_owned(), Some(0.88)), ("H-02".to_owned(), None)]
        );
    }

    #[test]
    fn silent_devices_are_reported_by_receipt_time() {
        let fleet = FleetState::new();
        let now = Utc::now();
        fleet.apply_at(record("H-01,0,0,0,0,0,0"), now - Duration::minutes(10));
        fleet.apply_at(record("H-02,0,0,0,0,0,0"), now);

        assert_eq!(fleet.silent_since(now - Duration::minutes(5)), vec!["H-01".to_owned()]);
        assert!(fleet.remove("H-01").is_some());
        assert_eq!(fleet.device_ids(), vec!["H-02".to_owned()]);
        fleet.clear();
        assert!(fleet.is_empty());
    }

    #[test]
    fn acts_as_a_telemetry_listener() {
        let fleet = FleetState::new();
        fleet
            .on_event(&record("H-07,0,0,0,13.7,100.5,72"))
            .expect("fold never fails");
        assert!(fleet.get("H-07").is_some());
    }
}
