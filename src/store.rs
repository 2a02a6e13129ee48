//! ==============================================================================
//! store.rs - the shared state store
//! ==============================================================================
//!
//! purpose:
//!     the one piece of state every worker touches. sensor workers merge their
//!     family's readings in, senders and the web api read snapshots out.
//!
//! locking model:
//!     a single std mutex guards two copy-on-write namespaces. a write clones
//!     the namespace map, replaces one key and swaps the new map in. the lock
//!     is held for that clone+insert+swap only, never across bus or http i/o,
//!     and never across an .await.
//!
//!     readers grab both namespace Arcs under the lock and deep-copy them after
//!     releasing it. a published namespace is never mutated again, so the copy
//!     is exactly the state at the moment the lock was held.
//!
//! relationships:
//!     - written by: worker.rs (sensor loops), senders/mod.rs (status lines)
//!     - read by: senders/*, web.rs, worker.rs (ens160 ambient inputs)
//!
//! ==============================================================================

use crate::domain::{now_secs, SensorFields, SensorSnapshot, ServiceEntry, ServiceStatus, SharedState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Namespaces {
    sensors: Arc<SensorSnapshot>,
    services: Arc<ServiceStatus>,
}

/// cheap-to-clone handle to the host's shared state
#[derive(Clone, Default)]
pub struct SharedStore {
    inner: Arc<Mutex<Namespaces>>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// replace `"Sensor data"[family]` with `fields`, leaving other families alone
    pub fn merge_sensor_data(&self, family: &str, fields: SensorFields) {
        let mut ns = self.lock();
        let mut next = SensorSnapshot::clone(&ns.sensors);
        next.insert(family.to_string(), fields);
        ns.sensors = Arc::new(next);
    }

    /// replace `"Service data"[process]` with `{message, now}`
    pub fn set_service_status(&self, process: &str, message: impl Into<String>) {
        let entry = ServiceEntry {
            message: message.into(),
            timestamp: now_secs(),
        };
        let mut ns = self.lock();
        let mut next = ServiceStatus::clone(&ns.services);
        next.insert(process.to_string(), entry);
        ns.services = Arc::new(next);
    }

    /// deep point-in-time copy of the whole state
    pub fn snapshot(&self) -> SharedState {
        let (sensors, services) = {
            let ns = self.lock();
            (Arc::clone(&ns.sensors), Arc::clone(&ns.services))
        };
        SharedState {
            sensors: SensorSnapshot::clone(&sensors),
            services: ServiceStatus::clone(&services),
        }
    }

    /// deep copy of the sensor namespace only
    pub fn sensor_snapshot(&self) -> SensorSnapshot {
        let sensors = Arc::clone(&self.lock().sensors);
        SensorSnapshot::clone(&sensors)
    }

    fn lock(&self) -> MutexGuard<'_, Namespaces> {
        // every critical section is a single map swap, so a panicking holder
        // cannot leave a half-written namespace behind
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Reading;
    use std::thread;

    fn fields(pairs: &[(&str, f64)]) -> SensorFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Reading::new(Some(*v), "", k)))
            .collect()
    }

    #[test]
    fn test_starts_empty() {
        let store = SharedStore::new();
        let snap = store.snapshot();
        assert!(snap.sensors.is_empty());
        assert!(snap.services.is_empty());
    }

    #[test]
    fn test_merge_leaves_siblings_untouched() {
        let store = SharedStore::new();
        store.merge_sensor_data("SDS011", fields(&[("pm25", 12.3), ("pm10", 20.1)]));
        store.merge_sensor_data("BMP280", fields(&[("Temperature", 21.5), ("Pressure", 1012.3)]));

        // a second write to SDS011 replaces its whole sub-mapping
        store.merge_sensor_data("SDS011", fields(&[("pm25", 1.0)]));

        let snap = store.snapshot();
        assert_eq!(snap.sensors["SDS011"].len(), 1);
        assert_eq!(snap.value("SDS011", "pm25"), Some(1.0));
        assert_eq!(snap.value("BMP280", "Temperature"), Some(21.5));
        assert_eq!(snap.value("BMP280", "Pressure"), Some(1012.3));
    }

    #[test]
    fn test_snapshot_is_detached_from_store() {
        let store = SharedStore::new();
        store.merge_sensor_data("CPU", fields(&[("Temperature", 40.0)]));
        let mut snap = store.snapshot();
        snap.sensors.clear();
        store.merge_sensor_data("AHT20", fields(&[("Humidity", 55.0)]));

        let later = store.snapshot();
        assert_eq!(later.sensors.len(), 2);
        assert!(snap.sensors.is_empty());
    }

    #[test]
    fn test_service_status_overwrites_own_slot_only() {
        let store = SharedStore::new();
        store.set_service_status("sensor.community", "OK");
        store.set_service_status("BMP280", "OK");
        store.set_service_status("sensor.community", "send error 1 - boom");

        let snap = store.snapshot();
        assert_eq!(snap.services.len(), 2);
        assert_eq!(snap.services["sensor.community"].message, "send error 1 - boom");
        assert_eq!(snap.services["BMP280"].message, "OK");
        assert!(snap.services["BMP280"].timestamp > 0.0);
    }

    #[test]
    fn test_concurrent_writers_never_tear_a_family() {
        const WRITERS: usize = 6;
        const READERS: usize = 4;
        const ROUNDS: usize = 500;

        let store = SharedStore::new();
        let mut handles = Vec::new();

        for w in 0..WRITERS {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let name = format!("family-{w}");
                for i in 0..ROUNDS {
                    // both fields always carry the same round number
                    let v = i as f64;
                    store.merge_sensor_data(&name, fields(&[("a", v), ("b", v)]));
                    store.set_service_status(&name, format!("round {i}"));
                }
            }));
        }

        for _ in 0..READERS {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let mut last_seen = vec![-1.0f64; WRITERS];
                for _ in 0..ROUNDS {
                    let snap = store.snapshot();
                    for (w, last) in last_seen.iter_mut().enumerate() {
                        let Some(f) = snap.sensors.get(&format!("family-{w}")) else {
                            continue;
                        };
                        assert_eq!(f.len(), 2, "family-{w} partially written");
                        let a = f["a"].value.unwrap();
                        let b = f["b"].value.unwrap();
                        assert_eq!(a, b, "family-{w} mixes two writes");
                        // each family only moves forward across snapshots
                        assert!(a >= *last, "family-{w} went back in time");
                        *last = a;
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let snap = store.snapshot();
        assert_eq!(snap.sensors.len(), WRITERS);
        for w in 0..WRITERS {
            assert_eq!(snap.value(&format!("family-{w}"), "a"), Some((ROUNDS - 1) as f64));
        }
    }
}
