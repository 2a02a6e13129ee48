//! ==============================================================================
//! domain.rs - shared state data model
//! ==============================================================================
//!
//! purpose:
//!     the types that flow between sensor workers, the shared store, the
//!     senders and the json api. everything here is plain data with serde
//!     derives; the locking lives in store.rs.
//!
//! shape on the wire (what /api/data returns):
//!
//!     {
//!       "Sensor data":  { "SDS011": { "pm25": {value, unit, description, timestamp}, ... }, ... },
//!       "Service data": { "sensor.community": { "message": "OK", "timestamp": 1.7e9 }, ... }
//!     }
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// top-level key holding per-family sensor readings
pub const SENSOR_NAMESPACE: &str = "Sensor data";
/// top-level key holding per-worker status messages
pub const SERVICE_NAMESPACE: &str = "Service data";

/// sensor family keys used in the "Sensor data" namespace
pub mod family {
    pub const BMP280: &str = "BMP280";
    pub const AHT20: &str = "AHT20";
    pub const SDS011: &str = "SDS011";
    pub const ENS160: &str = "ENS160";
    pub const CPU: &str = "CPU";
}

/// one field of one sensor, measured once
///
/// `value == None` means the sensor produced nothing usable this cycle.
/// that is a normal state and serializes as `null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: Option<f64>,
    pub unit: String,
    pub description: String,
    /// unix seconds
    pub timestamp: f64,
}

impl Reading {
    pub fn new(value: Option<f64>, unit: &str, description: &str) -> Self {
        Self {
            value,
            unit: unit.to_string(),
            description: description.to_string(),
            timestamp: now_secs(),
        }
    }

    pub fn absent(unit: &str, description: &str) -> Self {
        Self::new(None, unit, description)
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }
}

/// all fields of a single sensor family, e.g. {"pm25": .., "pm10": ..}
pub type SensorFields = BTreeMap<String, Reading>;

/// family name -> fields
pub type SensorSnapshot = BTreeMap<String, SensorFields>;

/// a worker's latest self-reported status line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub message: String,
    /// unix seconds
    pub timestamp: f64,
}

impl ServiceEntry {
    /// age in seconds relative to `now`
    pub fn age(&self, now: f64) -> f64 {
        (now - self.timestamp).max(0.0)
    }

    pub fn is_stale(&self, now: f64, max_age_secs: f64) -> bool {
        self.age(now) > max_age_secs
    }
}

/// process name -> status
pub type ServiceStatus = BTreeMap<String, ServiceEntry>;

/// the aggregate root - one per running host
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    #[serde(rename = "Sensor data")]
    pub sensors: SensorSnapshot,
    #[serde(rename = "Service data")]
    pub services: ServiceStatus,
}

impl SharedState {
    /// value of `family.field`, if the family exists and the reading is present
    pub fn value(&self, family: &str, field: &str) -> Option<f64> {
        self.sensors.get(family)?.get(field)?.value
    }

    pub fn family(&self, family: &str) -> Option<&SensorFields> {
        self.sensors.get(family)
    }
}

/// current unix time in fractional seconds
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// round to two decimals the way the readings are published
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_serialize_with_display_names() {
        let mut state = SharedState::default();
        let mut fields = SensorFields::new();
        fields.insert("pm25".into(), Reading::new(Some(3.2), "µg/m³", "PM2.5"));
        fields.insert("pm10".into(), Reading::absent("µg/m³", "PM10"));
        state.sensors.insert(family::SDS011.into(), fields);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json[SENSOR_NAMESPACE]["SDS011"]["pm25"]["value"], 3.2);
        assert!(json[SENSOR_NAMESPACE]["SDS011"]["pm10"]["value"].is_null());
        assert!(json[SERVICE_NAMESPACE].is_object());
    }

    #[test]
    fn test_value_lookup_skips_absent() {
        let mut state = SharedState::default();
        let mut fields = SensorFields::new();
        fields.insert("Pressure".into(), Reading::absent("hPa", "Pressure"));
        state.sensors.insert(family::BMP280.into(), fields);

        assert_eq!(state.value(family::BMP280, "Pressure"), None);
        assert_eq!(state.value(family::BMP280, "Temperature"), None);
        assert_eq!(state.value(family::SDS011, "pm25"), None);
    }

    #[test]
    fn test_service_entry_staleness() {
        let entry = ServiceEntry { message: "OK".into(), timestamp: 100.0 };
        assert!(!entry.is_stale(125.0, 30.0));
        assert!(entry.is_stale(131.0, 30.0));
        // clock skew never yields a negative age
        assert_eq!(entry.age(90.0), 0.0);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(25.08247793081682), 25.08);
        assert_eq!(round2(1006.5326677582515), 1006.53);
    }
}
