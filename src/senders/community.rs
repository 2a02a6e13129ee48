//! ==============================================================================
//! community.rs - sensor.community push (plus madavi mirror)
//! ==============================================================================
//!
//! each cycle makes two pushes, told apart by the X-Pin header:
//!
//!     pin 1   particulate   P1 = pm10, P2 = pm2.5
//!     pin 11  climate       temperature, pressure (Pa, no decimals),
//!                           humidity when an AHT20 reading exists
//!
//! every push goes to every configured endpoint. a push counts as delivered
//! when at least one endpoint accepts it (200/201); the cycle is delivered
//! only when both pushes are.
//!
//! ==============================================================================

use super::{check_response, DataValue, Delivery, DeliveryError, Forwarder, Schedule};
use crate::config::CommunityConfig;
use crate::domain::{family, SharedState};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const NAME: &str = "sensor.community";
pub const PIN_PARTICULATE: &str = "1";
pub const PIN_CLIMATE: &str = "11";
const ACCEPTED: [u16; 2] = [200, 201];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub software_version: String,
    pub sensordatavalues: Vec<DataValue>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Push {
    pub pin: &'static str,
    pub payload: Payload,
}

/// both pushes for this snapshot, or None when SDS011 or BMP280 readings are missing
pub fn build_pushes(snapshot: &SharedState, software_version: &str) -> Option<Vec<Push>> {
    let pm10 = snapshot.value(family::SDS011, "pm10")?;
    let pm25 = snapshot.value(family::SDS011, "pm25")?;
    let temperature = snapshot.value(family::BMP280, "Temperature")?;
    let pressure = snapshot.value(family::BMP280, "Pressure")?;
    let humidity = snapshot.value(family::AHT20, "Humidity");

    let particulate = vec![DataValue::fixed2("P1", pm10), DataValue::fixed2("P2", pm25)];

    let mut climate = vec![
        DataValue::fixed2("temperature", temperature),
        DataValue::new("pressure", format!("{:.0}", pressure * 100.0)),
    ];
    if let Some(h) = humidity {
        climate.push(DataValue::fixed2("humidity", h));
    }

    let payload = |values| Payload {
        software_version: software_version.to_string(),
        sensordatavalues: values,
    };
    Some(vec![
        Push { pin: PIN_PARTICULATE, payload: payload(particulate) },
        Push { pin: PIN_CLIMATE, payload: payload(climate) },
    ])
}

pub struct CommunityPush {
    client: reqwest::Client,
    config: CommunityConfig,
}

impl CommunityPush {
    pub fn new(client: reqwest::Client, config: CommunityConfig) -> Self {
        Self { client, config }
    }

    async fn push(&self, push: &Push) -> Result<(), DeliveryError> {
        let mut delivered = false;
        let mut first_error = None;

        for url in &self.config.endpoints {
            let sent = self
                .client
                .post(url)
                .header("X-Pin", push.pin)
                .header("X-Sensor", &self.config.sensor_id)
                .json(&push.payload)
                .send()
                .await;
            match check_response(url, sent, &ACCEPTED).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    tracing::debug!(sender = NAME, pin = push.pin, "endpoint refused push: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match (delivered, first_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }
}

impl Forwarder for CommunityPush {
    fn name(&self) -> &str {
        NAME
    }

    fn schedule(&self) -> Schedule {
        Schedule {
            period: Duration::from_secs(self.config.interval_seconds),
            backoff: Duration::from_secs(self.config.backoff_seconds),
        }
    }

    async fn deliver(&self, snapshot: &SharedState) -> Result<Delivery, DeliveryError> {
        let Some(pushes) = build_pushes(snapshot, &self.config.software_version) else {
            return Ok(Delivery::NoData);
        };

        // both pushes always go out; the first failure decides the outcome
        let mut outcome = Ok(Delivery::Sent);
        for push in &pushes {
            if let Err(e) = self.push(push).await {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Reading, SensorFields};

    fn snapshot(with_humidity: bool) -> SharedState {
        let fields = |pairs: &[(&str, f64)]| -> SensorFields {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Reading::new(Some(*v), "", k)))
                .collect()
        };
        let mut state = SharedState::default();
        state.sensors.insert(family::SDS011.into(), fields(&[("pm25", 12.3), ("pm10", 20.1)]));
        state.sensors.insert(family::BMP280.into(), fields(&[("Temperature", 21.5), ("Pressure", 1012.3)]));
        if with_humidity {
            state.sensors.insert(family::AHT20.into(), fields(&[("Temperature", 21.0), ("Humidity", 48.25)]));
        }
        state
    }

    fn values(push: &Push) -> Vec<(&str, &str)> {
        push.payload
            .sensordatavalues
            .iter()
            .map(|v| (v.value_type.as_str(), v.value.as_str()))
            .collect()
    }

    #[test]
    fn test_builds_particulate_and_climate_pushes() {
        let pushes = build_pushes(&snapshot(false), "test_1.0").unwrap();
        assert_eq!(pushes.len(), 2);

        assert_eq!(pushes[0].pin, "1");
        assert_eq!(values(&pushes[0]), vec![("P1", "20.10"), ("P2", "12.30")]);

        assert_eq!(pushes[1].pin, "11");
        assert_eq!(values(&pushes[1]), vec![("temperature", "21.50"), ("pressure", "101230")]);
        assert_eq!(pushes[1].payload.software_version, "test_1.0");
    }

    #[test]
    fn test_humidity_rides_along_when_present() {
        let pushes = build_pushes(&snapshot(true), "v").unwrap();
        assert_eq!(values(&pushes[1]).last(), Some(&("humidity", "48.25")));
    }

    #[test]
    fn test_missing_family_means_no_data() {
        let mut state = snapshot(true);
        state.sensors.remove(family::SDS011);
        assert!(build_pushes(&state, "v").is_none());

        let mut state = snapshot(true);
        state
            .sensors
            .get_mut(family::BMP280)
            .unwrap()
            .insert("Pressure".into(), Reading::absent("hPa", "Pressure"));
        assert!(build_pushes(&state, "v").is_none());
    }

    #[test]
    fn test_payload_json_shape() {
        let pushes = build_pushes(&snapshot(false), "raspi_multiprocess_1.0").unwrap();
        let json = serde_json::to_value(&pushes[0].payload).unwrap();
        assert_eq!(json["software_version"], "raspi_multiprocess_1.0");
        assert_eq!(json["sensordatavalues"][0]["value_type"], "P1");
        assert_eq!(json["sensordatavalues"][0]["value"], "20.10");
    }

    #[tokio::test]
    async fn test_no_data_sends_nothing() {
        let config = CommunityConfig {
            endpoints: vec!["http://127.0.0.1:1/".into()],
            ..CommunityConfig::default()
        };
        let push = CommunityPush::new(reqwest::Client::new(), config);
        let outcome = push.deliver(&SharedState::default()).await.unwrap();
        assert_eq!(outcome, Delivery::NoData);
    }
}
