//! ==============================================================================
//! signed.rs - signed push to the aircms / doiot receiver
//! ==============================================================================
//!
//! request:
//!     POST <base><path>?h=<signature>
//!     Content-Type: application/x-www-form-urlencoded
//!     body: our_data, verbatim (no form encoding)
//!
//!     our_data  = "L=<login>&t=<unix seconds>&airrohr=<compact json>"
//!     signature = sha1hex( sha1hex(token) ++ sha1hex(our_data ++ token) )
//!
//! sha1hex is the lowercase hex digest; ++ concatenates the hex strings.
//! values go out rounded to two decimals in their shortest form ("21.5",
//! "48.0"), unlike the fixed two decimals of the community protocol.
//! the receiver only ever answers 200 on success.
//!
//! ==============================================================================

use super::{check_response, DataValue, Delivery, DeliveryError, Forwarder, Schedule};
use crate::config::SignedConfig;
use crate::domain::{family, SharedState};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::time::Duration;

pub const NAME: &str = "aircms.online";
const ACCEPTED: [u16; 1] = [200];

pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn signature(token: &str, our_data: &str) -> String {
    let secret = sha1_hex(token.as_bytes());
    let message = sha1_hex(format!("{our_data}{token}").as_bytes());
    sha1_hex(format!("{secret}{message}").as_bytes())
}

/// the "airrohr" document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub sensordatavalues: Vec<DataValue>,
}

/// None unless BMP280, SDS011 and AHT20 humidity are all present
pub fn build_payload(snapshot: &SharedState) -> Option<Payload> {
    let temperature = snapshot.value(family::BMP280, "Temperature")?;
    let pressure = snapshot.value(family::BMP280, "Pressure")?;
    let humidity = snapshot.value(family::AHT20, "Humidity")?;
    let pm10 = snapshot.value(family::SDS011, "pm10")?;
    let pm25 = snapshot.value(family::SDS011, "pm25")?;

    Some(Payload {
        sensordatavalues: vec![
            DataValue::rounded("BME280_temperature", temperature),
            DataValue::rounded("BME280_humidity", humidity),
            DataValue::rounded("BME280_pressure", pressure),
            DataValue::rounded("SDS_P1", pm10),
            DataValue::rounded("SDS_P2", pm25),
        ],
    })
}

pub fn our_data(login: &str, timestamp: u64, payload: &Payload) -> Result<String, serde_json::Error> {
    let airrohr = serde_json::to_string(payload)?;
    Ok(format!("L={login}&t={timestamp}&airrohr={airrohr}"))
}

/// everything that goes on the wire for one push
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedRequest {
    pub url: String,
    pub signature: String,
    pub body: String,
}

pub struct SignedPush {
    client: reqwest::Client,
    config: SignedConfig,
}

impl SignedPush {
    pub fn new(client: reqwest::Client, config: SignedConfig) -> Self {
        Self { client, config }
    }

    pub fn sign(&self, payload: &Payload, timestamp: u64) -> Result<SignedRequest, DeliveryError> {
        let body = our_data(&self.config.login, timestamp, payload)?;
        Ok(SignedRequest {
            url: format!("{}{}", self.config.base_url, self.config.path),
            signature: signature(&self.config.token, &body),
            body,
        })
    }

    async fn send(&self, request: SignedRequest) -> Result<(), DeliveryError> {
        let sent = self
            .client
            .post(&request.url)
            .query(&[("h", request.signature.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(request.body)
            .send()
            .await;
        check_response(&request.url, sent, &ACCEPTED).await
    }
}

impl Forwarder for SignedPush {
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
        let Some(payload) = build_payload(snapshot) else {
            return Ok(Delivery::NoData);
        };
        let timestamp = crate::domain::now_secs() as u64;
        let request = self.sign(&payload, timestamp)?;
        tracing::debug!(sender = NAME, url = %request.url, "pushing signed payload");
        self.send(request).await?;
        Ok(Delivery::Sent)
    }
}
