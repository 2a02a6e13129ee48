//! ==============================================================================
//! senders - outbound delivery pipeline
//! ==============================================================================
//!
//! purpose:
//!     periodically snapshot the shared store, turn it into a provider payload
//!     and push it over http. each provider is a Forwarder; the DeliveryTask
//!     around it owns the timer, the failure counter and the status line.
//!
//! one cycle:
//!
//!     snapshot ──> forwarder.deliver() ──┬─ Sent     -> "OK", counter = 0
//!                                        ├─ NoData   -> "no data to send"
//!                                        └─ Err(e)   -> "send error N - e"
//!     sleep period, or backoff after a transport error
//!
//!     missing inputs are not failures: the counter only moves on real
//!     delivery errors. there is no retry cap; a task keeps trying until
//!     shutdown.
//!
//! relationships:
//!     - reads/writes: store.rs
//!     - run by: worker.rs Supervisor (spawned from main.rs)
//!
//! ==============================================================================

pub mod community;
pub mod signed;

use crate::domain::{round2, SharedState};
use crate::store::SharedStore;
use crate::worker::{Shutdown, WorkerError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// one `{"value_type", "value"}` entry, shared by both receivers' payloads
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataValue {
    pub value_type: String,
    pub value: String,
}

impl DataValue {
    pub fn new(value_type: &str, value: impl Into<String>) -> Self {
        Self { value_type: value_type.to_string(), value: value.into() }
    }

    /// value rendered with two decimals, the community protocol's precision
    pub fn fixed2(value_type: &str, value: f64) -> Self {
        Self::new(value_type, format!("{:.2}", value))
    }

    /// value rounded to two decimals, shortest form, at least one decimal
    /// ("21.5", "48.0", "1012.35")
    pub fn rounded(value_type: &str, value: f64) -> Self {
        let value = round2(value);
        let text = if value.is_finite() && value.fract() == 0.0 {
            format!("{:.1}", value)
        } else {
            value.to_string()
        };
        Self::new(value_type, text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub period: Duration,
    /// pause after a transport error; longer than `period`
    pub backoff: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// required readings were missing; nothing was sent
    NoData,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{url} answered HTTP {status}")]
    Rejected { url: String, status: u16 },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// the request never got an answer (connect, dns, timeout)
    pub fn is_transport(&self) -> bool {
        matches!(self, DeliveryError::Transport { .. })
    }
}

/// a telemetry receiver
pub trait Forwarder: Send + Sync + 'static {
    /// status key in the "Service data" namespace
    fn name(&self) -> &str;

    fn schedule(&self) -> Schedule;

    fn deliver(&self, snapshot: &SharedState) -> impl Future<Output = Result<Delivery, DeliveryError>> + Send;
}

/// map a send result onto the receiver's notion of success
pub(crate) async fn check_response(
    url: &str,
    sent: Result<reqwest::Response, reqwest::Error>,
    accepted: &[u16],
) -> Result<(), DeliveryError> {
    let response = sent.map_err(|source| DeliveryError::Transport { url: url.to_string(), source })?;
    let status = response.status().as_u16();
    if accepted.contains(&status) {
        return Ok(());
    }
    let body: String = response.text().await.unwrap_or_default().chars().take(100).collect();
    tracing::debug!(url, status, body = %body, "receiver refused payload");
    Err(DeliveryError::Rejected { url: url.to_string(), status })
}

pub struct DeliveryTask<F> {
    forwarder: F,
    failures: u32,
}

impl<F: Forwarder> DeliveryTask<F> {
    pub fn new(forwarder: F) -> Self {
        Self { forwarder, failures: 0 }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// one snapshot -> deliver -> status round. returns how long to sleep.
    pub async fn run_cycle(&mut self, store: &SharedStore) -> Duration {
        let name = self.forwarder.name().to_string();
        let schedule = self.forwarder.schedule();
        let snapshot = store.snapshot();

        match self.forwarder.deliver(&snapshot).await {
            Ok(Delivery::Sent) => {
                if self.failures > 0 {
                    tracing::info!(sender = %name, "delivered after {} failed cycles", self.failures);
                } else {
                    tracing::debug!(sender = %name, "delivered");
                }
                self.failures = 0;
                store.set_service_status(&name, "OK");
                schedule.period
            }
            Ok(Delivery::NoData) => {
                tracing::debug!(sender = %name, "required readings missing, skipped");
                store.set_service_status(&name, "no data to send");
                schedule.period
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                tracing::warn!(sender = %name, failures = self.failures, "delivery failed: {}", e);
                store.set_service_status(&name, format!("send error {} - {}", self.failures, e));
                if e.is_transport() {
                    schedule.backoff
                } else {
                    schedule.period
                }
            }
        }
    }

    pub async fn run(mut self, store: SharedStore, mut shutdown: Shutdown) -> Result<(), WorkerError> {
        let schedule = self.forwarder.schedule();
        tracing::info!(
            sender = self.forwarder.name(),
            period_secs = schedule.period.as_secs(),
            backoff_secs = schedule.backoff.as_secs(),
            "delivery task started"
        );
        loop {
            let pause = self.run_cycle(&store).await;
            if !shutdown.sleep(pause).await {
                break;
            }
        }
        tracing::info!(sender = self.forwarder.name(), "delivery task stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// forwarder that replays scripted outcomes
    struct Scripted {
        outcomes: Mutex<Vec<Result<Delivery, DeliveryError>>>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Result<Delivery, DeliveryError>>) -> Self {
            outcomes.reverse();
            Self { outcomes: Mutex::new(outcomes) }
        }
    }

    impl Forwarder for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn schedule(&self) -> Schedule {
            Schedule { period: Duration::from_secs(180), backoff: Duration::from_secs(360) }
        }

        async fn deliver(&self, _snapshot: &SharedState) -> Result<Delivery, DeliveryError> {
            self.outcomes.lock().unwrap().pop().unwrap_or(Ok(Delivery::Sent))
        }
    }

    fn rejected() -> Result<Delivery, DeliveryError> {
        Err(DeliveryError::Rejected { url: "http://receiver/".into(), status: 500 })
    }

    #[tokio::test]
    async fn test_failures_accumulate_and_reset() {
        let store = SharedStore::new();
        let mut task = DeliveryTask::new(Scripted::new(vec![rejected(), rejected(), rejected(), Ok(Delivery::Sent)]));

        for n in 1..=3 {
            let pause = task.run_cycle(&store).await;
            assert_eq!(pause, Duration::from_secs(180), "non-transport errors keep the period");
            assert_eq!(task.consecutive_failures(), n);
        }
        let status = &store.snapshot().services["scripted"].message;
        assert!(status.starts_with("send error 3 - "), "{status}");
        assert!(status.contains("HTTP 500"));

        task.run_cycle(&store).await;
        assert_eq!(task.consecutive_failures(), 0);
        assert_eq!(store.snapshot().services["scripted"].message, "OK");
    }

    #[tokio::test]
    async fn test_no_data_leaves_counter_alone() {
        let store = SharedStore::new();
        let mut task = DeliveryTask::new(Scripted::new(vec![rejected(), Ok(Delivery::NoData)]));
        task.run_cycle(&store).await;
        task.run_cycle(&store).await;
        assert_eq!(task.consecutive_failures(), 1);
        assert_eq!(store.snapshot().services["scripted"].message, "no data to send");
    }

    #[tokio::test]
    async fn test_transport_error_backs_off() {
        // nothing listens on port 1
        let sent = reqwest::Client::new().post("http://127.0.0.1:1/").send().await;
        let err = check_response("http://127.0.0.1:1/", sent, &[200]).await.unwrap_err();
        assert!(err.is_transport());

        let store = SharedStore::new();
        let mut task = DeliveryTask::new(Scripted::new(vec![Err(err)]));
        assert_eq!(task.run_cycle(&store).await, Duration::from_secs(360));
        assert_eq!(task.consecutive_failures(), 1);
    }

    #[test]
    fn test_fixed2_formatting() {
        assert_eq!(DataValue::fixed2("P2", 12.3).value, "12.30");
        assert_eq!(DataValue::fixed2("temperature", 21.499).value, "21.50");
        assert_eq!(DataValue::fixed2("P1", 0.0).value, "0.00");
    }

    #[test]
    fn test_rounded_formatting() {
        assert_eq!(DataValue::rounded("BME280_temperature", 21.5).value, "21.5");
        assert_eq!(DataValue::rounded("BME280_humidity", 48.0).value, "48.0");
        assert_eq!(DataValue::rounded("BME280_pressure", 1012.3).value, "1012.3");
        assert_eq!(DataValue::rounded("BME280_pressure", 1012.3456).value, "1012.35");
        assert_eq!(DataValue::rounded("SDS_P2", 0.0).value, "0.0");
        assert_eq!(DataValue::rounded("BME280_temperature", -3.257).value, "-3.26");
    }
}
