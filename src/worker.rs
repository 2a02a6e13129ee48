//! ==============================================================================
//! worker.rs - long-lived tasks and their supervisor
//! ==============================================================================
//!
//! purpose:
//!     every sensor driver and every sender runs as its own tokio task on its
//!     own timer. this file holds the sensor loop, the shutdown signal the
//!     loops sleep on, and the supervisor that owns all task handles.
//!
//! shutdown:
//!
//!     Supervisor::shutdown(grace)
//!        │  watch channel flips to true
//!        ▼
//!     workers wake from Shutdown::sleep(), close their drivers, return
//!        │
//!        ▼
//!     anything still running when the grace period ends is aborted
//!
//!     a worker in the middle of bus i/o finishes (or times out) that call
//!     first; blocking calls run on the blocking pool and are never torn down
//!     half way.
//!
//! relationships:
//!     - runs: sensors/* drivers, senders/mod.rs delivery tasks
//!     - writes: store.rs
//!     - used by: main.rs
//!
//! ==============================================================================

use crate::sensors::{InitError, SensorDriver};
use crate::store::SharedStore;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{family} failed to initialize: {source}")]
    Init {
        family: &'static str,
        #[source]
        source: InitError,
    },
    #[error("blocking task failed: {0}")]
    Join(#[from] JoinError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ==============================================================================
// shutdown signal
// ==============================================================================

/// receiving side of the shutdown signal; one per worker
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// sleep for `pause`, waking early on shutdown.
    /// returns false when the worker should stop.
    pub async fn sleep(&mut self, pause: Duration) -> bool {
        if self.is_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = self.rx.changed() => {
                // the supervisor is gone; nobody is left to stop us later
                if changed.is_err() {
                    return false;
                }
            }
        }
        !self.is_requested()
    }

    /// resolve once shutdown is requested or the supervisor is gone
    pub async fn wait(&mut self) {
        while !self.is_requested() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ==============================================================================
// supervisor
// ==============================================================================

/// how each worker ended during shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
    pub aborted: Vec<String>,
}

pub struct Supervisor {
    signal: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<Result<(), WorkerError>>)>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self { signal, workers: Vec::new() }
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown { rx: self.signal.subscribe() }
    }

    /// start a worker. errors it returns are logged when it ends and never
    /// reach another worker.
    pub fn spawn<F>(&mut self, name: impl Into<String>, worker: F)
    where
        F: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let name = name.into();
        let label = name.clone();
        let handle = tokio::spawn(async move {
            let result = worker.await;
            if let Err(e) = &result {
                tracing::error!(worker = %label, "worker terminated: {}", e);
            }
            result
        });
        tracing::debug!(worker = %name, "worker started");
        self.workers.push((name, handle));
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// signal every worker, give them `grace` to wind down, abort the rest
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        self.signal.send_replace(true);
        let deadline = Instant::now() + grace;
        let mut report = ShutdownReport::default();

        for (name, mut handle) in self.workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!(worker = %name, "stopped");
                    report.stopped.push(name);
                }
                // already logged by the spawn wrapper
                Ok(Ok(Err(_))) => report.failed.push(name),
                Ok(Err(e)) => {
                    tracing::error!(worker = %name, "worker panicked: {}", e);
                    report.failed.push(name);
                }
                Err(_) => {
                    handle.abort();
                    tracing::warn!(worker = %name, "did not stop within {:?}, aborted", grace);
                    report.aborted.push(name);
                }
            }
        }
        report
    }
}

// ==============================================================================
// sensor loop
// ==============================================================================

/// run `f` against the driver on the blocking pool, handing the driver back
async fn on_blocking_pool<D, R, F>(mut driver: D, f: F) -> Result<(D, R), WorkerError>
where
    D: SensorDriver,
    R: Send + 'static,
    F: FnOnce(&mut D) -> R + Send + 'static,
{
    let out = tokio::task::spawn_blocking(move || {
        let r = f(&mut driver);
        (driver, r)
    })
    .await?;
    Ok(out)
}

/// init the driver, then read -> merge -> report on a fixed interval until
/// shutdown. an init failure ends the worker after recording it in the
/// service namespace.
pub async fn run_sensor<D: SensorDriver>(
    driver: D,
    store: SharedStore,
    interval: Duration,
    mut shutdown: Shutdown,
) -> Result<(), WorkerError> {
    let family = driver.family();

    let (driver, init) = on_blocking_pool(driver, |d| d.init()).await?;
    if let Err(source) = init {
        store.set_service_status(family, format!("init failed: {}", source));
        on_blocking_pool(driver, |d| d.close()).await?;
        return Err(WorkerError::Init { family, source });
    }
    tracing::info!(sensor = family, interval_secs = interval.as_secs_f64(), "polling started");

    let mut driver = driver;
    loop {
        let ambient = store.sensor_snapshot();
        let (d, fields) = on_blocking_pool(driver, move |d| d.read(&ambient)).await?;
        driver = d;

        let present = fields.values().filter(|r| r.is_present()).count();
        tracing::debug!(sensor = family, present, total = fields.len(), "cycle complete");
        store.merge_sensor_data(family, fields);
        store.set_service_status(family, if present > 0 { "OK" } else { "no reading" });

        if !shutdown.sleep(interval).await {
            break;
        }
    }

    on_blocking_pool(driver, |d| d.close()).await?;
    tracing::info!(sensor = family, "stopped");
    Ok(())
}
