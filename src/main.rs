//! ==============================================================================
//! main.rs - air-quality station host entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the library together: config -> logging -> store -> workers.
//!
//! responsibilities:
//!     - load host.toml (or defaults) and set up tracing
//!     - open one bus handle per enabled sensor and start its worker
//!     - start the enabled delivery tasks, each with its own http client
//!     - serve the read-only json api
//!     - on ctrl-c / SIGTERM, stop everything within the grace period
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                       host (this file)                        │
//!     │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ ┌─────────┐     │
//!     │  │ BMP280 │ │ AHT20  │ │ ENS160 │ │ SDS011 │ │  CPU    │     │
//!     │  └───┬────┘ └───┬────┘ └───┬────┘ └───┬────┘ └────┬────┘     │
//!     │      └──────────┴──────────┼──────────┴───────────┘          │
//!     │                       ┌────┴────┐                            │
//!     │                       │  store  │ <- store.rs                │
//!     │                       └────┬────┘                            │
//!     │        ┌───────────────────┼────────────────────┐            │
//!     │  ┌─────┴──────────┐ ┌──────┴───────┐ ┌──────────┴───┐        │
//!     │  │sensor.community│ │ aircms push  │ │ json api     │        │
//!     │  │ (180s cycle)   │ │ (300s cycle) │ │ (port 3000)  │        │
//!     │  └────────────────┘ └──────────────┘ └──────────────┘        │
//!     └──────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

use airsense::config::{HostConfig, I2cSensorConfig};
use airsense::domain::family;
use airsense::hal::{self, I2cDevice};
use airsense::senders::community::{self, CommunityPush};
use airsense::senders::signed::{self, SignedPush};
use airsense::senders::{DeliveryTask, Forwarder};
use airsense::sensors::aht20::Aht20;
use airsense::sensors::bmp280::Bmp280;
use airsense::sensors::cpu::CpuTemperature;
use airsense::sensors::ens160::Ens160;
use airsense::sensors::sds011::Sds011;
use airsense::sensors::SensorDriver;
use airsense::store::SharedStore;
use airsense::web;
use airsense::worker::{run_sensor, Supervisor};
use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration (logged once tracing is up)
    let path = HostConfig::find();
    let loaded = path.as_deref().map(HostConfig::load);
    let config = match &loaded {
        Some(Ok(config)) => config.clone(),
        _ => HostConfig::default(),
    };

    // step 2: logging - RUST_LOG wins over [logging].level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("airsense host {} starting", env!("CARGO_PKG_VERSION"));
    match (&path, &loaded) {
        (Some(p), Some(Ok(_))) => tracing::info!("Config loaded from {}", p.display()),
        (Some(p), Some(Err(e))) => tracing::warn!("Failed to load {}: {:#} - using defaults", p.display(), e),
        _ => tracing::warn!("No config file found - using defaults"),
    }
    config.log_summary();

    // step 3: shared state and supervisor
    let store = SharedStore::new();
    let mut supervisor = Supervisor::new();

    // step 4: json api (bind first so a taken port fails startup)
    if config.web.enabled {
        let listener = tokio::net::TcpListener::bind(&config.web.bind)
            .await
            .with_context(|| format!("failed to bind {}", config.web.bind))?;
        let app = web::router(store.clone(), liveness(&config));
        supervisor.spawn("web", web::serve(listener, app, supervisor.shutdown_handle()));
    }

    // step 5: sensor workers
    spawn_sensors(&config, &store, &mut supervisor);

    // step 6: delivery tasks
    let community = &config.senders.community;
    if community.enabled {
        let client = http_client(community.timeout_seconds)?;
        spawn_sender(&mut supervisor, &store, CommunityPush::new(client, community.clone()));
    }
    let signed = &config.senders.signed;
    if signed.enabled {
        let client = http_client(signed.timeout_seconds)?;
        spawn_sender(&mut supervisor, &store, SignedPush::new(client, signed.clone()));
    }

    tracing::info!(workers = ?supervisor.worker_names(), "host running");

    // step 7: run until asked to stop
    shutdown_signal().await;
    tracing::info!("shutdown requested");
    let report = supervisor
        .shutdown(Duration::from_secs(config.shutdown.grace_seconds))
        .await;
    tracing::info!(
        stopped = report.stopped.len(),
        failed = report.failed.len(),
        aborted = report.aborted.len(),
        "shutdown complete"
    );
    Ok(())
}

// ==============================================================================
// wiring helpers
// ==============================================================================

fn http_client(timeout_seconds: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .user_agent(concat!("airsense-host/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build http client")
}

/// sensors use the configured limit; senders only report once per cycle
fn liveness(config: &HostConfig) -> web::Liveness {
    let mut liveness = web::Liveness::new(Duration::from_secs(config.web.stale_after_seconds));
    let senders = &config.senders;
    if senders.community.enabled {
        liveness = liveness.with_worker(community::NAME, senders.community.status_window());
    }
    if senders.signed.enabled {
        liveness = liveness.with_worker(signed::NAME, senders.signed.status_window());
    }
    liveness
}

fn spawn_sender<F: Forwarder>(supervisor: &mut Supervisor, store: &SharedStore, forwarder: F) {
    let name = forwarder.name().to_string();
    let task = DeliveryTask::new(forwarder);
    supervisor.spawn(name, task.run(store.clone(), supervisor.shutdown_handle()));
}

fn spawn_driver<D: SensorDriver>(supervisor: &mut Supervisor, store: &SharedStore, interval: Duration, driver: D) {
    let name = driver.family();
    supervisor.spawn(name, run_sensor(driver, store.clone(), interval, supervisor.shutdown_handle()));
}

/// open the I2C handle for one sensor; failures are recorded in its status slot
fn open_i2c(config: &HostConfig, name: &str, sensor: &I2cSensorConfig, store: &SharedStore) -> Option<Box<dyn I2cDevice>> {
    if !sensor.enabled {
        tracing::info!(sensor = name, "disabled");
        return None;
    }
    let opened = sensor
        .address()
        .and_then(|address| hal::open_i2c(config.sensors.i2c_bus, address).map_err(anyhow::Error::from));
    match opened {
        Ok(bus) => Some(bus),
        Err(e) => {
            tracing::error!(sensor = name, "cannot open device: {:#}", e);
            store.set_service_status(name, format!("open failed: {:#}", e));
            None
        }
    }
}

fn spawn_sensors(config: &HostConfig, store: &SharedStore, supervisor: &mut Supervisor) {
    let s = &config.sensors;

    if let Some(bus) = open_i2c(config, family::BMP280, &s.bmp280, store) {
        let interval = config.sensor_interval(s.bmp280.interval_seconds);
        spawn_driver(supervisor, store, interval, Bmp280::new(bus));
    }
    if let Some(bus) = open_i2c(config, family::AHT20, &s.aht20, store) {
        let interval = config.sensor_interval(s.aht20.interval_seconds);
        spawn_driver(supervisor, store, interval, Aht20::new(bus));
    }
    if let Some(bus) = open_i2c(config, family::ENS160, &s.ens160, store) {
        let interval = config.sensor_interval(s.ens160.interval_seconds);
        spawn_driver(supervisor, store, interval, Ens160::new(bus));
    }

    if s.sds011.enabled {
        let timeout = Duration::from_secs(s.sds011.timeout_seconds);
        match hal::open_serial(&s.sds011.port, s.sds011.baud_rate, timeout) {
            Ok(link) => {
                let interval = config.sensor_interval(s.sds011.interval_seconds);
                spawn_driver(supervisor, store, interval, Sds011::new(link));
            }
            Err(e) => {
                tracing::error!(sensor = family::SDS011, port = %s.sds011.port, "cannot open serial port: {}", e);
                store.set_service_status(family::SDS011, format!("open failed: {}", e));
            }
        }
    }

    if s.cpu.enabled {
        let interval = config.sensor_interval(s.cpu.interval_seconds);
        spawn_driver(supervisor, store, interval, CpuTemperature::new(&s.cpu.path));
    }
}

/// ctrl-c everywhere, SIGTERM on unix (systemd stop)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
