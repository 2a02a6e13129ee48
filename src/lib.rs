//! ==============================================================================
//! airsense - air-quality station host
//! ==============================================================================
//!
//! purpose:
//!     samples I2C / UART sensors, keeps their latest readings in one shared
//!     store and pushes that store to telemetry receivers on a timer.
//!
//! module map:
//!
//!     hal ──> sensors ──> worker ──> store <── senders
//!                                      ^
//!                                      └────── web (read-only)
//!
//!     - hal.rs:      bus traits, rppal backends, mock devices
//!     - sensors/:    decoders + drivers, one file per sensor family
//!     - store.rs:    the shared state store
//!     - worker.rs:   sensor loop, shutdown signal, supervisor
//!     - senders/:    delivery tasks (sensor.community, signed aircms push)
//!     - web.rs:      json api for the external dashboard
//!     - config.rs:   host.toml schema
//!
//! ==============================================================================

pub mod config;
pub mod domain;
pub mod hal;
pub mod senders;
pub mod sensors;
pub mod store;
pub mod web;
pub mod worker;
