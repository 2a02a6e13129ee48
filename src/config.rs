//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file; main.rs falls back to defaults.
//!
//! structure:
//!     - PollingConfig: default sensor polling interval.
//!     - SensorsConfig: bus numbers, I2C addresses, serial port, sysfs path.
//!     - SendersConfig: endpoints, identities and timing for each receiver.
//!     - WebConfig: bind address and staleness limit of the JSON api.
//!     - LoggingConfig / ShutdownConfig.
//!
//!     every section and field is optional; anything left out takes the
//!     default below.
//!
//! ==============================================================================

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HostConfig {
    pub polling: PollingConfig,
    pub sensors: SensorsConfig,
    pub senders: SendersConfig,
    pub web: WebConfig,
    pub logging: LoggingConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_seconds: 5 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SensorsConfig {
    /// /dev/i2c-N shared by every I2C sensor
    pub i2c_bus: u8,
    pub bmp280: I2cSensorConfig,
    pub aht20: I2cSensorConfig,
    pub ens160: I2cSensorConfig,
    pub sds011: SerialSensorConfig,
    pub cpu: CpuSensorConfig,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 0,
            bmp280: I2cSensorConfig::at("0x76"),
            aht20: I2cSensorConfig::at("0x38"),
            ens160: I2cSensorConfig::at("0x53"),
            sds011: SerialSensorConfig::default(),
            cpu: CpuSensorConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct I2cSensorConfig {
    pub enabled: bool,
    /// hex string, e.g. "0x76"
    pub i2c_address: String,
    /// overrides [polling].interval_seconds
    pub interval_seconds: Option<u64>,
}

impl I2cSensorConfig {
    fn at(address: &str) -> Self {
        Self { enabled: true, i2c_address: address.to_string(), interval_seconds: None }
    }

    pub fn address(&self) -> anyhow::Result<u8> {
        parse_address(&self.i2c_address)
    }
}

impl Default for I2cSensorConfig {
    fn default() -> Self {
        Self::at("0x00")
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialSensorConfig {
    pub enabled: bool,
    pub port: String,
    pub baud_rate: u32,
    pub timeout_seconds: u64,
    pub interval_seconds: Option<u64>,
}

impl Default for SerialSensorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "/dev/ttyS1".to_string(),
            baud_rate: 9600,
            timeout_seconds: 2,
            interval_seconds: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CpuSensorConfig {
    pub enabled: bool,
    pub path: String,
    pub interval_seconds: Option<u64>,
}

impl Default for CpuSensorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: crate::sensors::cpu::DEFAULT_PATH.to_string(),
            interval_seconds: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SendersConfig {
    pub community: CommunityConfig,
    pub signed: SignedConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CommunityConfig {
    pub enabled: bool,
    /// X-Sensor header value
    pub sensor_id: String,
    pub software_version: String,
    pub endpoints: Vec<String>,
    pub interval_seconds: u64,
    pub backoff_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sensor_id: "raspi-5006471".to_string(),
            software_version: "raspi_multiprocess_1.0".to_string(),
            endpoints: vec![
                "https://api.sensor.community/v1/push-sensor-data/".to_string(),
                "https://api-rrd.madavi.de/data.php".to_string(),
            ],
            interval_seconds: 180,
            backoff_seconds: 360,
            timeout_seconds: 10,
        }
    }
}

impl CommunityConfig {
    /// longest gap between two status writes: backoff plus every request
    /// of one cycle (two pins per endpoint) running into the timeout
    pub fn status_window(&self) -> Duration {
        let requests = 2 * self.endpoints.len() as u64;
        Duration::from_secs(self.backoff_seconds + requests * self.timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SignedConfig {
    pub enabled: bool,
    pub base_url: String,
    pub path: String,
    /// device id, sent as L=
    pub login: String,
    /// signing token (the station's MAC address)
    pub token: String,
    pub interval_seconds: u64,
    pub backoff_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for SignedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://doiot.ru".to_string(),
            path: "/php/sensors.php".to_string(),
            login: "5006471".to_string(),
            token: "02:42:39:D2:02:B6".to_string(),
            interval_seconds: 300,
            backoff_seconds: 600,
            timeout_seconds: 10,
        }
    }
}

impl SignedConfig {
    /// longest gap between two status writes: backoff plus one timed-out request
    pub fn status_window(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds + self.timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub bind: String,
    /// a sensor status entry older than this marks its worker as down;
    /// delivery tasks get their own `status_window`
    pub stale_after_seconds: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { enabled: true, bind: "0.0.0.0:3000".to_string(), stale_after_seconds: 30 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive, used when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_seconds: 5 }
    }
}

/// "0x76" / "0X76" / "118" -> 0x76
pub fn parse_address(text: &str) -> anyhow::Result<u8> {
    let t = text.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => t.parse::<u8>(),
    };
    let address = parsed.with_context(|| format!("invalid I2C address {:?}", text))?;
    if address > 0x7F {
        bail!("I2C address {:#04x} is outside the 7-bit range", address);
    }
    Ok(address)
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: HostConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// first existing host.toml, looking in ./config then ../config
    pub fn find() -> Option<PathBuf> {
        let paths = [
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ];
        paths.into_iter().find(|p| p.exists())
    }

    /// reject settings that would only fail later, inside a worker
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.polling.interval_seconds == 0 {
            bail!("[polling] interval_seconds must be at least 1");
        }
        for (name, sensor) in [
            ("bmp280", &self.sensors.bmp280),
            ("aht20", &self.sensors.aht20),
            ("ens160", &self.sensors.ens160),
        ] {
            if sensor.enabled {
                sensor.address().with_context(|| format!("[sensors.{name}]"))?;
            }
        }

        let community = &self.senders.community;
        if community.enabled {
            if community.endpoints.is_empty() {
                bail!("[senders.community] needs at least one endpoint");
            }
            check_timing("community", community.interval_seconds, community.backoff_seconds)?;
        }
        let signed = &self.senders.signed;
        if signed.enabled {
            check_timing("signed", signed.interval_seconds, signed.backoff_seconds)?;
        }
        Ok(())
    }

    /// effective polling interval for one sensor
    pub fn sensor_interval(&self, own: Option<u64>) -> Duration {
        Duration::from_secs(own.unwrap_or(self.polling.interval_seconds).max(1))
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        let s = &self.sensors;
        tracing::info!(
            interval_secs = self.polling.interval_seconds,
            i2c_bus = s.i2c_bus,
            bmp280 = s.bmp280.enabled,
            aht20 = s.aht20.enabled,
            ens160 = s.ens160.enabled,
            sds011 = s.sds011.enabled,
            cpu = s.cpu.enabled,
            "sensors"
        );
        tracing::info!(
            community = self.senders.community.enabled,
            signed = self.senders.signed.enabled,
            "senders"
        );
        tracing::info!(web = self.web.enabled, bind = %self.web.bind, level = %self.logging.level, "host");
    }
}

fn check_timing(name: &str, interval: u64, backoff: u64) -> anyhow::Result<()> {
    if interval == 0 {
        bail!("[senders.{name}] interval_seconds must be at least 1");
    }
    if backoff <= interval {
        bail!("[senders.{name}] backoff_seconds ({backoff}) must be longer than interval_seconds ({interval})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_status_windows() {
        let config = HostConfig::default();
        // 360 s backoff + 4 requests x 10 s
        assert_eq!(config.senders.community.status_window(), Duration::from_secs(400));
        assert_eq!(config.senders.signed.status_window(), Duration::from_secs(610));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sensors.bmp280.address().unwrap(), 0x76);
        assert_eq!(config.sensors.sds011.port, "/dev/ttyS1");
        assert_eq!(config.web.stale_after_seconds, 30);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let config = HostConfig::parse(
            r#"
            [sensors.bmp280]
            i2c_address = "0x77"

            [senders.community]
            enabled = true
            sensor_id = "raspi-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.sensors.bmp280.address().unwrap(), 0x77);
        assert!(config.sensors.bmp280.enabled);
        assert_eq!(config.senders.community.sensor_id, "raspi-1");
        assert_eq!(config.senders.community.endpoints.len(), 2);
        assert_eq!(config.polling.interval_seconds, 5);
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(parse_address("0x76").unwrap(), 0x76);
        assert_eq!(parse_address("0X38").unwrap(), 0x38);
        assert_eq!(parse_address("83").unwrap(), 0x53);
        assert!(parse_address("0xZZ").is_err());
        assert!(parse_address("0x80").is_err());
    }

    #[test]
    fn test_backoff_must_exceed_period() {
        let err = HostConfig::parse(
            r#"
            [senders.signed]
            enabled = true
            interval_seconds = 300
            backoff_seconds = 60
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("backoff_seconds"));
    }

    #[test]
    fn test_bad_address_is_rejected_only_when_enabled() {
        assert!(HostConfig::parse("[sensors.ens160]\ni2c_address = \"nope\"").is_err());
        HostConfig::parse("[sensors.ens160]\nenabled = false\ni2c_address = \"nope\"").unwrap();
    }

    #[test]
    fn test_shipped_host_toml_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config").join("host.toml");
        let config = HostConfig::load(path).unwrap();
        assert_eq!(config.sensors.ens160.address().unwrap(), 0x53);
        assert_eq!(config.sensor_interval(config.sensors.ens160.interval_seconds), Duration::from_secs(10));
        assert!(!config.senders.community.enabled);
    }

    #[test]
    fn test_sensor_interval_override() {
        let config = HostConfig::default();
        assert_eq!(config.sensor_interval(None), Duration::from_secs(5));
        assert_eq!(config.sensor_interval(Some(30)), Duration::from_secs(30));
    }
}
