//! Configuration loading and validation using Figment.
//!
//! Configuration is loaded from:
//! 1. a YAML file (or TOML when the path ends in `.toml`)
//! 2. environment variables prefixed with `LAMBDA_DAQ_`, nested keys separated
//!    by `__` (e.g. `LAMBDA_DAQ_INFLUXDB__TOKEN`)
//!
//! ```yaml
//! lambda:
//!   host: 192.168.178.60
//!   port: 502
//! influxdb:
//!   host: localhost
//!   port: 8086
//!   token: secret
//!   org: home
//!   bucket: lambda
//! measurements:
//!   - measurement_group: boiler
//!     register: 2000
//!     count: 4
//!     format: ">hhhh"
//!     names: [error_number, operating_state, actual_high_temp, None]
//!     funcs: [as_int, boiler_mode_to_str, fixed_point_to_float_10, as_is]
//!     tags: [false, true, false, false]
//!     interval: 10
//! ```
//!
//! The raw structures mirror the file. [`MeasurementGroup::from_config`] turns a
//! raw group into the validated form the poll loop runs on.

use crate::decoder::Layout;
use crate::error::{AppResult, DaqError};
use crate::gate::GatePolicy;
use crate::transform::Transform;
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Field name that marks a value as unused.
pub const SKIP_MARKER: &str = "None";

/// Largest register count a single Modbus read may request.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Heat pump controller connection
    #[serde(rename = "lambda", alias = "device")]
    pub device: DeviceConfig,
    /// InfluxDB connection
    pub influxdb: InfluxConfig,
    /// Register blocks to poll
    pub measurements: Vec<MeasurementGroupConfig>,
}

/// Modbus TCP device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Modbus unit identifier
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Upper bound for a single register read, in seconds
    #[serde(default = "default_read_timeout")]
    pub timeout_secs: f64,
}

/// InfluxDB v2 settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Host name or IP address
    pub host: String,
    /// HTTP port
    #[serde(default = "default_influx_port")]
    pub port: u16,
    /// API token
    pub token: String,
    /// Organization
    pub org: String,
    /// Destination bucket
    pub bucket: String,
    /// Upper bound for a single write, in seconds
    #[serde(default = "default_write_timeout")]
    pub timeout_secs: f64,
}

/// One measurement group as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementGroupConfig {
    /// Measurement name used for every point of the group
    pub measurement_group: String,
    /// First holding register
    pub register: u16,
    /// Number of registers
    pub count: u16,
    /// Layout descriptor of the register block
    pub format: String,
    /// Field names, `None` to skip a value
    pub names: Vec<String>,
    /// Transform names, one per field
    pub funcs: Vec<String>,
    /// Tag flags, one per field
    pub tags: Vec<bool>,
    /// Poll interval in seconds
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Enable change detection
    #[serde(default = "default_true")]
    pub cache_values: bool,
    /// Compare non-tag fields with a tolerance instead of exactly
    #[serde(default = "default_true")]
    pub denoise_values: bool,
    /// Maximum seconds a field may go unwritten
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout: f64,
}

// Default value functions
fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_read_timeout() -> f64 {
    5.0
}

fn default_influx_port() -> u16 {
    8086
}

fn default_write_timeout() -> f64 {
    10.0
}

fn default_interval() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

fn default_cache_timeout() -> f64 {
    300.0
}

impl Settings {
    /// Load configuration from `path` and `LAMBDA_DAQ_` environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let figment = if is_toml {
            Figment::new().merge(Toml::file(path))
        } else {
            Figment::new().merge(Yaml::file(path))
        };
        figment.merge(Env::prefixed("LAMBDA_DAQ_").split("__"))
    }

    /// Validate the whole configuration and build the runtime form of every
    /// measurement group.
    pub fn validate(&self) -> AppResult<Vec<MeasurementGroup>> {
        self.device.validate()?;
        self.influxdb.validate()?;
        if self.measurements.is_empty() {
            return Err(DaqError::Configuration(
                "No measurement groups configured".to_string(),
            ));
        }
        self.measurements
            .iter()
            .map(MeasurementGroup::from_config)
            .collect()
    }
}

impl DeviceConfig {
    /// `host:port` of the device.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read timeout as a duration.
    pub fn timeout(&self) -> AppResult<Duration> {
        seconds("lambda.timeout_secs", self.timeout_secs, false).map_err(DaqError::Configuration)
    }

    fn validate(&self) -> AppResult<()> {
        if self.host.trim().is_empty() {
            return Err(DaqError::Configuration("lambda.host is empty".to_string()));
        }
        self.timeout().map(|_| ())
    }
}

impl InfluxConfig {
    /// Base URL of the InfluxDB HTTP API.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Write timeout as a duration.
    pub fn timeout(&self) -> AppResult<Duration> {
        seconds("influxdb.timeout_secs", self.timeout_secs, false)
            .map_err(DaqError::Configuration)
    }

    fn validate(&self) -> AppResult<()> {
        for (key, value) in [
            ("influxdb.host", &self.host),
            ("influxdb.org", &self.org),
            ("influxdb.bucket", &self.bucket),
        ] {
            if value.trim().is_empty() {
                return Err(DaqError::Configuration(format!("{key} is empty")));
            }
        }
        self.timeout().map(|_| ())
    }
}

/// `value` seconds as a duration, rejecting values no `Duration` can hold.
fn seconds(key: &str, value: f64, allow_zero: bool) -> Result<Duration, String> {
    let kind = if allow_zero { "non-negative" } else { "positive" };
    if !(value > 0.0 || (allow_zero && value == 0.0)) {
        return Err(format!("{key} must be a {kind} number of seconds, got {value}"));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|_| format!("{key} must be a {kind} number of seconds, got {value}"))
}

/// One decoded value of a measurement group.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Field or tag name
    pub name: String,
    /// Transform applied to the decoded value
    pub transform: Transform,
    /// Whether the value is written as a tag
    pub is_tag: bool,
}

impl FieldSpec {
    /// Whether the value is ignored.
    pub fn is_skipped(&self) -> bool {
        self.name == SKIP_MARKER
    }
}

/// Validated, immutable measurement group.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementGroup {
    /// Measurement name
    pub name: String,
    /// First holding register
    pub register: u16,
    /// Number of registers
    pub count: u16,
    /// Layout of the register block
    pub layout: Layout,
    /// Fields in layout order
    pub fields: Vec<FieldSpec>,
    /// Time between poll cycles
    pub interval: Duration,
    /// Change detection policy
    pub policy: GatePolicy,
}

impl MeasurementGroup {
    /// Validate a raw group.
    pub fn from_config(cfg: &MeasurementGroupConfig) -> AppResult<Self> {
        let name = cfg.measurement_group.as_str();
        let invalid = |msg: String| DaqError::Configuration(format!("group '{name}': {msg}"));

        if name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "measurement_group must not be empty".to_string(),
            ));
        }

        if cfg.names.len() != cfg.funcs.len() || cfg.names.len() != cfg.tags.len() {
            return Err(invalid(format!(
                "names ({}), funcs ({}) and tags ({}) must have the same length",
                cfg.names.len(),
                cfg.funcs.len(),
                cfg.tags.len()
            )));
        }

        if cfg.count == 0 || cfg.count > MAX_REGISTERS_PER_READ {
            return Err(invalid(format!(
                "count must be between 1 and {MAX_REGISTERS_PER_READ}, got {}",
                cfg.count
            )));
        }
        if u32::from(cfg.register) + u32::from(cfg.count) > u32::from(u16::MAX) + 1 {
            return Err(invalid(format!(
                "registers {}..{} exceed the address space",
                cfg.register,
                u32::from(cfg.register) + u32::from(cfg.count)
            )));
        }

        let layout = Layout::parse(&cfg.format).map_err(|e| invalid(e.to_string()))?;
        let expected_bytes = usize::from(cfg.count) * 2;
        if layout.byte_len() != expected_bytes {
            return Err(invalid(format!(
                "format '{}' spans {} bytes but {} registers hold {expected_bytes}",
                cfg.format,
                layout.byte_len(),
                cfg.count
            )));
        }
        if layout.value_count() < cfg.names.len() {
            return Err(invalid(format!(
                "format '{}' yields {} values for {} names",
                cfg.format,
                layout.value_count(),
                cfg.names.len()
            )));
        }
        if layout.value_count() > cfg.names.len() {
            warn!(
                group = name,
                values = layout.value_count(),
                names = cfg.names.len(),
                "Trailing values of the register block are ignored"
            );
        }

        let fields = cfg
            .names
            .iter()
            .zip(&cfg.funcs)
            .zip(&cfg.tags)
            .map(|((field, func), is_tag)| {
                let transform = func
                    .parse::<Transform>()
                    .map_err(|e| invalid(format!("field '{field}': {e}")))?;
                Ok(FieldSpec {
                    name: field.clone(),
                    transform,
                    is_tag: *is_tag,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        let interval = seconds("interval", cfg.interval, false).map_err(invalid)?;
        let cache_timeout = seconds("cache_timeout", cfg.cache_timeout, true).map_err(invalid)?;

        Ok(Self {
            name: name.to_string(),
            register: cfg.register,
            count: cfg.count,
            layout,
            fields,
            interval,
            policy: GatePolicy {
                cache_values: cfg.cache_values,
                denoise_values: cfg.denoise_values,
                cache_timeout,
            },
        })
    }

    /// Identifies the group in logs and health reports.
    ///
    /// Several groups may share a measurement name, the start register tells
    /// them apart.
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.register)
    }
}
