//! Testbed configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `CVT_`-prefixed environment variables. The result is validated once at
//! startup and turned into an immutable [`KernelConfig`] before the tick loop
//! exists; nothing re-reads configuration while the loop runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const ENV_PREFIX: &str = "CVT_";

pub const PROPAGATOR_KEPLER_TLE: &str = "kepler_tle";
pub const PROPAGATOR_FIXED: &str = "fixed";

const LOG_LEVELS: [&str; 6] = ["TRACE", "DEBUG", "INFO", "WARN", "WARNING", "ERROR"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub debug: bool,
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "INFO".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Heartbeat of the simulation in ticks per wall-clock second.
    pub tick_rate_hz: f64,
    /// Simulated seconds advanced per wall-clock second. 1.0 is real time.
    pub time_warp_factor: f64,
    pub orbit_propagator: String,
    /// Simulated instant of the first tick baseline. Defaults to now.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick_rate_hz: 10.0,
            time_warp_factor: 1.0,
            orbit_propagator: PROPAGATOR_KEPLER_TLE.to_owned(),
            start_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-observer delivery deadline; slower observers are evicted.
    pub send_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8765,
            send_timeout_ms: 1000,
        }
    }
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TleSettings {
    pub name: String,
    pub line1: String,
    pub line2: String,
}

impl Default for TleSettings {
    fn default() -> Self {
        Self {
            name: "ISS (ZARYA)".to_owned(),
            line1: "1 25544U 98067A   25299.54407407  .00016717  00000-0  10270-3 0  9993".to_owned(),
            line2: "2 25544  51.6416 247.4627 0006703 130.5360 325.0158 15.49814673420010".to_owned(),
        }
    }
}

/// Physics model switches. Reported through the status accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FidelitySettings {
    pub enable_attitude_dynamics: bool,
    pub enable_atmospheric_drag: bool,
    pub enable_solar_pressure: bool,
    pub enable_gravity_gradient: bool,
    pub enable_magnetic_torque: bool,
    pub enable_adcs_control: bool,
    pub enable_payload_operations: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintsSettings {
    pub enable_power_budget: bool,
    pub enable_cpu_simulation: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CvtConfig {
    pub general: GeneralSettings,
    pub simulation: SimulationSettings,
    pub server: ServerSettings,
    pub tle: TleSettings,
    pub fidelity: FidelitySettings,
    pub constraints: ConstraintsSettings,
}

impl CvtConfig {
    /// Load from `path` (if given) and the process environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        debug!("Configuration loaded and validated");
        Ok(config)
    }

    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("Config file not found at {}. Using defaults.", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply `CVT_<SECTION>_<FIELD>` overrides. Keys are case-insensitive;
    /// unrecognised `CVT_` variables are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let upper = name.to_ascii_uppercase();
            let Some(key) = upper.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match key {
                "GENERAL_DEBUG" => self.general.debug = parse_env(&name, &value)?,
                "GENERAL_LOG_LEVEL" => self.general.log_level = value.to_ascii_uppercase(),
                "SIMULATION_TICK_RATE_HZ" => self.simulation.tick_rate_hz = parse_env(&name, &value)?,
                "SIMULATION_TIME_WARP_FACTOR" => {
                    self.simulation.time_warp_factor = parse_env(&name, &value)?
                }
                "SIMULATION_ORBIT_PROPAGATOR" => self.simulation.orbit_propagator = value,
                "SIMULATION_START_TIME" => {
                    self.simulation.start_time = Some(parse_env(&name, &value)?)
                }
                "SERVER_HOST" => self.server.host = value,
                "SERVER_PORT" => self.server.port = parse_env(&name, &value)?,
                "SERVER_SEND_TIMEOUT_MS" => self.server.send_timeout_ms = parse_env(&name, &value)?,
                "TLE_NAME" => self.tle.name = value,
                "TLE_LINE1" => self.tle.line1 = value,
                "TLE_LINE2" => self.tle.line2 = value,
                _ => debug!("Ignoring unrecognised environment override {}", name),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.general.log_level.to_ascii_uppercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid {
                field: "general.log_level",
                reason: format!("unknown level {:?}", self.general.log_level),
            });
        }

        match self.simulation.orbit_propagator.as_str() {
            PROPAGATOR_KEPLER_TLE | PROPAGATOR_FIXED => {}
            other => {
                return Err(ConfigError::Invalid {
                    field: "simulation.orbit_propagator",
                    reason: format!("unknown propagator {:?}", other),
                })
            }
        }

        if self.server.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "server.send_timeout_ms",
                reason: "must be greater than zero".to_owned(),
            });
        }

        self.kernel_config().map(|_| ())
    }

    pub fn kernel_config(&self) -> Result<KernelConfig, ConfigError> {
        let config = KernelConfig::new(self.simulation.tick_rate_hz, self.simulation.time_warp_factor)?
            .with_fidelity(self.fidelity);
        Ok(match self.simulation.start_time {
            Some(start) => config.with_start_time(start),
            None => config,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_owned(),
        value: value.to_owned(),
    })
}

/// Validated scheduler parameters. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelConfig {
    tick_rate_hz: f64,
    tick_duration: Duration,
    time_warp_factor: f64,
    sim_step: chrono::Duration,
    start_time: Option<DateTime<Utc>>,
    fidelity: FidelitySettings,
}

impl KernelConfig {
    pub fn new(tick_rate_hz: f64, time_warp_factor: f64) -> Result<Self, ConfigError> {
        if !tick_rate_hz.is_finite() || tick_rate_hz <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "simulation.tick_rate_hz",
                reason: format!("must be a positive number, got {}", tick_rate_hz),
            });
        }
        if !time_warp_factor.is_finite() || time_warp_factor <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "simulation.time_warp_factor",
                reason: format!("must be a positive number, got {}", time_warp_factor),
            });
        }

        let tick_secs = 1.0 / tick_rate_hz;
        let tick_duration = match Duration::try_from_secs_f64(tick_secs) {
            Ok(duration) if !duration.is_zero() => duration,
            _ => {
                return Err(ConfigError::Invalid {
                    field: "simulation.tick_rate_hz",
                    reason: format!("tick period of {}s is out of range", tick_secs),
                })
            }
        };

        let sim_step_nanos = (tick_secs * time_warp_factor * 1e9).round();
        if sim_step_nanos < 1.0 || sim_step_nanos > i64::MAX as f64 {
            return Err(ConfigError::Invalid {
                field: "simulation.time_warp_factor",
                reason: format!(
                    "simulated step of {}s per tick is out of range",
                    tick_secs * time_warp_factor
                ),
            });
        }

        Ok(Self {
            tick_rate_hz,
            tick_duration,
            time_warp_factor,
            sim_step: chrono::Duration::nanoseconds(sim_step_nanos as i64),
            start_time: None,
            fidelity: FidelitySettings::default(),
        })
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_fidelity(mut self, fidelity: FidelitySettings) -> Self {
        self.fidelity = fidelity;
        self
    }

    pub fn tick_rate_hz(&self) -> f64 {
        self.tick_rate_hz
    }

    /// Wall-clock time between tick deadlines.
    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    pub fn time_warp_factor(&self) -> f64 {
        self.time_warp_factor
    }

    /// Simulated time advanced by each tick.
    pub fn sim_step(&self) -> chrono::Duration {
        self.sim_step
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn fidelity(&self) -> FidelitySettings {
        self.fidelity
    }
}
