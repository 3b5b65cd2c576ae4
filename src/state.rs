use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Vector3 = [f64; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// A condition raised while executing one tick. Alerts live until the
/// start of the next tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub source: String,
}

impl Alert {
    pub fn new(level: AlertLevel, source: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            source: source.to_owned(),
        }
    }

    pub fn info(source: &str, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Info, source, message)
    }

    pub fn warning(source: &str, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Warning, source, message)
    }

    pub fn critical(source: &str, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Critical, source, message)
    }
}

/// Inertial position (km) and velocity (km/s).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OrbitState {
    pub position: Vector3,
    pub velocity: Vector3,
}

/// The satellite state broadcast to observers once per tick.
///
/// A single instance is owned by the tick loop and mutated in place; other
/// components only ever see the serialized payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteState {
    pub timestamp: DateTime<Utc>,
    pub orbit: OrbitState,
    pub alerts: Vec<Alert>,
}

impl SatelliteState {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            orbit: OrbitState::default(),
            alerts: Vec::new(),
        }
    }

    /// Drop alerts raised during the previous tick.
    pub fn begin_tick(&mut self) {
        self.alerts.clear();
    }

    /// Replace position and velocity together.
    pub fn set_orbit(&mut self, position: Vector3, velocity: Vector3) {
        self.orbit = OrbitState { position, velocity };
    }

    pub fn push_alert(&mut self, alert: Alert) {
        self.alerts.push(alert);
    }

    pub fn has_critical(&self) -> bool {
        self.alerts.iter().any(|a| a.level == AlertLevel::Critical)
    }

    /// Serialize to the UTF-8 JSON text sent to every observer.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
