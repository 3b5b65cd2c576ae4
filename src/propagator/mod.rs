//! Position providers: answer "where is the satellite at simulated time t?".
//!
//! The tick loop only depends on [`PositionProvider::evaluate`]. Providers
//! are built once at startup and are stateless from the loop's point of view.

pub mod kepler;

pub use kepler::{KeplerPropagator, Tle, TleError};

use crate::state::Vector3;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateVector {
    pub position: Vector3,
    pub velocity: Vector3,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("time {0} is outside the propagation range")]
    OutOfRange(DateTime<Utc>),
    #[error("Kepler solver did not converge after {iterations} iterations")]
    NonConvergent { iterations: u32 },
    #[error("invalid orbital elements: {0}")]
    InvalidElements(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

pub trait PositionProvider: Send + Sync {
    /// Component name used as the source of alerts raised on failure.
    fn name(&self) -> &str;

    fn evaluate(&self, at: DateTime<Utc>) -> Result<StateVector, ProviderError>;
}

/// Always reports the same state vector regardless of time.
#[derive(Debug, Clone, Copy)]
pub struct FixedPositionProvider {
    state: StateVector,
}

impl FixedPositionProvider {
    pub fn new(position: Vector3, velocity: Vector3) -> Self {
        Self {
            state: StateVector { position, velocity },
        }
    }
}

impl Default for FixedPositionProvider {
    /// A point on a circular equatorial orbit at roughly ISS altitude.
    fn default() -> Self {
        Self::new([6771.0, 0.0, 0.0], [0.0, 7.6726, 0.0])
    }
}

impl PositionProvider for FixedPositionProvider {
    fn name(&self) -> &str {
        "FixedPositionProvider"
    }

    fn evaluate(&self, _at: DateTime<Utc>) -> Result<StateVector, ProviderError> {
        Ok(self.state)
    }
}
