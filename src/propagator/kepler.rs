//! Two-line element parsing and unperturbed two-body propagation.
//!
//! No drag, J2 or third-body terms; the orbit is a fixed Keplerian ellipse
//! referenced to the TLE epoch.

use super::{PositionProvider, ProviderError, StateVector};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::f64::consts::TAU;
use thiserror::Error;
use tracing::{debug, info};

/// Earth gravitational parameter, km^3/s^2.
pub const MU_EARTH: f64 = 398_600.4418;

const TLE_LINE_LEN: usize = 69;
const SECONDS_PER_DAY: f64 = 86_400.0;
const KEPLER_MAX_ITERATIONS: u32 = 50;
const KEPLER_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TleError {
    #[error("line {line} must be 69 ASCII characters, got {len}")]
    BadLength { line: u8, len: usize },
    #[error("line {line} does not start with '{line}'")]
    LineNumber { line: u8 },
    #[error("line {line} checksum mismatch: expected {expected}, computed {computed}")]
    Checksum { line: u8, expected: u32, computed: u32 },
    #[error("catalog numbers differ between lines ({line1} vs {line2})")]
    CatalogMismatch { line1: String, line2: String },
    #[error("field {field} could not be parsed from {raw:?}")]
    Field { field: &'static str, raw: String },
}

/// Mean orbital elements from a two-line element set.
#[derive(Debug, Clone, PartialEq)]
pub struct Tle {
    pub name: String,
    pub catalog_number: String,
    pub epoch: DateTime<Utc>,
    pub inclination_deg: f64,
    pub raan_deg: f64,
    pub eccentricity: f64,
    pub arg_perigee_deg: f64,
    pub mean_anomaly_deg: f64,
    pub mean_motion_rev_per_day: f64,
}

impl Tle {
    pub fn parse(name: &str, line1: &str, line2: &str) -> Result<Self, TleError> {
        let line1 = line1.trim_end();
        let line2 = line2.trim_end();
        check_line(line1, 1)?;
        check_line(line2, 2)?;

        let catalog1 = line1[2..7].trim();
        let catalog2 = line2[2..7].trim();
        if catalog1 != catalog2 {
            return Err(TleError::CatalogMismatch {
                line1: catalog1.to_owned(),
                line2: catalog2.to_owned(),
            });
        }

        let epoch_year: i32 = field(line1, 18..20, "epoch_year")?;
        let epoch_day: f64 = field(line1, 20..32, "epoch_day")?;
        let epoch = epoch_from(epoch_year, epoch_day)?;

        // Eccentricity carries an implied leading decimal point.
        let ecc_digits = line2[26..33].trim();
        let eccentricity: f64 = format!("0.{}", ecc_digits)
            .parse()
            .map_err(|_| TleError::Field {
                field: "eccentricity",
                raw: ecc_digits.to_owned(),
            })?;

        Ok(Self {
            name: name.trim().to_owned(),
            catalog_number: catalog1.to_owned(),
            epoch,
            inclination_deg: field(line2, 8..16, "inclination")?,
            raan_deg: field(line2, 17..25, "raan")?,
            eccentricity,
            arg_perigee_deg: field(line2, 34..42, "arg_perigee")?,
            mean_anomaly_deg: field(line2, 43..51, "mean_anomaly")?,
            mean_motion_rev_per_day: field(line2, 52..63, "mean_motion")?,
        })
    }
}

fn check_line(line: &str, number: u8) -> Result<(), TleError> {
    if !line.is_ascii() || line.len() != TLE_LINE_LEN {
        return Err(TleError::BadLength {
            line: number,
            len: line.chars().count(),
        });
    }

    let expected_prefix = char::from(b'0' + number);
    if !line.starts_with(expected_prefix) {
        return Err(TleError::LineNumber { line: number });
    }

    let expected = line[68..69]
        .parse::<u32>()
        .map_err(|_| TleError::Field {
            field: "checksum",
            raw: line[68..69].to_owned(),
        })?;
    let computed = checksum(&line[..68]);
    if expected != computed {
        return Err(TleError::Checksum {
            line: number,
            expected,
            computed,
        });
    }
    Ok(())
}

/// Mod-10 sum of digits, with '-' counting as one.
pub fn checksum(data: &str) -> u32 {
    data.chars()
        .map(|c| match c {
            '-' => 1,
            c => c.to_digit(10).unwrap_or(0),
        })
        .sum::<u32>()
        % 10
}

fn field<T: std::str::FromStr>(
    line: &str,
    range: std::ops::Range<usize>,
    name: &'static str,
) -> Result<T, TleError> {
    let raw = line[range].trim();
    raw.parse().map_err(|_| TleError::Field {
        field: name,
        raw: raw.to_owned(),
    })
}

fn epoch_from(two_digit_year: i32, day_of_year: f64) -> Result<DateTime<Utc>, TleError> {
    let year = if two_digit_year < 57 {
        2000 + two_digit_year
    } else {
        1900 + two_digit_year
    };
    let invalid = || TleError::Field {
        field: "epoch",
        raw: format!("{:02}{}", two_digit_year, day_of_year),
    };

    if !(1.0..367.0).contains(&day_of_year) {
        return Err(invalid());
    }
    let jan1 = Utc
        .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(invalid)?;
    let offset_micros = ((day_of_year - 1.0) * SECONDS_PER_DAY * 1e6).round() as i64;
    Ok(jan1 + Duration::microseconds(offset_micros))
}

/// Propagates a fixed Keplerian ellipse from the TLE epoch.
#[derive(Debug, Clone)]
pub struct KeplerPropagator {
    name: String,
    epoch: DateTime<Utc>,
    semi_major_axis_km: f64,
    eccentricity: f64,
    mean_motion_rad_s: f64,
    mean_anomaly_at_epoch: f64,
    // Perifocal-to-inertial rotation, first two columns.
    p_hat: [f64; 3],
    q_hat: [f64; 3],
}

impl KeplerPropagator {
    pub fn from_tle(tle: &Tle) -> Result<Self, ProviderError> {
        if !(0.0..1.0).contains(&tle.eccentricity) {
            return Err(ProviderError::InvalidElements(format!(
                "eccentricity {} is not elliptical",
                tle.eccentricity
            )));
        }
        if tle.mean_motion_rev_per_day <= 0.0 {
            return Err(ProviderError::InvalidElements(format!(
                "mean motion {} rev/day must be positive",
                tle.mean_motion_rev_per_day
            )));
        }

        let mean_motion_rad_s = tle.mean_motion_rev_per_day * TAU / SECONDS_PER_DAY;
        let semi_major_axis_km = (MU_EARTH / (mean_motion_rad_s * mean_motion_rad_s)).cbrt();

        let (sin_raan, cos_raan) = tle.raan_deg.to_radians().sin_cos();
        let (sin_inc, cos_inc) = tle.inclination_deg.to_radians().sin_cos();
        let (sin_argp, cos_argp) = tle.arg_perigee_deg.to_radians().sin_cos();

        let p_hat = [
            cos_raan * cos_argp - sin_raan * sin_argp * cos_inc,
            sin_raan * cos_argp + cos_raan * sin_argp * cos_inc,
            sin_argp * sin_inc,
        ];
        let q_hat = [
            -cos_raan * sin_argp - sin_raan * cos_argp * cos_inc,
            -sin_raan * sin_argp + cos_raan * cos_argp * cos_inc,
            cos_argp * sin_inc,
        ];

        info!("OrbitalPropagator initialized for '{}'", tle.name);
        debug!(
            "Orbit epoch {} a={:.3}km e={:.7}",
            tle.epoch, semi_major_axis_km, tle.eccentricity
        );

        Ok(Self {
            name: tle.name.clone(),
            epoch: tle.epoch,
            semi_major_axis_km,
            eccentricity: tle.eccentricity,
            mean_motion_rad_s,
            mean_anomaly_at_epoch: tle.mean_anomaly_deg.to_radians(),
            p_hat,
            q_hat,
        })
    }

    pub fn satellite_name(&self) -> &str {
        &self.name
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    pub fn semi_major_axis_km(&self) -> f64 {
        self.semi_major_axis_km
    }

    pub fn period(&self) -> Duration {
        Duration::nanoseconds((TAU / self.mean_motion_rad_s * 1e9).round() as i64)
    }

    fn solve_eccentric_anomaly(&self, mean_anomaly: f64) -> Result<f64, ProviderError> {
        let e = self.eccentricity;
        let mut ecc_anomaly = if e > 0.8 { std::f64::consts::PI } else { mean_anomaly };

        for _ in 0..KEPLER_MAX_ITERATIONS {
            let f = ecc_anomaly - e * ecc_anomaly.sin() - mean_anomaly;
            let delta = f / (1.0 - e * ecc_anomaly.cos());
            ecc_anomaly -= delta;
            if delta.abs() < KEPLER_TOLERANCE {
                return Ok(ecc_anomaly);
            }
        }
        Err(ProviderError::NonConvergent {
            iterations: KEPLER_MAX_ITERATIONS,
        })
    }
}

impl PositionProvider for KeplerPropagator {
    fn name(&self) -> &str {
        "OrbitalPropagator"
    }

    fn evaluate(&self, at: DateTime<Utc>) -> Result<StateVector, ProviderError> {
        let dt_s = (at - self.epoch)
            .num_microseconds()
            .ok_or(ProviderError::OutOfRange(at))? as f64
            / 1e6;

        let mean_anomaly = (self.mean_anomaly_at_epoch + self.mean_motion_rad_s * dt_s).rem_euclid(TAU);
        let ecc_anomaly = self.solve_eccentric_anomaly(mean_anomaly)?;

        let a = self.semi_major_axis_km;
        let e = self.eccentricity;
        let (sin_e, cos_e) = ecc_anomaly.sin_cos();
        let root = (1.0 - e * e).sqrt();
        let radius = a * (1.0 - e * cos_e);

        let x_pf = a * (cos_e - e);
        let y_pf = a * root * sin_e;
        let speed_factor = (MU_EARTH * a).sqrt() / radius;
        let vx_pf = -speed_factor * sin_e;
        let vy_pf = speed_factor * root * cos_e;

        let mut position = [0.0; 3];
        let mut velocity = [0.0; 3];
        for axis in 0..3 {
            position[axis] = x_pf * self.p_hat[axis] + y_pf * self.q_hat[axis];
            velocity[axis] = vx_pf * self.p_hat[axis] + vy_pf * self.q_hat[axis];
        }

        Ok(StateVector { position, velocity })
    }
}
