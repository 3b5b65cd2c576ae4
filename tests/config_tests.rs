use chrono::{TimeZone, Utc};
use cvt::config::{ConfigError, CvtConfig};
use cvt::testbed::{Testbed, TestbedError};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_defaults_are_valid() {
    let config = CvtConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.simulation.tick_rate_hz, 10.0);
    assert_eq!(config.simulation.time_warp_factor, 1.0);
    assert_eq!(config.simulation.orbit_propagator, "kepler_tle");
    assert_eq!(config.server.bind_addr(), "127.0.0.1:8765");

    let kernel = config.kernel_config().unwrap();
    assert_eq!(kernel.tick_duration(), Duration::from_millis(100));
    assert!(kernel.start_time().is_none());
}

#[test]
fn test_partial_file_keeps_defaults_for_missing_keys() {
    let file = write_config(
        r#"
[simulation]
tick_rate_hz = 5.0
time_warp_factor = 120.0
start_time = "2025-10-26T12:00:00Z"

[server]
port = 9100

[fidelity]
enable_atmospheric_drag = true
"#,
    );

    let config = CvtConfig::from_file(file.path()).unwrap();
    assert_eq!(config.simulation.tick_rate_hz, 5.0);
    assert_eq!(config.simulation.orbit_propagator, "kepler_tle");
    assert_eq!(config.server.port, 9100);
    assert_eq!(config.server.host, "127.0.0.1");
    assert!(config.fidelity.enable_atmospheric_drag);
    assert!(!config.fidelity.enable_solar_pressure);

    let kernel = config.kernel_config().unwrap();
    assert_eq!(kernel.tick_duration(), Duration::from_millis(200));
    assert_eq!(kernel.sim_step(), chrono::Duration::seconds(24));
    assert_eq!(
        kernel.start_time(),
        Some(Utc.with_ymd_and_hms(2025, 10, 26, 12, 0, 0).unwrap())
    );
    assert!(kernel.fidelity().enable_atmospheric_drag);
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = CvtConfig::from_file(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, CvtConfig::default());
}

#[test]
fn test_malformed_file_is_a_parse_error() {
    let file = write_config("[simulation\ntick_rate_hz = ");
    let result = CvtConfig::from_file(file.path());
    assert!(matches!(result, Err(ConfigError::Parse { .. })));
}

#[test]
fn test_wrong_value_type_is_a_parse_error() {
    let file = write_config("[simulation]\ntick_rate_hz = \"fast\"\n");
    assert!(matches!(
        CvtConfig::from_file(file.path()),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn test_validation_rejects_bad_values() {
    let mut config = CvtConfig::default();
    config.simulation.tick_rate_hz = 0.0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid { field: "simulation.tick_rate_hz", .. })
    ));

    let mut config = CvtConfig::default();
    config.simulation.time_warp_factor = -1.0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid { field: "simulation.time_warp_factor", .. })
    ));

    let mut config = CvtConfig::default();
    config.simulation.orbit_propagator = "sgp4".to_owned();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid { field: "simulation.orbit_propagator", .. })
    ));

    let mut config = CvtConfig::default();
    config.general.log_level = "LOUD".to_owned();
    assert!(config.validate().is_err());

    let mut config = CvtConfig::default();
    config.server.send_timeout_ms = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_serialized_config_loads_back() {
    let mut config = CvtConfig::default();
    config.simulation.time_warp_factor = 60.0;
    config.general.debug = true;

    let file = write_config(&toml::to_string_pretty(&config).unwrap());
    assert_eq!(CvtConfig::from_file(file.path()).unwrap(), config);
}

#[test]
fn test_testbed_from_default_config_uses_orbit_propagator() {
    let testbed = Testbed::from_config(&CvtConfig::default()).unwrap();
    let status = testbed.status();
    assert_eq!(status.tick_rate_hz, 10.0);
    assert_eq!(status.connected_clients, 0);
}

#[test]
fn test_testbed_rejects_corrupt_tle() {
    let mut config = CvtConfig::default();
    // Flip the final checksum digit of line 1
    let mut line1 = config.tle.line1.clone();
    let last = line1.pop().unwrap();
    line1.push(if last == '0' { '1' } else { '0' });
    config.tle.line1 = line1;

    assert!(matches!(Testbed::from_config(&config), Err(TestbedError::Tle(_))));
}
