use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use cvt::kernel::KernelStatus;
use cvt::protocol::{parse_response, ObserverRequest, ObserverResponse};
use cvt::state::{AlertLevel, SatelliteState};
use std::process::Command;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8765";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("cvt")
        .version("0.1.0")
        .about("🛰️  CubeSat Virtual Testbed - observe and query a running simulation")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("ping")
                .about("🏓 Test connection to the simulator")
        )
        .subcommand(
            SubCommand::with_name("status")
                .about("📊 Show scheduler configuration and tick statistics")
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📈 Monitor the live satellite state stream")
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("N")
                        .help("Stop after N snapshots")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Count must be a number".into()),
                        }),
                )
        )
        .subcommand(
            SubCommand::with_name("server")
                .about("🚀 Start the simulator server")
                .arg(
                    Arg::with_name("background")
                        .short("b")
                        .long("background")
                        .help("Run server in background"),
                )
                .arg(
                    Arg::with_name("config")
                        .short("c")
                        .long("config")
                        .value_name("FILE")
                        .help("TOML configuration file")
                        .takes_value(true),
                )
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("ping", _) => handle_ping(host, port, format).await?,
        ("status", _) => handle_status(host, port, format).await?,
        ("monitor", Some(sub_matches)) => handle_monitor(sub_matches, host, port, format).await?,
        ("server", Some(sub_matches)) => handle_server(sub_matches, port)?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the simulator server", "cvt server".bright_cyan());
            println!("  {} Test connection", "cvt ping".bright_cyan());
            println!("  {} Monitor satellite state", "cvt monitor".bright_cyan());
        }
    }

    Ok(())
}

async fn handle_ping(host: &str, port: u16, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (raw, response) = request(host, port, ObserverRequest::Ping).await?;

    match format {
        "json" => println!("{}", raw),
        "compact" => println!("{}", "PONG".bright_green()),
        _ => match response {
            ObserverResponse::Pong => {
                println!("{} {}", "✅".green(), "Simulator is responsive".bright_green())
            }
            other => println!("{} Unexpected reply: {:?}", "❌".red(), other),
        },
    }
    Ok(())
}

async fn handle_status(host: &str, port: u16, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (raw, response) = request(host, port, ObserverRequest::Status).await?;

    let status = match response {
        ObserverResponse::Status(status) => status,
        other => {
            println!("{} Unexpected reply: {:?}", "❌".red(), other);
            return Ok(());
        }
    };

    match format {
        "json" => println!("{}", raw),
        "compact" => println!(
            "{:?} | {} Hz | {}x | {} ticks | {} clients",
            status.phase, status.tick_rate_hz, status.time_warp_factor, status.stats.ticks,
            status.connected_clients
        ),
        _ => print_status_table(&status),
    }
    Ok(())
}

fn print_status_table(status: &KernelStatus) {
    let on_off = |flag: bool| if flag { "ON".bright_green() } else { "off".dimmed() };

    println!("{} {}", "📊".bright_blue(), "Simulation Status".bright_blue().bold());
    println!("{} {:?}", "Phase:".bright_white(), status.phase);
    println!("{} {} Hz ({:.1} ms)", "Tick rate:".bright_white(), status.tick_rate_hz, status.tick_duration_ms);
    println!("{} {}x", "Time warp:".bright_white(), status.time_warp_factor);
    println!("{} {}", "Simulated time:".bright_white(), status.sim_time.to_rfc3339());
    println!("{} {}", "Connected clients:".bright_white(), status.connected_clients);
    println!("{}", "Tick statistics".bright_white().bold());
    println!("  ticks={} lag_events={} provider_failures={} kernel_failures={} broadcast_failures={}",
        status.stats.ticks, status.stats.lag_events, status.stats.provider_failures,
        status.stats.kernel_failures, status.stats.broadcast_failures);
    println!("  last_tick={}µs last_lateness={}µs max_lateness={}µs",
        status.stats.last_tick_micros, status.stats.last_lateness_micros,
        status.stats.max_lateness_micros);
    if !status.alerts.is_empty() {
        println!("{}", "Last tick alerts".bright_white().bold());
        for alert in &status.alerts {
            println!("  {:?} [{}] {}", alert.level, alert.source, alert.message);
        }
    }
    println!("{}", "Fidelity".bright_white().bold());
    println!("  attitude_dynamics {}  atmospheric_drag {}  solar_pressure {}",
        on_off(status.fidelity.enable_attitude_dynamics),
        on_off(status.fidelity.enable_atmospheric_drag),
        on_off(status.fidelity.enable_solar_pressure));
    println!("  gravity_gradient {}  magnetic_torque {}  adcs_control {}  payload_operations {}",
        on_off(status.fidelity.enable_gravity_gradient),
        on_off(status.fidelity.enable_magnetic_torque),
        on_off(status.fidelity.enable_adcs_control),
        on_off(status.fidelity.enable_payload_operations));
}

async fn handle_monitor(matches: &ArgMatches<'_>, host: &str, port: u16, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let limit = match matches.value_of("count") {
        Some(count) => Some(count.parse::<u64>()?),
        None => None,
    };

    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();
    let mut received = 0u64;

    if format == "table" {
        println!("{}", "┌──────────────────────────┬─────────────────────────────────────┬────────────┬────────┐".bright_white());
        println!("{}", "│ Simulated time (UTC)     │ Position (km)                       │ |v| (km/s) │ Alerts │".bright_white());
        println!("{}", "├──────────────────────────┼─────────────────────────────────────┼────────────┼────────┤".bright_white());
    }

    while let Some(line) = lines.next_line().await? {
        if format == "json" {
            println!("{}", line);
        } else if let Ok(state) = serde_json::from_str::<SatelliteState>(&line) {
            print_state(&state, format);
        } else {
            continue;
        }

        received += 1;
        if limit.map_or(false, |limit| received >= limit) {
            break;
        }
    }

    Ok(())
}

fn print_state(state: &SatelliteState, format: &str) {
    let [x, y, z] = state.orbit.position;
    let [vx, vy, vz] = state.orbit.velocity;
    let speed = (vx * vx + vy * vy + vz * vz).sqrt();
    let time = state.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();

    let alerts = if state.alerts.iter().any(|a| a.level == AlertLevel::Critical) {
        format!("{:>6}", state.alerts.len()).bright_red()
    } else if state.alerts.is_empty() {
        format!("{:>6}", 0).green()
    } else {
        format!("{:>6}", state.alerts.len()).yellow()
    };

    match format {
        "compact" => println!("[{}] r=({:.1}, {:.1}, {:.1}) v={:.3} alerts={}", time, x, y, z, speed, alerts),
        _ => println!("│ {:<24} │ {:>10.1} {:>10.1} {:>10.1}    │ {:>10.4} │ {} │", time, x, y, z, speed, alerts),
    }

    for alert in &state.alerts {
        let level = match alert.level {
            AlertLevel::Critical => "CRITICAL".bright_red(),
            AlertLevel::Warning => "WARNING".yellow(),
            AlertLevel::Info => "INFO".bright_blue(),
        };
        println!("    {} [{}] {}", level, alert.source, alert.message);
    }
}

fn handle_server(matches: &ArgMatches<'_>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let background = matches.is_present("background");

    println!("{}", "🚀 Starting CubeSat virtual testbed server...".bright_green().bold());

    let port_arg = port.to_string();
    let mut cmd = Command::new("cargo");
    cmd.args(["run", "--bin", "cvt-simulator", "--", "--port", port_arg.as_str()]);
    if let Some(config) = matches.value_of("config") {
        cmd.args(["--config", config]);
    }

    if background {
        cmd.spawn()?;
        println!("{} Server started in background on port {}", "✅".green(), port);
    } else {
        println!("{} Server starting on port {} (Press Ctrl+C to stop)", "🌐".bright_blue(), port);
        cmd.status()?;
    }

    Ok(())
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to simulator at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cvt server".bright_cyan());
                eprintln!("   or");
                eprintln!("   {}", "cargo run --bin cvt-simulator".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            Err(e.into())
        }
    }
}

/// Send one request and wait for its reply, skipping state lines that
/// arrive in between.
async fn request(host: &str, port: u16, request: ObserverRequest) -> Result<(String, ObserverResponse), Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    let encoded = serde_json::to_string(&request)?;

    let exchange = async {
        writer.write_all(encoded.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(response) = parse_response(&line) {
                return Ok((line, response));
            }
        }
        Err::<(String, ObserverResponse), std::io::Error>(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "Server closed connection",
        ))
    };

    match tokio::time::timeout(REQUEST_TIMEOUT, exchange).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} Request timed out after {} seconds", "⏰".yellow(), REQUEST_TIMEOUT.as_secs());
            Err("Request timeout".into())
        }
    }
}
