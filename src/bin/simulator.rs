use clap::{App, Arg};
use cvt::config::CvtConfig;
use cvt::logging;
use cvt::testbed::Testbed;
use std::path::PathBuf;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "cvt.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("cvt-simulator")
        .version("0.1.0")
        .about("CubeSat virtual testbed simulation server")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Observer port (overrides the configuration file)")
                .takes_value(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .get_matches();

    let config_path = PathBuf::from(matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH));
    let mut config = match CvtConfig::load(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("!!! CONFIGURATION VALIDATION ERROR !!!\n{}", e);
            return Err(e.into());
        }
    };
    if let Some(port) = matches.value_of("port") {
        config.server.port = port.parse()?;
    }

    logging::init(&config.general);
    if config.general.debug {
        info!("Final configuration:\n{}", toml::to_string_pretty(&config)?);
    }

    println!("🛰️  CubeSat Virtual Testbed");
    println!("===========================");

    let testbed = Testbed::from_config(&config)?;
    let (addr, server) = testbed.listen(&config.server.bind_addr()).await?;
    info!("📡 Streaming satellite state on {}", addr);

    testbed.start().await;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Server shutting down...");
        }
        result = server => {
            if let Err(e) = result {
                error!("Observer server stopped unexpectedly: {}", e);
            }
        }
    }

    testbed.stop().await;
    println!("🚀 CubeSat Virtual Testbed stopped");

    Ok(())
}
