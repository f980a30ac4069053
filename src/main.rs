use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;
use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::Deserialize;
use tokio::net::TcpListener;

use ofvisor::hypervisor::Hypervisor;
use ofvisor::slice::{self, SliceConfig};

/// Transparent OpenFlow 1.3 network hypervisor.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the slice configuration.
    #[arg(long, default_value = "ofvisor.toml")]
    config: PathBuf,
    /// Listen address for physical switches; overrides the configuration.
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    listen: Option<String>,
    log_level: Option<String>,
    #[serde(default, rename = "slice")]
    slices: Vec<SliceConfig>,
}

fn init_logging(level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}",
        )))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))?;
    log4rs::init_config(config)?;
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(&args.config)
        .map_err(|e| format!("cannot read {}: {}", args.config.display(), e))?;
    let config: FileConfig = toml::from_str(&raw)?;

    let level = match &config.log_level {
        Some(level) => LevelFilter::from_str(level)?,
        None => LevelFilter::Info,
    };
    init_logging(level)?;

    slice::validate(&config.slices)?;

    let listen = args
        .listen
        .or(config.listen)
        .unwrap_or_else(|| "0.0.0.0:6653".to_string());
    let listener = TcpListener::bind(&listen).await?;
    info!(
        "listening for physical switches on {} with {} slice(s)",
        listen,
        config.slices.len()
    );

    let (hypervisor, event_rx) = Hypervisor::new(&config.slices);
    hypervisor.run(listener, event_rx).await;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be up yet; print to both.
            eprintln!("ofvisor: {}", e);
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
