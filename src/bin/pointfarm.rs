use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pointfarm::config::{AppConfig, CONFIG_PATH};
use pointfarm::connection::WsConnector;
use pointfarm::cookies::expand_sources;
use pointfarm::reporter;
use pointfarm::scheduler::{AccountSource, CookieAccount, Farm, FarmSettings};

#[derive(Parser)]
#[command(name = "pointfarm", about = "Twitch channel points farmer")]
struct Args {
    /// Channel logins to farm (comma-separated), added to the config list
    #[arg(long, value_delimiter = ',')]
    channels: Vec<String>,

    /// Cookie files or directories of cookie files, added to the config list
    #[arg(long)]
    cookies: Vec<PathBuf>,

    /// Config file path (defaults to config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a config file with default settings and exit
    #[arg(long)]
    init_config: bool,

    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));

    if args.init_config {
        if config_path.exists() {
            bail!("{} already exists", config_path.display());
        }
        AppConfig::default().save(&config_path)?;
        info!("Wrote default config to {}", config_path.display());
        return Ok(());
    }

    // An explicit --config must exist; the default path is optional.
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(&config_path)?,
    };
    config.channels.extend(args.channels);
    config.cookies.extend(args.cookies);
    config.validate()?;
    info!(
        channels = config.channels.len(),
        "Loaded config from {}",
        config_path.display()
    );

    let sources: Vec<Box<dyn AccountSource>> = expand_sources(&config.cookies)?
        .into_iter()
        .map(|path| {
            Box::new(CookieAccount {
                path,
                http: config.http.clone(),
            }) as Box<dyn AccountSource>
        })
        .collect();
    if sources.is_empty() {
        warn!("No cookie files found; pass --cookies or set `cookies` in the config");
    }

    let cancel = CancellationToken::new();
    let farm = Farm::new(
        FarmSettings::from_config(&config),
        Arc::new(WsConnector::new(config.feed.url.clone())),
        cancel.clone(),
    );

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
            }
            cancel.cancel();
        }
    });

    info!(
        accounts = sources.len(),
        channels = config.channels.len(),
        "Starting pointfarm"
    );
    let outcome = farm.run(&sources, &config.channels).await;

    let summary = farm.shutdown().await;
    reporter::report_exit_summary(&summary);
    outcome
}
