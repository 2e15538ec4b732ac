use std::path::PathBuf;

use clap::Parser;
use log::info;

use music_metadata_processor::api::{self, ApiState};
use music_metadata_processor::config::AppConfig;
use music_metadata_processor::lifecycle::Shutdown;
use music_metadata_processor::registry::{FileRegistry, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
use music_metadata_processor::utils::ensure_dir_exists;

#[derive(Debug, Parser)]
#[command(name = "music-metadata-processor")]
#[command(about = "Downloads remote audio, rewrites its tags, and serves the result")]
struct Args {
    /// Path to the JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen host (loopback only)
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Directory for staged and processed files
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting music metadata processor");

    let args = Args::parse();

    let mut config = match AppConfig::load(args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            AppConfig::default()
        }
    };

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(cache_dir) = args.cache_dir {
        config.cache_dir = cache_dir;
    }

    if let Err(e) = ensure_dir_exists(&config.cache_dir).await {
        log::error!("Cache directory {:?} is unusable: {e}", config.cache_dir);
        std::process::exit(1);
    }
    info!("Using cache directory: {:?}", config.cache_dir);

    let shutdown = Shutdown::default();
    let registry = FileRegistry::new(DEFAULT_TTL);
    let _sweeper = registry.spawn_sweeper(DEFAULT_SWEEP_INTERVAL, shutdown.clone());

    let state = match ApiState::new(config.cache_dir.clone(), registry, shutdown) {
        Ok(state) => state,
        Err(e) => {
            log::error!("Failed to initialize service state: {e}");
            std::process::exit(1);
        }
    };

    let addr = format!("{}:{}", config.effective_host(), config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!("Server listening on http://{addr}");

    if let Err(e) = api::serve(listener, state).await {
        log::error!("Server error: {e}");
        std::process::exit(1);
    }

    info!("Server stopped");
}
