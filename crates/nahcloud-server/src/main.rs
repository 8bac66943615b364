use clap::Parser;
use nahcloud_server::{ConfigLayer, ServerConfig, ServerError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "nahcloud-server",
    version,
    about = "Terraform HTTP remote-state backend",
    after_help = "Settings are taken from flags, then NAH_* environment variables, \
                  then the config file, then built-in defaults."
)]
struct Cli {
    /// TOML config file with addr, data_dir, workers, max_body_bytes.
    #[arg(short, long, env = "NAH_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on [default: 0.0.0.0:8080].
    #[arg(long, env = "NAH_ADDR")]
    addr: Option<String>,

    /// Directory to persist state and locks in. State is kept in memory if unset.
    #[arg(long, env = "NAH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Number of request worker threads [default: 4].
    #[arg(long, env = "NAH_WORKERS")]
    workers: Option<usize>,

    /// Largest accepted request body in bytes [default: 33554432].
    #[arg(long, env = "NAH_MAX_BODY_BYTES")]
    max_body_bytes: Option<usize>,
}

impl Cli {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            addr: self.addr.clone(),
            data_dir: self.data_dir.clone(),
            workers: self.workers,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

fn run(cli: &Cli) -> Result<(), ServerError> {
    let file = match &cli.config {
        Some(path) => ConfigLayer::load(path)?,
        None => ConfigLayer::default(),
    };
    let config = ServerConfig::resolve(cli.layer().over(file))?;

    match &config.data_dir {
        Some(dir) => info!("data directory: {}", dir.display()),
        None => info!("no data directory configured, state is kept in memory"),
    }
    let store = config.open_store()?;

    info!("starting nahcloud-server on {}", config.addr);
    let handle = nahcloud_server::run_server(&config, store)?;

    let stopper = handle.stopper();
    ctrlc::set_handler(move || {
        info!("shutdown requested, finishing in-flight requests");
        stopper.stop();
    })
    .map_err(|e| ServerError::Signal(e.to_string()))?;

    handle.wait();
    info!("server stopped");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
