use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use drivefs_config::DriveConfig;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "drivefs", version, about = "drivefs - mount a cloud drive as a filesystem")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Refresh token; overrides the config and the token file
    #[arg(long)]
    refresh_token: Option<String>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the drive and serve it until unmounted
    Mount {
        /// Directory to mount at (defaults to mount.mountpoint)
        mountpoint: Option<PathBuf>,
    },
    /// Exchange the refresh token once and persist the rotated token
    Refresh,
    /// List a remote directory
    Ls {
        /// Path to list (defaults to /)
        path: Option<String>,
    },
    /// Show remote file or directory metadata
    Stat {
        /// Path to inspect
        path: String,
    },
    /// Show drive capacity
    Quota,
    /// Show effective configuration
    Config,
}

fn find_config() -> Option<PathBuf> {
    // 1. DRIVEFS_CONFIG environment variable
    if let Ok(path) = std::env::var("DRIVEFS_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. drivefs.yaml in current directory
    let cwd_config = PathBuf::from("drivefs.yaml");
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    // 3. ~/.config/drivefs/config.yaml
    if let Some(home) = dirs_next::home_dir() {
        let home_config = home.join(".config/drivefs/config.yaml");
        if home_config.exists() {
            return Some(home_config);
        }
    }

    None
}

fn load_config(path: Option<PathBuf>) -> Result<DriveConfig, Box<dyn std::error::Error>> {
    let config = match path.or_else(find_config) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading configuration");
            DriveConfig::from_file(&path)?
        }
        None => DriveConfig::default(),
    };
    config.validate_or_err()?;
    Ok(config.effective())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let filter = if verbose {
        filter.add_directive(tracing::Level::DEBUG.into())
    } else {
        filter
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(cli.config)?;
    let token = cli.refresh_token;

    match cli.command {
        Commands::Config => commands::config::run(&config)?,
        Commands::Mount { mountpoint } => {
            let args = commands::mount::MountArgs { mountpoint };
            commands::mount::run(config, token, args).await?;
        }
        Commands::Refresh => {
            let session = commands::Session::connect(&config, token).await?;
            commands::refresh::run(&session)?;
        }
        Commands::Ls { path } => {
            let session = commands::Session::connect(&config, token).await?;
            commands::ls::run(&session, path).await?;
        }
        Commands::Stat { path } => {
            let session = commands::Session::connect(&config, token).await?;
            commands::stat::run(&session, &path).await?;
        }
        Commands::Quota => {
            let session = commands::Session::connect(&config, token).await?;
            commands::quota::run(&session).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let code = err.exit_code().clamp(0, 255) as u8;
            return ExitCode::from(code);
        }
    };
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
