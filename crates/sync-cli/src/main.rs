//! drive-sync: Mirror a local directory with a OneDrive folder.
//!
//! One invocation is one batch run: load the configuration file, authorize if
//! needed, scan both trees, reconcile, and save the updated change state.
//!
//! Exit status: 0 clean, 1 finished with per-item errors, 2 aborted.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use sync_cli::auth::{self, OAuthClient, TokenHolder};
use sync_cli::{ConfigFile, ConfigStore, GraphClient, NativeFs, OptionOverrides};
use sync_core::{RunStatus, SyncEngine, SyncMode};

#[derive(Parser, Debug)]
#[command(name = "drive-sync")]
#[command(about = "Mirror a local directory with a OneDrive folder")]
#[command(
    after_help = "--local-dir, --remote-dir, --include, --exclude, --mode and --log-file are \
                  stored in the configuration file and only need to be given once.\n\
                  Filters are matched against paths relative to each root, like \
                  /Pictures/2024/a.jpg, on both sides."
)]
struct Args {
    /// Configuration file holding options, credentials and sync state
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Start a new configuration (implied when the file does not exist)
    #[arg(short, long)]
    new: bool,

    /// Local directory to synchronize (required for a new configuration)
    #[arg(short = 'l', long)]
    local_dir: Option<PathBuf>,

    /// OneDrive folder to synchronize
    #[arg(short = 'r', long)]
    remote_dir: Option<String>,

    /// Only synchronize paths matching this regex ("" clears)
    #[arg(long)]
    include: Option<String>,

    /// Never synchronize paths matching this regex ("" clears)
    #[arg(long)]
    exclude: Option<String>,

    /// pull (r2l): OneDrive to local, push (l2r): local to OneDrive, both
    #[arg(short, long)]
    mode: Option<SyncMode>,

    /// Also append the log to this file ("" clears)
    #[arg(long)]
    log_file: Option<String>,

    /// Paste the redirect URL instead of listening on localhost:8888
    #[arg(long)]
    no_listener: bool,

    /// Report what would happen without changing either side or saving state
    #[arg(long, alias = "test")]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Application (client) id registered with Microsoft
    #[arg(long, env = "DRIVE_SYNC_CLIENT_ID")]
    client_id: String,

    /// Client secret, for confidential app registrations
    #[arg(long, env = "DRIVE_SYNC_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,
}

impl Args {
    fn overrides(&self) -> OptionOverrides {
        OptionOverrides {
            local_dir: self.local_dir.clone(),
            remote_dir: self.remote_dir.clone(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            mode: self.mode,
            log_file: self.log_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging depends on the stored options, so startup errors go to stderr
    let (store, mut config) = match open_config(&args) {
        Ok(opened) => opened,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = init_logging(&args, config.options.log_file.as_deref()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(2);
    }

    match run(&args, &store, &mut config).await {
        Ok(RunStatus::Clean) => ExitCode::SUCCESS,
        Ok(RunStatus::CompletedWithErrors) => {
            error!("Sync finished with errors");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("Sync aborted: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn open_config(args: &Args) -> Result<(ConfigStore, ConfigFile)> {
    let store = ConfigStore::open(&args.config)?;
    let mut config = if args.new || !store.exists() {
        ConfigFile::default()
    } else {
        store.load()?
    };
    config.options.apply(args.overrides())?;
    Ok((store, config))
}

fn init_logging(args: &Args, log_file: Option<&Path>) -> Result<()> {
    let default_filter = if args.verbose {
        "info,sync_core=debug,sync_cli=debug,drive_sync=debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

async fn run(args: &Args, store: &ConfigStore, config: &mut ConfigFile) -> Result<RunStatus> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("drive-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let oauth = OAuthClient::new(http.clone(), args.client_id.clone(), args.client_secret.clone());

    if config.authentication.is_none() {
        let session = auth::authorize_interactive(&oauth, !args.no_listener)
            .await
            .context("Authorization failed")?;
        config.authentication = Some(session);
    }

    let tokens = Arc::new(TokenHolder::new(oauth, config.authentication.clone()));
    tokens
        .ensure_fresh()
        .await
        .context("Cannot obtain an access token")?;
    config.authentication = tokens.session().await;
    store.save(config)?;

    let options = &config.options;
    info!("Starting sync");
    info!("  Local directory:  {}", options.local_dir);
    info!("  OneDrive folder:  {}", options.remote_dir);
    info!("  Include filter:   {}", options.include.as_deref().unwrap_or("-"));
    info!("  Exclude filter:   {}", options.exclude.as_deref().unwrap_or("-"));
    info!("  Direction:        {}", options.mode);
    if args.dry_run {
        info!("  Dry run: nothing is changed, state is not saved");
    }

    let engine = SyncEngine::new(
        NativeFs::new(),
        GraphClient::new(http, tokens.clone()),
        options.to_mapper()?,
        options.mode,
    )
    .dry_run(args.dry_run);

    let report = engine.run(&mut config.files).await?;

    // The token may have been refreshed during the run
    if let Some(session) = tokens.session().await {
        config.authentication = Some(session);
    }
    if !args.dry_run {
        store.save(config)?;
        info!("Saved state of {} entries to {}", config.files.len(), store.path().display());
    }

    Ok(report.status())
}
