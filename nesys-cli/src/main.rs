use anyhow::{Context, Result, bail};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use nesys_lib::config::DEFAULT_SETTINGS_FILE;
use nesys_lib::process::DefaultInspector;
use nesys_lib::volume::DriveMask;
use nesys_lib::{Blackboard, Settings, Worker, WorkerExit};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps a game's car profile in sync with the nesys profile server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file, created with defaults if missing.
    #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    /// Select these drive letters (e.g. "DE") and save the selection.
    #[arg(short, long)]
    drives: Option<String>,
    /// Override the server address for this run.
    #[arg(long)]
    server: Option<String>,
    /// Override the server port for this run.
    #[arg(long)]
    port: Option<u16>,
    /// Override the game executable name for this run.
    #[arg(long)]
    exe: Option<String>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn setup_logging(
    log_file_path: Option<&Path>,
    verbosity: &Verbosity<InfoLevel>,
) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = if let Some(path) = log_file_path {
        let log_file = File::create(path)
            .with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    let mut settings = Settings::load_or_init(&cli.config)
        .with_context(|| format!("Failed to load settings from {:?}", cli.config))?;

    if let Some(letters) = &cli.drives {
        settings.drives = DriveMask::from_letters(letters).bits();
        settings
            .save(&cli.config)
            .context("Failed to save the drive selection")?;
    }
    if let Some(server) = cli.server {
        settings.server_address = server;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(exe) = cli.exe {
        settings.exe_name = exe;
    }

    let board = Arc::new(Blackboard::new());
    settings.apply_to(&board);

    let volumes = settings.volumes();
    if settings.drive_roots.is_empty() {
        warn!("No drive roots configured, add \"drive_roots\" to {:?}", cli.config);
    }
    info!(
        server = %settings.server_address,
        port = settings.port,
        exe = %settings.exe_name,
        drives = %settings.drive_mask(),
        "Starting worker"
    );

    let worker = Worker::new(
        Arc::clone(&board),
        volumes,
        DefaultInspector::new(settings.memory_layout),
    )
    .spawn();

    let mut drive_mask = settings.drive_mask();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => {
                info!("Ctrl+C received, shutting down gracefully.");
                break;
            }
        }

        // Pick up selection changes made to the settings file
        match Settings::load(&cli.config) {
            Ok(current) => drive_mask = current.drive_mask(),
            Err(e) => debug!("keeping previous drive selection: {e}"),
        }
        board.set_selected_drives(drive_mask);

        if let Some(profile_id) = board.take_profile_id_text() {
            if profile_id.is_empty() {
                debug!("profile id cleared");
            } else {
                println!("Profile ID: {profile_id}");
            }
        }
        if let Some(status) = board.take_status() {
            println!("{status}");
        }

        if worker.is_finished() {
            break;
        }
    }

    let exit = worker.shutdown().await.context("Worker task failed")?;
    // The worker may have left a final message behind
    if let Some(status) = board.take_status() {
        println!("{status}");
    }
    match exit {
        WorkerExit::StopRequested => {
            info!("Worker stopped");
            Ok(())
        }
        other => {
            error!(%other, "Worker ended");
            bail!("worker ended: {other}")
        }
    }
}
