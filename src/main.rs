use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use nesys_lib::Settings;
use nesys_lib::config::DEFAULT_SETTINGS_FILE;
use nesys_lib::constants::DRIVE_COUNT;
use nesys_lib::profile_id::{id_file_path, read_id_file};
use nesys_lib::volume::{VolumeScanner, letter_for_slot};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// List the drives known to the settings file and the profile id on each.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(args.verbose.tracing_level_filter().into())
                .from_env_lossy(),
        )
        .init();

    let settings = Settings::load_or_default(&args.config)
        .with_context(|| format!("Failed to load settings from {:?}", args.config))?;
    let volumes = settings.volumes();
    let selected = settings.drive_mask();
    let live = volumes.live_mask();
    debug!(%selected, %live, "drive masks");

    println!("Server: {}:{}", settings.server_address, settings.port);
    println!("Game:   {}", settings.exe_name);
    if selected.is_empty() {
        println!("Selected drives: none");
    } else {
        println!("Selected drives: {selected}");
    }

    if settings.drive_roots.is_empty() {
        println!("\nNo drive roots configured.");
        return Ok(());
    }

    println!();
    for slot in 0..DRIVE_COUNT {
        let Some(root) = volumes.root(slot) else {
            continue;
        };
        let marker = if selected.contains(slot) { '*' } else { ' ' };
        let state = if live.contains(slot) { "present" } else { "missing" };
        let id = if live.contains(slot) {
            match read_id_file(&id_file_path(root)) {
                Ok(id) => id.to_string(),
                Err(_) => "no id".to_string(),
            }
        } else {
            String::new()
        };
        println!("{marker} {}: {:<30} {state:<8} {id}", letter_for_slot(slot), root.display());
    }
    Ok(())
}
