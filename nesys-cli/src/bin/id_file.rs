use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nesys_lib::config::DEFAULT_SETTINGS_FILE;
use nesys_lib::profile_id::{id_file_path, write_id_file};
use nesys_lib::{ConnectionContext, ProfileClient, ProfileId, Settings};
use std::fs;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Inspect and provision profile id files on removable drives.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the id stored on a drive.
    Read { root: PathBuf },
    /// Store an id such as BG04000000ABCDEF on a drive.
    Write { root: PathBuf, id: ProfileId },
    /// Ask the server for a fresh id and store it on every drive given.
    New {
        #[arg(required = true)]
        roots: Vec<PathBuf>,
        #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Args::parse().command {
        Command::Read { root } => {
            let path = id_file_path(&root);
            let raw = fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
            println!("File: {}", path.display());
            println!("Raw:  {}", hex::encode_upper(&raw));
            match ProfileId::decode(&raw) {
                Ok(id) => println!("ID:   {id} ({:#x})", id.value()),
                Err(e) => bail!("not a valid profile id file: {e}"),
            }
        }
        Command::Write { root, id } => {
            let path = id_file_path(&root);
            write_id_file(&path, id).with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote {id} to {}", path.display());
        }
        Command::New { roots, config } => {
            let settings = Settings::load_or_default(&config)
                .with_context(|| format!("Failed to load settings from {:?}", config))?;
            let mut client = ProfileClient::new(ConnectionContext::new(
                settings.access_code.into_bytes(),
                settings.server_address,
                settings.port,
            ));
            let id = client
                .request_new_profile_id()
                .await
                .map_err(|e| anyhow::anyhow!("{} ({e})", e.status_text()))?;
            println!("Server issued {id}");

            let mut written = 0;
            for root in &roots {
                let path = id_file_path(root);
                match write_id_file(&path, id) {
                    Ok(()) => {
                        written += 1;
                        println!("  {}", path.display());
                    }
                    Err(e) => warn!("skipping {}: {e}", root.display()),
                }
            }
            if written == 0 {
                bail!("id {id} was not written to any drive");
            }
        }
    }
    Ok(())
}
