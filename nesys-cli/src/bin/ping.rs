use anyhow::{Context, Result};
use clap::Parser;
use nesys_lib::config::DEFAULT_SETTINGS_FILE;
use nesys_lib::{ConnectionContext, ProfileClient, Settings};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Ping the profile server using the connection settings from the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file, defaults are used if it does not exist.
    #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Access code, overrides the one in the settings file.
    #[arg(long)]
    key: Option<String>,
    /// Number of pings to send.
    #[arg(short = 'n', long, default_value_t = 4)]
    count: u32,
    /// Pause between pings in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let settings = Settings::load_or_default(&args.config)
        .with_context(|| format!("Failed to load settings from {:?}", args.config))?;

    let server = args.server.unwrap_or(settings.server_address);
    let port = args.port.unwrap_or(settings.port);
    let key = args.key.unwrap_or(settings.access_code);
    if key.is_empty() {
        println!("Warning: no access code set, the server will reject signed requests.");
    }

    let mut client = ProfileClient::new(ConnectionContext::new(key.into_bytes(), server, port));
    let ctx = client.context();
    println!("Pinging {}:{} (timeout {:?})...", ctx.server_address(), ctx.port(), ctx.timeout());

    let mut replies = 0u32;
    let mut total = Duration::ZERO;
    for seq in 1..=args.count {
        match client.ping().await {
            Ok(rtt) => {
                replies += 1;
                total += rtt;
                println!("  reply {seq}: {:.1} ms", rtt.as_secs_f64() * 1000.0);
            }
            Err(e) => println!("  reply {seq}: {} ({e})", e.status_text()),
        }
        if seq < args.count {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    println!("\n{replies}/{} replies", args.count);
    if replies > 0 {
        let avg = total / replies;
        println!("Average round trip: {:.1} ms", avg.as_secs_f64() * 1000.0);
    }
    Ok(())
}
