use anyhow::{Context, bail};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use geochat::{GeoChat, GeoChatConfig, load_config};
use geochat_core::{ChatEvent, DEFAULT_PRECISION, GeoCell, encode, label_for};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;

/// Status is polled this often even when no message arrives.
const STATUS_POLL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "geochat", about = "Location-based chat over public relays", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the geohash cell for a coordinate
    Encode {
        #[arg(allow_negative_numbers = true)]
        lat: f64,
        #[arg(allow_negative_numbers = true)]
        lon: f64,
        #[arg(short, long, default_value_t = DEFAULT_PRECISION)]
        precision: usize,
    },
    /// Print the centre and bounding box of a cell
    Decode { cell: String },
    /// Print the region name of a cell
    Label { cell: String },
    /// Join a channel and print messages until Ctrl-C
    Watch(WatchArgs),
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    #[arg(long, allow_negative_numbers = true, requires = "lon", conflicts_with = "cell")]
    lat: Option<f64>,
    #[arg(long, allow_negative_numbers = true, requires = "lat")]
    lon: Option<f64>,
    /// Join this cell instead of a coordinate
    #[arg(long)]
    cell: Option<String>,
    /// Channel precision; defaults to the configured one
    #[arg(short, long, conflicts_with = "cell")]
    precision: Option<usize>,
    /// Relay URL, repeatable; replaces the configured relays
    #[arg(long = "relay")]
    relays: Vec<String>,
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::Encode {
            lat,
            lon,
            precision,
        } => {
            check_coordinate(lat, lon)?;
            let cell = encode(lat, lon, precision);
            println!("{}\t{}", cell, label_for(&cell));
        }
        Command::Decode { cell } => {
            let cell = GeoCell::parse(&cell)?;
            let (lat, lon) = cell.center();
            let b = cell.bounds();
            println!("{lat:.6} {lon:.6}");
            println!(
                "lat {:.6}..{:.6} lon {:.6}..{:.6}",
                b.min_lat, b.max_lat, b.min_lon, b.max_lon
            );
        }
        Command::Label { cell } => {
            println!("{}", label_for(&GeoCell::parse(&cell)?));
        }
        Command::Watch(args) => watch(args).await?,
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn check_coordinate(lat: f64, lon: f64) -> anyhow::Result<()> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        bail!("coordinate out of range: {lat}, {lon}");
    }
    Ok(())
}

fn build_config(args: &WatchArgs) -> anyhow::Result<GeoChatConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GeoChatConfig::default(),
    };
    if !args.relays.is_empty() {
        config.relays = args.relays.clone();
    }
    Ok(config)
}

async fn watch(args: WatchArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    let chat = GeoChat::new(config)?;

    let key = match (&args.cell, args.lat, args.lon) {
        (Some(cell), _, _) => chat.join_cell(cell).await?,
        (None, Some(lat), Some(lon)) => chat.join(lat, lon, args.precision).await?,
        _ => bail!("pass --lat and --lon, or --cell"),
    };
    info!("Watching {} ({})", key, chat.label(&key));

    let result = watch_channel(&chat, &key).await;
    chat.shutdown().await;
    result
}

async fn watch_channel(chat: &GeoChat, key: &GeoCell) -> anyhow::Result<()> {
    let mut changes = chat.watch(key).await?;
    let mut printed = HashSet::new();
    let mut status = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let current = chat.status(key).await?;
        if status != Some(current) {
            println!("-- {} is {}", key, current);
            status = Some(current);
        }
        print_new(chat, key, &mut printed).await?;

        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = changes.changed() => if changed.is_err() { break },
            _ = tokio::time::sleep(STATUS_POLL) => {}
        }
    }
    Ok(())
}

async fn print_new(
    chat: &GeoChat,
    key: &GeoCell,
    printed: &mut HashSet<String>,
) -> anyhow::Result<()> {
    let mut fresh = 0;
    for message in chat.messages(key).await? {
        if printed.insert(message.id().to_string()) {
            println!("{}", format_message(&message));
            fresh += 1;
        }
    }
    // Anything on screen counts as read.
    if fresh > 0 {
        chat.mark_read(key).await?;
    }
    Ok(())
}

fn format_message(message: &ChatEvent) -> String {
    let time = DateTime::from_timestamp(message.created_at() as i64, 0)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| message.created_at().to_string());
    let author = message
        .nickname()
        .map(str::to_string)
        .unwrap_or_else(|| message.author().chars().take(8).collect());
    format!("[{time}] <{author}> {}", message.content())
}
