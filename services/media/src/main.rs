use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trafficstats_media::config::Config;
use trafficstats_media::{DateDirectory, FfmpegTranscoder, MediaRoot, VideoCacheManager};

#[derive(Parser, Debug)]
#[command(name = "trafficstats-media")]
#[command(about = "Convert and cache camera recordings for the dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a recording (YYYY-MM-DD/<file>) and print the cached path
    Convert { relative: String },

    /// Print the cached path of a recording without converting it
    Lookup { relative: String },

    /// Find the snapshot and recording for an event
    Match {
        /// Upload directory, YYYY-MM-DD
        #[arg(long)]
        date: String,
        /// Event time, "YYYY-MM-DD HH:MM:SS" in camera local time
        #[arg(long)]
        at: String,
    },

    /// Recover the cache directory and enforce the byte budget
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("Failed to load configuration")?;
    init_tracing(&config.logging.level, &config.logging.format);
    config.validate().context("Invalid configuration")?;

    let root = MediaRoot::new(&config.media.root)
        .with_context(|| format!("Media root {} is not usable", config.media.root.display()))?;

    match cli.command {
        Command::Match { date, at } => {
            let at = NaiveDateTime::parse_from_str(&at, "%Y-%m-%d %H:%M:%S")
                .with_context(|| format!("Bad event time: {}", at))?;
            let directory = DateDirectory::scan(&root, &date).await?;
            println!("{}", serde_json::to_string(&directory.match_event(at))?);
        }
        Command::Convert { relative } => {
            let cache = open_cache(&config, root).await?;
            let output = cache.get_or_convert(&relative).await?;
            println!("{}", output.display());
        }
        Command::Lookup { relative } => {
            let cache = open_cache(&config, root).await?;
            match cache.lookup(&relative).await? {
                Some(output) => println!("{}", output.display()),
                None => anyhow::bail!("{} is not cached", relative),
            }
        }
        Command::Sweep => {
            let cache = open_cache(&config, root).await?;
            let evicted = cache.evict().await;
            info!(evicted, "Sweep complete");
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
    }

    Ok(())
}

/// Build the cache and register what is already on disk
async fn open_cache(config: &Config, root: MediaRoot) -> Result<VideoCacheManager<FfmpegTranscoder>> {
    let cache = VideoCacheManager::new(
        root,
        config.cache.dir.clone(),
        config.cache.max_bytes,
        FfmpegTranscoder::new(&config.transcode),
    );
    let recovered = cache
        .load_existing()
        .await
        .context("Failed to load cache directory")?;
    info!(entries = recovered, dir = %config.cache.dir.display(), "Cache ready");
    Ok(cache)
}

/// Initialize tracing/logging
fn init_tracing(level: &str, format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("trafficstats_media={},warn", level)));

    // stdout carries command output
    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "pretty" {
        registry.with(fmt::layer().pretty().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    }
}
