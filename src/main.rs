//! spotlight-narration: Spotlight summary + narration service.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spotlight_narration::api::{start_api, ApiState};
use spotlight_narration::audio::RodioOutput;
use spotlight_narration::period::group_messages;
use spotlight_narration::store::NarrationStore;
use spotlight_narration::summary::{HttpSummaryClient, PeriodSummarizer};
use spotlight_narration::{Config, Granularity, Message, Spotlight};

#[derive(Parser, Debug)]
#[command(name = "spotlight-narration", about = "Per-period summaries and narrated playback")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control API with live audio output
    Serve {
        /// Messages JSON file to load at startup
        #[arg(short, long)]
        messages: Option<PathBuf>,
    },
    /// Fetch summaries for a messages JSON file and print them
    Summarize {
        messages: PathBuf,

        /// week or month (defaults to config)
        #[arg(short, long)]
        granularity: Option<String>,
    },
    /// Inspect the narration cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// List cached narrations
    List,
    /// Remove one cached narration
    Remove { key: String },
    /// Remove every cached narration
    Clear,
}

fn read_messages(path: &Path) -> Result<Vec<Message>, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let messages: Vec<Message> = serde_json::from_str(&contents)?;
    info!("Read {} messages from {}", messages.len(), path.display());
    Ok(messages)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy HTTP internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info")
    } else {
        EnvFilter::new("info,hyper=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(args.config.as_deref());

    match args.command {
        Command::Serve { messages } => serve(config, messages).await,
        Command::Summarize {
            messages,
            granularity,
        } => summarize(config, &messages, granularity.as_deref()).await,
        Command::Cache { action } => cache(&config, action),
    }
}

async fn serve(config: Config, messages: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    info!("spotlight-narration starting");

    let output = Arc::new(RodioOutput::open_default()?);
    let spotlight = Arc::new(Spotlight::connect(&config, output)?);

    if let Some(path) = messages {
        spotlight.load_messages(read_messages(&path)?);
    }

    let ticker = spotlight
        .playback()
        .spawn_ticker(config.playback.tick_interval());

    if config.api.enabled {
        let state = ApiState {
            spotlight: spotlight.clone(),
        };
        start_api(state, config.api.port).await;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    ticker.abort();
    spotlight.teardown();
    Ok(())
}

async fn summarize(
    config: Config,
    path: &Path,
    granularity: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let granularity = match granularity {
        Some(g) => Granularity::from_str(g).ok_or_else(|| format!("Unknown granularity: {g}"))?,
        None => config.summary.granularity,
    };

    let groups = group_messages(&read_messages(path)?, granularity);
    let backend = Arc::new(HttpSummaryClient::new(&config.backend)?);
    let summarizer = PeriodSummarizer::new(backend, &config.user_id, config.summary.timeout());

    for handle in summarizer.ensure_summaries(&groups) {
        handle.await?;
    }

    for group in &groups {
        let key = group.period.key();
        let text = summarizer
            .get(&key)
            .map(|s| s.text)
            .unwrap_or_default();
        println!("## {} ({} messages)\n{text}\n", group.period.label(), group.messages.len());
    }
    Ok(())
}

fn cache(config: &Config, action: CacheAction) -> Result<(), Box<dyn std::error::Error>> {
    let store = NarrationStore::new(config.narration.cache_file(), config.narration.max_entries);
    match action {
        CacheAction::List => {
            let entries = store.load()?;
            if entries.is_empty() {
                println!("No cached narrations in {}", store.path().display());
            }
            for (key, entry) in &entries {
                let stored = chrono::DateTime::from_timestamp_millis(entry.stored_at)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{key}  {:.1}s  {} KiB  {stored}",
                    entry.duration,
                    entry.payload.len() * 3 / 4 / 1024
                );
            }
        }
        CacheAction::Remove { key } => {
            if store.remove(&key)? {
                println!("Removed {key}");
            } else {
                println!("No cached narration for {key}");
            }
        }
        CacheAction::Clear => {
            let count = store.clear()?;
            println!("Removed {count} cached narration(s)");
        }
    }
    Ok(())
}
