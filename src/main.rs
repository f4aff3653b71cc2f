//! airplay-fingerprinter - command-line front end for the fingerprint engine
//!
//! Loads WAV files, ingests reference tracks, identifies broadcast captures
//! and prints station statistics as JSON.

use std::path::{Path, PathBuf};

use airplay_fingerprinter::{AudioFingerprinter, AudioLoader, EngineConfig, SongMetadata};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for airplay-fingerprinter
#[derive(Parser, Debug)]
#[command(name = "airplay-fingerprinter")]
#[command(about = "Acoustic fingerprinting for radio and TV airplay monitoring")]
#[command(version)]
struct Args {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long, env = "AIRPLAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fingerprint a reference track and add it to the catalog
    Ingest {
        wav: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long)]
        artist: String,
    },
    /// Identify the song playing in a broadcast capture
    Identify {
        wav: PathBuf,
        #[arg(long)]
        station: String,
        /// Capture time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Print hourly statistics for a station
    Stats {
        #[arg(long)]
        station: String,
        /// Local date, YYYY-MM-DD
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        hour: u32,
    },
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let engine =
        AudioFingerprinter::from_config(config).context("Failed to initialize fingerprint engine")?;

    match args.command {
        Command::Ingest { wav, title, artist } => {
            let pcm = AudioLoader::load_wav(&wav)
                .with_context(|| format!("Failed to load {}", wav.display()))?;
            match engine.ingest(&pcm, &SongMetadata::new(title, artist)) {
                Ok(song) => print_json(&song)?,
                Err(e) if e.is_duplicate() => {
                    info!(error = %e, "Track already in catalog");
                    print_json(&serde_json::json!({ "duplicate": e.to_string() }))?;
                }
                Err(e) => return Err(e).context("Ingest failed"),
            }
        }
        Command::Identify { wav, station, at } => {
            let pcm = AudioLoader::load_wav(&wav)
                .with_context(|| format!("Failed to load {}", wav.display()))?;
            let outcome = engine
                .identify(&pcm, &station, at.unwrap_or_else(Utc::now))
                .context("Identification failed")?;
            print_json(&outcome)?;
        }
        Command::Stats {
            station,
            date,
            hour,
        } => {
            let stat = engine
                .get_station_stats(&station, date, hour)
                .context("Stats lookup failed")?;
            let plays = engine
                .station_plays(&station)
                .context("Play tally lookup failed")?;
            print_json(&serde_json::json!({ "hour": stat, "plays": plays }))?;
        }
    }

    Ok(())
}
