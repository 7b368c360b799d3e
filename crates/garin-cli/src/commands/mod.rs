pub mod destinations;
pub mod live;
pub mod replay;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};

use garin_core::config::Config;
use garin_core::engine::RunSummary;
use garin_core::store::StoreKind;

const DEFAULT_CONFIG: &str = "garin.yml";

#[derive(Parser)]
#[command(
    name = "garin",
    about = "Passive HTTP/TLS destination sniffer",
    long_about = "Garin - watches TCP traffic, reassembles HTTP and TLS streams and records\n\
                  which server names each client talked to.",
    version,
    propagate_version = true,
    styles = help_styles(),
)]
pub struct Cli {
    /// YAML configuration file (defaults to ./garin.yml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Do not print the banner
    #[arg(short, long, global = true, default_value_t = false)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a pcap or pcapng file through the pipeline
    Replay(replay::ReplayArgs),

    /// Sniff a network interface until interrupted
    Live(live::LiveArgs),

    /// Show the most recently recorded destinations
    Destinations(destinations::DestinationsArgs),
}

pub fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Replay(args) => replay::run(args, config),
        Commands::Live(args) => live::run(args, config),
        Commands::Destinations(args) => destinations::run(args, config),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.or_else(|| Some(Path::new(DEFAULT_CONFIG)).filter(|p| p.exists()));
    match path {
        Some(path) => {
            let config = Config::load(path)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => {
            tracing::debug!("no configuration file, using defaults");
            Ok(Config::default())
        }
    }
}

/// Command-line overrides shared by the capturing commands.
#[derive(Args, Debug, Default)]
pub struct PipelineArgs {
    /// Store location (SQLite file or JSON-lines file)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Store backend
    #[arg(long, value_parser = parse_store_kind)]
    pub db_type: Option<StoreKind>,

    /// Debounce window in seconds (0 records every observation)
    #[arg(long)]
    pub debounce: Option<u64>,

    /// Parse and log destinations without recording them
    #[arg(long, alias = "no-record", default_value_t = false)]
    pub dont_record_destinations: bool,

    /// Parses allowed to run at once
    #[arg(long)]
    pub parsing_concurrency: Option<usize>,

    /// Recorder workers
    #[arg(long)]
    pub recording_threads: Option<usize>,

    /// Plaintext HTTP port (repeatable, replaces the configured set)
    #[arg(long = "http-port")]
    pub http_ports: Vec<u16>,

    /// TLS port (repeatable, replaces the configured set)
    #[arg(long = "tls-port")]
    pub tls_ports: Vec<u16>,

    /// Out-of-order segments buffered per connection (0 = unlimited)
    #[arg(long)]
    pub buffered_per_connection: Option<usize>,

    /// Out-of-order segments buffered across all connections (0 = unlimited)
    #[arg(long)]
    pub total_max_buffer: Option<usize>,

    /// Bytes kept per stream for parsing
    #[arg(long)]
    pub max_stream_bytes: Option<usize>,

    /// Seconds of inactivity before a connection is flushed
    #[arg(long)]
    pub flush_after: Option<u64>,
}

impl PipelineArgs {
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(ref db) = self.db {
            config.database.args = db.clone();
        }
        if let Some(kind) = self.db_type {
            config.database.kind = kind;
        }
        if let Some(secs) = self.debounce {
            config.database.debounce_destinations = Duration::from_secs(secs);
        }
        if self.dont_record_destinations {
            config.general.dont_record_destinations = true;
        }
        if let Some(n) = self.parsing_concurrency {
            config.general.parsing_concurrency = n;
        }
        if let Some(n) = self.recording_threads {
            config.general.recording_threads = n;
        }
        if !self.http_ports.is_empty() {
            config.capture.unencrypted_ports = self.http_ports.clone();
        }
        if !self.tls_ports.is_empty() {
            config.capture.encrypted_ports = self.tls_ports.clone();
        }
        if let Some(n) = self.buffered_per_connection {
            config.capture.buffered_per_connection = n;
        }
        if let Some(n) = self.total_max_buffer {
            config.capture.total_max_buffer = n;
        }
        if let Some(n) = self.max_stream_bytes {
            config.capture.max_stream_bytes = n;
        }
        if let Some(secs) = self.flush_after {
            config.capture.flush_after = Duration::from_secs(secs);
        }
        config.validate().context("invalid command-line override")
    }
}

fn parse_store_kind(s: &str) -> Result<StoreKind, String> {
    match s.to_lowercase().as_str() {
        "sql" | "sqlite" => Ok(StoreKind::Sql),
        "document" | "jsonl" => Ok(StoreKind::Document),
        _ => Err(format!("unknown store '{s}': expected sql or document")),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("garin-worker")
        .build()
        .context("cannot start async runtime")
}

fn print_summary(summary: &RunSummary, elapsed: Duration, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    let c = &summary.capture;
    let r = &summary.reassembly;
    let d = &summary.dispatch;
    println!(
        "\n  {} in {:.2}s",
        console::style("done").green().bold(),
        elapsed.as_secs_f64(),
    );
    println!(
        "  {:<14} {} packets, {} tcp segments, {} undecodable",
        console::style("capture").cyan(),
        c.packets,
        c.tcp_segments,
        c.decode_errors,
    );
    println!(
        "  {:<14} {} streams, {} gaps skipped ({} bytes)",
        console::style("reassembly").cyan(),
        r.completed,
        r.gaps_skipped,
        r.skipped_bytes,
    );
    println!(
        "  {:<14} {} parsed, {} destinations, {} misses, {} failures",
        console::style("parsing").cyan(),
        d.parsed,
        d.destinations,
        d.misses,
        d.failures,
    );
    println!(
        "  {:<14} {}",
        console::style("recorded").cyan(),
        console::style(summary.recorded).green().bold(),
    );
    Ok(())
}

fn help_styles() -> Styles {
    let heading = AnsiColor::Cyan.on_default() | Effects::BOLD;
    Styles::styled()
        .header(heading)
        .usage(heading)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Yellow.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
}
