use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use garin_core::config::Config;
use garin_core::store;

#[derive(Args)]
pub struct DestinationsArgs {
    /// Store location (defaults to database.args)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Store backend (defaults to database.type)
    #[arg(long, value_parser = super::parse_store_kind)]
    pub db_type: Option<garin_core::store::StoreKind>,

    /// Maximum rows to show
    #[arg(short, long, default_value_t = 50)]
    pub limit: usize,

    /// Output format
    #[arg(short, long, default_value = "table", value_parser = ["table", "json"])]
    pub format: String,
}

pub fn run(args: DestinationsArgs, config: Config) -> Result<()> {
    let location = args.db.as_ref().unwrap_or(&config.database.args);
    let kind = args.db_type.unwrap_or(config.database.kind);
    let store = store::open(kind, location)
        .with_context(|| format!("cannot open {kind} store at {}", location.display()))?;
    let rows = store.recent(args.limit)?;
    store.close()?;

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!(
            "  {} no destinations recorded in {}",
            console::style("note:").yellow().bold(),
            location.display(),
        );
        return Ok(());
    }

    println!(
        "\n  {:<26} {:<8} {:<40} {:<16} {}",
        console::style("timestamp").cyan().bold(),
        console::style("proto").cyan().bold(),
        console::style("server name").cyan().bold(),
        console::style("client").cyan().bold(),
        console::style("server").cyan().bold(),
    );
    for d in &rows {
        println!(
            "  {:<26} {:<8} {:<40} {:<16} {}",
            d.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            d.protocol.as_str(),
            console::style(&d.server_name).green(),
            d.source_ip,
            d.destination_ip.map_or_else(|| "-".to_string(), |ip| ip.to_string()),
        );
    }
    println!("\n  {} destinations shown", rows.len());
    Ok(())
}
