use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Args;

use garin_core::config::Config;
use garin_core::engine::Engine;
use garin_core::ingest::PcapReplay;

use super::PipelineArgs;

#[derive(Args)]
pub struct ReplayArgs {
    /// Path to the pcap or pcapng file
    pub pcap: PathBuf,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Print the run summary as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub fn run(args: ReplayArgs, mut config: Config) -> Result<()> {
    args.pipeline.apply(&mut config)?;
    let started = Instant::now();

    let replay = PcapReplay::open(&args.pcap)?;
    if !args.json {
        println!(
            "  {} {} ({} bytes, sha256:{})",
            console::style("replaying").cyan().bold(),
            replay.filename,
            replay.file_size,
            &replay.file_sha256[..16],
        );
    }

    let engine = Engine::from_config(&config)?;
    let shutdown = engine.shutdown_handle();
    ctrlc::set_handler(move || {
        shutdown.trigger();
    })?;

    let summary = super::runtime()?.block_on(engine.run(replay))?;
    super::print_summary(&summary, started.elapsed(), args.json)
}
