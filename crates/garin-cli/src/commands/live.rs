use anyhow::{bail, Result};
use clap::Args;

use garin_core::config::Config;

use super::PipelineArgs;

#[derive(Args)]
pub struct LiveArgs {
    /// Network interface to sniff (overrides capture.interface)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// List available network interfaces
    #[arg(long, default_value_t = false)]
    pub list: bool,

    /// BPF capture filter (defaults to the configured ports)
    #[arg(long)]
    pub filter: Option<String>,

    /// Stop after this many seconds (0 = until interrupted)
    #[arg(short, long, default_value_t = 0)]
    pub duration: u64,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Print the run summary as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[cfg(feature = "live")]
mod capture {
    use std::time::{Duration, Instant};

    use anyhow::{Context, Result};
    use garin_core::ingest::{pcap_ts_to_datetime, CaptureSource, CaptureStats, Linktype};
    use garin_core::models::Segment;
    use garin_core::shutdown::ShutdownHandle;

    /// A libpcap handle feeding the engine. Reads time out every second so
    /// the shutdown flag is noticed on a quiet link.
    pub struct LiveCapture {
        pub name: String,
        pub cap: pcap::Capture<pcap::Active>,
        pub linktype: Linktype,
        pub shutdown: ShutdownHandle,
        pub deadline: Option<Instant>,
    }

    impl LiveCapture {
        pub fn open(
            name: &str,
            snaplen: i32,
            filter: &str,
            duration: u64,
            shutdown: ShutdownHandle,
        ) -> Result<Self> {
            let device = pcap::Device::list()?
                .into_iter()
                .find(|d| d.name == name)
                .ok_or_else(|| anyhow::anyhow!("interface '{name}' not found"))?;

            let mut cap = pcap::Capture::from_device(device)?
                .promisc(true)
                .snaplen(snaplen)
                .timeout(1000)
                .open()
                .with_context(|| format!("cannot open {name} (need root?)"))?;
            if !filter.is_empty() {
                cap.filter(filter, true)
                    .with_context(|| format!("invalid capture filter '{filter}'"))?;
            }
            let linktype = Linktype(cap.get_datalink().0);

            Ok(Self {
                name: name.to_string(),
                cap,
                linktype,
                shutdown,
                deadline: (duration > 0).then(|| Instant::now() + Duration::from_secs(duration)),
            })
        }
    }

    impl CaptureSource for LiveCapture {
        fn describe(&self) -> String {
            format!("interface {}", self.name)
        }

        fn run(&mut self, sink: &mut dyn FnMut(Segment) -> bool) -> Result<CaptureStats> {
            let mut stats = CaptureStats::default();
            while !self.shutdown.is_triggered() {
                if self.deadline.is_some_and(|d| Instant::now() >= d) {
                    tracing::info!("duration limit reached");
                    break;
                }
                match self.cap.next_packet() {
                    Ok(packet) => {
                        let ts = pcap_ts_to_datetime(
                            packet.header.ts.tv_sec as i64,
                            (packet.header.ts.tv_usec as u32).saturating_mul(1000),
                        );
                        if let Some(segment) = stats.decode(self.linktype, packet.data, ts) {
                            if !sink(segment) {
                                break;
                            }
                        }
                    }
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => return Err(e).context("capture failed"),
                }
            }
            Ok(stats)
        }
    }
}

#[cfg(feature = "live")]
pub fn run(args: LiveArgs, mut config: Config) -> Result<()> {
    use std::time::Instant;

    use garin_core::engine::Engine;

    if args.list {
        return list_interfaces();
    }

    args.pipeline.apply(&mut config)?;
    if args.interface.is_some() {
        config.capture.interface = args.interface.clone();
    }
    if args.filter.is_some() {
        config.capture.filter = args.filter.clone();
    }

    let Some(interface) = config.capture.interface.clone() else {
        bail!("no interface given: pass -i IFACE or set capture.interface (see --list)");
    };
    let filter = config.capture_filter();

    if !args.json {
        println!(
            "\n  {} on interface '{}'",
            console::style("LIVE CAPTURE").cyan().bold(),
            console::style(&interface).green().bold(),
        );
        println!("  {} {}", console::style("BPF filter:").cyan(), filter);
        println!(
            "  {} press Ctrl+C to stop\n",
            console::style("-->").yellow(),
        );
    }

    let started = Instant::now();
    let engine = Engine::from_config(&config)?;
    let shutdown = engine.shutdown_handle();
    let source = capture::LiveCapture::open(
        &interface,
        config.capture.snaplen,
        &filter,
        args.duration,
        shutdown.clone(),
    )?;
    ctrlc::set_handler(move || {
        shutdown.trigger();
    })?;

    let summary = super::runtime()?.block_on(engine.run(source))?;
    super::print_summary(&summary, started.elapsed(), args.json)
}

#[cfg(feature = "live")]
fn list_interfaces() -> Result<()> {
    use anyhow::Context;

    let devices = pcap::Device::list().context("cannot enumerate interfaces")?;
    if devices.is_empty() {
        bail!("libpcap reports no interfaces; capture usually needs root or CAP_NET_RAW");
    }

    println!("  {:<16} {:<6} ADDRESSES", "INTERFACE", "STATE");
    for dev in devices {
        let state = if dev.flags.is_up() { "up" } else { "down" };
        let addrs: Vec<String> = dev.addresses.iter().map(|a| a.addr.to_string()).collect();
        println!(
            "  {} {:<6} {}",
            console::style(format!("{:<16}", dev.name)).green(),
            state,
            addrs.join(" "),
        );
    }
    Ok(())
}

#[cfg(not(feature = "live"))]
pub fn run(_args: LiveArgs, _config: Config) -> Result<()> {
    bail!("this build has no live capture; rebuild garin-cli with `--features live` (requires libpcap)")
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Commands};

    fn live_args(argv: &[&str]) -> LiveArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        let Commands::Live(args) = cli.command else {
            panic!("expected live");
        };
        args
    }

    #[cfg(not(feature = "live"))]
    #[test]
    fn test_live_without_capture_support_fails() {
        let err = run(live_args(&["garin", "live", "-i", "eth0"]), Config::default()).unwrap_err();
        assert!(err.to_string().contains("--features live"));
    }

    #[cfg(feature = "live")]
    #[test]
    fn test_live_without_interface_fails() {
        let err = run(live_args(&["garin", "live"]), Config::default()).unwrap_err();
        assert!(err.to_string().contains("no interface given"));
    }
}
