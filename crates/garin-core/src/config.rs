use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::dispatch::{OverlapPolicy, PortClassifier};
use crate::reassembly::ReassemblyLimits;
use crate::store::{self, DestinationStore, NullStore, StoreKind};

/// Top-level configuration, read from YAML. Every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub general: GeneralConfig,
    pub capture: CaptureConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// Parses allowed to run at once.
    pub parsing_concurrency: usize,
    /// Workers writing destinations to the store.
    pub recording_threads: usize,
    /// Parse and log, but record nothing.
    pub dont_record_destinations: bool,
    /// How long an idle recorder sleeps before polling again.
    #[serde(with = "humantime_serde")]
    pub idle_backoff: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            parsing_concurrency: 4,
            recording_threads: 2,
            dont_record_destinations: false,
            idle_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    pub snaplen: i32,
    /// BPF filter for live capture. Built from the port sets when absent.
    pub filter: Option<String>,
    pub unencrypted_ports: Vec<u16>,
    pub encrypted_ports: Vec<u16>,
    pub overlap: OverlapPolicy,
    /// Out-of-order segments buffered per connection. 0 = unlimited.
    pub buffered_per_connection: usize,
    pub buffered_bytes_per_connection: usize,
    /// Out-of-order segments buffered across all connections. 0 = unlimited.
    pub total_max_buffer: usize,
    pub total_max_buffer_bytes: usize,
    pub max_stream_bytes: usize,
    /// Idle time after which a connection is flushed.
    #[serde(with = "humantime_serde")]
    pub flush_after: Duration,
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            snaplen: 65536,
            filter: None,
            unencrypted_ports: vec![80],
            encrypted_ports: vec![443],
            overlap: OverlapPolicy::Both,
            buffered_per_connection: 0,
            buffered_bytes_per_connection: 0,
            total_max_buffer: 0,
            total_max_buffer_bytes: 0,
            max_stream_bytes: 256 * 1024,
            flush_after: Duration::from_secs(120),
            channel_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: StoreKind,
    /// Backend location: the SQLite file or the JSON-lines file.
    pub args: PathBuf,
    /// Quiet period before a repeated destination is recorded. 0 disables.
    #[serde(with = "humantime_serde")]
    pub debounce_destinations: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Sql,
            args: PathBuf::from("garin.sqlite3"),
            debounce_destinations: Duration::from_secs(20),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.parsing_concurrency == 0 {
            bail!("general.parsing_concurrency must be at least 1");
        }
        if self.general.parsing_concurrency > u32::MAX as usize {
            bail!("general.parsing_concurrency is too large");
        }
        if self.general.recording_threads == 0 {
            bail!("general.recording_threads must be at least 1");
        }
        if self.capture.unencrypted_ports.is_empty() && self.capture.encrypted_ports.is_empty() {
            bail!("capture.unencrypted_ports and capture.encrypted_ports are both empty");
        }
        if self.capture.flush_after.is_zero() {
            bail!("capture.flush_after must be greater than zero");
        }
        if self.capture.channel_capacity == 0 {
            bail!("capture.channel_capacity must be at least 1");
        }
        if self.capture.snaplen <= 0 {
            bail!("capture.snaplen must be positive");
        }
        Ok(())
    }

    pub fn reassembly_limits(&self) -> ReassemblyLimits {
        ReassemblyLimits {
            max_buffered_segments_per_connection: self.capture.buffered_per_connection,
            max_buffered_bytes_per_connection: self.capture.buffered_bytes_per_connection,
            max_buffered_segments_total: self.capture.total_max_buffer,
            max_buffered_bytes_total: self.capture.total_max_buffer_bytes,
            max_stream_bytes: self.capture.max_stream_bytes,
        }
    }

    pub fn classifier(&self) -> PortClassifier {
        PortClassifier::new(
            self.capture.unencrypted_ports.iter().copied(),
            self.capture.encrypted_ports.iter().copied(),
            self.capture.overlap,
        )
    }

    /// The configured filter, or one matching every sniffed port.
    pub fn capture_filter(&self) -> String {
        if let Some(filter) = self.capture.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            return filter.to_string();
        }
        self.classifier()
            .ports()
            .iter()
            .map(|p| format!("tcp port {p}"))
            .collect::<Vec<_>>()
            .join(" or ")
    }

    pub fn open_store(&self) -> Result<Arc<dyn DestinationStore>> {
        if self.general.dont_record_destinations {
            tracing::info!("recording disabled, destinations are only logged");
            return Ok(Arc::new(NullStore));
        }
        let store = store::open(self.database.kind, &self.database.args).with_context(|| {
            format!(
                "cannot open {} store at {}",
                self.database.kind,
                self.database.args.display()
            )
        })?;
        Ok(Arc::from(store))
    }
}
