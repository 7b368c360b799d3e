use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::models::{CompletedStream, Destination, FlowKey};
use crate::protocols::{HttpSniffer, Sniffer, TlsSniffer};
use crate::queue::RecordingQueue;

/// What to do with a flow whose ports are in both sets.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Try both parsers.
    #[default]
    Both,
    Plaintext,
    Encrypted,
}

/// Which parsers a flow is handed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Route {
    pub plaintext: bool,
    pub encrypted: bool,
}

impl Route {
    pub fn is_empty(&self) -> bool {
        !self.plaintext && !self.encrypted
    }
}

#[derive(Debug, Clone)]
pub struct PortClassifier {
    plaintext: HashSet<u16>,
    encrypted: HashSet<u16>,
    overlap: OverlapPolicy,
}

impl PortClassifier {
    pub fn new(
        plaintext: impl IntoIterator<Item = u16>,
        encrypted: impl IntoIterator<Item = u16>,
        overlap: OverlapPolicy,
    ) -> Self {
        Self {
            plaintext: plaintext.into_iter().collect(),
            encrypted: encrypted.into_iter().collect(),
            overlap,
        }
    }

    pub fn route(&self, key: &FlowKey) -> Route {
        let matches = |set: &HashSet<u16>| set.contains(&key.src_port) || set.contains(&key.dst_port);
        let plaintext = matches(&self.plaintext);
        let encrypted = matches(&self.encrypted);

        match (plaintext, encrypted, self.overlap) {
            (true, true, OverlapPolicy::Plaintext) => Route { plaintext: true, encrypted: false },
            (true, true, OverlapPolicy::Encrypted) => Route { plaintext: false, encrypted: true },
            _ => Route { plaintext, encrypted },
        }
    }

    /// Every port either parser listens on, for building capture filters.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.plaintext.union(&self.encrypted).copied().collect();
        ports.sort_unstable();
        ports
    }
}

/// Point a destination at the client. A stream whose source port is a
/// service port and whose destination port is not is the server's half.
fn orient(mut dest: Destination, key: &FlowKey, service_ports: &HashSet<u16>) -> Destination {
    if service_ports.contains(&key.src_port) && !service_ports.contains(&key.dst_port) {
        dest.source_ip = key.dst_ip;
        if dest.destination_ip.is_some() {
            dest.destination_ip = Some(key.src_ip);
        }
    }
    dest
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub submitted: u64,
    pub parsed: u64,
    pub destinations: u64,
    pub misses: u64,
    pub failures: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    parsed: AtomicU64,
    destinations: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

/// Tracks one running parse. Dropping it during a panic counts a failure.
struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        if std::thread::panicking() {
            self.0.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("parser panicked, stream dropped");
        }
    }
}

struct Shared {
    classifier: PortClassifier,
    http: Arc<dyn Sniffer>,
    tls: Arc<dyn Sniffer>,
    queue: Arc<RecordingQueue>,
    counters: Counters,
}

/// Bounded-concurrency fan-out of completed streams to the parsers.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    limit: u32,
}

impl Dispatcher {
    pub fn new(classifier: PortClassifier, concurrency: usize, queue: Arc<RecordingQueue>) -> Self {
        Self::with_sniffers(
            classifier,
            concurrency,
            queue,
            Arc::new(HttpSniffer),
            Arc::new(TlsSniffer),
        )
    }

    pub fn with_sniffers(
        classifier: PortClassifier,
        concurrency: usize,
        queue: Arc<RecordingQueue>,
        http: Arc<dyn Sniffer>,
        tls: Arc<dyn Sniffer>,
    ) -> Self {
        let limit = concurrency.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)) as u32;
        Self {
            shared: Arc::new(Shared {
                classifier,
                http,
                tls,
                queue,
                counters: Counters::default(),
            }),
            permits: Arc::new(Semaphore::new(limit as usize)),
            limit,
        }
    }

    /// Hand a stream to its parsers. Waits for a free slot when the budget is
    /// spent; returns once the parse has been started. Streams that match no
    /// port or carry no bytes are dropped here.
    pub async fn submit(&self, stream: CompletedStream) {
        let route = self.shared.classifier.route(&stream.key);
        if route.is_empty() || stream.payload.is_empty() {
            tracing::trace!(flow = %stream.key, "stream not routed");
            return;
        }

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(flow = %stream.key, "dispatcher closed, dropping stream");
                return;
            }
        };
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _guard = InFlight::enter(&shared.counters);
            shared.process(&stream, route);
        });
    }

    /// Wait until every started parse has finished.
    pub async fn drain(&self) {
        if let Ok(all) = self.permits.acquire_many(self.limit).await {
            drop(all);
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.shared.counters;
        DispatchStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            parsed: c.parsed.load(Ordering::Relaxed),
            destinations: c.destinations.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            peak_in_flight: c.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

impl Shared {
    fn process(&self, stream: &CompletedStream, route: Route) {
        let mut sniffers: Vec<(&dyn Sniffer, &HashSet<u16>)> = Vec::with_capacity(2);
        if route.plaintext {
            sniffers.push((self.http.as_ref(), &self.classifier.plaintext));
        }
        if route.encrypted {
            sniffers.push((self.tls.as_ref(), &self.classifier.encrypted));
        }

        for (sniffer, ports) in sniffers {
            let protocol = sniffer.protocol();
            match sniffer.sniff(stream) {
                Ok(Some(dest)) => {
                    let dest = orient(dest, &stream.key, ports);
                    tracing::info!(
                        protocol = %dest.protocol,
                        server_name = %dest.server_name,
                        source = %dest.source_ip,
                        destination = ?dest.destination_ip,
                        "destination"
                    );
                    self.counters.destinations.fetch_add(1, Ordering::Relaxed);
                    self.queue.push(dest);
                }
                Ok(None) => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(flow = %stream.key, %protocol, "no destination");
                }
                Err(e) if e.is_benign() => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(flow = %stream.key, %protocol, error = %e, "parse failed");
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(flow = %stream.key, %protocol, error = %e, "parse failed");
                }
            }
        }
        self.counters.parsed.fetch_add(1, Ordering::Relaxed);
    }
}
