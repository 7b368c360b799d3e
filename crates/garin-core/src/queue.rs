use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::models::Destination;

struct DebouncedRecording {
    last_update: Instant,
    destination: Destination,
}

/// Two-stage output queue between the parsers and the recorders.
///
/// With a zero threshold every destination goes straight to the immediate
/// queue. Otherwise repeated observations of the same fingerprint are folded
/// into one pending entry, which a sweep releases to the debounced queue once
/// the fingerprint has been quiet for at least the threshold.
pub struct RecordingQueue {
    threshold: Duration,
    immediate: Mutex<VecDeque<Destination>>,
    debounced: Mutex<VecDeque<Destination>>,
    pending: Mutex<HashMap<String, DebouncedRecording>>,
}

impl RecordingQueue {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            immediate: Mutex::new(VecDeque::new()),
            debounced: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_debouncing(&self) -> bool {
        !self.threshold.is_zero()
    }

    pub fn push(&self, destination: Destination) {
        self.push_at(destination, Instant::now());
    }

    pub fn push_at(&self, destination: Destination, now: Instant) {
        if !self.is_debouncing() {
            self.immediate.lock().push_back(destination);
            return;
        }

        let fingerprint = destination.fingerprint();
        let mut pending = self.pending.lock();
        match pending.get_mut(&fingerprint) {
            Some(entry) => {
                entry.last_update = now;
                entry.destination = destination;
            }
            None => {
                pending.insert(
                    fingerprint,
                    DebouncedRecording {
                        last_update: now,
                        destination,
                    },
                );
            }
        }
    }

    /// Release every pending entry quiet for at least the threshold. Returns
    /// how many were released.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let threshold = self.threshold;
        self.release_where(|entry| now.saturating_duration_since(entry.last_update) >= threshold)
    }

    /// Release everything still pending, whatever its age. Used at shutdown.
    pub fn release_pending(&self) -> usize {
        self.release_where(|_| true)
    }

    fn release_where(&self, ready: impl Fn(&DebouncedRecording) -> bool) -> usize {
        let mut pending = self.pending.lock();
        let mut due: Vec<(Instant, String)> = pending
            .iter()
            .filter(|(_, entry)| ready(entry))
            .map(|(fp, entry)| (entry.last_update, fp.clone()))
            .collect();
        if due.is_empty() {
            return 0;
        }
        due.sort();

        // Keep the pending lock until the entries are visible in the output
        // queue so a concurrent `is_empty` never misses them.
        let mut debounced = self.debounced.lock();
        for (_, fp) in &due {
            if let Some(entry) = pending.remove(fp) {
                debounced.push_back(entry.destination);
            }
        }
        due.len()
    }

    /// Immediate queue first, then debounced.
    pub fn pop(&self) -> Option<Destination> {
        if let Some(d) = self.immediate.lock().pop_front() {
            return Some(d);
        }
        self.debounced.lock().pop_front()
    }

    /// Both output queues are empty. Pending entries do not count.
    pub fn is_empty(&self) -> bool {
        self.immediate.lock().is_empty() && self.debounced.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.immediate.lock().len() + self.debounced.lock().len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Periodic sweep every half threshold until shutdown is signalled.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.is_debouncing() {
            return;
        }
        let period = (self.threshold / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let released = self.sweep();
                    if released > 0 {
                        tracing::debug!(released, pending = self.pending_len(), "debounce sweep");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
