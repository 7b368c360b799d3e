use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::Config;
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::ingest::{CaptureSource, CaptureStats};
use crate::models::Segment;
use crate::queue::RecordingQueue;
use crate::reassembly::{Reassembler, ReassemblyStats};
use crate::recorder::RecorderPool;
use crate::shutdown::ShutdownHandle;
use crate::store::DestinationStore;

/// Capture time as seen by the engine: the latest capture timestamp, moved
/// forward by the wall time spent since it arrived. Replayed files and live
/// traffic age connections the same way.
#[derive(Default)]
pub struct CaptureClock {
    latest: Mutex<Option<(DateTime<Utc>, Instant)>>,
}

impl CaptureClock {
    pub fn observe(&self, timestamp: DateTime<Utc>) {
        let mut latest = self.latest.lock();
        match *latest {
            Some((seen, _)) if seen >= timestamp => {}
            _ => *latest = Some((timestamp, Instant::now())),
        }
    }

    pub fn now(&self) -> Option<DateTime<Utc>> {
        let (seen, at) = (*self.latest.lock())?;
        let elapsed = chrono::Duration::from_std(at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        Some(seen + elapsed)
    }
}

/// Completes connections that have been idle for `flush_after` capture time.
#[derive(Clone)]
struct IdleFlusher {
    reassembler: Arc<Mutex<Reassembler>>,
    dispatcher: Dispatcher,
    clock: Arc<CaptureClock>,
    flush_after: chrono::Duration,
}

impl IdleFlusher {
    async fn flush_idle(&self) -> usize {
        let Some(now) = self.clock.now() else { return 0 };
        let completed = self.reassembler.lock().flush_older_than(now - self.flush_after);
        let n = completed.len();
        for stream in completed {
            self.dispatcher.submit(stream).await;
        }
        if n > 0 {
            tracing::debug!(flushed = n, "idle connections flushed");
        }
        n
    }

    async fn run(self, period: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_idle().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunSummary {
    pub capture: CaptureStats,
    pub reassembly: ReassemblyStats,
    pub dispatch: DispatchStats,
    pub recorded: u64,
}

/// Owns every stage of the pipeline for one capture run.
pub struct Engine {
    reassembler: Arc<Mutex<Reassembler>>,
    dispatcher: Dispatcher,
    queue: Arc<RecordingQueue>,
    store: Arc<dyn DestinationStore>,
    clock: Arc<CaptureClock>,
    shutdown: ShutdownHandle,
    store_closed: AtomicBool,
    flush_after: Duration,
    channel_capacity: usize,
    recording_threads: usize,
    idle_backoff: Duration,
}

impl Engine {
    pub fn new(config: &Config, store: Arc<dyn DestinationStore>) -> Self {
        let queue = Arc::new(RecordingQueue::new(config.database.debounce_destinations));
        Self {
            reassembler: Arc::new(Mutex::new(Reassembler::new(config.reassembly_limits()))),
            dispatcher: Dispatcher::new(config.classifier(), config.general.parsing_concurrency, queue.clone()),
            queue,
            store,
            clock: Arc::new(CaptureClock::default()),
            shutdown: ShutdownHandle::new(),
            store_closed: AtomicBool::new(false),
            flush_after: config.capture.flush_after,
            channel_capacity: config.capture.channel_capacity.max(1),
            recording_threads: config.general.recording_threads,
            idle_backoff: config.general.idle_backoff,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let store = config.open_store()?;
        Ok(Self::new(config, store))
    }

    /// Triggering it stops the run; safe to call from signal handlers.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn queue(&self) -> &Arc<RecordingQueue> {
        &self.queue
    }

    /// Feed `source` through the pipeline until it ends or shutdown is
    /// triggered, then drain every stage and close the store.
    pub async fn run<S: CaptureSource>(&self, source: S) -> Result<RunSummary> {
        let flush_after = chrono::Duration::from_std(self.flush_after).context("flush interval out of range")?;
        let flusher = IdleFlusher {
            reassembler: self.reassembler.clone(),
            dispatcher: self.dispatcher.clone(),
            clock: self.clock.clone(),
            flush_after,
        };

        let (flusher_stop, flusher_rx) = watch::channel(false);
        let (sweeper_stop, sweeper_rx) = watch::channel(false);
        let flush_period = (self.flush_after / 2).max(Duration::from_millis(10));
        let flusher_task = tokio::spawn(flusher.clone().run(flush_period, flusher_rx));
        let sweeper_task = tokio::spawn(self.queue.clone().run_sweeper(sweeper_rx));

        let recorders = RecorderPool::spawn(
            self.recording_threads,
            self.queue.clone(),
            self.store.clone(),
            self.idle_backoff,
            self.shutdown.clone(),
        );

        let (tx, mut rx) = mpsc::channel::<Segment>(self.channel_capacity);
        let capture_stop = self.shutdown.clone();
        let capture = tokio::task::spawn_blocking(move || {
            let mut source = source;
            tracing::info!(source = %source.describe(), "capture started");
            source.run(&mut |segment| !capture_stop.is_triggered() && tx.blocking_send(segment).is_ok())
        });

        let mut next_flush: Option<DateTime<Utc>> = None;
        loop {
            let segment = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                segment = rx.recv() => match segment {
                    Some(segment) => segment,
                    None => break,
                },
            };

            self.clock.observe(segment.timestamp);
            let completed = self.reassembler.lock().ingest(segment);
            for stream in completed {
                self.dispatcher.submit(stream).await;
            }

            if let Some(now) = self.clock.now() {
                match next_flush {
                    Some(due) if now < due => {}
                    Some(_) => {
                        flusher.flush_idle().await;
                        next_flush = Some(now + flush_after);
                    }
                    None => next_flush = Some(now + flush_after),
                }
            }
        }

        // Stop admitting: the capture thread sees the flag or a closed channel.
        self.shutdown.trigger();
        drop(rx);
        tracing::info!("shutting down, flushing live connections");

        // The flusher may hold streams it has not submitted yet; let it finish
        // before the final drain.
        let _ = flusher_stop.send(true);
        if let Err(e) = flusher_task.await {
            tracing::warn!(error = %e, "idle flusher ended abnormally");
        }

        let remaining = self.reassembler.lock().flush_all();
        for stream in remaining {
            self.dispatcher.submit(stream).await;
        }
        self.dispatcher.drain().await;

        let released = self.queue.release_pending();
        if released > 0 {
            tracing::debug!(released, "released pending debounced destinations");
        }
        let recorded = recorders.finish().await;

        let _ = sweeper_stop.send(true);
        if let Err(e) = sweeper_task.await {
            tracing::warn!(error = %e, "debounce sweeper ended abnormally");
        }

        self.close_store();

        let capture = capture.await.context("capture thread panicked")?;
        let recorded = recorded.context("recording destination failed")?;
        let capture = capture?;

        let summary = RunSummary {
            capture,
            reassembly: self.reassembler.lock().stats(),
            dispatch: self.dispatcher.stats(),
            recorded,
        };
        tracing::info!(
            packets = summary.capture.packets,
            tcp_segments = summary.capture.tcp_segments,
            streams = summary.reassembly.completed,
            skipped_bytes = summary.reassembly.skipped_bytes,
            destinations = summary.dispatch.destinations,
            recorded = summary.recorded,
            "run complete"
        );
        Ok(summary)
    }

    fn close_store(&self) {
        if self.store_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.store.close() {
            tracing::warn!(backend = self.store.name(), error = %e, "closing store failed");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close_store();
    }
}
