use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::queue::RecordingQueue;
use crate::shutdown::ShutdownHandle;
use crate::store::DestinationStore;

/// One worker draining the recording queue into the store. Runs on the
/// blocking pool because every backend does synchronous I/O.
pub struct Recorder {
    id: usize,
    queue: Arc<RecordingQueue>,
    store: Arc<dyn DestinationStore>,
    idle_backoff: Duration,
    draining: Arc<AtomicBool>,
    shutdown: ShutdownHandle,
}

impl Recorder {
    /// Record until `draining` is set and the queue is empty. A storage error
    /// ends the worker and triggers shutdown.
    pub fn run(self) -> Result<u64, StoreError> {
        let mut recorded = 0u64;
        loop {
            // Read the flag before popping: once it is set nothing else is
            // pushed, so an empty pop after it means we are done.
            let draining = self.draining.load(Ordering::SeqCst);
            match self.queue.pop() {
                Some(destination) => {
                    if let Err(e) = self.store.record_destination(&destination) {
                        tracing::error!(
                            worker = self.id,
                            server_name = %destination.server_name,
                            error = %e,
                            "failed to record destination"
                        );
                        self.shutdown.trigger();
                        return Err(e);
                    }
                    recorded += 1;
                    tracing::debug!(
                        worker = self.id,
                        protocol = %destination.protocol,
                        server_name = %destination.server_name,
                        "recorded"
                    );
                }
                None if draining => break,
                None => std::thread::sleep(self.idle_backoff),
            }
        }
        tracing::debug!(worker = self.id, recorded, "recorder stopped");
        Ok(recorded)
    }
}

/// The recorder workers and the flag that tells them to finish.
pub struct RecorderPool {
    draining: Arc<AtomicBool>,
    handles: Vec<JoinHandle<Result<u64, StoreError>>>,
}

impl RecorderPool {
    pub fn spawn(
        workers: usize,
        queue: Arc<RecordingQueue>,
        store: Arc<dyn DestinationStore>,
        idle_backoff: Duration,
        shutdown: ShutdownHandle,
    ) -> Self {
        let draining = Arc::new(AtomicBool::new(false));
        let handles = (0..workers.max(1))
            .map(|id| {
                let recorder = Recorder {
                    id,
                    queue: queue.clone(),
                    store: store.clone(),
                    idle_backoff,
                    draining: draining.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::task::spawn_blocking(move || recorder.run())
            })
            .collect();
        Self { draining, handles }
    }

    /// Let the workers empty the queue, then wait for all of them. Returns the
    /// number of records written, or the first storage error.
    pub async fn finish(self) -> Result<u64, StoreError> {
        self.draining.store(true, Ordering::SeqCst);
        let mut total = 0;
        let mut first_error = None;
        for handle in self.handles {
            match handle.await {
                Ok(Ok(n)) => total += n,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "recorder worker panicked");
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}
