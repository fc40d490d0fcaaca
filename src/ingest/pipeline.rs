// src/ingest/pipeline.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::error::Result;
use crate::flush_event;
use crate::ingest::OverflowBuffer;
use crate::retry::is_transient;
use crate::storage::{ActivityLog, ActivityRecord};

/// Batched write path for activity records.
///
/// `submit` only ever touches the in-memory pending batch; storage work
/// happens in flushes, which are serialized by an async gate so a slow
/// bulk insert cannot interleave with the next one. A full batch
/// triggers a flush at the submitting call; a background timer catches
/// stragglers.
pub struct IngestPipeline {
    pending: Mutex<Vec<ActivityRecord>>,
    flush_gate: tokio::sync::Mutex<()>,
    buffer: Arc<OverflowBuffer>,
    log: Arc<dyn ActivityLog>,
    config: IngestConfig,
    timer_cancel: Arc<AtomicBool>,
    flush_running: AtomicBool,
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("pending", &self.pending.lock().unwrap().len())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl IngestPipeline {
    pub fn new(log: Arc<dyn ActivityLog>, buffer: Arc<OverflowBuffer>, config: IngestConfig) -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(config.batch_size)),
            flush_gate: tokio::sync::Mutex::new(()),
            buffer,
            log,
            config,
            timer_cancel: Arc::new(AtomicBool::new(false)),
            flush_running: AtomicBool::new(false),
        }
    }

    /// Enqueue a record. Never blocks on storage; a full batch spawns a
    /// flush and the call returns immediately.
    pub fn submit(self: &Arc<Self>, record: ActivityRecord) {
        let should_flush = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(record);
            pending.len() >= self.config.batch_size
        };

        if should_flush {
            let pipeline = Arc::clone(self);
            task::spawn(async move {
                if let Err(e) = pipeline.flush().await {
                    warn!(error = %e, "threshold flush failed");
                }
            });
        }
    }

    /// Number of records waiting in the pending batch
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Write the pending batch (and any buffered backlog) to storage.
    ///
    /// Behavior on failure:
    /// - transient error: the batch moves to the overflow buffer
    /// - anything else: the batch is re-queued while the pending queue is
    ///   below the safety cap, otherwise dropped with a log entry
    pub async fn flush(&self) -> Result<()> {
        let _gate = self.flush_gate.lock().await;
        let started = Instant::now();

        // Backlog first, so recovered outages drain in admission order
        if !self.buffer.is_empty() {
            let backlog = self.buffer.flush();
            let count = backlog.len();
            if count > 0 {
                match self.log.bulk_insert(&backlog).await {
                    Ok(()) => info!(count, "overflow backlog drained"),
                    Err(e) => {
                        warn!(count, error = %e, "overflow drain failed, backlog preserved");
                        self.buffer.add_all(backlog);
                    }
                }
            }
        }

        let to_write = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if to_write.is_empty() {
            return Ok(());
        }

        let count = to_write.len();
        match self.log.bulk_insert(&to_write).await {
            Ok(()) => {
                flush_event!(count, self.buffer.len(), started.elapsed().as_millis() as u64);
                Ok(())
            }
            Err(e) if is_transient(&e) => {
                warn!(count, error = %e, "storage unreachable, diverting batch to overflow");
                self.buffer.add_all(to_write);
                Ok(())
            }
            Err(e) => {
                let mut pending = self.pending.lock().unwrap();
                if pending.len() < self.config.pending_cap {
                    // Prepend so original submit order survives the retry
                    let mut merged = to_write;
                    merged.append(&mut pending);
                    *pending = merged;
                    warn!(count, error = %e, "flush failed, batch re-queued");
                } else {
                    error!(
                        count,
                        error = %e,
                        "flush failed with pending queue at capacity, dropping batch"
                    );
                }
                Err(e)
            }
        }
    }

    /// Start the interval flush task
    pub fn start_timer(self: &Arc<Self>) -> task::JoinHandle<()> {
        let pipeline = Arc::clone(self);
        let cancel = Arc::clone(&self.timer_cancel);
        let interval = self.config.batch_interval;

        task::spawn(async move {
            let mut timer = time::interval(interval);
            timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                if pipeline.pending_len() == 0 && pipeline.buffer.is_empty() {
                    continue;
                }

                // Overlapping ticks are dropped, not queued
                if pipeline.flush_running.swap(true, Ordering::SeqCst) {
                    debug!("flush already running, skipping tick");
                    continue;
                }
                if let Err(e) = pipeline.flush().await {
                    warn!(error = %e, "interval flush failed");
                }
                pipeline.flush_running.store(false, Ordering::SeqCst);
            }

            debug!("ingestion flush timer stopped");
        })
    }

    /// Stop the timer, flush what remains, then try the backlog once more
    pub async fn shutdown(&self) {
        self.timer_cancel.store(true, Ordering::SeqCst);

        if let Err(e) = self.flush().await {
            warn!(error = %e, "final flush failed during shutdown");
        }

        if !self.buffer.is_empty() {
            let backlog = self.buffer.flush();
            let count = backlog.len();
            if let Err(e) = self.log.bulk_insert(&backlog).await {
                error!(count, error = %e, "shutdown could not drain overflow backlog");
            } else {
                info!(count, "overflow backlog drained during shutdown");
            }
        }

        self.buffer.stop_cleanup();
    }
}
