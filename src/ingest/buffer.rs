// src/ingest/buffer.rs

// Bounded holding area for records the durable store could not take.
// Insertion must stay O(1) and never block an ingesting caller.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task;
use tokio::time;
use tracing::{debug, warn};

use crate::storage::ActivityRecord;

/// An activity record plus the moment it entered the buffer
#[derive(Debug, Clone)]
struct OverflowEntry {
    record: ActivityRecord,
    admitted_at: Instant,
}

/// Bounded FIFO that absorbs records during storage outages.
///
/// When full the oldest entry is dropped; entries past `max_age` are
/// removed by a periodic cleanup task.
#[derive(Debug)]
pub struct OverflowBuffer {
    entries: Mutex<VecDeque<OverflowEntry>>,
    max_size: usize,
    max_age: Duration,
    cleanup_cancel: Arc<AtomicBool>,
}

impl OverflowBuffer {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_size,
            max_age,
            cleanup_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append a record, evicting the oldest when over capacity
    pub fn add(&self, record: ActivityRecord) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(OverflowEntry {
            record,
            admitted_at: Instant::now(),
        });

        if entries.len() > self.max_size {
            entries.pop_front();
            warn!(
                max_size = self.max_size,
                "overflow buffer full, dropped oldest record"
            );
        }
    }

    /// Append a batch in order, applying the same eviction rule
    pub fn add_all(&self, records: Vec<ActivityRecord>) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        for record in records {
            entries.push_back(OverflowEntry {
                record,
                admitted_at: now,
            });
        }

        let overflow = entries.len().saturating_sub(self.max_size);
        if overflow > 0 {
            entries.drain(..overflow);
            warn!(dropped = overflow, "overflow buffer full, dropped oldest records");
        }
    }

    /// Atomically remove and return everything, oldest first
    pub fn flush(&self) -> Vec<ActivityRecord> {
        let mut entries = self.entries.lock().unwrap();
        entries.drain(..).map(|entry| entry.record).collect()
    }

    /// Remove entries older than `max_age`
    pub fn cleanup(&self) {
        let cutoff = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| cutoff.duration_since(entry.admitted_at) <= self.max_age);

        let removed = before - entries.len();
        if removed > 0 {
            warn!(removed, "overflow buffer dropped aged-out records");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Start the periodic cleanup task
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) -> task::JoinHandle<()> {
        let buffer = Arc::clone(self);
        let cancel = Arc::clone(&self.cleanup_cancel);

        task::spawn(async move {
            let mut timer = time::interval(interval);
            timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                buffer.cleanup();
            }

            debug!("overflow cleanup task stopped");
        })
    }

    /// Stop the cleanup task
    pub fn stop_cleanup(&self) {
        self.cleanup_cancel.store(true, Ordering::SeqCst);
    }
}
