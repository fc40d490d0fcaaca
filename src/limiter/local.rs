// src/limiter/local.rs

// In-process sliding window, used only while the shared counter store
// is unreachable. Not shared across replicas: under a replica split it
// over-admits at worst by the replica count.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task;
use tokio::time;
use tracing::debug;

/// Per-caller timestamp vectors behind per-key locks.
///
/// The outer map lock is held only to fetch or insert the per-key
/// handle; trimming and counting happen under the key's own lock.
#[derive(Debug)]
pub struct LocalLimiter {
    entries: Mutex<HashMap<String, Arc<Mutex<Vec<u64>>>>>,
    window: Duration,
    sweep_cancel: Arc<AtomicBool>,
}

impl LocalLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            window,
            sweep_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Vec<u64>>> {
        let mut entries = self.entries.lock().unwrap();
        Arc::clone(entries.entry(key.to_string()).or_default())
    }

    /// Trim the window and decide. Returns (allowed, current, reset_ms).
    pub fn check(&self, key: &str, now_ms: u64, window_ms: u64, ceiling: u64) -> (bool, u64, u64) {
        let bucket = self.bucket(key);
        let mut timestamps = bucket.lock().unwrap();

        let cutoff = now_ms.saturating_sub(window_ms);
        timestamps.retain(|&ts| ts > cutoff);

        if timestamps.len() as u64 >= ceiling {
            let oldest = timestamps.first().copied().unwrap_or(now_ms);
            return (false, timestamps.len() as u64, oldest + window_ms);
        }

        timestamps.push(now_ms);
        (true, timestamps.len() as u64, now_ms + window_ms)
    }

    /// Number of callers currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Drop entries whose window has fully drained.
    ///
    /// Buckets are only trimmed on check, so idle callers are trimmed
    /// here before the emptiness test.
    pub fn sweep(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let cutoff = now_ms.saturating_sub(self.window.as_millis() as u64);

        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, bucket| {
            let mut timestamps = bucket.lock().unwrap();
            timestamps.retain(|&ts| ts > cutoff);
            !timestamps.is_empty()
        });
    }

    /// Start the periodic eviction sweep
    pub fn start_sweep(self: &Arc<Self>, interval: Duration) -> task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let cancel = Arc::clone(&self.sweep_cancel);

        task::spawn(async move {
            let mut timer = time::interval(interval);
            timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                limiter.sweep();
            }

            debug!("local limiter sweep stopped");
        })
    }

    /// Stop the eviction sweep
    pub fn stop_sweep(&self) {
        self.sweep_cancel.store(true, Ordering::SeqCst);
    }
}
