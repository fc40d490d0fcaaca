// src/analytics/prewarm.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task;
use tokio::time;
use tracing::{debug, info, warn};

use crate::analytics::{AnalyticsService, HitTracker};
use crate::config::PrewarmConfig;

/// The aggregates worth having warm regardless of telemetry
const STATIC_SET: [PrewarmTarget; 5] = [
    PrewarmTarget::Daily(7),
    PrewarmTarget::Daily(30),
    PrewarmTarget::Top(24, 3),
    PrewarmTarget::Top(24, 10),
    PrewarmTarget::Top(168, 10),
];

/// A parsed pre-warm work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrewarmTarget {
    Daily(u32),
    Top(u32, u32),
}

/// Parse a cache fingerprint back into its query arguments.
///
/// `usage:daily:<int>` and `usage:top:<int>:<int>` are the only shapes
/// the warmer understands; anything else is skipped.
pub fn parse_fingerprint(fingerprint: &str) -> Option<PrewarmTarget> {
    let parts: Vec<&str> = fingerprint.split(':').collect();
    match parts.as_slice() {
        ["usage", "daily", days] => days.parse().ok().map(PrewarmTarget::Daily),
        ["usage", "top", hours, limit] => match (hours.parse(), limit.parse()) {
            (Ok(hours), Ok(limit)) => Some(PrewarmTarget::Top(hours, limit)),
            _ => None,
        },
        _ => None,
    }
}

/// Keeps hot analytics keys warm: once at startup and on a fixed cadence
/// driven by the hit tracker's telemetry.
pub struct Prewarmer {
    analytics: Arc<AnalyticsService>,
    hits: Arc<HitTracker>,
    config: PrewarmConfig,
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for Prewarmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prewarmer")
            .field("on_startup", &self.config.on_startup)
            .field("cron_enabled", &self.config.cron_enabled)
            .finish()
    }
}

impl Prewarmer {
    pub fn new(
        analytics: Arc<AnalyticsService>,
        hits: Arc<HitTracker>,
        config: PrewarmConfig,
    ) -> Self {
        Self {
            analytics,
            hits,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn warm(&self, target: PrewarmTarget) {
        let result = match target {
            PrewarmTarget::Daily(days) => self.analytics.prewarm_daily(days).await,
            PrewarmTarget::Top(hours, limit) => self.analytics.prewarm_top(hours, limit).await,
        };

        if let Err(e) = result {
            // Failures never abort a cycle
            warn!(?target, error = %e, "prewarm failed");
        }
    }

    /// Warm the static set once; called at startup when enabled
    pub async fn run_startup(&self) {
        if !self.config.on_startup {
            return;
        }

        info!("startup cache prewarm");
        for target in STATIC_SET {
            self.warm(target).await;
        }
    }

    /// One scheduled cycle: telemetry-driven keys first, then the static set
    pub async fn run_cycle(&self) {
        let hot = self.hits.hot_keys().await;
        debug!(count = hot.len(), "prewarm cycle");

        for fingerprint in hot {
            match parse_fingerprint(&fingerprint) {
                Some(target) => self.warm(target).await,
                None => debug!(%fingerprint, "skipping unrecognized fingerprint"),
            }
        }

        for target in STATIC_SET {
            self.warm(target).await;
        }
    }

    /// Start the scheduled pre-warm task
    pub fn start(self: &Arc<Self>) -> Option<task::JoinHandle<()>> {
        if !self.config.cron_enabled {
            return None;
        }

        let warmer = Arc::clone(self);
        let cancel = Arc::clone(&self.cancel);
        let running = Arc::clone(&self.running);
        let interval = self.config.interval;

        Some(task::spawn(async move {
            let mut timer = time::interval(interval);
            timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick fires immediately; startup warming already
            // covered that
            timer.tick().await;

            loop {
                timer.tick().await;
                if cancel.load(Ordering::SeqCst) {
                    break;
                }

                // Overlapping ticks are dropped
                if running.swap(true, Ordering::SeqCst) {
                    debug!("prewarm cycle still running, skipping tick");
                    continue;
                }
                warmer.run_cycle().await;
                running.store(false, Ordering::SeqCst);
            }

            debug!("prewarm scheduler stopped");
        }))
    }

    /// Stop the scheduler; an in-flight cycle finishes naturally
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}
