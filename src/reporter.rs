use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{BatchReport, FarmSummary};

/// Running counters, shared by the dispatcher and the watch loop.
#[derive(Debug, Default)]
pub struct FarmStats {
    batches: AtomicU64,
    minutes_watched: AtomicU64,
    watch_failures: AtomicU64,
    claims: AtomicU64,
    claim_failures: AtomicU64,
    points_earned: AtomicU64,
}

impl FarmStats {
    pub fn record_batch(&self, report: &BatchReport) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.minutes_watched
            .fetch_add(report.succeeded as u64, Ordering::Relaxed);
        self.watch_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    pub fn record_claim(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.claims
        } else {
            &self.claim_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Negative gains (refunds, corrections) are not counted.
    pub fn record_points(&self, gained: i64) {
        if let Ok(gained) = u64::try_from(gained) {
            self.points_earned.fetch_add(gained, Ordering::Relaxed);
        }
    }

    /// Snapshot the counters; `reconnects` comes from the feeds.
    pub fn summary(&self, reconnects: u64) -> FarmSummary {
        FarmSummary {
            batches: self.batches.load(Ordering::Relaxed),
            minutes_watched: self.minutes_watched.load(Ordering::Relaxed),
            watch_failures: self.watch_failures.load(Ordering::Relaxed),
            claims: self.claims.load(Ordering::Relaxed),
            claim_failures: self.claim_failures.load(Ordering::Relaxed),
            points_earned: self.points_earned.load(Ordering::Relaxed),
            reconnects,
        }
    }
}

/// Emit a batch report as a single JSON line to stdout.
pub fn report_batch(report: &BatchReport) {
    if let Ok(json) = serde_json::to_string(report) {
        println!("{json}");
    }
}

/// Emit the exit summary as pretty-printed JSON to stdout.
pub fn report_exit_summary(summary: &FarmSummary) {
    if let Ok(json) = serde_json::to_string_pretty(summary) {
        println!("{json}");
    }
}
