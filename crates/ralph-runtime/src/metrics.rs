//! Global atomic counters for Ralph Loop observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters. No allocations, no locking.
pub struct Metrics {
    backends_provisioned: AtomicU64,
    backends_cleaned_up: AtomicU64,
    backend_retries: AtomicU64,
    iterations_run: AtomicU64,
    verifications_passed: AtomicU64,
    verifications_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            backends_provisioned: AtomicU64::new(0),
            backends_cleaned_up: AtomicU64::new(0),
            backend_retries: AtomicU64::new(0),
            iterations_run: AtomicU64::new(0),
            verifications_passed: AtomicU64::new(0),
            verifications_failed: AtomicU64::new(0),
        }
    }

    /// A backend finished `initialize()` successfully.
    pub fn inc_backends_provisioned(&self) {
        self.backends_provisioned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "backends_provisioned", "counter incremented");
    }

    /// A backend released its resource.
    pub fn inc_backends_cleaned_up(&self) {
        self.backends_cleaned_up.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "backends_cleaned_up", "counter incremented");
    }

    /// The retry layer scheduled another attempt.
    pub fn inc_backend_retries(&self) {
        self.backend_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "backend_retries", "counter incremented");
    }

    /// One generate/verify cycle completed.
    pub fn inc_iterations(&self) {
        self.iterations_run.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "iterations_run", "counter incremented");
    }

    /// Record a verification outcome.
    pub fn record_verification(&self, passed: bool) {
        if passed {
            self.verifications_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.verifications_failed.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(metric = "verifications", passed, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a run) rather than on every
    /// increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            backends_provisioned = self.backends_provisioned(),
            backends_cleaned_up = self.backends_cleaned_up(),
            backend_retries = self.backend_retries(),
            iterations_run = self.iterations_run(),
            verifications_passed = self.verifications_passed(),
            verifications_failed = self.verifications_failed(),
        );
    }

    pub fn backends_provisioned(&self) -> u64 {
        self.backends_provisioned.load(Ordering::Relaxed)
    }

    pub fn backends_cleaned_up(&self) -> u64 {
        self.backends_cleaned_up.load(Ordering::Relaxed)
    }

    pub fn backend_retries(&self) -> u64 {
        self.backend_retries.load(Ordering::Relaxed)
    }

    pub fn iterations_run(&self) -> u64 {
        self.iterations_run.load(Ordering::Relaxed)
    }

    pub fn verifications_passed(&self) -> u64 {
        self.verifications_passed.load(Ordering::Relaxed)
    }

    pub fn verifications_failed(&self) -> u64 {
        self.verifications_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.backends_provisioned.store(0, Ordering::Relaxed);
        self.backends_cleaned_up.store(0, Ordering::Relaxed);
        self.backend_retries.store(0, Ordering::Relaxed);
        self.iterations_run.store(0, Ordering::Relaxed);
        self.verifications_passed.store(0, Ordering::Relaxed);
        self.verifications_failed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.iterations_run(), 0);
        m.inc_iterations();
        m.inc_iterations();
        assert_eq!(m.iterations_run(), 2);

        m.inc_backend_retries();
        assert_eq!(m.backend_retries(), 1);

        m.record_verification(true);
        m.record_verification(false);
        m.record_verification(false);
        assert_eq!(m.verifications_passed(), 1);
        assert_eq!(m.verifications_failed(), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_backends_provisioned();
        m.inc_backends_cleaned_up();
        m.inc_iterations();
        m.reset();
        assert_eq!(m.backends_provisioned(), 0);
        assert_eq!(m.backends_cleaned_up(), 0);
        assert_eq!(m.iterations_run(), 0);
    }
}
