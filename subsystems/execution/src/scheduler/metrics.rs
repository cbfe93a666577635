//! # Scheduler Metrics
//!
//! Counters for scheduler activity.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler metrics
pub struct SchedulerMetrics {
    /// Total context switches
    context_switches: AtomicU64,
    /// Total timer ticks
    ticks: AtomicU64,
    /// Total voluntary yields
    voluntary_yields: AtomicU64,
    /// Total preemptions
    preemptions: AtomicU64,
    /// Times the CPU went idle
    idle_entries: AtomicU64,
    /// Sleeps started
    blocks: AtomicU64,
    /// Sleepers woken by their queue
    wakeups: AtomicU64,
    /// Sleeps ended by a signal or queue teardown
    interrupted_sleeps: AtomicU64,
}

impl SchedulerMetrics {
    /// Create new metrics
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            voluntary_yields: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            idle_entries: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            wakeups: AtomicU64::new(0),
            interrupted_sleeps: AtomicU64::new(0),
        }
    }

    /// Record a context switch
    pub fn record_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a timer tick
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a voluntary yield
    pub fn record_yield(&self) {
        self.voluntary_yields.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a preemption
    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the CPU going idle
    pub fn record_idle(&self) {
        self.idle_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a thread going to sleep
    pub fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sleep ending in a wake
    pub fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sleep ending in an interruption
    pub fn record_interrupted(&self) {
        self.interrupted_sleeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total context switches
    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    /// Get total ticks
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Get voluntary yields
    pub fn voluntary_yields(&self) -> u64 {
        self.voluntary_yields.load(Ordering::Relaxed)
    }

    /// Get preemptions
    pub fn preemptions(&self) -> u64 {
        self.preemptions.load(Ordering::Relaxed)
    }

    /// Get idle entries
    pub fn idle_entries(&self) -> u64 {
        self.idle_entries.load(Ordering::Relaxed)
    }

    /// Get sleeps started
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Get wakeups
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }

    /// Get interrupted sleeps
    pub fn interrupted_sleeps(&self) -> u64 {
        self.interrupted_sleeps.load(Ordering::Relaxed)
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.context_switches.store(0, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Relaxed);
        self.voluntary_yields.store(0, Ordering::Relaxed);
        self.preemptions.store(0, Ordering::Relaxed);
        self.idle_entries.store(0, Ordering::Relaxed);
        self.blocks.store(0, Ordering::Relaxed);
        self.wakeups.store(0, Ordering::Relaxed);
        self.interrupted_sleeps.store(0, Ordering::Relaxed);
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
