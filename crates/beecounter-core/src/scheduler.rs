//! Cooperative scheduler.
//!
//! The main loop is a fixed list of [`PeriodicTask`]s. Each pass runs every
//! task whose period has elapsed, feeding the [`Watchdog`] after each one,
//! so no handler code ever touches the watchdog directly. Tasks must return
//! within a bounded slice; anything long-running belongs on its own thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::collection::Collector;
use crate::config::{MAX_PERFORMANCE_INTERVAL_MS, MIN_PERFORMANCE_INTERVAL_MS};
use crate::error::DeviceError;
use crate::events::{DeviceEvent, Notifier, SystemMonitor};
use crate::storage::ImageStore;

/// Hardware (or software) watchdog.
pub trait Watchdog: Send + Sync {
    fn feed(&self);
}

/// Watchdog that only records when it was last fed. The host binary polls
/// it to report a stalled scheduler.
pub struct SoftwareWatchdog {
    clock: Arc<dyn Clock>,
    last_feed_ms: AtomicU64,
}

impl SoftwareWatchdog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.uptime_ms();
        Self {
            clock,
            last_feed_ms: AtomicU64::new(now),
        }
    }

    pub fn since_last_feed_ms(&self) -> u64 {
        self.clock
            .uptime_ms()
            .saturating_sub(self.last_feed_ms.load(Ordering::SeqCst))
    }

    pub fn is_starved(&self, timeout_ms: u64) -> bool {
        self.since_last_feed_ms() >= timeout_ms
    }
}

impl Watchdog for SoftwareWatchdog {
    fn feed(&self) {
        self.last_feed_ms
            .store(self.clock.uptime_ms(), Ordering::SeqCst);
    }
}

pub trait PeriodicTask: Send {
    fn name(&self) -> &'static str;

    /// Minimum time between runs; 0 runs the task on every pass.
    fn period_ms(&self) -> u64;

    fn run(&mut self, now_ms: u64);
}

struct Slot {
    task: Box<dyn PeriodicTask>,
    last_run_ms: Option<u64>,
}

pub struct Scheduler {
    slots: Vec<Slot>,
    clock: Arc<dyn Clock>,
    watchdog: Arc<dyn Watchdog>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, watchdog: Arc<dyn Watchdog>) -> Self {
        Self {
            slots: Vec::new(),
            clock,
            watchdog,
        }
    }

    pub fn add(&mut self, task: impl PeriodicTask + 'static) -> &mut Self {
        debug!(task = task.name(), period_ms = task.period_ms(), "task registered");
        self.slots.push(Slot {
            task: Box::new(task),
            last_run_ms: None,
        });
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.task.name()).collect()
    }

    /// Run one pass. Returns how many tasks ran.
    pub fn run_pass(&mut self) -> usize {
        self.watchdog.feed();
        let mut ran = 0;
        for slot in &mut self.slots {
            let now = self.clock.uptime_ms();
            let period = slot.task.period_ms();
            let due = match slot.last_run_ms {
                None => true,
                Some(last) => now.saturating_sub(last) >= period,
            };
            if !due {
                continue;
            }
            trace!(task = slot.task.name(), "running task");
            slot.task.run(now);
            slot.last_run_ms = Some(now);
            self.watchdog.feed();
            ran += 1;
        }
        ran
    }

    /// Run passes until `shutdown` is set, sleeping `pass_delay` in between.
    pub fn run_until(&mut self, shutdown: &AtomicBool, pass_delay: Duration) {
        info!(tasks = ?self.task_names(), "scheduler running");
        while !shutdown.load(Ordering::SeqCst) {
            self.run_pass();
            std::thread::sleep(pass_delay);
        }
        info!("scheduler stopped");
    }
}

/// Drives the collection job on every pass.
pub struct CollectionTask {
    collector: Arc<Collector>,
}

impl CollectionTask {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self { collector }
    }
}

impl PeriodicTask for CollectionTask {
    fn name(&self) -> &'static str {
        "collection"
    }

    fn period_ms(&self) -> u64 {
        0
    }

    fn run(&mut self, _now_ms: u64) {
        if let Err(e) = self.collector.tick() {
            warn!(error = %e, "collection tick failed");
        }
    }
}

/// Shared, adjustable interval for performance updates.
#[derive(Clone)]
pub struct RefreshRate(Arc<AtomicU64>);

impl RefreshRate {
    pub fn new(ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(
            ms.clamp(MIN_PERFORMANCE_INTERVAL_MS, MAX_PERFORMANCE_INTERVAL_MS),
        )))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, ms: u64) -> Result<(), DeviceError> {
        if !(MIN_PERFORMANCE_INTERVAL_MS..=MAX_PERFORMANCE_INTERVAL_MS).contains(&ms) {
            return Err(DeviceError::Validation(format!(
                "rate must be between {} and {} ms",
                MIN_PERFORMANCE_INTERVAL_MS, MAX_PERFORMANCE_INTERVAL_MS
            )));
        }
        self.0.store(ms, Ordering::SeqCst);
        info!(interval_ms = ms, "performance update interval changed");
        Ok(())
    }
}

/// Pushes `performance_update` events.
pub struct PerformanceReporter {
    monitor: Arc<dyn SystemMonitor>,
    notifier: Arc<dyn Notifier>,
    rate: RefreshRate,
}

impl PerformanceReporter {
    pub fn new(monitor: Arc<dyn SystemMonitor>, notifier: Arc<dyn Notifier>, rate: RefreshRate) -> Self {
        Self {
            monitor,
            notifier,
            rate,
        }
    }
}

impl PeriodicTask for PerformanceReporter {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn period_ms(&self) -> u64 {
        self.rate.get()
    }

    fn run(&mut self, _now_ms: u64) {
        self.notifier
            .notify(DeviceEvent::PerformanceUpdate(self.monitor.snapshot()));
    }
}

/// Heap usage above which the health check warns.
const HEAP_PRESSURE_PERCENT: f64 = 80.0;

/// Short health line every 10 seconds.
pub struct HealthCheck {
    monitor: Arc<dyn SystemMonitor>,
    period_ms: u64,
}

impl HealthCheck {
    pub fn new(monitor: Arc<dyn SystemMonitor>, period_ms: u64) -> Self {
        Self { monitor, period_ms }
    }
}

impl PeriodicTask for HealthCheck {
    fn name(&self) -> &'static str {
        "health"
    }

    fn period_ms(&self) -> u64 {
        self.period_ms
    }

    fn run(&mut self, now_ms: u64) {
        let s = self.monitor.snapshot();
        let heap_pct = if s.heap_total > 0 {
            s.heap_used as f64 * 100.0 / s.heap_total as f64
        } else {
            0.0
        };
        info!(
            uptime_s = now_ms / 1000,
            heap_used = s.heap_used,
            heap_total = s.heap_total,
            rssi = ?s.wifi_rssi,
            "health"
        );
        if heap_pct > HEAP_PRESSURE_PERCENT {
            warn!(heap_pct = %format!("{:.1}", heap_pct), "memory pressure");
        }
    }
}

/// Detailed status every 2 minutes.
pub struct StatusLog {
    collector: Arc<Collector>,
    images: Arc<ImageStore>,
    period_ms: u64,
}

impl StatusLog {
    pub fn new(collector: Arc<Collector>, images: Arc<ImageStore>, period_ms: u64) -> Self {
        Self {
            collector,
            images,
            period_ms,
        }
    }
}

impl PeriodicTask for StatusLog {
    fn name(&self) -> &'static str {
        "status"
    }

    fn period_ms(&self) -> u64 {
        self.period_ms
    }

    fn run(&mut self, now_ms: u64) {
        let usage = self.images.usage().unwrap_or_default();
        match self.collector.snapshot() {
            Ok(job) => info!(
                uptime_min = now_ms / 60_000,
                images = usage.images,
                image_bytes = usage.bytes,
                collecting = job.active,
                collected = job.collected,
                target = job.target,
                "status"
            ),
            Err(e) => warn!(error = %e, "status unavailable"),
        }
    }
}
