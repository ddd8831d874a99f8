//! CPU utilisation from scheduler run-time counters.
//!
//! The monitor keeps a short history of `(total, busy, tick)` samples. Slots
//! 0 and 1 always hold the two most recent raw samples; everything from slot
//! 2 on is decimated to at most one sample per second, however often
//! [`CpuLoadMonitor::update`] is called.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub const CPU_LOAD_HISTORY_DEPTH: usize = 8;

const DECIMATION_MS: u32 = 1000;

/// Source of cumulative run-time counters.
pub trait RunTimeCounters: Send + Sync {
    /// Run time since boot, in counter units.
    fn total(&self) -> u64;
    /// Time spent in the idle task, same units as [`total`](Self::total).
    fn idle(&self) -> u64;
    /// Millisecond tick.
    fn tick_ms(&self) -> u32;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadSample {
    pub total: u64,
    pub busy: u64,
    pub tick_ms: u32,
}

/// Load percentages over three windows; `None` when the window is empty.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuLoadInfo {
    pub last: Option<f32>,
    pub last_second: Option<f32>,
    pub last_five_seconds: Option<f32>,
}

#[derive(Debug, Default)]
pub struct CpuLoadMonitor {
    history: [LoadSample; CPU_LOAD_HISTORY_DEPTH],
}

impl CpuLoadMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[LoadSample; CPU_LOAD_HISTORY_DEPTH] {
        &self.history
    }

    pub fn update(&mut self, counters: &dyn RunTimeCounters) {
        let total = counters.total();
        self.push(LoadSample {
            total,
            busy: total.saturating_sub(counters.idle()),
            tick_ms: counters.tick_ms(),
        });
    }

    pub fn push(&mut self, sample: LoadSample) {
        let h = &mut self.history;
        h[1] = h[0];
        h[0] = sample;
        if h[1].tick_ms.wrapping_sub(h[2].tick_ms) < DECIMATION_MS {
            return;
        }
        for i in 0..CPU_LOAD_HISTORY_DEPTH - 2 {
            h[CPU_LOAD_HISTORY_DEPTH - 1 - i] = h[CPU_LOAD_HISTORY_DEPTH - 2 - i];
        }
    }

    fn load(&self, newer: usize, older: usize) -> Option<f32> {
        let (a, b) = (&self.history[newer], &self.history[older]);
        let total = a.total.wrapping_sub(b.total);
        if total == 0 {
            return None;
        }
        let busy = a.busy.wrapping_sub(b.busy);
        Some((100.0 * busy as f64 / total as f64).clamp(0.0, 100.0) as f32)
    }

    pub fn get_info(&self) -> CpuLoadInfo {
        CpuLoadInfo {
            last: self.load(0, 1),
            last_second: self.load(2, 3),
            last_five_seconds: self.load(2, 7),
        }
    }
}

/// Hosted run-time counters: wall-clock microseconds since creation, with
/// busy time accumulated by the stages around their CPU work.
#[derive(Debug)]
pub struct TaskRunTime {
    start: Instant,
    busy_us: AtomicU64,
}

impl Default for TaskRunTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunTime {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            busy_us: AtomicU64::new(0),
        }
    }

    /// Count the lifetime of the returned guard as busy time.
    pub fn busy(&self) -> BusyScope<'_> {
        BusyScope {
            owner: self,
            since: Instant::now(),
        }
    }

    pub fn add_busy_us(&self, us: u64) {
        self.busy_us.fetch_add(us, Ordering::Relaxed);
    }
}

impl RunTimeCounters for TaskRunTime {
    fn total(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn idle(&self) -> u64 {
        self.total().saturating_sub(self.busy_us.load(Ordering::Relaxed))
    }

    fn tick_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

pub struct BusyScope<'a> {
    owner: &'a TaskRunTime,
    since: Instant,
}

impl Drop for BusyScope<'_> {
    fn drop(&mut self) {
        self.owner.add_busy_us(self.since.elapsed().as_micros() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Scripted counters: each call to `tick_ms` reads the current cell value.
    struct Fake {
        total: Cell<u64>,
        idle: Cell<u64>,
        tick: Cell<u32>,
    }

    // Single-threaded test double.
    unsafe impl Sync for Fake {}

    impl RunTimeCounters for Fake {
        fn total(&self) -> u64 {
            self.total.get()
        }
        fn idle(&self) -> u64 {
            self.idle.get()
        }
        fn tick_ms(&self) -> u32 {
            self.tick.get()
        }
    }

    fn sample(total: u64, busy: u64, tick_ms: u32) -> LoadSample {
        LoadSample {
            total,
            busy,
            tick_ms,
        }
    }

    #[test]
    fn decimated_history_is_a_second_apart() {
        let mut mon = CpuLoadMonitor::new();
        // 50 samples per second for 10 seconds.
        for i in 1..=500u32 {
            let t = i * 20;
            mon.push(sample(u64::from(t) * 10, u64::from(t) * 5, t));
        }
        let h = mon.history();
        for pair in h[2..].windows(2) {
            assert!(pair[0].tick_ms.wrapping_sub(pair[1].tick_ms) >= 1000, "{pair:?}");
        }
        assert_eq!(h[0].tick_ms, 10_000);
        assert_eq!(h[1].tick_ms, 9_980);
    }

    #[test]
    fn load_over_windows() {
        let mut mon = CpuLoadMonitor::new();
        for s in 1..=8u32 {
            // 25% busy during every second.
            mon.push(sample(u64::from(s) * 1000, u64::from(s) * 250, s * 1000));
        }
        // One more raw sample 100ms later, fully busy.
        mon.push(sample(8100, 2100, 8100));
        let info = mon.get_info();
        assert_eq!(info.last, Some(100.0));
        assert_eq!(info.last_second, Some(25.0));
        assert_eq!(info.last_five_seconds, Some(25.0));
    }

    #[test]
    fn equal_totals_are_guarded() {
        let mut mon = CpuLoadMonitor::new();
        assert_eq!(mon.get_info(), CpuLoadInfo::default());
        mon.push(sample(500, 100, 10));
        mon.push(sample(500, 100, 20));
        assert_eq!(mon.get_info().last, None);
    }

    #[test]
    fn tick_wrap_still_decimates() {
        let mut mon = CpuLoadMonitor::new();
        let base = u32::MAX - 1500;
        for i in 0..6u32 {
            mon.push(sample(u64::from(i) * 600, 0, base.wrapping_add(i * 600)));
        }
        for pair in mon.history()[2..].windows(2) {
            if pair[1] == LoadSample::default() {
                break;
            }
            assert!(pair[0].tick_ms.wrapping_sub(pair[1].tick_ms) >= 1000);
        }
    }

    #[test]
    fn update_reads_counters() {
        let fake = Fake {
            total: Cell::new(1000),
            idle: Cell::new(600),
            tick: Cell::new(5),
        };
        let mut mon = CpuLoadMonitor::new();
        mon.update(&fake);
        assert_eq!(mon.history()[0], sample(1000, 400, 5));
        fake.total.set(2000);
        fake.idle.set(1100);
        fake.tick.set(6);
        mon.update(&fake);
        assert_eq!(mon.get_info().last, Some(50.0));
    }

    #[test]
    fn busy_scope_accumulates() {
        let rt = TaskRunTime::new();
        {
            let _busy = rt.busy();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(rt.total() >= 5000);
        assert!(rt.idle() <= rt.total() - 5000);
    }
}
