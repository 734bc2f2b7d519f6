// Per-invocation resource sampling.
//
// A `ProcessMonitor` runs a sampling thread alongside exactly one measured
// invocation (an external child process, or this process for in-process
// codecs). It polls the pid through `sysinfo` at a fixed interval and keeps
// the peak observed RSS plus a running CPU-usage mean. The monitor only
// *observes*; limit enforcement (killing a child that breached its deadline
// or ceiling) belongs to the caller, which can read `peak_mem()` live.
//
// `stop()` joins the sampling thread, so a finished invocation never leaks
// its sampler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, Pid, ProcessRefreshKind, System};

/// Default gap between two resource samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Floor for the sampling interval; tighter loops just burn CPU in the
/// sampler and distort the measurement.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// ResourceSample
// ---------------------------------------------------------------------------

/// Aggregated readings for one measured invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Wall-clock time between `spawn` and `stop`.
    pub elapsed: Duration,
    /// Mean CPU utilization, percent of one core. Averaged over readings
    /// spaced at least [`sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`] apart; 0.0
    /// when the invocation was too short for a single CPU window.
    pub cpu_pct: f32,
    /// Peak observed RSS in bytes (peak, not average).
    pub peak_mem: u64,
    /// Number of samples taken. Zero for invocations shorter than one interval.
    pub samples: u64,
}

// ---------------------------------------------------------------------------
// ProcessMonitor
// ---------------------------------------------------------------------------

struct Shared {
    stop: AtomicBool,
    peak_mem: AtomicU64,
    /// CPU percent accumulated in thousandths, divided by `cpu_samples` at
    /// stop. CPU runs on its own (slower) cadence than the RSS samples:
    /// sysinfo only yields meaningful `cpu_usage()` readings when refreshes
    /// are at least `MINIMUM_CPU_UPDATE_INTERVAL` apart.
    cpu_milli_sum: AtomicU64,
    cpu_samples: AtomicU64,
    samples: AtomicU64,
}

/// Sampling thread handle for one watched pid.
pub struct ProcessMonitor {
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
    started: Instant,
}

impl ProcessMonitor {
    /// Start sampling `pid` every `interval` (clamped to
    /// [`MIN_SAMPLE_INTERVAL`]). Sampling stops on its own if the process
    /// disappears before `stop()` is called.
    pub fn spawn(pid: u32, interval: Duration) -> Self {
        let interval = interval.max(MIN_SAMPLE_INTERVAL);
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            peak_mem: AtomicU64::new(0),
            cpu_milli_sum: AtomicU64::new(0),
            cpu_samples: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("pb-monitor-{pid}"))
            .spawn(move || sample_loop(pid, interval, &thread_shared))
            .expect("failed to spawn monitor thread");

        Self {
            shared,
            handle,
            started: Instant::now(),
        }
    }

    /// Watch the current process (for in-process codec invocations).
    pub fn spawn_self(interval: Duration) -> Self {
        Self::spawn(std::process::id(), interval)
    }

    /// Live peak RSS reading, for memory-ceiling polls while the measured
    /// invocation is still running.
    pub fn peak_mem(&self) -> u64 {
        self.shared.peak_mem.load(Ordering::Relaxed)
    }

    /// Elapsed wall-clock time since the monitor started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop sampling, join the thread, and return the aggregate readings.
    pub fn stop(self) -> ResourceSample {
        self.shared.stop.store(true, Ordering::Relaxed);
        let elapsed = self.started.elapsed();
        // The loop wakes at least every MIN_SAMPLE_INTERVAL, so this join is
        // bounded and the sampler cannot outlive the measurement.
        let _ = self.handle.join();

        let samples = self.shared.samples.load(Ordering::Relaxed);
        let cpu_samples = self.shared.cpu_samples.load(Ordering::Relaxed);
        let cpu_pct = if cpu_samples == 0 {
            0.0
        } else {
            (self.shared.cpu_milli_sum.load(Ordering::Relaxed) as f64
                / 1000.0
                / cpu_samples as f64) as f32
        };

        ResourceSample {
            elapsed,
            cpu_pct,
            peak_mem: self.shared.peak_mem.load(Ordering::Relaxed),
            samples,
        }
    }
}

fn sample_loop(pid: u32, interval: Duration, shared: &Shared) {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    // Prime the CPU baseline; the first cpu_usage() after a single refresh
    // always reads zero.
    system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_cpu());
    let mut last_cpu = Instant::now();

    while !shared.stop.load(Ordering::Relaxed) {
        sleep_interruptible(interval, shared);
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }

        // RSS runs at the caller's cadence; cpu_usage() is only refreshed and
        // read once MINIMUM_CPU_UPDATE_INTERVAL has passed since the previous
        // CPU refresh, per the sysinfo contract.
        let take_cpu = last_cpu.elapsed() >= MINIMUM_CPU_UPDATE_INTERVAL;
        let refresh_kind = if take_cpu {
            ProcessRefreshKind::new().with_cpu()
        } else {
            ProcessRefreshKind::new()
        };
        if !system.refresh_process_specifics(pid, refresh_kind) {
            // Process exited; nothing more to sample.
            break;
        }
        if let Some(process) = system.process(pid) {
            shared
                .peak_mem
                .fetch_max(process.memory(), Ordering::Relaxed);
            shared.samples.fetch_add(1, Ordering::Relaxed);

            if take_cpu {
                last_cpu = Instant::now();
                shared.cpu_milli_sum.fetch_add(
                    (f64::from(process.cpu_usage()) * 1000.0) as u64,
                    Ordering::Relaxed,
                );
                shared.cpu_samples.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Sleep `interval` in MIN_SAMPLE_INTERVAL slices so `stop()` never waits
/// for a full (possibly long) interval to elapse.
fn sleep_interruptible(interval: Duration, shared: &Shared) {
    let deadline = Instant::now() + interval;
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(MIN_SAMPLE_INTERVAL));
    }
}

// ---------------------------------------------------------------------------
// In-process measurement
// ---------------------------------------------------------------------------

/// Run `f` with a self-process monitor attached and return its result plus
/// the resource readings for the call window.
pub fn measure_inline<T>(interval: Duration, f: impl FnOnce() -> T) -> (T, ResourceSample) {
    let monitor = ProcessMonitor::spawn_self(interval);
    let value = f();
    (value, monitor.stop())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_measurement_reports_elapsed_and_memory() {
        let ((), sample) = measure_inline(MIN_SAMPLE_INTERVAL, || {
            // Hold a visible allocation across at least one sample.
            let buf = vec![7u8; 8 << 20];
            std::thread::sleep(Duration::from_millis(150));
            std::hint::black_box(&buf);
        });

        assert!(sample.elapsed >= Duration::from_millis(150));
        assert!(sample.samples >= 1, "expected at least one sample");
        // Our own process always has a nonzero RSS.
        assert!(sample.peak_mem > 0);
    }

    #[test]
    fn short_invocations_stop_cleanly_without_samples() {
        let ((), sample) = measure_inline(DEFAULT_SAMPLE_INTERVAL, || {});
        // No interval elapsed, so no samples -- but stop() must still join
        // promptly and report zeroed aggregates rather than hanging.
        assert_eq!(sample.cpu_pct, 0.0);
        assert!(sample.elapsed < Duration::from_secs(1));
        let _ = sample.samples;
    }

    #[test]
    fn cpu_needs_a_full_update_window() {
        // 60ms is under MINIMUM_CPU_UPDATE_INTERVAL, so RSS may be sampled
        // but no CPU reading is taken and the mean stays zero instead of
        // averaging in a meaningless sub-window value.
        let ((), sample) = measure_inline(MIN_SAMPLE_INTERVAL, || {
            std::thread::sleep(Duration::from_millis(60));
        });
        assert_eq!(sample.cpu_pct, 0.0);
    }

    #[test]
    fn monitor_of_dead_pid_stops_on_its_own() {
        // Pid 0 is never a user process sysinfo can refresh.
        let monitor = ProcessMonitor::spawn(0, MIN_SAMPLE_INTERVAL);
        std::thread::sleep(Duration::from_millis(120));
        let sample = monitor.stop();
        assert_eq!(sample.peak_mem, 0);
    }

    #[test]
    fn interval_is_clamped_to_minimum() {
        let monitor = ProcessMonitor::spawn_self(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(60));
        let sample = monitor.stop();
        // With a 1ms request clamped to 50ms, a 60ms window fits ~1 sample.
        assert!(sample.samples <= 3);
    }
}
