//! Throughput, latency, and resource usage sampling.
//!
//! Counters are lock-free so workers can record without contention;
//! `sample()` atomically reads and resets the window counters, making
//! it suitable for periodic reporting. A sample is due every
//! `sample_interval` enriched events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Kernel USER_HZ; /proc stat times are reported in these ticks.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Point-in-time process resource usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// CPU utilization percent since the previous sample.
    pub cpu_percent: f64,
}

/// One benchmark sample covering the window since the previous sample.
#[derive(Debug, Clone, Copy)]
pub struct StatsSample {
    /// Enriched events per second in the window.
    pub throughput_per_sec: f64,
    /// Mean per-event processing latency in the window.
    pub avg_latency: Duration,
    /// Enriched events since process start.
    pub processed_total: u64,
    /// Dropped payloads since process start.
    pub dropped_total: u64,
    /// Process resource usage, when readable.
    pub resources: Option<ResourceUsage>,
}

/// Lock-free pipeline counters shared by all workers.
pub struct PipelineStats {
    sample_interval: u64,
    processed: AtomicU64,
    dropped: AtomicU64,
    window_latency_ns: AtomicU64,
    window_count: AtomicU64,
    window_started: parking_lot::Mutex<Instant>,
    cpu_reading: parking_lot::Mutex<Option<CpuReading>>,
}

#[derive(Clone, Copy)]
struct CpuReading {
    ticks: u64,
    at: Instant,
}

impl PipelineStats {
    /// Create zeroed stats that report every `sample_interval` events.
    pub fn new(sample_interval: u64) -> Self {
        Self {
            sample_interval: sample_interval.max(1),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            window_latency_ns: AtomicU64::new(0),
            window_count: AtomicU64::new(0),
            window_started: parking_lot::Mutex::new(Instant::now()),
            cpu_reading: parking_lot::Mutex::new(None),
        }
    }

    /// Record one enriched event and its processing latency. Returns
    /// true when a benchmark sample is due.
    pub fn record_enriched(&self, latency: Duration) -> bool {
        self.window_latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        self.window_count.fetch_add(1, Ordering::Relaxed);

        let total = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        total % self.sample_interval == 0
    }

    /// Record one dropped payload.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Enriched events since process start.
    pub fn processed_total(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Atomically read and reset the sampling window.
    pub fn sample(&self) -> StatsSample {
        let window_count = self.window_count.swap(0, Ordering::Relaxed);
        let window_latency_ns = self.window_latency_ns.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut started = self.window_started.lock();
            let elapsed = started.elapsed();
            *started = Instant::now();
            elapsed
        };

        let throughput_per_sec = if elapsed.as_secs_f64() > 0.0 {
            window_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if window_count > 0 {
            Duration::from_nanos(window_latency_ns / window_count)
        } else {
            Duration::ZERO
        };

        StatsSample {
            throughput_per_sec,
            avg_latency,
            processed_total: self.processed.load(Ordering::Relaxed),
            dropped_total: self.dropped.load(Ordering::Relaxed),
            resources: self.sample_resources(),
        }
    }

    /// Read current RSS and CPU utilization from /proc. Returns `None`
    /// where /proc is unavailable; callers treat that as non-fatal.
    fn sample_resources(&self) -> Option<ResourceUsage> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let rss_bytes = parse_vm_rss_bytes(&status)?;

        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        let ticks = parse_cpu_ticks(&stat)?;
        let now = Instant::now();

        let cpu_percent = {
            let mut reading = self.cpu_reading.lock();
            let percent = match *reading {
                Some(prev) if now > prev.at => {
                    let delta_secs = (now - prev.at).as_secs_f64();
                    let delta_ticks = ticks.saturating_sub(prev.ticks) as f64;
                    delta_ticks / CLOCK_TICKS_PER_SEC / delta_secs * 100.0
                }
                _ => 0.0,
            };
            *reading = Some(CpuReading { ticks, at: now });
            percent
        };

        Some(ResourceUsage {
            rss_bytes,
            cpu_percent,
        })
    }
}

/// Extract VmRSS from /proc/self/status content, converted to bytes.
fn parse_vm_rss_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())?;
    Some(kb * 1024)
}

/// Extract utime + stime ticks from /proc/self/stat content.
///
/// The comm field may contain spaces, so fields are counted from the
/// closing paren.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let after_comm = stat.rsplit_once(')')?.1;
    let mut fields = after_comm.split_whitespace();
    let utime: u64 = fields.nth(11).and_then(|v| v.parse().ok())?;
    let stime: u64 = fields.next().and_then(|v| v.parse().ok())?;
    Some(utime + stime)
}
