//! Memory Monitor - Watermark-Driven Frame Cache Eviction
//!
//! Sustained video playback keeps decoded frames resident in the task store's
//! caches. This worker samples process memory on its own interval (not tied
//! to the scheduler's tick rate) and applies tiered cleanup when resident
//! memory crosses configured watermarks:
//!
//! - below `warning`: no action
//! - above `warning`: gentle cleanup, bounding each cache to its most recent
//!   frames, then one allocator release pass
//! - above `critical`: aggressive cleanup, dropping every cached frame except
//!   the active ones, then repeated allocator release passes
//!
//! The monitor only ever issues trim operations against the store; it never
//! touches task cursors or settings, so playback continues (with transient
//! cache misses) through any cleanup tier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::store::RenderTaskStore;

/// Resident set size of the current process, in bytes
///
/// Reads `VmRSS` from `/proc/self/status`. Returns `None` on platforms
/// without procfs or when the field cannot be parsed; the monitor then
/// idles harmlessly.
#[must_use]
pub fn resident_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kb * 1024)
}

/// Ask the allocator to return freed pages to the OS
///
/// Dropping `Arc<KeyFrame>`s frees heap blocks, but glibc may keep the pages
/// mapped; `malloc_trim` releases them so RSS actually falls.
fn release_freed_memory() {
    #[cfg(target_os = "linux")]
    // SAFETY: malloc_trim has no preconditions; 0 means "trim everything"
    unsafe {
        libc::malloc_trim(0);
    }
}

/// Watermarks and cadence for the memory monitor
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Sampling interval
    pub interval: Duration,
    /// Gentle-cleanup watermark in bytes
    pub warning_bytes: u64,
    /// Aggressive-cleanup watermark in bytes
    pub critical_bytes: u64,
    /// Background grid frames retained by a gentle trim
    pub background_keep: usize,
    /// Per-key video frames retained by a gentle trim
    pub video_keep: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            warning_bytes: 500 * 1024 * 1024,
            critical_bytes: 1000 * 1024 * 1024,
            background_keep: 30,
            video_keep: 15,
        }
    }
}

impl MemoryConfig {
    /// Override both watermarks
    #[must_use]
    pub fn with_watermarks(mut self, warning_bytes: u64, critical_bytes: u64) -> Self {
        self.warning_bytes = warning_bytes;
        self.critical_bytes = critical_bytes;
        self
    }

    /// Override the sampling interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Short interval for tests; watermarks high enough that a test
    /// process's real footprint never trips them
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(10),
            warning_bytes: 8 * 1024 * 1024 * 1024,
            critical_bytes: 16 * 1024 * 1024 * 1024,
            background_keep: 30,
            video_keep: 15,
        }
    }
}

/// Cleanup tier applied for one sample
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupTier {
    /// Below the warning watermark
    None,
    /// Above warning: caches bounded to their most recent frames
    Gentle,
    /// Above critical: caches emptied except active frames
    Aggressive,
}

/// Counters exposed for diagnostics and telemetry surfaces
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Most recent resident memory sample, bytes
    pub current_bytes: u64,
    /// Highest resident memory observed, bytes
    pub peak_bytes: u64,
    /// Total cleanups of any tier
    pub cleanup_count: u64,
    /// Gentle cleanups performed
    pub gentle_cleanups: u64,
    /// Aggressive cleanups performed
    pub aggressive_cleanups: u64,
    /// Configured warning watermark, bytes
    pub warning_bytes: u64,
    /// Configured critical watermark, bytes
    pub critical_bytes: u64,
}

struct MonitorShared {
    stats: Mutex<MemoryStats>,
    stop: Notify,
    stopped: AtomicBool,
}

/// Cloneable view onto a running monitor
#[derive(Clone)]
pub struct MemoryMonitorHandle {
    shared: Arc<MonitorShared>,
}

impl MemoryMonitorHandle {
    /// Snapshot of the monitor's counters
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        *self.shared.stats.lock()
    }

    /// Signal the monitor to exit, interrupting an in-progress wait
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.stop.notify_one();
    }
}

impl std::fmt::Debug for MemoryMonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitorHandle")
            .field("stats", &self.stats())
            .finish()
    }
}

/// The periodic memory sampler
pub struct MemoryMonitor {
    store: Arc<RenderTaskStore>,
    config: MemoryConfig,
    shared: Arc<MonitorShared>,
}

impl MemoryMonitor {
    /// Create a monitor over the shared task store
    #[must_use]
    pub fn new(store: Arc<RenderTaskStore>, config: MemoryConfig) -> Self {
        let stats = MemoryStats {
            warning_bytes: config.warning_bytes,
            critical_bytes: config.critical_bytes,
            ..MemoryStats::default()
        };
        Self {
            store,
            config,
            shared: Arc::new(MonitorShared {
                stats: Mutex::new(stats),
                stop: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Handle for stats access and shutdown
    #[must_use]
    pub fn handle(&self) -> MemoryMonitorHandle {
        MemoryMonitorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Sample and react until stopped
    ///
    /// The stop signal interrupts the interval sleep promptly rather than
    /// waiting out the remainder of the interval.
    pub async fn run(self) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs_f64(),
            warning_bytes = self.config.warning_bytes,
            critical_bytes = self.config.critical_bytes,
            "Memory monitor started"
        );
        loop {
            if self.shared.stopped.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                () = self.shared.stop.notified() => break,
                () = sleep(self.config.interval) => self.cycle(),
            }
        }
        tracing::info!("Memory monitor stopped");
    }

    /// One sampling cycle: read resident memory and apply the matching tier
    pub fn cycle(&self) {
        match resident_memory_bytes() {
            Some(bytes) => {
                self.apply_sample(bytes);
            }
            None => tracing::trace!("Resident memory unavailable on this platform"),
        }
    }

    /// Apply watermark policy to one memory sample
    ///
    /// Split from [`MemoryMonitor::cycle`] so tests can inject synthetic
    /// samples. Returns the tier applied.
    pub fn apply_sample(&self, bytes: u64) -> CleanupTier {
        {
            let mut stats = self.shared.stats.lock();
            stats.current_bytes = bytes;
            stats.peak_bytes = stats.peak_bytes.max(bytes);
        }

        let tier = if bytes >= self.config.critical_bytes {
            CleanupTier::Aggressive
        } else if bytes >= self.config.warning_bytes {
            CleanupTier::Gentle
        } else {
            CleanupTier::None
        };

        match tier {
            CleanupTier::None => {}
            CleanupTier::Gentle => {
                let outcome = self
                    .store
                    .trim_frame_caches(self.config.background_keep, self.config.video_keep);
                release_freed_memory();
                let mut stats = self.shared.stats.lock();
                stats.cleanup_count += 1;
                stats.gentle_cleanups += 1;
                tracing::warn!(
                    resident_bytes = bytes,
                    background_evicted = outcome.background_evicted,
                    video_evicted = outcome.video_evicted,
                    "Memory above warning watermark; caches trimmed"
                );
            }
            CleanupTier::Aggressive => {
                let evicted = self.store.clear_frame_caches();
                // Freed blocks come from many allocation sizes; repeat the
                // release so the allocator consolidates across bins.
                for _ in 0..3 {
                    release_freed_memory();
                }
                let mut stats = self.shared.stats.lock();
                stats.cleanup_count += 1;
                stats.aggressive_cleanups += 1;
                tracing::warn!(
                    resident_bytes = bytes,
                    evicted = evicted,
                    "Memory above critical watermark; caches cleared"
                );
            }
        }
        tier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::KeyFrame;
    use pretty_assertions::assert_eq;

    fn frames(n: usize) -> Vec<Arc<KeyFrame>> {
        (0..n)
            .map(|i| Arc::new(KeyFrame::new(vec![u8::try_from(i % 256).unwrap()])))
            .collect()
    }

    fn monitor_with_video(cache: usize) -> (MemoryMonitor, Arc<RenderTaskStore>) {
        let store = Arc::new(RenderTaskStore::new(4));
        store.set_video(0, frames(cache), true, 30.0, None).unwrap();
        let config = MemoryConfig::for_testing().with_watermarks(1024, 4096);
        let monitor = MemoryMonitor::new(Arc::clone(&store), config);
        (monitor, store)
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tapp\nVmPeak:\t  999 kB\nVmRSS:\t    2048 kB\nThreads: 4\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tapp\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_is_nonzero() {
        assert!(resident_memory_bytes().unwrap() > 0);
    }

    #[test]
    fn test_below_warning_is_a_no_op() {
        let (monitor, store) = monitor_with_video(40);
        assert_eq!(monitor.apply_sample(512), CleanupTier::None);
        assert_eq!(store.video_cache_len(0), Some(40));
        let stats = monitor.handle().stats();
        assert_eq!(stats.cleanup_count, 0);
        assert_eq!(stats.current_bytes, 512);
    }

    #[test]
    fn test_warning_tier_bounds_caches() {
        let (monitor, store) = monitor_with_video(40);
        assert_eq!(monitor.apply_sample(2048), CleanupTier::Gentle);
        assert_eq!(store.video_cache_len(0), Some(15));
        let stats = monitor.handle().stats();
        assert_eq!(stats.gentle_cleanups, 1);
        assert_eq!(stats.cleanup_count, 1);
    }

    #[test]
    fn test_critical_tier_clears_caches() {
        let (monitor, store) = monitor_with_video(40);
        // Advance so one frame is active and must survive
        store.advance_frames(0, 30);
        assert_eq!(monitor.apply_sample(8192), CleanupTier::Aggressive);
        assert_eq!(store.video_cache_len(0), Some(1));
        assert_eq!(monitor.handle().stats().aggressive_cleanups, 1);
    }

    #[test]
    fn test_peak_tracks_maximum() {
        let (monitor, _store) = monitor_with_video(4);
        monitor.apply_sample(100);
        monitor.apply_sample(900);
        monitor.apply_sample(200);
        let stats = monitor.handle().stats();
        assert_eq!(stats.peak_bytes, 900);
        assert_eq!(stats.current_bytes, 200);
    }

    #[test]
    fn test_stats_carry_configured_watermarks() {
        let store = Arc::new(RenderTaskStore::new(4));
        let config = MemoryConfig::default().with_watermarks(10, 20);
        let monitor = MemoryMonitor::new(store, config);
        let stats = monitor.handle().stats();
        assert_eq!(stats.warning_bytes, 10);
        assert_eq!(stats.critical_bytes, 20);
    }

    #[tokio::test]
    async fn test_stop_interrupts_interval_wait() {
        let store = Arc::new(RenderTaskStore::new(4));
        let config = MemoryConfig::default().with_interval(Duration::from_secs(60));
        let monitor = MemoryMonitor::new(store, config);
        let handle = monitor.handle();

        let worker = tokio::spawn(monitor.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();

        tokio::time::timeout(Duration::from_millis(500), worker)
            .await
            .expect("stop should interrupt the interval sleep")
            .unwrap();
    }
}
