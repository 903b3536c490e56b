//! Frame Scheduler - Fixed-Cadence Render Loop
//!
//! One async worker ticks at a fixed rate (default 30 Hz) and multiplexes the
//! task store onto the device: per-key video advances, the background
//! advance, then the one-shot image FIFO, all within a single exclusive
//! device-access window per tick.
//!
//! # Design
//!
//! ```text
//!  Idle ──start──► Running ◄──resume──┐
//!                     │ pause         │
//!                     ▼               │
//!                   Paused ───────────┘
//!                     │ stop (from Running or Paused)
//!                     ▼
//!                  Stopped (terminal)
//! ```
//!
//! While paused the loop polls its state at a coarse interval without doing
//! tick work. A stop request takes effect after the in-flight tick completes.
//!
//! # Rate Conversion
//!
//! Each task carries its own target fps; the scheduler advances it on ticks
//! where `tick % advance_divisor(rate, fps) == 0`. The divisor is the ratio
//! rounded to the nearest integer and clamped to ≥ 1, so an fps that does not
//! divide the tick rate degrades to the nearest representable cadence instead
//! of silently truncating toward a faster one.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use crate::frame::KeyFrame;
use crate::geometry::KeyMapper;
use crate::store::RenderTaskStore;
use crate::surface::{KeySurface, SharedSurface};

/// Round the tick-rate/fps ratio to the nearest integer divisor, minimum 1
///
/// A task advances on ticks where `tick % divisor == 0`, so a 10 fps task on
/// a 30 Hz scheduler advances on exactly 1 of every 3 ticks.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn advance_divisor(scheduler_rate: u32, task_fps: f32) -> u64 {
    let fps = f64::from(task_fps.max(0.1));
    let ratio = f64::from(scheduler_rate.max(1)) / fps;
    (ratio.round() as u64).max(1)
}

/// Scheduler cadence configuration
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick cadence in Hz
    pub tick_rate: u32,
    /// How often the paused loop re-checks its state
    pub pause_poll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 30,
            pause_poll: Duration::from_millis(250),
        }
    }
}

impl SchedulerConfig {
    /// Override the tick cadence
    #[must_use]
    pub fn with_tick_rate(mut self, tick_rate: u32) -> Self {
        self.tick_rate = tick_rate;
        self
    }

    /// Fast cadence for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            tick_rate: 200,
            pause_poll: Duration::from_millis(5),
        }
    }
}

/// Lifecycle state of the scheduler loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    /// Constructed, not yet running
    Idle = 0,
    /// Ticking at the configured cadence
    Running = 1,
    /// Loop alive but skipping tick work
    Paused = 2,
    /// Loop exited (terminal)
    Stopped = 3,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Events the scheduler reports back to the owning application
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A non-looping background reached its final frame
    BackgroundFinished,
    /// The background advanced; key overlays should be re-composited on top
    RecompositeNeeded {
        /// Background frame index that was just pushed
        index: usize,
    },
    /// A single frame failed to reach the device (transient, tick continued)
    RenderFailed {
        /// Logical key whose write failed
        key: usize,
        /// Failure description
        reason: String,
    },
}

/// A frame duplicated toward a UI mirror of a key
///
/// Dropped silently when no mirror receiver is attached.
#[derive(Clone, Debug)]
pub struct MirrorFrame {
    /// Logical key the frame belongs to
    pub key: usize,
    /// The frame, shared with the device write
    pub frame: Arc<KeyFrame>,
}

struct SchedulerShared {
    state: AtomicU8,
    ticks: AtomicU64,
}

/// Cloneable remote control for a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

impl SchedulerHandle {
    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether the loop is actively ticking
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Completed ticks since start
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::Acquire)
    }

    /// Suspend tick work; the loop polls for resume at a coarse interval
    pub fn pause(&self) {
        let swapped = self.shared.state.compare_exchange(
            SchedulerState::Running as u8,
            SchedulerState::Paused as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            tracing::info!("Frame scheduler paused");
        }
    }

    /// Resume tick work after a pause
    pub fn resume(&self) {
        let swapped = self.shared.state.compare_exchange(
            SchedulerState::Paused as u8,
            SchedulerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            tracing::info!("Frame scheduler resumed");
        }
    }

    /// Request loop exit; takes effect after the in-flight tick completes
    pub fn stop(&self) {
        self.shared
            .state
            .store(SchedulerState::Stopped as u8, Ordering::Release);
        tracing::info!("Frame scheduler stop requested");
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("state", &self.state())
            .field("ticks", &self.tick_count())
            .finish()
    }
}

/// The fixed-cadence render worker
///
/// Owns the tick loop; shares the task store with producers and the memory
/// monitor, and the mapper with the input path. Consumed by
/// [`FrameScheduler::run`], controlled afterwards through its
/// [`SchedulerHandle`].
pub struct FrameScheduler<S: KeySurface> {
    store: Arc<RenderTaskStore>,
    surface: SharedSurface<S>,
    mapper: Arc<RwLock<KeyMapper>>,
    config: SchedulerConfig,
    shared: Arc<SchedulerShared>,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    mirror_tx: Option<mpsc::UnboundedSender<MirrorFrame>>,
    tick_count: u64,
}

impl<S: KeySurface> FrameScheduler<S> {
    /// Create a scheduler over a store, a surface, and a shared mapper
    #[must_use]
    pub fn new(
        store: Arc<RenderTaskStore>,
        surface: SharedSurface<S>,
        mapper: Arc<RwLock<KeyMapper>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            surface,
            mapper,
            config,
            shared: Arc::new(SchedulerShared {
                state: AtomicU8::new(SchedulerState::Idle as u8),
                ticks: AtomicU64::new(0),
            }),
            event_tx: None,
            mirror_tx: None,
            tick_count: 0,
        }
    }

    /// Remote control usable from any task
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Attach an event channel and return its receiving end
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        rx
    }

    /// Attach a UI mirror channel and return its receiving end
    pub fn mirror_frames(&mut self) -> mpsc::UnboundedReceiver<MirrorFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mirror_tx = Some(tx);
        rx
    }

    fn emit_event(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            // Receiver may be gone during teardown; events are best-effort
            let _ = tx.send(event);
        }
    }

    fn emit_mirror(&self, key: usize, frame: Arc<KeyFrame>) {
        if let Some(tx) = &self.mirror_tx {
            let _ = tx.send(MirrorFrame { key, frame });
        }
    }

    fn set_state(&self, state: SchedulerState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    /// Run the tick loop until stopped
    ///
    /// Each iteration performs one tick, then sleeps for the remainder of the
    /// tick period. While paused, the loop sleeps in coarse increments
    /// without acquiring the device.
    pub async fn run(mut self) {
        // A stop requested between spawn and first poll must win; only an
        // Idle scheduler may transition to Running.
        let started = self.shared.state.compare_exchange(
            SchedulerState::Idle as u8,
            SchedulerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if started.is_err() {
            tracing::info!("Frame scheduler stopped before first tick");
            self.set_state(SchedulerState::Stopped);
            return;
        }
        let rate = self.config.tick_rate.max(1);
        let period = Duration::from_secs_f64(1.0 / f64::from(rate));
        tracing::info!(tick_rate = rate, "Frame scheduler started");

        loop {
            match SchedulerState::from_u8(self.shared.state.load(Ordering::Acquire)) {
                SchedulerState::Stopped => break,
                SchedulerState::Paused => {
                    sleep(self.config.pause_poll).await;
                    continue;
                }
                SchedulerState::Idle | SchedulerState::Running => {}
            }

            let started = Instant::now();
            self.tick().await;

            let elapsed = started.elapsed();
            if elapsed < period {
                sleep(period - elapsed).await;
            }
        }

        self.set_state(SchedulerState::Stopped);
        tracing::info!(ticks = self.tick_count, "Frame scheduler stopped");
    }

    /// Perform exactly one tick
    ///
    /// Exposed so tests and diagnostic tools can drive the scheduler without
    /// the timing loop. Order within the tick: per-key video advances, the
    /// background advance, then the image FIFO, all under one device lock.
    pub async fn tick(&mut self) {
        let _gate = self.store.begin_tick().await;
        let batch = self
            .store
            .advance_frames(self.tick_count, self.config.tick_rate.max(1));
        self.tick_count += 1;
        self.shared.ticks.store(self.tick_count, Ordering::Release);

        if batch.videos.is_empty() && batch.background.is_none() && batch.images.is_empty() {
            return;
        }

        // KeyMapper is Copy; snapshot it so a concurrent rotation change
        // cannot split one tick across two orientations.
        let mapper = *self.mapper.read();
        let mut surface = self.surface.lock().await;
        if !surface.is_open() {
            tracing::trace!("Surface closed; tick skipped");
            return;
        }

        for write in batch.videos {
            let Some(frame) = write.frame else {
                tracing::debug!(
                    key = write.key,
                    index = write.index,
                    "Video frame missing from cache; skipped"
                );
                continue;
            };
            self.write_key(&mut *surface, mapper, write.key, &frame);
            self.emit_mirror(write.key, frame);
        }

        if let Some(bg) = batch.background {
            if let Some(frame) = bg.frame {
                for (key, tile) in frame.tiles().iter().enumerate() {
                    self.write_key(&mut *surface, mapper, key, tile);
                }
                self.emit_event(SchedulerEvent::RecompositeNeeded { index: bg.index });
            } else {
                tracing::debug!(
                    index = bg.index,
                    "Background frame missing from cache; skipped"
                );
            }
            if bg.finished {
                tracing::debug!("Background playback finished");
                self.emit_event(SchedulerEvent::BackgroundFinished);
            }
        }

        for image in batch.images {
            self.write_key(&mut *surface, mapper, image.key, &image.frame);
            if let Some(mirror) = image.mirror {
                self.emit_mirror(image.key, mirror);
            }
        }
    }

    /// Push one frame through the rotation transform onto the device
    ///
    /// Any failure is transient: logged, reported, and the tick continues.
    fn write_key(&self, surface: &mut S, mapper: KeyMapper, key: usize, frame: &KeyFrame) {
        let physical = match mapper.logical_to_physical(key) {
            Ok(physical) => physical,
            Err(err) => {
                tracing::warn!(key = key, error = %err, "Key outside surface layout");
                self.emit_event(SchedulerEvent::RenderFailed {
                    key,
                    reason: err.to_string(),
                });
                return;
            }
        };
        if let Err(err) = surface.write_key(physical, frame) {
            tracing::warn!(key = key, physical = physical, error = %err, "Frame write failed");
            self.emit_event(SchedulerEvent::RenderFailed {
                key,
                reason: err.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BackgroundFrame;
    use crate::geometry::{KeyLayout, Rotation};
    use crate::surface::shared;
    use crate::testing::RecordingSurface;
    use pretty_assertions::assert_eq;

    fn mapper(rotation: Rotation) -> Arc<RwLock<KeyMapper>> {
        let layout = KeyLayout::new(3, 5).unwrap();
        Arc::new(RwLock::new(KeyMapper::new(layout, rotation)))
    }

    fn frame(byte: u8) -> Arc<KeyFrame> {
        Arc::new(KeyFrame::new(vec![byte]))
    }

    #[test]
    fn test_advance_divisor_policy() {
        assert_eq!(advance_divisor(30, 30.0), 1);
        assert_eq!(advance_divisor(30, 10.0), 3);
        assert_eq!(advance_divisor(30, 15.0), 2);
        // Faster than the scheduler clamps to every tick
        assert_eq!(advance_divisor(30, 60.0), 1);
        // Non-integer ratios round to nearest: 30/8 = 3.75 -> 4
        assert_eq!(advance_divisor(30, 8.0), 4);
        // Nonsense fps values are clamped, never panic or divide by zero
        assert_eq!(advance_divisor(30, 0.0), 300);
        assert_eq!(advance_divisor(30, -5.0), 300);
    }

    #[test]
    fn test_handle_state_transitions() {
        let store = Arc::new(RenderTaskStore::new(15));
        let surface = shared(RecordingSurface::new(15));
        let scheduler =
            FrameScheduler::new(store, surface, mapper(Rotation::Deg0), SchedulerConfig::default());
        let handle = scheduler.handle();

        assert_eq!(handle.state(), SchedulerState::Idle);
        // Pause only applies to a running loop
        handle.pause();
        assert_eq!(handle.state(), SchedulerState::Idle);
        handle.stop();
        assert_eq!(handle.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_tick_pushes_image_through_rotation() {
        let store = Arc::new(RenderTaskStore::new(15));
        let surface = shared(RecordingSurface::new(15));
        let mut scheduler = FrameScheduler::new(
            Arc::clone(&store),
            Arc::clone(&surface),
            mapper(Rotation::Deg90),
            SchedulerConfig::for_testing(),
        );

        store.push_image(0, frame(7), None).unwrap();
        scheduler.tick().await;

        // Logical 0 on a 3x5 grid rotated 90° lands on physical 10
        let writes = surface.lock().await.writes().to_vec();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 10);
        assert_eq!(writes[0].1.bytes(), &[7]);

        // Consumed exactly once
        scheduler.tick().await;
        assert_eq!(surface.lock().await.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_emits_recomposite_and_finished() {
        let store = Arc::new(RenderTaskStore::new(15));
        let surface = shared(RecordingSurface::new(15));
        let mut scheduler = FrameScheduler::new(
            Arc::clone(&store),
            surface,
            mapper(Rotation::Deg0),
            SchedulerConfig::for_testing(),
        );
        let mut events = scheduler.events();

        let frames: Vec<BackgroundFrame> = (0..2)
            .map(|i| BackgroundFrame::new(vec![frame(i); 15]))
            .collect();
        store.set_background(frames, false, 200.0).unwrap();

        scheduler.tick().await;
        scheduler.tick().await;
        scheduler.tick().await; // no background work left

        assert_eq!(
            events.try_recv().unwrap(),
            SchedulerEvent::RecompositeNeeded { index: 0 }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SchedulerEvent::RecompositeNeeded { index: 1 }
        );
        assert_eq!(events.try_recv().unwrap(), SchedulerEvent::BackgroundFinished);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_render_failure_does_not_halt_tick() {
        let store = Arc::new(RenderTaskStore::new(15));
        let surface = shared(RecordingSurface::new(15).failing_on(10));
        let mut scheduler = FrameScheduler::new(
            Arc::clone(&store),
            Arc::clone(&surface),
            mapper(Rotation::Deg90),
            SchedulerConfig::for_testing(),
        );
        let mut events = scheduler.events();

        // Logical 0 maps to the failing physical slot 10; logical 1 maps to 5
        store.push_image(0, frame(1), None).unwrap();
        store.push_image(1, frame(2), None).unwrap();
        scheduler.tick().await;

        let writes = surface.lock().await.writes().to_vec();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 5);
        assert!(matches!(
            events.try_recv().unwrap(),
            SchedulerEvent::RenderFailed { key: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_closed_surface_skips_writes_but_advances() {
        let store = Arc::new(RenderTaskStore::new(15));
        let mut device = RecordingSurface::new(15);
        device.close();
        let surface = shared(device);
        let mut scheduler = FrameScheduler::new(
            Arc::clone(&store),
            Arc::clone(&surface),
            mapper(Rotation::Deg0),
            SchedulerConfig::for_testing(),
        );

        store.set_video(3, vec![frame(0), frame(1)], true, 200.0, None).unwrap();
        scheduler.tick().await;
        scheduler.tick().await;

        assert!(surface.lock().await.writes().is_empty());
        // Cursor advanced regardless; playback does not stall on reconnect
        assert_eq!(
            store.advance_frames(2, 200).videos[0].index,
            0 // looped back around after frames 0 and 1
        );
    }

    #[tokio::test]
    async fn test_stop_before_run_exits_immediately() {
        let store = Arc::new(RenderTaskStore::new(15));
        let surface = shared(RecordingSurface::new(15));
        let scheduler = FrameScheduler::new(
            store,
            surface,
            mapper(Rotation::Deg0),
            SchedulerConfig::for_testing(),
        );
        let handle = scheduler.handle();

        // Stop races the spawn: it must not be overwritten by startup
        handle.stop();
        let worker = tokio::spawn(scheduler.run());

        tokio::time::timeout(Duration::from_millis(500), worker)
            .await
            .expect("loop must exit without ever entering Running")
            .unwrap();
        assert_eq!(handle.state(), SchedulerState::Stopped);
        assert_eq!(handle.tick_count(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_pause_and_stop() {
        let store = Arc::new(RenderTaskStore::new(15));
        let surface = shared(RecordingSurface::new(15));
        let scheduler = FrameScheduler::new(
            store,
            surface,
            mapper(Rotation::Deg0),
            SchedulerConfig::for_testing(),
        );
        let handle = scheduler.handle();
        let worker = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), SchedulerState::Running);
        assert!(handle.tick_count() > 0);

        handle.pause();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let paused_at = handle.tick_count();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.tick_count(), paused_at);

        handle.resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.tick_count() > paused_at);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("scheduler loop should exit promptly")
            .unwrap();
        assert_eq!(handle.state(), SchedulerState::Stopped);
    }
}
