//! Deck Controller - Outward Facade
//!
//! One controller per attached surface. It owns the task store, spawns the
//! frame scheduler and the memory monitor, and exposes the narrow operations
//! collaborators use: content setters, input translation, rotation changes,
//! diagnostics, and orderly shutdown.
//!
//! # Lifecycle
//!
//! [`DeckController::start`] spawns both workers on the current tokio
//! runtime. [`DeckController::shutdown`] stops the scheduler first and waits
//! for its in-flight tick, then stops the monitor, then clears the task
//! store, so no render can touch freed cache entries.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::frame::{BackgroundFrame, KeyFrame};
use crate::geometry::{GeometryError, KeyLayout, KeyMapper, Rotation};
use crate::input::{diff_key_states, logical_key_states, KeyEvent};
use crate::memory::{MemoryConfig, MemoryMonitor, MemoryMonitorHandle, MemoryStats};
use crate::scheduler::{
    FrameScheduler, MirrorFrame, SchedulerConfig, SchedulerEvent, SchedulerHandle, SchedulerState,
};
use crate::store::RenderTaskStore;
use crate::surface::{shared, KeySurface, SharedSurface};

/// Combined configuration for one controller's workers
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DeckConfig {
    /// Frame scheduler cadence
    pub scheduler: SchedulerConfig,
    /// Memory monitor watermarks and interval
    pub memory: MemoryConfig,
}

impl DeckConfig {
    /// Fast cadences and tiny watermarks for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            scheduler: SchedulerConfig::for_testing(),
            memory: MemoryConfig::for_testing(),
        }
    }
}

/// Facade owning the render pipeline for one attached surface
pub struct DeckController<S: KeySurface + 'static> {
    store: Arc<RenderTaskStore>,
    surface: SharedSurface<S>,
    mapper: Arc<RwLock<KeyMapper>>,
    scheduler_handle: SchedulerHandle,
    monitor_handle: MemoryMonitorHandle,
    scheduler_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
    events: Option<mpsc::UnboundedReceiver<SchedulerEvent>>,
    mirrors: Option<mpsc::UnboundedReceiver<MirrorFrame>>,
    last_key_states: Mutex<Vec<bool>>,
}

impl<S: KeySurface + 'static> DeckController<S> {
    /// Take ownership of a surface and spawn both workers
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(surface: S, layout: KeyLayout, rotation: Rotation, config: DeckConfig) -> Self {
        let key_count = layout.key_count();
        let store = Arc::new(RenderTaskStore::new(key_count));
        let surface = shared(surface);
        let mapper = Arc::new(RwLock::new(KeyMapper::new(layout, rotation)));

        let mut scheduler = FrameScheduler::new(
            Arc::clone(&store),
            Arc::clone(&surface),
            Arc::clone(&mapper),
            config.scheduler,
        );
        let events = scheduler.events();
        let mirrors = scheduler.mirror_frames();
        let scheduler_handle = scheduler.handle();

        let monitor = MemoryMonitor::new(Arc::clone(&store), config.memory);
        let monitor_handle = monitor.handle();

        tracing::info!(layout = %layout, rotation = %rotation, "Deck controller started");
        let scheduler_task = tokio::spawn(scheduler.run());
        let monitor_task = tokio::spawn(monitor.run());

        Self {
            store,
            surface,
            mapper,
            scheduler_handle,
            monitor_handle,
            scheduler_task,
            monitor_task,
            events: Some(events),
            mirrors: Some(mirrors),
            last_key_states: Mutex::new(vec![false; key_count]),
        }
    }

    /// The shared task store, for collaborators that enqueue directly
    #[must_use]
    pub fn store(&self) -> &Arc<RenderTaskStore> {
        &self.store
    }

    /// The shared surface handle
    #[must_use]
    pub fn surface(&self) -> &SharedSurface<S> {
        &self.surface
    }

    /// Number of keys on the surface
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.store.key_count()
    }

    /// The physical layout
    #[must_use]
    pub fn layout(&self) -> KeyLayout {
        self.mapper.read().layout()
    }

    /// The active rotation
    #[must_use]
    pub fn rotation(&self) -> Rotation {
        self.mapper.read().rotation()
    }

    /// Change the rotation; takes effect on the next tick
    ///
    /// Persisting the new value is the caller's job.
    pub fn set_rotation(&self, rotation: Rotation) {
        let layout = self.layout();
        *self.mapper.write() = KeyMapper::new(layout, rotation);
        tracing::info!(rotation = %rotation, "Rotation changed");
    }

    /// Push a one-shot image to a key
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::KeyOutOfRange`] for an invalid key.
    pub fn set_image(&self, key: usize, frame: Arc<KeyFrame>) -> Result<(), GeometryError> {
        self.store.push_image(key, frame, None)
    }

    /// Push a one-shot image with a distinct frame for the UI mirror
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::KeyOutOfRange`] for an invalid key.
    pub fn set_image_with_mirror(
        &self,
        key: usize,
        frame: Arc<KeyFrame>,
        mirror: Arc<KeyFrame>,
    ) -> Result<(), GeometryError> {
        self.store.push_image(key, frame, Some(mirror))
    }

    /// Install looping media on a key, replacing any existing task
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::KeyOutOfRange`] for an invalid key.
    pub fn set_video(
        &self,
        key: usize,
        frames: Vec<Arc<KeyFrame>>,
        looping: bool,
        fps: f32,
    ) -> Result<(), GeometryError> {
        self.store.set_video(key, frames, looping, fps, None)
    }

    /// Install looping media with label overlay metadata
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::KeyOutOfRange`] for an invalid key.
    pub fn set_video_with_labels(
        &self,
        key: usize,
        frames: Vec<Arc<KeyFrame>>,
        looping: bool,
        fps: f32,
        labels: Vec<String>,
    ) -> Result<(), GeometryError> {
        self.store.set_video(key, frames, looping, fps, Some(labels))
    }

    /// Remove the video task on a key
    pub fn clear_video(&self, key: usize) -> bool {
        self.store.clear_video(key)
    }

    /// Install the grid-wide background, replacing any existing one
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::LengthMismatch`] if a grid frame does not
    /// carry one tile per key.
    pub fn set_background(
        &self,
        frames: Vec<BackgroundFrame>,
        looping: bool,
        fps: f32,
    ) -> Result<(), GeometryError> {
        self.store.set_background(frames, looping, fps)
    }

    /// Remove the background task
    pub fn clear_background(&self) -> bool {
        self.store.clear_background()
    }

    /// Restrict ticks to the background (full-grid takeover states)
    pub fn set_background_only(&self, enabled: bool) {
        self.store.set_background_only(enabled);
    }

    /// Clear every render task, waiting out any in-flight tick
    ///
    /// The workers keep running; the surface simply has nothing to render
    /// until new tasks arrive.
    pub async fn stop_all(&self) {
        self.store.clear_all().await;
    }

    /// Suspend rendering without tearing anything down
    pub fn pause(&self) {
        self.scheduler_handle.pause();
    }

    /// Resume rendering after a pause
    pub fn resume(&self) {
        self.scheduler_handle.resume();
    }

    /// Whether the scheduler loop is actively ticking
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.scheduler_handle.is_running()
    }

    /// Scheduler lifecycle state
    #[must_use]
    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler_handle.state()
    }

    /// Completed scheduler ticks
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.scheduler_handle.tick_count()
    }

    /// Memory monitor counters for diagnostics surfaces
    #[must_use]
    pub fn get_stats(&self) -> MemoryStats {
        self.monitor_handle.stats()
    }

    /// Take the scheduler event stream (background finished, render
    /// failures, re-composite requests). Yields `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<SchedulerEvent>> {
        self.events.take()
    }

    /// Take the UI mirror frame stream. Yields `None` after the first call.
    pub fn mirror_frames(&mut self) -> Option<mpsc::UnboundedReceiver<MirrorFrame>> {
        self.mirrors.take()
    }

    /// Translate one device-reported physical index to its logical key
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::KeyOutOfRange`] for indices outside the layout.
    pub fn physical_to_logical(&self, physical: usize) -> Result<usize, GeometryError> {
        self.mapper.read().physical_to_logical(physical)
    }

    /// Translate a physical-order key-state report into logical edge events
    ///
    /// Keeps the previous report internally; each call diffs against it and
    /// replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::LengthMismatch`] when the report length does
    /// not match the surface's key count.
    pub fn process_key_report(&self, physical: &[bool]) -> Result<Vec<KeyEvent>, GeometryError> {
        let mapper = *self.mapper.read();
        let logical = logical_key_states(mapper, physical)?;
        let mut last = self.last_key_states.lock();
        let events = diff_key_states(&last, &logical);
        *last = logical;
        Ok(events)
    }

    /// Stop both workers and clear the task store
    ///
    /// Ordering: the scheduler stops accepting ticks and its in-flight tick
    /// completes before the containers are cleared.
    pub async fn shutdown(self) {
        self.scheduler_handle.stop();
        if let Err(err) = self.scheduler_task.await {
            tracing::warn!(error = %err, "Scheduler task ended abnormally");
        }
        self.monitor_handle.stop();
        if let Err(err) = self.monitor_task.await {
            tracing::warn!(error = %err, "Memory monitor task ended abnormally");
        }
        self.store.clear_all().await;
        tracing::info!("Deck controller shut down");
    }
}

impl<S: KeySurface + 'static> std::fmt::Debug for DeckController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeckController")
            .field("layout", &self.layout())
            .field("rotation", &self.rotation())
            .field("scheduler", &self.scheduler_handle.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSurface;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn frame(byte: u8) -> Arc<KeyFrame> {
        Arc::new(KeyFrame::new(vec![byte]))
    }

    fn controller() -> DeckController<RecordingSurface> {
        let layout = KeyLayout::new(3, 5).unwrap();
        DeckController::start(
            RecordingSurface::new(15),
            layout,
            Rotation::Deg0,
            DeckConfig::for_testing(),
        )
    }

    #[tokio::test]
    async fn test_image_reaches_surface_once() {
        let controller = controller();
        controller.set_image(4, frame(42)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let writes = controller.surface().lock().await.writes().to_vec();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], (4, frame(42)));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_rotation_change_applies_to_next_writes() {
        let controller = controller();
        controller.set_rotation(Rotation::Deg90);
        assert_eq!(controller.rotation(), Rotation::Deg90);

        controller.set_image(0, frame(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let writes = controller.surface().lock().await.writes().to_vec();
        assert_eq!(writes[0].0, 10);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_key_report_diffing_is_stateful() {
        let controller = controller();
        let mut report = vec![false; 15];
        report[3] = true;

        let events = controller.process_key_report(&report).unwrap();
        assert_eq!(events, vec![KeyEvent::Pressed { key: 3 }]);
        // Same report again: no edges
        assert!(controller.process_key_report(&report).unwrap().is_empty());

        report[3] = false;
        let events = controller.process_key_report(&report).unwrap();
        assert_eq!(events, vec![KeyEvent::Released { key: 3 }]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers_and_clears_store() {
        let controller = controller();
        controller.set_video(0, vec![frame(0), frame(1)], true, 30.0).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(controller.is_running());

        let store = Arc::clone(controller.store());
        let handle = controller.scheduler_handle.clone();
        controller.shutdown().await;

        assert_eq!(handle.state(), SchedulerState::Stopped);
        assert!(store.video_keys().is_empty());
    }

    #[tokio::test]
    async fn test_event_streams_taken_once() {
        let mut controller = controller();
        assert!(controller.events().is_some());
        assert!(controller.events().is_none());
        assert!(controller.mirror_frames().is_some());
        assert!(controller.mirror_frames().is_none());
        controller.shutdown().await;
    }
}
