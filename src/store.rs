//! Render Task Store - Shared Home for the Three Task Kinds
//!
//! The store is the only mutable state shared between the frame scheduler and
//! the memory monitor. It holds one-shot image tasks (FIFO), per-key video
//! tasks, and at most one grid-wide background video task.
//!
//! # Thread Safety
//!
//! All containers sit behind a single `parking_lot::Mutex`, so every mutation
//! (push/set/clear/trim) applies atomically per task and the scheduler's
//! per-tick sweep can never observe a partially trimmed frame sequence. The
//! lock is held only for pointer-sized work (cursor math, `Arc` clones);
//! device I/O happens outside it.
//!
//! # Tick Gate
//!
//! [`RenderTaskStore::clear_all`] must not rip frames out from under an
//! in-flight tick. The scheduler holds the async tick gate for the duration
//! of each tick; `clear_all` awaits it before clearing, so callers may free
//! underlying device resources as soon as it returns.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::MutexGuard as TokioMutexGuard;

use crate::frame::{BackgroundFrame, KeyFrame};
use crate::geometry::GeometryError;
use crate::scheduler::advance_divisor;

/// Minimum accepted target frame rate; lower values are clamped
const MIN_TASK_FPS: f32 = 0.1;

/// Cursor over a finite, restartable frame sequence
///
/// Starts at −1 (before the first frame). [`FrameCursor::advance`] moves it
/// forward by one, wrapping to 0 for looping sequences and pinning at the
/// last index otherwise. Frames are rendered strictly in non-decreasing
/// cursor order, modulo the loop wrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameCursor {
    position: i64,
    count: usize,
    looping: bool,
}

impl FrameCursor {
    /// Create a cursor over `count` frames
    #[must_use]
    pub fn new(count: usize, looping: bool) -> Self {
        Self {
            position: -1,
            count,
            looping,
        }
    }

    /// Advance by one frame
    ///
    /// Returns the new frame index, or `None` when a non-looping sequence is
    /// already pinned at its last frame (or the sequence is empty).
    pub fn advance(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let next = usize::try_from(self.position + 1).unwrap_or(0);
        if next >= self.count {
            if self.looping {
                self.position = 0;
                Some(0)
            } else {
                None
            }
        } else {
            self.position = i64::try_from(next).unwrap_or(i64::MAX);
            Some(next)
        }
    }

    /// Raw cursor position (−1 before the first advance)
    #[must_use]
    pub fn position(&self) -> i64 {
        self.position
    }

    /// The active frame index, once the cursor has advanced at least once
    #[must_use]
    pub fn active_index(&self) -> Option<usize> {
        usize::try_from(self.position).ok()
    }

    /// Whether the cursor sits on the last frame
    #[must_use]
    pub fn at_last(&self) -> bool {
        self.count > 0 && self.active_index() == Some(self.count - 1)
    }

    /// Whether the sequence wraps at the end
    #[must_use]
    pub fn looping(&self) -> bool {
        self.looping
    }

    /// Total number of frames in the sequence
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.count
    }
}

/// One-shot image push for a single logical key
///
/// Created by a collaborator on any state change; consumed and discarded by
/// the scheduler in the same tick it is observed. FIFO, no rate limiting, no
/// retry.
#[derive(Clone, Debug)]
pub struct ImageTask {
    /// Target logical key
    pub key: usize,
    /// Frame rendered for the device
    pub frame: Arc<KeyFrame>,
    /// Optional frame rendered for a UI mirror of the key
    pub mirror: Option<Arc<KeyFrame>>,
}

/// Looping media playing on one logical key
#[derive(Debug)]
pub(crate) struct VideoTask {
    frames: BTreeMap<usize, Arc<KeyFrame>>,
    cursor: FrameCursor,
    fps: f32,
    labels: Option<Vec<String>>,
}

impl VideoTask {
    fn new(frames: Vec<Arc<KeyFrame>>, looping: bool, fps: f32, labels: Option<Vec<String>>) -> Self {
        let count = frames.len();
        Self {
            frames: frames.into_iter().enumerate().collect(),
            cursor: FrameCursor::new(count, looping),
            fps: fps.max(MIN_TASK_FPS),
            labels,
        }
    }

    fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    fn cached_len(&self) -> usize {
        self.frames.len()
    }

    fn advance(&mut self) -> Option<usize> {
        self.cursor.advance()
    }

    fn frame(&self, index: usize) -> Option<Arc<KeyFrame>> {
        self.frames.get(&index).cloned()
    }

    fn trim(&mut self, keep: usize) -> usize {
        trim_frames(&mut self.frames, keep, self.cursor.active_index())
    }
}

/// Grid-wide animated background
#[derive(Debug)]
pub(crate) struct BackgroundTask {
    frames: BTreeMap<usize, Arc<BackgroundFrame>>,
    cursor: FrameCursor,
    fps: f32,
    playing: bool,
}

impl BackgroundTask {
    fn new(frames: Vec<BackgroundFrame>, looping: bool, fps: f32) -> Self {
        let count = frames.len();
        Self {
            frames: frames.into_iter().map(Arc::new).enumerate().collect(),
            cursor: FrameCursor::new(count, looping),
            fps: fps.max(MIN_TASK_FPS),
            playing: count > 0,
        }
    }

    fn is_playing(&self) -> bool {
        self.playing
    }

    fn cached_len(&self) -> usize {
        self.frames.len()
    }

    /// Advance the shared cursor
    ///
    /// Returns the new frame index and whether this advance reached the end
    /// of a non-looping sequence (after which `playing` is false and the
    /// cursor stays on the last frame indefinitely).
    fn advance(&mut self) -> Option<(usize, bool)> {
        if !self.playing {
            return None;
        }
        match self.cursor.advance() {
            Some(index) => {
                let finished = !self.cursor.looping() && self.cursor.at_last();
                if finished {
                    self.playing = false;
                }
                Some((index, finished))
            }
            None => {
                self.playing = false;
                None
            }
        }
    }

    fn frame(&self, index: usize) -> Option<Arc<BackgroundFrame>> {
        self.frames.get(&index).cloned()
    }

    fn trim(&mut self, keep: usize) -> usize {
        trim_frames(&mut self.frames, keep, self.cursor.active_index())
    }
}

/// Evict the oldest indices until at most `keep` remain, never the active one
fn trim_frames<V>(frames: &mut BTreeMap<usize, V>, keep: usize, active: Option<usize>) -> usize {
    let mut evicted = 0;
    while frames.len() > keep {
        let candidate = frames.keys().copied().find(|k| Some(*k) != active);
        match candidate {
            Some(index) => {
                frames.remove(&index);
                evicted += 1;
            }
            // Only the active frame remains; it is never evicted
            None => break,
        }
    }
    evicted
}

/// Result of a gentle cache trim, for logging and diagnostics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrimOutcome {
    /// Background grid frames evicted
    pub background_evicted: usize,
    /// Per-key video frames evicted, summed over all keys
    pub video_evicted: usize,
}

/// Frames selected for one key during a tick sweep
#[derive(Debug)]
pub(crate) struct VideoWrite {
    pub key: usize,
    pub index: usize,
    /// `None` when the index was evicted from the cache (transient miss)
    pub frame: Option<Arc<KeyFrame>>,
}

/// Background grid frame selected during a tick sweep
#[derive(Debug)]
pub(crate) struct BackgroundWrite {
    pub index: usize,
    pub frame: Option<Arc<BackgroundFrame>>,
    /// A non-looping background just reached its final frame
    pub finished: bool,
}

/// Everything one tick renders, snapshotted under a single lock acquisition
#[derive(Debug, Default)]
pub(crate) struct TickBatch {
    pub videos: Vec<VideoWrite>,
    pub background: Option<BackgroundWrite>,
    pub images: Vec<ImageTask>,
}

#[derive(Default)]
struct StoreState {
    images: VecDeque<ImageTask>,
    videos: BTreeMap<usize, VideoTask>,
    background: Option<BackgroundTask>,
    background_only: bool,
}

/// Thread-safe home for the three render task containers
///
/// Shared as `Arc<RenderTaskStore>` between the owning application (producer),
/// the frame scheduler (consumer), and the memory monitor (cache trimming).
pub struct RenderTaskStore {
    state: Mutex<StoreState>,
    tick_gate: TokioMutex<()>,
    key_count: usize,
}

impl RenderTaskStore {
    /// Create a store for a surface with `key_count` keys
    #[must_use]
    pub fn new(key_count: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            tick_gate: TokioMutex::new(()),
            key_count,
        }
    }

    /// Number of keys on the owning surface
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    fn check_key(&self, key: usize) -> Result<(), GeometryError> {
        if key >= self.key_count {
            return Err(GeometryError::KeyOutOfRange {
                index: key,
                count: self.key_count,
            });
        }
        Ok(())
    }

    /// Enqueue a one-shot image push for a key
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::KeyOutOfRange`] for an invalid key.
    pub fn push_image(
        &self,
        key: usize,
        frame: Arc<KeyFrame>,
        mirror: Option<Arc<KeyFrame>>,
    ) -> Result<(), GeometryError> {
        self.check_key(key)?;
        let mut state = self.state.lock();
        state.images.push_back(ImageTask { key, frame, mirror });
        Ok(())
    }

    /// Install looping media on a key, replacing any existing task wholesale
    ///
    /// There is no partial update: any settings change re-creates the task,
    /// resetting its cursor to the start.
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
        labels: Option<Vec<String>>,
    ) -> Result<(), GeometryError> {
        self.check_key(key)?;
        let task = VideoTask::new(frames, looping, fps, labels);
        tracing::debug!(
            key = key,
            frames = task.cursor.frame_count(),
            fps = task.fps,
            looping = looping,
            "Video task installed"
        );
        self.state.lock().videos.insert(key, task);
        Ok(())
    }

    /// Remove the video task for a key, if any
    pub fn clear_video(&self, key: usize) -> bool {
        let removed = self.state.lock().videos.remove(&key).is_some();
        if removed {
            tracing::debug!(key = key, "Video task cleared");
        }
        removed
    }

    /// Logical keys that currently have a video task
    #[must_use]
    pub fn video_keys(&self) -> Vec<usize> {
        self.state.lock().videos.keys().copied().collect()
    }

    /// Install the grid-wide background, atomically replacing any existing one
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::LengthMismatch`] if any grid frame does not
    /// carry exactly one tile per key.
    pub fn set_background(
        &self,
        frames: Vec<BackgroundFrame>,
        looping: bool,
        fps: f32,
    ) -> Result<(), GeometryError> {
        for frame in &frames {
            if frame.len() != self.key_count {
                return Err(GeometryError::LengthMismatch {
                    expected: self.key_count,
                    actual: frame.len(),
                });
            }
        }
        let task = BackgroundTask::new(frames, looping, fps);
        tracing::debug!(
            frames = task.cursor.frame_count(),
            fps = task.fps,
            looping = looping,
            "Background task installed"
        );
        self.state.lock().background = Some(task);
        Ok(())
    }

    /// Remove the background task, if any
    pub fn clear_background(&self) -> bool {
        let removed = self.state.lock().background.take().is_some();
        if removed {
            tracing::debug!("Background task cleared");
        }
        removed
    }

    /// Whether the background is installed and still advancing
    #[must_use]
    pub fn background_playing(&self) -> bool {
        self.state
            .lock()
            .background
            .as_ref()
            .is_some_and(BackgroundTask::is_playing)
    }

    /// The background's raw cursor position, if a background is installed
    #[must_use]
    pub fn background_cursor(&self) -> Option<i64> {
        self.state
            .lock()
            .background
            .as_ref()
            .map(|bg| bg.cursor.position())
    }

    /// Restrict ticks to the background task only
    ///
    /// While set, per-key video advances and the image FIFO drain are both
    /// suspended (used by full-grid takeover states such as screensavers).
    pub fn set_background_only(&self, enabled: bool) {
        self.state.lock().background_only = enabled;
        tracing::debug!(enabled = enabled, "Background-only mode changed");
    }

    /// Whether background-only mode is active
    #[must_use]
    pub fn background_only(&self) -> bool {
        self.state.lock().background_only
    }

    /// Pending one-shot image pushes
    #[must_use]
    pub fn image_queue_len(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Resident cache size of a key's video task
    #[must_use]
    pub fn video_cache_len(&self, key: usize) -> Option<usize> {
        self.state.lock().videos.get(&key).map(VideoTask::cached_len)
    }

    /// Label overlay metadata of a key's video task, for compositors
    #[must_use]
    pub fn video_labels(&self, key: usize) -> Option<Vec<String>> {
        self.state
            .lock()
            .videos
            .get(&key)
            .and_then(|task| task.labels().map(<[String]>::to_vec))
    }

    /// Resident cache size of the background task
    #[must_use]
    pub fn background_cache_len(&self) -> Option<usize> {
        self.state
            .lock()
            .background
            .as_ref()
            .map(BackgroundTask::cached_len)
    }

    /// Hold the tick gate for the duration of one scheduler tick
    pub(crate) async fn begin_tick(&self) -> TokioMutexGuard<'_, ()> {
        self.tick_gate.lock().await
    }

    /// Clear every task container, waiting for any in-flight tick first
    ///
    /// Returns only after the scheduler's current tick (if one is running)
    /// has released the device, so callers can safely free underlying
    /// resources afterwards.
    pub async fn clear_all(&self) {
        let _gate = self.tick_gate.lock().await;
        let mut state = self.state.lock();
        let images = state.images.len();
        let videos = state.videos.len();
        let had_background = state.background.is_some();
        state.images.clear();
        state.videos.clear();
        state.background = None;
        tracing::info!(
            images = images,
            videos = videos,
            background = had_background,
            "Task store cleared"
        );
    }

    /// One tick's sweep: advance cursors per the divisor rule and snapshot
    /// the frames to write, all under a single lock acquisition
    ///
    /// `tick` is the scheduler's monotonically increasing tick counter and
    /// `rate` its fixed cadence in Hz; a task advances only on ticks where
    /// `tick % advance_divisor(rate, fps) == 0`.
    pub(crate) fn advance_frames(&self, tick: u64, rate: u32) -> TickBatch {
        let mut state = self.state.lock();
        let mut batch = TickBatch::default();
        let background_only = state.background_only;

        if !background_only {
            for (&key, task) in &mut state.videos {
                if tick % advance_divisor(rate, task.fps) != 0 {
                    continue;
                }
                if let Some(index) = task.advance() {
                    batch.videos.push(VideoWrite {
                        key,
                        index,
                        frame: task.frame(index),
                    });
                }
            }
        }

        if let Some(bg) = state.background.as_mut() {
            if tick % advance_divisor(rate, bg.fps) == 0 {
                if let Some((index, finished)) = bg.advance() {
                    batch.background = Some(BackgroundWrite {
                        index,
                        frame: bg.frame(index),
                        finished,
                    });
                }
            }
        }

        if !background_only {
            batch.images = state.images.drain(..).collect();
        }

        batch
    }

    /// Gentle cleanup: bound each cache to its most recent indices
    ///
    /// The background cache keeps at most `background_keep` grid frames and
    /// each per-key cache at most `video_keep` frames; the oldest indices go
    /// first and the active frame is always retained. Each task is trimmed
    /// atomically under the store lock.
    pub fn trim_frame_caches(&self, background_keep: usize, video_keep: usize) -> TrimOutcome {
        let mut state = self.state.lock();
        let mut outcome = TrimOutcome::default();
        if let Some(bg) = state.background.as_mut() {
            outcome.background_evicted = bg.trim(background_keep);
        }
        for task in state.videos.values_mut() {
            outcome.video_evicted += task.trim(video_keep);
        }
        if outcome.background_evicted > 0 || outcome.video_evicted > 0 {
            tracing::debug!(
                background_evicted = outcome.background_evicted,
                video_evicted = outcome.video_evicted,
                "Frame caches trimmed"
            );
        }
        outcome
    }

    /// Aggressive cleanup: drop every cached frame except the active ones
    ///
    /// Returns the number of frames evicted. Task cursors and settings stay
    /// intact; subsequent renders of evicted indices are transient misses.
    pub fn clear_frame_caches(&self) -> usize {
        let mut state = self.state.lock();
        let mut evicted = 0;
        if let Some(bg) = state.background.as_mut() {
            evicted += bg.trim(0);
        }
        for task in state.videos.values_mut() {
            evicted += task.trim(0);
        }
        if evicted > 0 {
            tracing::info!(evicted = evicted, "Frame caches cleared under memory pressure");
        }
        evicted
    }
}

impl std::fmt::Debug for RenderTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RenderTaskStore")
            .field("key_count", &self.key_count)
            .field("images", &state.images.len())
            .field("videos", &state.videos.len())
            .field("background", &state.background.is_some())
            .field("background_only", &state.background_only)
            .finish()
    }
}
