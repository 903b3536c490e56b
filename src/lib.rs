//! Deckgrid - Render Scheduling Core for Grid Button Displays
//!
//! This crate drives a grid of independently addressable hardware button
//! displays (a physical or virtual control surface) with visual content:
//! one-shot images, per-key looping video clips, and a full-grid animated
//! background. It is completely independent of any device transport or UI
//! framework; the owning application supplies a [`KeySurface`] implementation
//! and pre-rendered frames, and consumes input events and mirror frames.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Owning application                        │
//! │   (plugins / pages / settings live outside this crate)        │
//! └───────┬───────────────────────────────────────────▲──────────┘
//!         │ set_image / set_video / set_background    │ events,
//!         ▼                                           │ mirrors
//! ┌──────────────────┐      ┌─────────────────────────┴────────┐
//! │ RenderTaskStore  │◄─────┤        DeckController            │
//! │ images / videos  │      └──────┬───────────────┬───────────┘
//! │ background       │             │ spawns        │ spawns
//! └───▲──────────▲───┘      ┌──────▼───────┐  ┌────▼──────────┐
//!     │ trim     │ advance  │FrameScheduler│  │ MemoryMonitor │
//!     │          └──────────┤  (tick loop) │  │ (watermarks)  │
//!     └─────────────────────┴──────┬───────┘  └───────────────┘
//!                                  │ KeyMapper (rotation)
//!                           ┌──────▼───────┐
//!                           │  KeySurface  │  exclusive access per tick
//!                           └──────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`DeckController`]: facade that owns the store and both workers
//! - [`RenderTaskStore`]: thread-safe home for the three render task kinds
//! - [`FrameScheduler`]: fixed-cadence worker multiplexing tasks onto the device
//! - [`MemoryMonitor`]: periodic sampler evicting cached frames on pressure
//! - [`KeyMapper`]: rotation-aware logical↔physical index transform
//! - [`KeySurface`]: the device write seam implemented by the application
//!
//! # Module Overview
//!
//! - [`geometry`]: key layout, rotation, and coordinate transforms
//! - [`frame`]: pre-rendered frame value types
//! - [`surface`]: device write seam and exclusive-access wrapper
//! - [`store`]: render task containers and frame-cache trimming
//! - [`scheduler`]: the tick loop, its state machine, and its events
//! - [`memory`]: resident-memory watermarks and tiered cache cleanup
//! - [`input`]: physical-order key reports translated to logical events
//! - [`controller`]: the outward facade
//! - [`testing`]: shared test surfaces (mock device implementations)
//!
//! # No Device Dependencies
//!
//! This crate has **zero** dependencies on HID, USB, or image-decoding
//! libraries. Frames arrive already rendered to the device pixel format;
//! composition and decoding are the collaborators' jobs.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod controller;
pub mod frame;
pub mod geometry;
pub mod input;
pub mod memory;
pub mod scheduler;
pub mod store;
pub mod surface;
pub mod testing;

pub use controller::{DeckConfig, DeckController};
pub use frame::{BackgroundFrame, FrameEncoding, ImageFormat, KeyFrame};
pub use geometry::{GeometryError, KeyLayout, KeyMapper, Rotation};
pub use input::{diff_key_states, logical_key_states, KeyEvent};
pub use memory::{
    resident_memory_bytes, CleanupTier, MemoryConfig, MemoryMonitor, MemoryMonitorHandle,
    MemoryStats,
};
pub use scheduler::{
    FrameScheduler, MirrorFrame, SchedulerConfig, SchedulerEvent, SchedulerHandle, SchedulerState,
};
pub use store::{FrameCursor, ImageTask, RenderTaskStore, TrimOutcome};
pub use surface::{KeySurface, SharedSurface, SurfaceError, SurfaceInfo};
