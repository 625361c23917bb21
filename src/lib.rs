//! # wlsink
//!
//! Core of a Wayland video sink: it takes decoded frames and puts them on
//! screen through a Wayland compositor with as little copying as possible.
//!
//! ## Architecture
//!
//! - `protocol`: the seam to the compositor, a live `wayland-client`
//!   backend plus an in-process headless one
//! - `display`: connection, capability discovery and the dispatch thread
//! - `buffer`: memory blocks, the per-display buffer registry, dmabuf and
//!   `wl_shm` wrapping and the copy pool
//! - `window`: the area + video surface pair and its fill-mode geometry
//! - `sink`: render dispatch and frame pacing
//! - `config`: TOML configuration with environment overrides
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wlsink::{NoHost, SinkConfig, VideoSink};
//! use wlsink::format::{VideoFormat, VideoInfo};
//!
//! let sink = VideoSink::new(&SinkConfig::from_env(), Arc::new(NoHost));
//! sink.start()?;
//! sink.set_caps(VideoInfo::new(VideoFormat::NV12, 1920, 1080))?;
//! # Ok::<(), wlsink::SinkError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod display;
pub mod error;
pub mod format;
pub mod protocol;
pub mod sink;
pub mod window;

// Re-export main types for easy access
pub use buffer::memory::{MemfdAllocator, Memory, MemoryAllocator};
pub use buffer::{BufferSource, RenderableBuffer};
pub use config::SinkConfig;
pub use display::Display;
pub use error::{Result, SinkError};
pub use format::{MemoryDomain, VideoFormat, VideoFrame, VideoInfo};
pub use sink::pacer::{DropReason, FramePacer, PacerStats};
pub use sink::{NoHost, RenderOutcome, SinkHost, VideoSink};
pub use window::{FillMode, Layer, Rectangle, Window};

/// Version information for wlsink
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
