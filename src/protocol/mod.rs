//! Compositor protocol seam
//!
//! Everything the core asks of the compositor goes through
//! [`ProtocolBackend`]. Objects are referred to by small copyable ids so the
//! display, window and sink code never touch proxies directly, and the same
//! code runs against a live `wayland-client` connection
//! ([`wayland::WaylandBackend`]) or the in-process recording compositor
//! ([`headless::HeadlessBackend`]).
//!
//! # Threading
//!
//! Exactly one thread (the display's dispatch thread) calls
//! [`ProtocolBackend::dispatch_blocking`]. Requests may be issued from any
//! thread at the same time.

pub mod headless;
pub mod wayland;

use crate::error::Result;
use std::fmt;
use std::os::fd::BorrowedFd;

macro_rules! object_ids {
    ($($(#[$meta:meta])* $name:ident => $prefix:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!($prefix, "#{}"), self.0)
                }
            }
        )*
    };
}

object_ids! {
    /// `wl_surface`
    SurfaceId => "surface",
    /// `wl_subsurface`
    SubsurfaceId => "subsurface",
    /// `wp_viewport`
    ViewportId => "viewport",
    /// `wl_buffer`
    BufferId => "buffer",
    /// One-shot `wl_surface.frame` callback
    CallbackId => "callback",
    /// `xdg_toplevel` or a fullscreen-shell presentation
    ToplevelId => "toplevel",
    /// `wl_seat`
    SeatId => "seat",
}

/// Snapshot of what the compositor advertised during discovery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Globals {
    pub compositor: bool,
    pub subcompositor: bool,
    pub shm: bool,
    pub viewporter: bool,
    pub dmabuf: bool,
    pub xdg_wm_base: bool,
    pub fullscreen_shell: bool,
    pub seat: bool,
    /// `wl_shm` format codes
    pub shm_formats: Vec<u32>,
    /// `(drm fourcc, modifier)` pairs advertised by `zwp_linux_dmabuf_v1`
    pub dmabuf_formats: Vec<(u32, u64)>,
}

impl Globals {
    /// Names of mandatory globals that are absent
    pub fn missing_mandatory(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.compositor {
            missing.push("wl_compositor");
        }
        if !self.subcompositor {
            missing.push("wl_subcompositor");
        }
        if !self.shm {
            missing.push("wl_shm");
        }
        missing
    }
}

/// Events the dispatch thread hands to the display
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// `wl_buffer.release`
    BufferReleased(BufferId),
    /// `wl_callback.done` for a frame callback
    FrameDone { callback: CallbackId, time: u32 },
    /// Toplevel configure, already acknowledged. Zero sizes mean "client decides"
    ToplevelConfigured { toplevel: ToplevelId, width: i32, height: i32 },
    /// The compositor asked the toplevel to close
    ToplevelClosed { toplevel: ToplevelId },
    PointerButton {
        seat: SeatId,
        surface: Option<SurfaceId>,
        serial: u32,
        button: u32,
        pressed: bool,
    },
    TouchDown { seat: SeatId, surface: Option<SurfaceId>, serial: u32 },
}

/// Outcome of one blocking dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Dispatched,
    /// The wait was interrupted by [`ProtocolBackend::cancel_dispatch`]
    Cancelled,
}

/// Source rectangle for `wp_viewport.set_source`, in buffer coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Parameters for wrapping an fd-backed block as a `wl_shm` buffer
#[derive(Debug)]
pub struct ShmBufferDesc<'a> {
    pub fd: BorrowedFd<'a>,
    pub pool_size: usize,
    pub offset: usize,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    /// `wl_shm` format code
    pub format: u32,
}

#[derive(Debug)]
pub struct DmabufPlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub offset: u32,
    pub stride: u32,
}

/// Parameters for `zwp_linux_buffer_params_v1.create_immed`
#[derive(Debug)]
pub struct DmabufBufferDesc<'a> {
    pub planes: Vec<DmabufPlane<'a>>,
    pub width: i32,
    pub height: i32,
    /// DRM fourcc
    pub format: u32,
    pub modifier: u64,
    pub interlaced: bool,
    pub bottom_first: bool,
}

/// Requests and event pumping against a compositor
pub trait ProtocolBackend: Send + Sync + 'static {
    /// Synchronous round-trip; events produced meanwhile are queued for the
    /// next dispatch
    fn roundtrip(&self) -> Result<()>;
    fn globals(&self) -> Globals;

    /// Blocks until events arrive or the wait is cancelled
    fn dispatch_blocking(&self, events: &mut Vec<ProtocolEvent>) -> Result<DispatchStatus>;
    /// Interrupts a pending or future [`ProtocolBackend::dispatch_blocking`]
    fn cancel_dispatch(&self);
    fn flush(&self) -> Result<()>;

    fn create_surface(&self) -> Result<SurfaceId>;
    fn destroy_surface(&self, surface: SurfaceId);

    fn create_subsurface(&self, surface: SurfaceId, parent: SurfaceId) -> Result<SubsurfaceId>;
    fn subsurface_set_position(&self, subsurface: SubsurfaceId, x: i32, y: i32);
    fn subsurface_set_sync(&self, subsurface: SubsurfaceId, sync: bool);
    /// Restacks the subsurface directly above or below `sibling`
    fn subsurface_place(&self, subsurface: SubsurfaceId, sibling: SurfaceId, above: bool);
    fn destroy_subsurface(&self, subsurface: SubsurfaceId);

    fn create_viewport(&self, surface: SurfaceId) -> Result<ViewportId>;
    /// `None` resets the source to the whole buffer
    fn viewport_set_source(&self, viewport: ViewportId, source: Option<SourceRect>);
    /// Non-positive sizes reset the destination
    fn viewport_set_destination(&self, viewport: ViewportId, width: i32, height: i32);
    fn destroy_viewport(&self, viewport: ViewportId);

    fn surface_attach(&self, surface: SurfaceId, buffer: Option<BufferId>);
    fn surface_damage(&self, surface: SurfaceId, x: i32, y: i32, width: i32, height: i32);
    /// `None` clears the opaque region
    fn surface_set_opaque(&self, surface: SurfaceId, size: Option<(i32, i32)>);
    fn surface_frame(&self, surface: SurfaceId) -> Result<CallbackId>;
    fn surface_commit(&self, surface: SurfaceId);

    fn create_shm_buffer(&self, desc: &ShmBufferDesc<'_>) -> Result<BufferId>;
    fn create_dmabuf_buffer(&self, desc: &DmabufBufferDesc<'_>) -> Result<BufferId>;
    fn destroy_buffer(&self, buffer: BufferId);

    fn create_toplevel(&self, surface: SurfaceId, fullscreen: bool) -> Result<ToplevelId>;
    fn toplevel_set_fullscreen(&self, toplevel: ToplevelId, fullscreen: bool);
    fn toplevel_move(&self, toplevel: ToplevelId, seat: SeatId, serial: u32);
    fn destroy_toplevel(&self, toplevel: ToplevelId);

    /// Destroys capability-bound globals (shm, dmabuf, viewporter, shells)
    fn release_globals(&self);
    /// Closes the connection if the backend owns it
    fn disconnect(&self);
}
