//! Display connection
//!
//! A [`Display`] owns one compositor connection (through a
//! [`ProtocolBackend`]), discovers what the compositor offers, runs the
//! dispatch thread that delivers compositor events, and owns the
//! [`BufferRegistry`] of every buffer created on it.
//!
//! # Features
//!
//! - **Capability discovery**: exactly two synchronous round-trips, mandatory
//!   globals enforced, optional ones degrade with a warning
//! - **Format queries**: cached shm/dmabuf format sets, AFBC and NV15 support
//! - **Event fan-out**: listeners subscribe to frame, configure, close and
//!   input events plus a connection-lost notification
//! - **Interactive move**: left-button press or touch-down on a toplevel
//!   window starts a compositor-side move
//!
//! # Usage
//!
//! ```no_run
//! use wlsink::display::Display;
//! use wlsink::format::{MemoryDomain, VideoFormat};
//!
//! let display = Display::connect(None)?;
//! if display.check_format_supported(VideoFormat::NV12, MemoryDomain::Dmabuf) {
//!     println!("zero-copy NV12 available");
//! }
//! display.shutdown();
//! # Ok::<(), wlsink::SinkError>(())
//! ```

mod dispatch;

use crate::buffer::memory::{Memory, MemoryId};
use crate::buffer::registry::BufferRegistry;
use crate::buffer::{DisplayToken, RenderableBuffer};
use crate::error::{Result, SinkError};
use crate::format::{drm, MemoryDomain, VideoFormat};
use crate::protocol::wayland::WaylandBackend;
use crate::protocol::{Globals, ProtocolBackend, ProtocolEvent, SeatId, SurfaceId, ToplevelId};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Left mouse button (`BTN_LEFT` from linux/input-event-codes.h)
pub const BTN_LEFT: u32 = 0x110;

/// Receives compositor events from the dispatch thread
///
/// Handlers run on the dispatch thread and must not block on it.
pub trait EventListener: Send + Sync {
    fn handle_event(&self, event: &ProtocolEvent);

    /// The connection failed; the display is unusable from now on
    fn connection_lost(&self, _error: &SinkError) {}
}

/// What the compositor offers, as discovered at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub shm: bool,
    pub dmabuf: bool,
    pub viewport_scaling: bool,
    pub xdg_shell: bool,
    pub fullscreen_shell: bool,
    pub pointer_move: bool,
    /// Some dmabuf format is advertised with the ARM AFBC modifier
    pub afbc: bool,
    /// NV15 (NV12_10LE40) dmabufs are accepted
    pub nv15: bool,
}

impl Capabilities {
    pub fn has_shell(&self) -> bool {
        self.xdg_shell || self.fullscreen_shell
    }
}

/// Result of a format query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSupport {
    pub supported: bool,
    /// Frames of this format may arrive AFBC-compressed
    pub afbc: bool,
}

/// One acceptable (format, domain, layout) combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatCaps {
    pub format: VideoFormat,
    pub domain: MemoryDomain,
    pub afbc: bool,
}

pub(crate) struct DisplayInner {
    backend: Arc<dyn ProtocolBackend>,
    capabilities: Capabilities,
    shm_formats: HashSet<VideoFormat>,
    dmabuf_formats: HashSet<VideoFormat>,
    owns_connection: bool,
    registry: Arc<BufferRegistry>,
    shutdown: AtomicBool,
    failure: Mutex<Option<String>>,
    listeners: Mutex<Vec<Weak<dyn EventListener>>>,
    move_targets: Mutex<HashMap<SurfaceId, ToplevelId>>,
}

impl DisplayInner {
    fn listeners(&self) -> Vec<Arc<dyn EventListener>> {
        let mut listeners = self.listeners.lock();
        listeners.retain(|listener| listener.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    fn handle_event(&self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::BufferReleased(server) => match self.registry.lookup_by_server(*server) {
                Some(buffer) => buffer.on_release(),
                None => debug!("Release for unknown {}", server),
            },
            ProtocolEvent::PointerButton {
                seat,
                surface: Some(surface),
                serial,
                button,
                pressed: true,
            } if *button == BTN_LEFT => self.start_move(*surface, *seat, *serial),
            ProtocolEvent::TouchDown {
                seat,
                surface: Some(surface),
                serial,
            } => self.start_move(*surface, *seat, *serial),
            _ => {}
        }

        for listener in self.listeners() {
            listener.handle_event(event);
        }
    }

    fn start_move(&self, surface: SurfaceId, seat: SeatId, serial: u32) {
        let toplevel = self.move_targets.lock().get(&surface).copied();
        if let Some(toplevel) = toplevel {
            debug!("🖱️ Interactive move of {} (serial {})", toplevel, serial);
            self.backend.toplevel_move(toplevel, seat, serial);
            if let Err(e) = self.backend.flush() {
                warn!("⚠️ Flush after move request failed: {}", e);
            }
        }
    }

    fn fail(&self, err: SinkError) {
        error!("💥 Display connection failed: {}", err);
        *self.failure.lock() = Some(err.to_string());
        for listener in self.listeners() {
            listener.connection_lost(&err);
        }
    }
}

/// Compositor connection shared by sinks
pub struct Display {
    inner: Arc<DisplayInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Display")
            .field("capabilities", &self.inner.capabilities)
            .field("owns_connection", &self.inner.owns_connection)
            .field("buffers", &self.inner.registry.len())
            .finish()
    }
}

impl Display {
    /// Opens a new connection to `name`, or the default display
    pub fn connect(name: Option<&str>) -> Result<Self> {
        let backend = WaylandBackend::connect(name)?;
        Self::with_backend(Arc::new(backend), true)
    }

    /// Uses a connection owned by the application; it is never closed here
    pub fn from_connection(connection: wayland_client::Connection) -> Result<Self> {
        let backend = WaylandBackend::from_connection(connection)?;
        Self::with_backend(Arc::new(backend), false)
    }

    /// Discovers capabilities over `backend` and starts the dispatch thread
    pub fn with_backend(backend: Arc<dyn ProtocolBackend>, owns_connection: bool) -> Result<Self> {
        // First round-trip binds globals, second collects their initial events
        for _ in 0..2 {
            if let Err(e) = backend.roundtrip() {
                if owns_connection {
                    backend.disconnect();
                }
                return Err(SinkError::Connection(format!("discovery round-trip failed: {}", e)));
            }
        }

        let globals = backend.globals();
        let missing = globals.missing_mandatory();
        if !missing.is_empty() {
            error!("❌ Compositor lacks mandatory globals: {}", missing.join(", "));
            if owns_connection {
                backend.disconnect();
            }
            return Err(SinkError::Connection(format!("missing mandatory globals: {}", missing.join(", "))));
        }

        let (capabilities, shm_formats, dmabuf_formats) = Self::discover(&globals);
        Self::warn_degraded(&capabilities);

        let inner = Arc::new(DisplayInner {
            backend,
            capabilities,
            shm_formats,
            dmabuf_formats,
            owns_connection,
            registry: BufferRegistry::new(),
            shutdown: AtomicBool::new(false),
            failure: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            move_targets: Mutex::new(HashMap::new()),
        });

        let thread_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("wl-display-dispatch".into())
            .spawn(move || dispatch::run(thread_inner))
            .map_err(|e| SinkError::Connection(format!("failed to spawn dispatch thread: {}", e)))?;

        info!(
            "🖥️ Display ready: {} shm formats, {} dmabuf formats, viewporter={}, afbc={}",
            inner.shm_formats.len(),
            inner.dmabuf_formats.len(),
            capabilities.viewport_scaling,
            capabilities.afbc
        );

        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn discover(globals: &Globals) -> (Capabilities, HashSet<VideoFormat>, HashSet<VideoFormat>) {
        let shm_formats: HashSet<VideoFormat> = globals
            .shm_formats
            .iter()
            .filter_map(|code| VideoFormat::from_shm_format(*code))
            .collect();
        let dmabuf_formats: HashSet<VideoFormat> = globals
            .dmabuf_formats
            .iter()
            .filter_map(|(code, _)| VideoFormat::from_drm_fourcc(*code))
            .collect();
        let afbc = globals
            .dmabuf_formats
            .iter()
            .any(|(_, modifier)| *modifier == drm::AFBC_MODIFIER);
        let nv15 = globals.dmabuf_formats.iter().any(|(code, _)| *code == drm::NV15);

        let capabilities = Capabilities {
            shm: globals.shm,
            dmabuf: globals.dmabuf,
            viewport_scaling: globals.viewporter,
            xdg_shell: globals.xdg_wm_base,
            fullscreen_shell: globals.fullscreen_shell,
            pointer_move: globals.seat && globals.xdg_wm_base,
            afbc: globals.dmabuf && afbc,
            nv15: globals.dmabuf && nv15,
        };
        (capabilities, shm_formats, dmabuf_formats)
    }

    fn warn_degraded(capabilities: &Capabilities) {
        if !capabilities.viewport_scaling {
            warn!("⚠️ wp_viewporter not available, video will not be scaled");
        }
        if !capabilities.dmabuf {
            warn!("⚠️ zwp_linux_dmabuf_v1 not available, dmabuf frames will be copied");
        }
        if !capabilities.has_shell() {
            warn!("⚠️ No shell protocol available, only embedded windows can be used");
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn backend(&self) -> &Arc<dyn ProtocolBackend> {
        &self.inner.backend
    }

    pub fn owns_connection(&self) -> bool {
        self.inner.owns_connection
    }

    /// Looks `format` up in the cached sets for `domain`
    pub fn format_support(&self, format: VideoFormat, domain: MemoryDomain) -> FormatSupport {
        match domain {
            MemoryDomain::Shm => FormatSupport {
                supported: self.inner.shm_formats.contains(&format),
                afbc: false,
            },
            MemoryDomain::Dmabuf => {
                let supported = self.inner.dmabuf_formats.contains(&format);
                let afbc = supported
                    && self.inner.capabilities.afbc
                    && matches!(format, VideoFormat::NV12 | VideoFormat::NV12_10LE40 | VideoFormat::NV16);
                FormatSupport { supported, afbc }
            }
        }
    }

    pub fn check_format_supported(&self, format: VideoFormat, domain: MemoryDomain) -> bool {
        self.format_support(format, domain).supported
    }

    /// Formats accepted for `domain`, in a stable order
    pub fn supported_formats(&self, domain: MemoryDomain) -> Vec<VideoFormat> {
        VideoFormat::ALL
            .iter()
            .copied()
            .filter(|format| self.check_format_supported(*format, domain))
            .collect()
    }

    /// Every acceptable combination, including the AFBC variants of NV12,
    /// NV16 and NV12_10LE40
    pub fn supported_caps(&self) -> Vec<FormatCaps> {
        let mut caps = Vec::new();
        for domain in [MemoryDomain::Dmabuf, MemoryDomain::Shm] {
            for format in self.supported_formats(domain) {
                caps.push(FormatCaps { format, domain, afbc: false });
                if self.format_support(format, domain).afbc {
                    caps.push(FormatCaps { format, domain, afbc: true });
                }
            }
        }
        caps
    }

    pub fn registry(&self) -> &Arc<BufferRegistry> {
        &self.inner.registry
    }

    pub fn token(&self) -> DisplayToken {
        self.inner.registry.token()
    }

    /// Wraps `memory` with `construct` unless it already has a buffer here
    pub fn register_buffer<F>(&self, memory: &Memory, construct: F) -> Result<Arc<RenderableBuffer>>
    where
        F: FnOnce(DisplayToken) -> Result<RenderableBuffer>,
    {
        self.ensure_usable()?;
        self.inner.registry.get_or_wrap(memory, construct)
    }

    pub fn lookup_buffer(&self, memory: MemoryId) -> Option<Arc<RenderableBuffer>> {
        self.inner.registry.lookup(memory)
    }

    pub fn unregister_buffer(&self, memory: MemoryId) {
        self.inner.registry.unregister(memory);
    }

    pub fn add_listener(&self, listener: Weak<dyn EventListener>) {
        self.inner.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Weak<dyn EventListener>) {
        self.inner
            .listeners
            .lock()
            .retain(|existing| !Weak::ptr_eq(existing, listener));
    }

    /// Pointer and touch presses on `surface` move `toplevel`
    pub fn register_move_target(&self, surface: SurfaceId, toplevel: ToplevelId) {
        self.inner.move_targets.lock().insert(surface, toplevel);
    }

    pub fn unregister_move_target(&self, surface: SurfaceId) {
        self.inner.move_targets.lock().remove(&surface);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// The error that killed the dispatch thread, if any
    pub fn failure(&self) -> Option<SinkError> {
        self.inner.failure.lock().clone().map(SinkError::ProtocolIo)
    }

    pub fn ensure_usable(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(SinkError::Shutdown);
        }
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stops the dispatch thread, force-releases every buffer and tears the
    /// connection down. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🛑 Shutting down display");
        self.inner.backend.cancel_dispatch();

        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() == std::thread::current().id() {
                debug!("Display dropped from its own dispatch thread, not joining");
            } else if thread.join().is_err() {
                error!("💥 Dispatch thread panicked");
            }
        }

        self.inner.registry.shutdown();
        self.inner.move_targets.lock().clear();
        self.inner.backend.release_globals();
        if self.inner.owns_connection {
            self.inner.backend.disconnect();
        }
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        self.shutdown();
    }
}
