//! Render dispatch
//!
//! [`VideoSink`] ties a [`Display`], a [`Window`] and a [`FramePacer`]
//! together. Each [`VideoSink::render`] call picks the cheapest way to get
//! the frame on screen (dmabuf import, direct `wl_shm` wrapping, or a copy
//! into the sink's pool), commits it with a frame callback, and drops any
//! frame that arrives while that callback is still outstanding.
//!
//! # Locking
//!
//! One render lock guards the window, the pacer and the last shown buffer.
//! Callers hold it for the duration of a render or geometry call. The
//! dispatch thread takes it only inside frame, configure and close
//! handlers. The last handle to a [`Display`] is never dropped while the
//! lock is held, because dropping it joins the dispatch thread.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wlsink::config::SinkConfig;
//! use wlsink::format::{VideoFormat, VideoFrame, VideoInfo};
//! use wlsink::sink::{NoHost, VideoSink};
//! use wlsink::buffer::memory::Memory;
//!
//! let sink = VideoSink::new(&SinkConfig::from_env(), Arc::new(NoHost));
//! sink.start()?;
//! let info = VideoInfo::new(VideoFormat::BGRx, 320, 240);
//! sink.set_caps(info.clone())?;
//! sink.render(&VideoFrame::new(Memory::from_vec(vec![0; info.size])))?;
//! sink.stop();
//! # Ok::<(), wlsink::SinkError>(())
//! ```

pub mod pacer;

use crate::buffer::dmabuf::wrap_dmabuf;
use crate::buffer::memory::{MemfdAllocator, Memory, MemoryAllocator};
use crate::buffer::pool::{BufferPool, PoolLimits};
use crate::buffer::shm::wrap_shm;
use crate::buffer::{BufferSource, RenderableBuffer};
use crate::config::SinkConfig;
use crate::display::{Display, EventListener, FormatCaps};
use crate::error::{Result, SinkError};
use crate::format::{MemoryDomain, VideoFormat, VideoFrame, VideoInfo};
use crate::protocol::{CallbackId, ProtocolEvent, SurfaceId};
use crate::window::{ConfigureSignal, CropBox, FillMode, Layer, Rectangle, Window};
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use pacer::{DropReason, FramePacer, PacerStats};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Slice of the synchronous frame wait; shutdown is noticed between slices
const SYNC_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Application side of the sink
///
/// All methods have defaults, so a host only implements what it needs.
#[cfg_attr(test, mockall::automock)]
pub trait SinkHost: Send + Sync {
    /// A frame arrived and there is no window. Called without the render
    /// lock; the host may call [`VideoSink::set_window_handle`] and
    /// [`VideoSink::set_render_rectangle`] from here. If it does nothing the
    /// sink creates its own toplevel.
    fn prepare_window(&self, _sink: &VideoSink) {}

    /// Offers a display shared with the application. Called with the render
    /// lock held, so it must not call back into the sink.
    fn need_display(&self) -> Option<Arc<Display>> {
        None
    }

    /// The window was closed or the connection broke; the sink cannot
    /// render anymore. Called from the dispatch thread.
    fn on_fatal_error(&self, _error: &SinkError) {}
}

/// Host that supplies nothing; the sink connects and creates its own window
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHost;

impl SinkHost for NoHost {}

/// What happened to a frame passed to [`VideoSink::render`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Committed to the compositor through this path
    Rendered(BufferSource),
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowHandle {
    /// No handle given; the sink creates a toplevel when needed
    Unset,
    /// The host set a null handle: frames are dropped until it sets a real one
    Deferred,
    Embedded(SurfaceId),
}

/// A resolved frame buffer and the memory it shows
struct Resolved {
    buffer: Arc<RenderableBuffer>,
    memory: Memory,
    /// Layout to show it with; `None` keeps the previous one
    info: Option<VideoInfo>,
}

/// Everything guarded by the render lock
struct RenderState {
    display: Option<Arc<Display>>,
    listener: Option<Weak<dyn EventListener>>,
    window: Option<Window>,
    handle: WindowHandle,
    pacer: FramePacer,
    negotiated: Option<VideoInfo>,
    /// Layout of the buffer in `last`
    info: Option<VideoInfo>,
    video_info_changed: bool,
    resend_info: bool,
    last: Option<(Arc<RenderableBuffer>, Memory)>,
    pool: Option<BufferPool>,
    render_rectangle: Option<Rectangle>,
    fullscreen: bool,
    layer: Layer,
    alpha: f64,
    fill_mode: FillMode,
    sync_frame: bool,
    closed: bool,
}

struct SinkShared {
    state: Mutex<RenderState>,
    frame_done: Condvar,
    configure: ConfigureSignal,
    allocator: Arc<dyn MemoryAllocator>,
    host: Arc<dyn SinkHost>,
    display_name: Option<String>,
    pool_limits: PoolLimits,
}

impl EventListener for SinkShared {
    fn handle_event(&self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::FrameDone { callback, .. } => {
                let mut state = self.state.lock();
                if state.pacer.on_frame_done(*callback) {
                    self.frame_done.notify_all();
                }
            }
            ProtocolEvent::ToplevelConfigured { toplevel, width, height } => {
                // A window under construction waits on this without the render lock
                self.configure.notify(*toplevel, *width, *height);
                let mut state = self.state.lock();
                if let Some(window) = state.window.as_mut().filter(|w| w.toplevel() == Some(*toplevel)) {
                    window.handle_configure(*width, *height);
                }
            }
            ProtocolEvent::ToplevelClosed { toplevel } => {
                let closed = {
                    let mut state = self.state.lock();
                    let ours = state.window.as_ref().is_some_and(|w| w.toplevel() == Some(*toplevel));
                    if ours {
                        state.closed = true;
                    }
                    ours
                };
                if closed {
                    error!("🚪 Output window was closed by the compositor");
                    self.frame_done.notify_all();
                    self.host.on_fatal_error(&SinkError::WindowClosed);
                }
            }
            _ => {}
        }
    }

    fn connection_lost(&self, error: &SinkError) {
        error!("💥 Lost the display connection: {}", error);
        self.frame_done.notify_all();
        self.host.on_fatal_error(error);
    }
}

/// Handle to one sink; clones share the same window and pacing state
#[derive(Clone)]
pub struct VideoSink {
    shared: Arc<SinkShared>,
}

impl std::fmt::Debug for VideoSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("VideoSink")
            .field("handle", &state.handle)
            .field("window", &state.window)
            .field("negotiated", &state.negotiated)
            .field("pending", &state.pacer.is_pending())
            .finish()
    }
}

impl VideoSink {
    pub fn new(config: &SinkConfig, host: Arc<dyn SinkHost>) -> Self {
        Self::with_allocator(config, host, Arc::new(MemfdAllocator::new()))
    }

    /// Uses `allocator` for the copy pool and for classifying frame memory
    pub fn with_allocator(config: &SinkConfig, host: Arc<dyn SinkHost>, allocator: Arc<dyn MemoryAllocator>) -> Self {
        let state = RenderState {
            display: None,
            listener: None,
            window: None,
            handle: WindowHandle::Unset,
            pacer: FramePacer::new(),
            negotiated: None,
            info: None,
            video_info_changed: false,
            resend_info: false,
            last: None,
            pool: None,
            render_rectangle: config.window.render_rectangle,
            fullscreen: config.window.fullscreen,
            layer: config.window.layer,
            alpha: config.window.alpha.clamp(0.0, 1.0),
            fill_mode: config.window.fill_mode,
            sync_frame: config.display.sync_frame,
            closed: false,
        };
        Self {
            shared: Arc::new(SinkShared {
                state: Mutex::new(state),
                frame_done: Condvar::new(),
                configure: ConfigureSignal::new(),
                allocator,
                host,
                display_name: config.display.name.clone(),
                pool_limits: config.pool.limits(),
            }),
        }
    }

    /// Returns the sink's display, connecting (or asking the host) first
    fn ensure_display(&self, state: &mut RenderState) -> Result<Arc<Display>> {
        if let Some(display) = &state.display {
            return Ok(display.clone());
        }

        let display = match self.shared.host.need_display() {
            Some(display) => {
                info!("🤝 Using the display supplied by the application");
                display
            }
            None => Arc::new(Display::connect(self.shared.display_name.as_deref())?),
        };

        let listener: Arc<dyn EventListener> = self.shared.clone();
        let weak = Arc::downgrade(&listener);
        display.add_listener(weak.clone());
        state.listener = Some(weak);
        state.display = Some(display.clone());
        Ok(display)
    }

    /// Connects to the display so formats can be queried before negotiation
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let display = self.ensure_display(&mut state)?;
        display.ensure_usable()?;
        info!("▶️ Sink started");
        Ok(())
    }

    /// Releases the last frame, the copy pool and any toplevel window. An
    /// embedded window is cleared but kept, together with its display.
    pub fn stop(&self) {
        let (window, display, listener) = {
            let mut state = self.shared.state.lock();
            state.last = None;
            if let Some(window) = state.window.as_mut().filter(|w| !w.is_toplevel()) {
                if let Err(e) = window.render(None, None) {
                    warn!("⚠️ Failed to clear the embedded window: {}", e);
                }
            }
            let window = if state.window.as_ref().is_some_and(Window::is_toplevel) {
                state.window.take()
            } else {
                None
            };

            state.pacer.reset();
            state.closed = false;
            state.pool = None;
            state.negotiated = None;
            state.info = None;
            state.video_info_changed = false;
            state.resend_info = false;

            let (display, listener) = if state.window.is_none() {
                (state.display.take(), state.listener.take())
            } else {
                (None, None)
            };
            (window, display, listener)
        };
        self.shared.frame_done.notify_all();

        drop(window);
        if let (Some(display), Some(listener)) = (&display, &listener) {
            display.remove_listener(listener);
        }
        drop(display);
        info!("⏹️ Sink stopped");
    }

    /// Negotiates the frame format. Fails if the compositor cannot show
    /// `info` in its memory domain.
    pub fn set_caps(&self, info: VideoInfo) -> Result<()> {
        let mut state = self.shared.state.lock();
        let display = self.ensure_display(&mut state)?;
        display.ensure_usable()?;

        let support = display.format_support(info.format, info.domain);
        if !support.supported || (info.afbc && !support.afbc) {
            let domain = if info.afbc { "dmabuf (AFBC)".to_string() } else { info.domain.to_string() };
            warn!("⚠️ Rejecting caps: {} via {}", info.format, domain);
            return Err(SinkError::FormatUnsupported {
                format: info.format.to_string(),
                domain,
            });
        }

        info!(
            "🎬 Negotiated {} {}x{} via {}{}",
            info.format,
            info.width,
            info.height,
            info.domain,
            if info.afbc { " (AFBC)" } else { "" }
        );
        state.negotiated = Some(info);
        state.video_info_changed = true;
        state.pool = None;
        Ok(())
    }

    /// Formats the compositor accepts in `domain`
    pub fn supported_formats(&self, domain: MemoryDomain) -> Result<Vec<VideoFormat>> {
        let mut state = self.shared.state.lock();
        Ok(self.ensure_display(&mut state)?.supported_formats(domain))
    }

    /// Every acceptable (format, domain, AFBC) combination
    pub fn supported_caps(&self) -> Result<Vec<FormatCaps>> {
        let mut state = self.shared.state.lock();
        Ok(self.ensure_display(&mut state)?.supported_caps())
    }

    /// Shows `frame`, or drops it if the previous frame has not been
    /// presented yet
    pub fn render(&self, frame: &VideoFrame) -> Result<RenderOutcome> {
        // Declared before the guard so it is dropped after the render lock
        let display: Arc<Display>;
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(SinkError::WindowClosed);
        }
        if state.negotiated.is_none() {
            return Err(SinkError::NotNegotiated);
        }

        if state.window.is_none() {
            MutexGuard::unlocked(&mut state, || self.shared.host.prepare_window(self));

            if state.handle == WindowHandle::Deferred {
                trace!("Frame dropped, window not ready");
                state.pacer.record_drop(DropReason::WindowDeferred);
                return Ok(RenderOutcome::Dropped(DropReason::WindowDeferred));
            }
        }

        display = state.display.clone().ok_or(SinkError::Shutdown)?;
        display.ensure_usable()?;
        let negotiated = state.negotiated.clone().ok_or(SinkError::NotNegotiated)?;

        if state.window.is_none() {
            let mut window = Window::new_toplevel(
                display.clone(),
                self.shared.allocator.clone(),
                &negotiated,
                state.fullscreen,
                state.layer,
                state.render_rectangle,
                &self.shared.configure,
            )?;
            window.ensure_alpha(state.alpha);
            window.set_fill_mode(state.fill_mode);
            state.window = Some(window);
        }

        if let (Some(crop), Some(window)) = (frame.crop, state.window.as_mut()) {
            window.set_crop(CropBox {
                x: crop.x,
                y: crop.y,
                width: crop.width,
                height: crop.height,
            });
        }

        if state.pacer.is_pending() {
            trace!("Frame dropped, redraw pending");
            state.pacer.record_drop(DropReason::CallbackPending);
            return Ok(RenderOutcome::Dropped(DropReason::CallbackPending));
        }

        if !state.window.as_ref().is_some_and(Window::has_size) {
            warn!("⚠️ Window has no size set, make sure to set the render rectangle after the window handle");
            state.pacer.record_drop(DropReason::NoWindowSize);
            return Ok(RenderOutcome::Dropped(DropReason::NoWindowSize));
        }

        let resolved = self.resolve_buffer(&mut state, &display, frame, &negotiated)?;
        let source = resolved.buffer.source();

        let server = resolved.buffer.server_id();
        if state.last.as_ref().is_some_and(|(last, _)| last.server_id() == server) {
            debug!("{} is already being rendered", server);
            state.pacer.record_drop(DropReason::AlreadyShown);
            return Ok(RenderOutcome::Dropped(DropReason::AlreadyShown));
        }

        if let Some(info) = resolved.info {
            state.info = Some(info);
        }
        state.last = Some((resolved.buffer, resolved.memory));
        Self::render_last_buffer(&mut state, &display, false)?;

        if state.sync_frame {
            self.wait_frame_done(&mut state, &display);
        }
        Ok(RenderOutcome::Rendered(source))
    }

    /// Finds or creates the server buffer for `frame`: reuse, then dmabuf,
    /// then `wl_shm`, then a copy into the pool
    fn resolve_buffer(
        &self,
        state: &mut RenderState,
        display: &Display,
        frame: &VideoFrame,
        negotiated: &VideoInfo,
    ) -> Result<Resolved> {
        let primary = frame
            .primary()
            .ok_or_else(|| SinkError::allocation("frame has no memory"))?;

        if let Some(buffer) = display.lookup_buffer(primary.id()) {
            trace!("♻️ {} already wrapped as {}", primary.id(), buffer.server_id());
            return Ok(Resolved {
                buffer,
                memory: primary.clone(),
                info: None,
            });
        }

        let info = frame.effective_info(negotiated);
        let allocator = &self.shared.allocator;

        let all_gpu = frame.memories.iter().all(|memory| allocator.is_gpu_backed(memory));
        if all_gpu && display.check_format_supported(info.format, MemoryDomain::Dmabuf) {
            match wrap_dmabuf(display, frame, &info) {
                Ok(buffer) => {
                    return Ok(Resolved {
                        buffer,
                        memory: primary.clone(),
                        info: Some(info),
                    })
                }
                Err(e) => debug!("dmabuf import of {} failed: {}", primary.id(), e),
            }
        }

        if info.afbc {
            error!("❌ Could not import AFBC {} frame", info.format);
            return Err(SinkError::allocation(format!("could not import AFBC {} frame", info.format)));
        }

        if !display.check_format_supported(info.format, MemoryDomain::Shm) {
            return Err(SinkError::FormatUnsupported {
                format: info.format.to_string(),
                domain: MemoryDomain::Shm.to_string(),
            });
        }

        if let [memory] = frame.memories.as_slice() {
            if memory.is_fd_backed() {
                match wrap_shm(display, memory, &info, BufferSource::Shm) {
                    Ok(buffer) => {
                        return Ok(Resolved {
                            buffer,
                            memory: memory.clone(),
                            info: Some(info),
                        })
                    }
                    Err(e) => debug!("wl_shm wrapping of {} failed, copying: {}", memory.id(), e),
                }
            }
        }

        if state.pool.is_none() {
            state.pool = Some(BufferPool::new(allocator.clone(), negotiated, self.shared.pool_limits)?);
        }
        let pool = state.pool.as_ref().ok_or_else(|| SinkError::allocation("copy pool unavailable"))?;

        let on_screen = state.last.as_ref().map(|(_, memory)| memory.id());
        let target = pool.acquire(display.registry(), on_screen)?;
        pool.copy_frame(frame, &info, &target)?;
        let buffer = wrap_shm(display, &target, pool.info(), BufferSource::Copy)?;
        trace!("📋 Copied {} into {}", primary.id(), target.id());
        Ok(Resolved {
            buffer,
            memory: target,
            info: Some(pool.info().clone()),
        })
    }

    /// Commits `state.last` with a new frame callback
    fn render_last_buffer(state: &mut RenderState, display: &Display, redraw: bool) -> Result<()> {
        let RenderState {
            window,
            pacer,
            info,
            video_info_changed,
            resend_info,
            last,
            fill_mode,
            ..
        } = state;
        let (Some(window), Some((buffer, memory))) = (window.as_mut(), last.as_ref()) else {
            return Ok(());
        };

        let callback = display.backend().surface_frame(window.video_surface())?;
        pacer.callback_requested(callback);

        let pass_info = (*video_info_changed && !redraw) || *resend_info;
        if pass_info {
            *video_info_changed = false;
            *resend_info = false;
        }
        window.set_fill_mode(*fill_mode);

        let result = window.render(Some((buffer, memory.clone())), info.as_ref().filter(|_| pass_info));
        if let Err(e) = &result {
            // The commit carrying the callback may never have reached the server
            error!("❌ Render of {} failed: {}", buffer.server_id(), e);
            pacer.reset();
        }
        result
    }

    fn wait_frame_done(&self, state: &mut MutexGuard<'_, RenderState>, display: &Display) {
        while state.pacer.is_pending() {
            if state.closed || display.is_shut_down() || display.failure().is_some() {
                debug!("Stopped waiting for the frame callback");
                return;
            }
            self.shared.frame_done.wait_for(state, SYNC_WAIT_SLICE);
        }
    }

    /// Embeds the output into `handle`, a surface on the application's
    /// display. `None` defers window creation: frames are dropped until a
    /// real handle is set.
    pub fn set_window_handle(&self, handle: Option<SurfaceId>) -> Result<()> {
        let next = match handle {
            Some(surface) => WindowHandle::Embedded(surface),
            None => WindowHandle::Deferred,
        };

        let mut state = self.shared.state.lock();
        if state.handle == next {
            return Ok(());
        }
        debug!("Window handle {:?} -> {:?}", state.handle, next);

        let window = match handle {
            Some(parent) => {
                let display = self.ensure_display(&mut state)?;
                if display.owns_connection() {
                    error!("❌ Embedding requires the application's display");
                    return Err(SinkError::InvalidWindowHandle(
                        "cannot use an externally-supplied surface without an externally-supplied display handle"
                            .into(),
                    ));
                }
                let mut window = Window::new_in_surface(display, self.shared.allocator.clone(), parent)?;
                window.ensure_alpha(state.alpha);
                window.set_fill_mode(state.fill_mode);
                if state.layer != Layer::Normal {
                    window.ensure_layer(state.layer);
                }
                if let Some(rect) = state.render_rectangle {
                    window.set_render_rectangle(rect, true);
                }
                Some(window)
            }
            None => None,
        };

        state.handle = next;
        if state.window.is_some() {
            warn!("⚠️ Changing the window handle is dangerous");
            state.pacer.reset();
        }
        state.window = window;
        if state.window.is_some() && state.last.is_some() {
            state.resend_info = true;
            state.pacer.reset();
        }
        Ok(())
    }

    /// Places the window; cached until a window exists
    pub fn set_render_rectangle(&self, rect: Rectangle) {
        let mut state = self.shared.state.lock();
        match state.window.as_mut() {
            Some(window) => window.set_render_rectangle(rect, true),
            None => {
                debug!("📐 Caching render rectangle {}", rect);
                state.render_rectangle = Some(rect);
            }
        }
    }

    /// Redraws the last frame if nothing is pending
    pub fn expose(&self) -> Result<()> {
        let display: Arc<Display>;
        let mut state = self.shared.state.lock();
        let Some(current) = state.display.clone() else {
            return Ok(());
        };
        display = current;
        if state.window.is_some() && state.last.is_some() && !state.pacer.is_pending() {
            debug!("🔁 Expose, redrawing last frame");
            Self::render_last_buffer(&mut state, &display, true)?;
        }
        Ok(())
    }

    /// Starts an atomic move/resize of an embedded window; see
    /// [`Window::begin_geometry_change`]
    pub fn begin_geometry_change(&self) -> bool {
        let mut state = self.shared.state.lock();
        match state.window.as_mut() {
            Some(window) => window.begin_geometry_change(),
            None => {
                warn!("⚠️ begin_geometry_change called without a window");
                false
            }
        }
    }

    pub fn end_geometry_change(&self) -> bool {
        let mut state = self.shared.state.lock();
        match state.window.as_mut() {
            Some(window) => window.end_geometry_change(),
            None => {
                warn!("⚠️ end_geometry_change called without a window");
                false
            }
        }
    }

    pub fn set_fullscreen(&self, fullscreen: bool) {
        let mut state = self.shared.state.lock();
        if state.fullscreen == fullscreen {
            return;
        }
        state.fullscreen = fullscreen;
        if let Some(window) = state.window.as_mut() {
            window.ensure_fullscreen(fullscreen);
        }
    }

    pub fn set_layer(&self, layer: Layer) {
        let mut state = self.shared.state.lock();
        if state.layer == layer {
            return;
        }
        state.layer = layer;
        if let Some(window) = state.window.as_mut() {
            window.ensure_layer(layer);
        }
    }

    /// Window opacity, clamped to 0.0..=1.0
    pub fn set_alpha(&self, alpha: f64) {
        let alpha = alpha.clamp(0.0, 1.0);
        let mut state = self.shared.state.lock();
        if state.alpha == alpha {
            return;
        }
        state.alpha = alpha;
        if let Some(window) = state.window.as_mut() {
            window.ensure_alpha(alpha);
        }
    }

    /// Takes effect with the next frame
    pub fn set_fill_mode(&self, mode: FillMode) {
        let mut state = self.shared.state.lock();
        if state.fill_mode == mode {
            return;
        }
        state.fill_mode = mode;
        if let Some(window) = state.window.as_mut() {
            window.set_fill_mode(mode);
        }
    }

    pub fn set_sync_frame(&self, sync_frame: bool) {
        self.shared.state.lock().sync_frame = sync_frame;
    }

    pub fn fullscreen(&self) -> bool {
        self.shared.state.lock().fullscreen
    }

    pub fn layer(&self) -> Layer {
        self.shared.state.lock().layer
    }

    pub fn alpha(&self) -> f64 {
        self.shared.state.lock().alpha
    }

    pub fn fill_mode(&self) -> FillMode {
        self.shared.state.lock().fill_mode
    }

    pub fn sync_frame(&self) -> bool {
        self.shared.state.lock().sync_frame
    }

    /// True while the last commit's frame callback is outstanding
    pub fn is_frame_pending(&self) -> bool {
        self.shared.state.lock().pacer.is_pending()
    }

    pub fn pending_callback(&self) -> Option<CallbackId> {
        self.shared.state.lock().pacer.pending_callback()
    }

    pub fn is_window_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn stats(&self) -> PacerStats {
        self.shared.state.lock().pacer.stats().clone()
    }

    pub fn reset_stats(&self) {
        self.shared.state.lock().pacer.reset_stats();
    }

    pub fn display(&self) -> Option<Arc<Display>> {
        self.shared.state.lock().display.clone()
    }

    /// Runs `f` on the current window, under the render lock
    pub fn with_window<R>(&self, f: impl FnOnce(&Window) -> R) -> Option<R> {
        self.shared.state.lock().window.as_ref().map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::headless::HeadlessBackend;
    use crate::protocol::ProtocolBackend;
    use std::sync::mpsc;
    use std::time::Instant;

    fn headless_display(backend: &Arc<HeadlessBackend>) -> Arc<Display> {
        Arc::new(Display::with_backend(backend.clone(), false).unwrap())
    }

    fn host_with(display: Arc<Display>) -> MockSinkHost {
        let mut host = MockSinkHost::new();
        host.expect_need_display().returning(move || Some(display.clone()));
        host.expect_prepare_window().returning(|_| ());
        host
    }

    fn bgrx_frame(info: &VideoInfo) -> VideoFrame {
        VideoFrame::new(Memory::from_vec(vec![0x80; info.size]))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_render_before_caps_is_rejected() {
        let backend = Arc::new(HeadlessBackend::new());
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host_with(headless_display(&backend))));
        let info = VideoInfo::new(VideoFormat::BGRx, 16, 16);
        assert!(matches!(sink.render(&bgrx_frame(&info)), Err(SinkError::NotNegotiated)));
    }

    #[test]
    fn test_unsupported_caps_are_rejected() {
        let backend = Arc::new(HeadlessBackend::new());
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host_with(headless_display(&backend))));

        let err = sink.set_caps(VideoInfo::new(VideoFormat::v308, 16, 16)).unwrap_err();
        assert!(matches!(err, SinkError::FormatUnsupported { .. }));

        let afbc = VideoInfo::new(VideoFormat::BGRx, 16, 16)
            .with_domain(MemoryDomain::Dmabuf)
            .with_afbc(true);
        assert!(sink.set_caps(afbc).is_err());
        assert!(sink.set_caps(VideoInfo::new(VideoFormat::NV12, 16, 16)).is_ok());
    }

    #[test]
    fn test_first_frame_creates_toplevel_and_copies() {
        let backend = Arc::new(HeadlessBackend::new());
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host_with(headless_display(&backend))));
        let info = VideoInfo::new(VideoFormat::BGRx, 64, 48);
        sink.set_caps(info.clone()).unwrap();

        let outcome = sink.render(&bgrx_frame(&info)).unwrap();
        assert_eq!(outcome, RenderOutcome::Rendered(BufferSource::Copy));
        assert_eq!(backend.toplevels().len(), 1);
        assert!(sink.is_frame_pending());
        assert_eq!(
            sink.with_window(|w| w.render_rectangle()),
            Some(Rectangle::from_size(64, 48))
        );
    }

    #[test]
    fn test_frames_dropped_until_callback() {
        let backend = Arc::new(HeadlessBackend::new());
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host_with(headless_display(&backend))));
        let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
        sink.set_caps(info.clone()).unwrap();

        sink.render(&bgrx_frame(&info)).unwrap();
        let video = sink.with_window(|w| w.video_surface()).unwrap();
        let commits = backend.surface(video).unwrap().commits;

        let outcome = sink.render(&bgrx_frame(&info)).unwrap();
        assert_eq!(outcome, RenderOutcome::Dropped(DropReason::CallbackPending));
        assert_eq!(backend.surface(video).unwrap().commits, commits);

        backend.complete_frames();
        assert!(wait_until(|| !sink.is_frame_pending()));
        assert!(matches!(sink.render(&bgrx_frame(&info)).unwrap(), RenderOutcome::Rendered(_)));

        let stats = sink.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.dropped(DropReason::CallbackPending), 1);
    }

    #[test]
    fn test_deferred_handle_drops_frames() {
        let backend = Arc::new(HeadlessBackend::new());
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host_with(headless_display(&backend))));
        let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
        sink.set_caps(info.clone()).unwrap();
        sink.set_window_handle(None).unwrap();

        let outcome = sink.render(&bgrx_frame(&info)).unwrap();
        assert_eq!(outcome, RenderOutcome::Dropped(DropReason::WindowDeferred));
        assert!(backend.toplevels().is_empty());
    }

    #[test]
    fn test_embedded_window_needs_size() {
        let backend = Arc::new(HeadlessBackend::new());
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host_with(headless_display(&backend))));
        let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
        sink.set_caps(info.clone()).unwrap();

        let parent = backend.create_surface().unwrap();
        sink.set_window_handle(Some(parent)).unwrap();
        let outcome = sink.render(&bgrx_frame(&info)).unwrap();
        assert_eq!(outcome, RenderOutcome::Dropped(DropReason::NoWindowSize));

        sink.set_render_rectangle(Rectangle::new(0, 0, 320, 240));
        assert!(matches!(sink.render(&bgrx_frame(&info)).unwrap(), RenderOutcome::Rendered(_)));
        assert_eq!(sink.stats().dropped(DropReason::NoWindowSize), 1);
    }

    #[test]
    fn test_embedding_requires_application_display() {
        let backend = Arc::new(HeadlessBackend::new());
        let owned = Arc::new(Display::with_backend(backend.clone(), true).unwrap());
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host_with(owned)));
        let parent = backend.create_surface().unwrap();

        let err = sink.set_window_handle(Some(parent)).unwrap_err();
        assert!(matches!(err, SinkError::InvalidWindowHandle(_)));
    }

    #[test]
    fn test_window_close_is_fatal() {
        let backend = Arc::new(HeadlessBackend::new());
        let (tx, rx) = mpsc::channel();
        let mut host = host_with(headless_display(&backend));
        host.expect_on_fatal_error().returning(move |error| {
            let _ = tx.send(matches!(error, SinkError::WindowClosed));
        });
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host));
        let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
        sink.set_caps(info.clone()).unwrap();
        sink.render(&bgrx_frame(&info)).unwrap();

        let (toplevel, _) = backend.toplevels()[0].clone();
        backend.close_toplevel(toplevel);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert!(matches!(sink.render(&bgrx_frame(&info)), Err(SinkError::WindowClosed)));
    }

    #[test]
    fn test_setters_apply_to_window() {
        let backend = Arc::new(HeadlessBackend::new());
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host_with(headless_display(&backend))));
        let parent = backend.create_surface().unwrap();
        sink.set_window_handle(Some(parent)).unwrap();

        sink.set_alpha(3.0);
        assert_eq!(sink.alpha(), 1.0);
        sink.set_alpha(0.25);
        assert_eq!(sink.with_window(|w| w.alpha()), Some(0.25));

        sink.set_layer(Layer::Bottom);
        let area = sink.with_window(|w| w.area_surface()).unwrap();
        assert_eq!(backend.placement(area), Some((parent, false)));

        sink.set_fill_mode(FillMode::Crop);
        assert_eq!(sink.with_window(|w| w.fill_mode()), Some(FillMode::Crop));
    }

    #[test]
    fn test_stop_destroys_toplevel_and_forgets_caps() {
        let backend = Arc::new(HeadlessBackend::new());
        let sink = VideoSink::new(&SinkConfig::default(), Arc::new(host_with(headless_display(&backend))));
        let info = VideoInfo::new(VideoFormat::BGRx, 32, 32);
        sink.set_caps(info.clone()).unwrap();
        sink.render(&bgrx_frame(&info)).unwrap();

        sink.stop();
        assert!(backend.toplevels().is_empty());
        assert!(!sink.is_frame_pending());
        assert!(sink.display().is_none());
        assert!(matches!(sink.render(&bgrx_frame(&info)), Err(SinkError::NotNegotiated)));
    }
}
