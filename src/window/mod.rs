//! Output window
//!
//! A [`Window`] is two stacked surfaces: the *area* surface, which covers the
//! whole render rectangle with black, and the *video* surface, a
//! subsurface of the area that carries the frames. The video surface is
//! positioned and scaled inside the area according to the [`FillMode`].
//!
//! A window is either a toplevel the sink created itself
//! ([`Window::new_toplevel`]) or embedded into a surface supplied by the
//! application ([`Window::new_in_surface`]). Embedded windows take part in
//! the host's geometry changes through [`Window::begin_geometry_change`] /
//! [`Window::end_geometry_change`], which make the area subsurface
//! synchronized with its parent so that moves and resizes land in a single
//! update.

pub mod geometry;

pub use geometry::{compute_placement, CropBox, FillMode, Layer, Placement, Rectangle};

use crate::buffer::memory::{Memory, MemoryAllocator};
use crate::buffer::shm::wrap_shm;
use crate::buffer::{BufferSource, RenderableBuffer};
use crate::display::Display;
use crate::error::{Result, SinkError};
use crate::format::{VideoFormat, VideoInfo};
use crate::protocol::{ProtocolBackend, SubsurfaceId, SurfaceId, ToplevelId, ViewportId};
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a new toplevel waits for its first configure
pub const CONFIGURE_TIMEOUT: Duration = Duration::from_millis(100);

/// Whole-surface region for damage and opaque requests
const WHOLE: (i32, i32) = (i32::MAX, i32::MAX);

/// Last toplevel configure seen by the dispatch thread
///
/// Lives outside the render lock so a window under construction can wait
/// for its first configure while the caller still holds the lock.
#[derive(Debug, Default)]
pub struct ConfigureSignal {
    last: Mutex<Option<(ToplevelId, i32, i32)>>,
    cond: Condvar,
}

impl ConfigureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, toplevel: ToplevelId, width: i32, height: i32) {
        *self.last.lock() = Some((toplevel, width, height));
        self.cond.notify_all();
    }

    /// Waits for a configure of `toplevel` and returns its size
    pub fn wait_for(&self, toplevel: ToplevelId, timeout: Duration) -> Option<(i32, i32)> {
        let deadline = Instant::now() + timeout;
        let mut last = self.last.lock();
        loop {
            if let Some((id, width, height)) = *last {
                if id == toplevel {
                    return Some((width, height));
                }
            }
            if self.cond.wait_until(&mut last, deadline).timed_out() {
                return None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowKind {
    Toplevel { toplevel: ToplevelId },
    Embedded { parent: SurfaceId, subsurface: SubsurfaceId },
}

/// Surfaces shared by both window kinds; destroyed on drop
struct SurfacePair {
    backend: Arc<dyn ProtocolBackend>,
    area: SurfaceId,
    area_viewport: Option<ViewportId>,
    video: SurfaceId,
    video_subsurface: SubsurfaceId,
    video_viewport: Option<ViewportId>,
}

impl SurfacePair {
    fn create(display: &Display) -> Result<Self> {
        let backend = display.backend().clone();
        let area = backend.create_surface()?;
        let video = backend.create_surface().inspect_err(|_| backend.destroy_surface(area))?;
        let video_subsurface = backend.create_subsurface(video, area).inspect_err(|_| {
            backend.destroy_surface(video);
            backend.destroy_surface(area);
        })?;
        // The video surface follows its own commits unless a geometry
        // update needs it tied to the area
        backend.subsurface_set_sync(video_subsurface, false);

        let mut pair = Self {
            backend,
            area,
            area_viewport: None,
            video,
            video_subsurface,
            video_viewport: None,
        };
        if display.capabilities().viewport_scaling {
            pair.area_viewport = Some(pair.backend.create_viewport(area)?);
            pair.video_viewport = Some(pair.backend.create_viewport(video)?);
        }
        Ok(pair)
    }
}

impl Drop for SurfacePair {
    fn drop(&mut self) {
        if let Some(viewport) = self.video_viewport.take() {
            self.backend.destroy_viewport(viewport);
        }
        if let Some(viewport) = self.area_viewport.take() {
            self.backend.destroy_viewport(viewport);
        }
        self.backend.destroy_subsurface(self.video_subsurface);
        self.backend.destroy_surface(self.video);
        self.backend.destroy_surface(self.area);
    }
}

/// Black background buffer of the area surface
struct Border {
    memory: Memory,
    buffer: Arc<RenderableBuffer>,
    size: (i32, i32),
}

pub struct Window {
    display: Arc<Display>,
    allocator: Arc<dyn MemoryAllocator>,
    kind: WindowKind,
    surfaces: SurfacePair,
    configured: bool,
    render_rectangle: Rectangle,
    video_rectangle: Rectangle,
    /// Display size of the video (pixel aspect ratio applied)
    video_size: (i32, i32),
    buffer_size: (u32, u32),
    video_has_alpha: bool,
    crop: CropBox,
    crop_dirty: bool,
    fill_mode: FillMode,
    fill_mode_dirty: bool,
    alpha: f64,
    layer: Layer,
    fullscreen: bool,
    area_mapped: bool,
    in_geometry_change: bool,
    border: Option<Border>,
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("kind", &self.kind)
            .field("area", &self.surfaces.area)
            .field("video", &self.surfaces.video)
            .field("render_rectangle", &self.render_rectangle)
            .field("video_rectangle", &self.video_rectangle)
            .field("fill_mode", &self.fill_mode)
            .finish()
    }
}

impl Window {
    fn assemble(
        display: Arc<Display>,
        allocator: Arc<dyn MemoryAllocator>,
        kind: WindowKind,
        surfaces: SurfacePair,
    ) -> Self {
        Self {
            display,
            allocator,
            kind,
            surfaces,
            configured: false,
            render_rectangle: Rectangle::default(),
            video_rectangle: Rectangle::default(),
            video_size: (0, 0),
            buffer_size: (0, 0),
            video_has_alpha: false,
            crop: CropBox::default(),
            crop_dirty: false,
            fill_mode: FillMode::default(),
            fill_mode_dirty: false,
            alpha: 1.0,
            layer: Layer::default(),
            fullscreen: false,
            area_mapped: false,
            in_geometry_change: false,
            border: None,
        }
    }

    /// Creates a toplevel window sized for `info`, or for `render_rectangle`
    /// when the host already chose one
    ///
    /// Blocks up to [`CONFIGURE_TIMEOUT`] for the first configure, which the
    /// dispatch thread reports through `configure`.
    pub fn new_toplevel(
        display: Arc<Display>,
        allocator: Arc<dyn MemoryAllocator>,
        info: &VideoInfo,
        fullscreen: bool,
        layer: Layer,
        render_rectangle: Option<Rectangle>,
        configure: &ConfigureSignal,
    ) -> Result<Self> {
        if !display.capabilities().has_shell() {
            return Err(SinkError::Connection(
                "compositor offers no shell to create a toplevel window".into(),
            ));
        }

        let surfaces = SurfacePair::create(&display)?;
        let backend = display.backend().clone();
        let toplevel = backend.create_toplevel(surfaces.area, fullscreen)?;
        display.register_move_target(surfaces.area, toplevel);
        display.register_move_target(surfaces.video, toplevel);

        let mut window = Self::assemble(display, allocator, WindowKind::Toplevel { toplevel }, surfaces);
        window.fullscreen = fullscreen;
        window.layer = layer;
        window.set_video_info(info);

        // Initial commit without a buffer asks for the first configure
        backend.surface_commit(window.surfaces.area);
        backend.flush()?;

        let configured_size = configure.wait_for(toplevel, CONFIGURE_TIMEOUT);
        if configured_size.is_none() {
            warn!("⚠️ No configure for {} within {:?}, continuing", toplevel, CONFIGURE_TIMEOUT);
        }
        window.configured = true;

        let initial = match (render_rectangle, configured_size) {
            (Some(rect), _) if !rect.is_empty() => rect,
            (_, Some((width, height))) if width > 0 && height > 0 => Rectangle::from_size(width, height),
            _ => Rectangle::from_size(info.display_width() as i32, info.height as i32),
        };
        window.set_render_rectangle(initial, false);

        info!(
            "🪟 Created toplevel window {} at {}{}",
            toplevel,
            window.render_rectangle,
            if fullscreen { " (fullscreen)" } else { "" }
        );
        Ok(window)
    }

    /// Embeds a window into `parent`, a surface owned by the application
    pub fn new_in_surface(
        display: Arc<Display>,
        allocator: Arc<dyn MemoryAllocator>,
        parent: SurfaceId,
    ) -> Result<Self> {
        let surfaces = SurfacePair::create(&display)?;
        let backend = display.backend().clone();
        let subsurface = backend
            .create_subsurface(surfaces.area, parent)
            .map_err(|e| SinkError::InvalidWindowHandle(format!("cannot embed into {}: {}", parent, e)))?;
        backend.subsurface_set_sync(subsurface, false);
        backend.surface_commit(parent);
        backend.flush()?;

        let mut window = Self::assemble(display, allocator, WindowKind::Embedded { parent, subsurface }, surfaces);
        window.configured = true;
        info!("🪟 Embedded window into {}", parent);
        Ok(window)
    }

    pub fn is_toplevel(&self) -> bool {
        matches!(self.kind, WindowKind::Toplevel { .. })
    }

    pub fn toplevel(&self) -> Option<ToplevelId> {
        match self.kind {
            WindowKind::Toplevel { toplevel } => Some(toplevel),
            WindowKind::Embedded { .. } => None,
        }
    }

    pub fn area_surface(&self) -> SurfaceId {
        self.surfaces.area
    }

    pub fn video_surface(&self) -> SurfaceId {
        self.surfaces.video
    }

    pub fn render_rectangle(&self) -> Rectangle {
        self.render_rectangle
    }

    pub fn video_rectangle(&self) -> Rectangle {
        self.video_rectangle
    }

    pub fn fill_mode(&self) -> FillMode {
        self.fill_mode
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn crop_dirty(&self) -> bool {
        self.crop_dirty
    }

    /// True once the window has a non-empty render rectangle
    pub fn has_size(&self) -> bool {
        !self.render_rectangle.is_empty()
    }

    fn backend(&self) -> &Arc<dyn ProtocolBackend> {
        &self.surfaces.backend
    }

    fn set_video_info(&mut self, info: &VideoInfo) {
        self.video_size = (info.display_width() as i32, info.height as i32);
        self.buffer_size = (info.width, info.height);
        self.video_has_alpha = info.format.has_alpha();
    }

    /// Compositor-driven resize of a toplevel
    pub fn handle_configure(&mut self, width: i32, height: i32) {
        self.configured = true;
        if width > 0 && height > 0 {
            self.set_render_rectangle(Rectangle::from_size(width, height), false);
        }
    }

    /// Moves and resizes the window. The position only matters for embedded
    /// windows and is ignored unless `with_position` is set.
    pub fn set_render_rectangle(&mut self, rect: Rectangle, with_position: bool) {
        let next = if with_position {
            rect
        } else {
            Rectangle::new(self.render_rectangle.x, self.render_rectangle.y, rect.width, rect.height)
        };
        if next == self.render_rectangle {
            return;
        }
        debug!("📐 Render rectangle {} -> {}", self.render_rectangle, next);
        self.render_rectangle = next;
        self.update_geometry(with_position);
    }

    fn update_geometry(&mut self, position_changed: bool) {
        let backend = self.backend().clone();
        if let WindowKind::Embedded { subsurface, .. } = self.kind {
            if position_changed {
                // Applied on the parent's next commit
                backend.subsurface_set_position(subsurface, self.render_rectangle.x, self.render_rectangle.y);
            }
        }
        if let Some(viewport) = self.surfaces.area_viewport {
            backend.viewport_set_destination(viewport, self.render_rectangle.width, self.render_rectangle.height);
        }
        if self.area_mapped {
            if let Err(e) = self.update_borders() {
                warn!("⚠️ Failed to update window background: {}", e);
            }
        }
        if !self.configured {
            return;
        }

        let has_video = self.video_size.0 > 0;
        if has_video {
            backend.subsurface_set_sync(self.surfaces.video_subsurface, true);
            self.resize_video_surface(true);
        }
        backend.surface_commit(self.surfaces.area);
        if has_video {
            backend.subsurface_set_sync(self.surfaces.video_subsurface, false);
        }
        if let Err(e) = backend.flush() {
            warn!("⚠️ Flush after geometry update failed: {}", e);
        }
    }

    fn resize_video_surface(&mut self, commit: bool) {
        let placement = compute_placement(
            self.fill_mode,
            (self.render_rectangle.width, self.render_rectangle.height),
            self.video_size,
            self.buffer_size,
            self.crop,
            self.surfaces.video_viewport.is_some(),
        );
        let backend = self.backend().clone();
        if let Some(viewport) = self.surfaces.video_viewport {
            let (width, height) = placement.destination.unwrap_or((-1, -1));
            backend.viewport_set_destination(viewport, width, height);
            backend.viewport_set_source(viewport, placement.source);
        }
        backend.subsurface_set_position(self.surfaces.video_subsurface, placement.position.0, placement.position.1);
        if commit {
            backend.surface_damage(self.surfaces.video, 0, 0, WHOLE.0, WHOLE.1);
            backend.surface_commit(self.surfaces.video);
        }

        trace!("🎞️ Video rectangle {} ({:?})", placement.video, self.fill_mode);
        self.video_rectangle = placement.video;
        self.crop_dirty = false;
        self.fill_mode_dirty = false;
    }

    fn update_borders(&mut self) -> Result<()> {
        let size = if self.surfaces.area_viewport.is_some() {
            (1, 1)
        } else {
            (self.render_rectangle.width, self.render_rectangle.height)
        };
        if size.0 <= 0 || size.1 <= 0 {
            return Ok(());
        }

        let stale = self.border.as_ref().map_or(true, |border| border.size != size);
        if stale {
            let info = VideoInfo::new(VideoFormat::BGRx, size.0 as u32, size.1 as u32);
            // Fresh memfd pages are zero, which is opaque black in BGRx
            let memory = self.allocator.allocate(info.format, info.width, info.height)?;
            let buffer = wrap_shm(&self.display, &memory, &info, BufferSource::Copy)?;
            self.border = Some(Border { memory, buffer, size });
        }

        if let Some(border) = &self.border {
            if !border.buffer.is_busy() && border.buffer.attach(self.surfaces.area, border.memory.clone()) {
                self.backend().surface_damage(self.surfaces.area, 0, 0, WHOLE.0, WHOLE.1);
                border.buffer.mark_busy();
            }
        }
        Ok(())
    }

    fn update_opaque(&self) {
        let opaque = self.alpha >= 1.0;
        let backend = self.backend();
        backend.surface_set_opaque(self.surfaces.area, opaque.then_some(WHOLE));
        backend.surface_set_opaque(self.surfaces.video, (opaque && !self.video_has_alpha).then_some(WHOLE));
    }

    /// Records the crop box of the next frame; returns true if it changed
    pub fn set_crop(&mut self, crop: CropBox) -> bool {
        if crop == self.crop {
            return false;
        }
        trace!("✂️ Crop {:?} -> {:?}", self.crop, crop);
        self.crop = crop;
        self.crop_dirty = true;
        true
    }

    pub fn set_fill_mode(&mut self, mode: FillMode) {
        if mode != self.fill_mode {
            debug!("🖼️ Fill mode {:?} -> {:?}", self.fill_mode, mode);
            self.fill_mode = mode;
            self.fill_mode_dirty = true;
        }
    }

    /// Shows `frame` on the video surface, or clears both surfaces when it
    /// is `None`. Passing `info` re-reads the video size and opacity.
    pub fn render(&mut self, frame: Option<(&Arc<RenderableBuffer>, Memory)>, info: Option<&VideoInfo>) -> Result<()> {
        let backend = self.backend().clone();
        let geometry_changed = info.is_some() || self.crop_dirty || self.fill_mode_dirty;
        if let Some(info) = info {
            self.set_video_info(info);
        }
        if geometry_changed {
            backend.subsurface_set_sync(self.surfaces.video_subsurface, true);
            self.resize_video_surface(false);
            if info.is_some() {
                self.update_opaque();
            }
        }

        match frame {
            Some((buffer, memory)) => {
                if !buffer.attach(self.surfaces.video, memory) {
                    trace!("{} still on screen, committing without attach", buffer.server_id());
                }
                backend.surface_damage(self.surfaces.video, 0, 0, WHOLE.0, WHOLE.1);
                backend.surface_commit(self.surfaces.video);
                buffer.mark_busy();

                if !self.area_mapped {
                    self.update_borders()?;
                    backend.surface_commit(self.surfaces.area);
                    self.area_mapped = true;
                }
            }
            None => {
                backend.surface_attach(self.surfaces.video, None);
                backend.surface_commit(self.surfaces.video);
                backend.surface_attach(self.surfaces.area, None);
                backend.surface_commit(self.surfaces.area);
                self.area_mapped = false;
                debug!("🧹 Cleared window surfaces");
            }
        }

        if geometry_changed {
            // The area commit carries the new video subsurface position
            backend.surface_commit(self.surfaces.area);
            backend.subsurface_set_sync(self.surfaces.video_subsurface, false);
        }
        backend.flush()
    }

    /// Makes opaque regions follow `alpha`; applied with the next commit
    pub fn ensure_alpha(&mut self, alpha: f64) {
        self.alpha = alpha.clamp(0.0, 1.0);
        self.update_opaque();
        debug!("🌫️ Window alpha {:.2}", self.alpha);
    }

    /// Restacks an embedded window above or below its parent
    pub fn ensure_layer(&mut self, layer: Layer) {
        self.layer = layer;
        match self.kind {
            WindowKind::Embedded { parent, subsurface } => {
                let above = layer != Layer::Bottom;
                self.backend().subsurface_place(subsurface, parent, above);
                debug!("🧱 Layer {:?}: area placed {} {}", layer, if above { "above" } else { "below" }, parent);
            }
            WindowKind::Toplevel { .. } => debug!("Layer {:?} has no effect on a toplevel window", layer),
        }
    }

    pub fn ensure_fullscreen(&mut self, fullscreen: bool) {
        if self.fullscreen == fullscreen {
            return;
        }
        self.fullscreen = fullscreen;
        if let WindowKind::Toplevel { toplevel } = self.kind {
            self.backend().toplevel_set_fullscreen(toplevel, fullscreen);
            if let Err(e) = self.backend().flush() {
                warn!("⚠️ Flush after fullscreen request failed: {}", e);
            }
        }
    }

    /// Ties the area to its parent's commits until
    /// [`Window::end_geometry_change`]. Returns false for toplevel windows.
    pub fn begin_geometry_change(&mut self) -> bool {
        match self.kind {
            WindowKind::Embedded { subsurface, .. } => {
                self.backend().subsurface_set_sync(subsurface, true);
                self.in_geometry_change = true;
                true
            }
            WindowKind::Toplevel { .. } => false,
        }
    }

    pub fn end_geometry_change(&mut self) -> bool {
        if !self.in_geometry_change {
            warn!("⚠️ end_geometry_change without begin_geometry_change, ignoring");
            return false;
        }
        self.in_geometry_change = false;
        if let WindowKind::Embedded { subsurface, .. } = self.kind {
            self.backend().subsurface_set_sync(subsurface, false);
        }
        if let Err(e) = self.backend().flush() {
            warn!("⚠️ Flush after geometry change failed: {}", e);
        }
        true
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        let backend = self.backend().clone();
        match self.kind {
            WindowKind::Toplevel { toplevel } => {
                self.display.unregister_move_target(self.surfaces.area);
                self.display.unregister_move_target(self.surfaces.video);
                backend.destroy_toplevel(toplevel);
            }
            WindowKind::Embedded { subsurface, .. } => backend.destroy_subsurface(subsurface),
        }
        if let Some(border) = self.border.take() {
            border.buffer.force_release();
        }
        debug!("🗑️ Destroyed window {}", self.surfaces.area);
    }
}
