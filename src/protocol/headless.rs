//! In-process recording compositor
//!
//! `HeadlessBackend` implements [`ProtocolBackend`] without a server. It keeps
//! enough compositor state to be useful in tests and dry runs:
//!
//! - double-buffered surface state, with synchronized subsurfaces caching
//!   their commits until the parent applies
//! - frame callbacks that fire once the committed state is applied
//!   (automatically or on demand)
//! - buffer release when a newer buffer replaces one on screen
//! - per-surface request counters (attach, commit, applied updates)
//!
//! Events are queued and handed out by `dispatch_blocking`, which parks on a
//! condvar until something arrives or the wait is cancelled.

use super::{
    BufferId, CallbackId, DispatchStatus, DmabufBufferDesc, Globals, ProtocolBackend, ProtocolEvent,
    SeatId, ShmBufferDesc, SourceRect, SubsurfaceId, SurfaceId, ToplevelId, ViewportId,
};
use crate::error::{Result, SinkError};
use crate::format::{drm, VideoFormat};
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq)]
struct SurfaceContent {
    /// `Some(None)` means an explicit detach
    buffer: Option<Option<BufferId>>,
    opaque: Option<Option<(i32, i32)>>,
    source: Option<Option<SourceRect>>,
    destination: Option<(i32, i32)>,
    callbacks: Vec<CallbackId>,
    damaged: bool,
}

impl SurfaceContent {
    fn merge(&mut self, newer: SurfaceContent) {
        if newer.buffer.is_some() {
            self.buffer = newer.buffer;
        }
        if newer.opaque.is_some() {
            self.opaque = newer.opaque;
        }
        if newer.source.is_some() {
            self.source = newer.source;
        }
        if newer.destination.is_some() {
            self.destination = newer.destination;
        }
        self.callbacks.extend(newer.callbacks);
        self.damaged |= newer.damaged;
    }
}

/// What a surface currently shows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceSnapshot {
    pub buffer: Option<BufferId>,
    pub opaque: Option<(i32, i32)>,
    pub source: Option<SourceRect>,
    pub destination: Option<(i32, i32)>,
    /// Position relative to the parent, for subsurfaces
    pub position: (i32, i32),
    pub commits: u64,
    pub attaches: u64,
    pub applied_updates: u64,
}

#[derive(Debug, Default)]
struct SurfaceRecord {
    pending: SurfaceContent,
    cached: Option<SurfaceContent>,
    current: SurfaceSnapshot,
    viewport: Option<ViewportId>,
    subsurface: Option<SubsurfaceId>,
}

#[derive(Debug)]
struct SubsurfaceRecord {
    surface: SurfaceId,
    parent: SurfaceId,
    sync: bool,
    pending_position: Option<(i32, i32)>,
    placement: Option<(SurfaceId, bool)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferRecord {
    pub width: i32,
    pub height: i32,
    pub format: u32,
    pub modifier: Option<u64>,
    pub dmabuf: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToplevelRecord {
    pub surface: SurfaceId,
    pub fullscreen: bool,
}

#[derive(Debug, Default)]
struct HeadlessState {
    globals: Globals,
    queue: VecDeque<ProtocolEvent>,
    cancel_pending: bool,
    connected: bool,
    globals_released: bool,
    dispatch_error: Option<String>,
    buffer_error: Option<String>,
    surfaces: HashMap<SurfaceId, SurfaceRecord>,
    subsurfaces: HashMap<SubsurfaceId, SubsurfaceRecord>,
    viewports: HashMap<ViewportId, SurfaceId>,
    buffers: HashMap<BufferId, BufferRecord>,
    toplevels: HashMap<ToplevelId, ToplevelRecord>,
    presented: Vec<CallbackId>,
    moves: Vec<(ToplevelId, SeatId, u32)>,
    roundtrips: u64,
    dispatch_calls: u64,
    frame_requests: u64,
    auto_frame_done: bool,
    auto_release: bool,
    auto_configure: Option<(i32, i32)>,
}

/// Recording compositor used by tests and `--headless` runs
#[derive(Debug)]
pub struct HeadlessBackend {
    state: Mutex<HeadlessState>,
    wake: Condvar,
    next_id: AtomicU64,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// A compositor advertising every capability the sink can use
    pub fn new() -> Self {
        let shm_formats = [VideoFormat::BGRA, VideoFormat::BGRx, VideoFormat::RGBx, VideoFormat::NV12, VideoFormat::I420, VideoFormat::YUY2]
            .iter()
            .map(|f| f.shm_format())
            .collect();
        let dmabuf_formats = vec![
            (drm::XRGB8888, drm::LINEAR_MODIFIER),
            (drm::ARGB8888, drm::LINEAR_MODIFIER),
            (drm::NV12, drm::LINEAR_MODIFIER),
            (drm::NV15, drm::LINEAR_MODIFIER),
            (drm::YUV420_8BIT, drm::AFBC_MODIFIER),
            (drm::YUV420_10BIT, drm::AFBC_MODIFIER),
        ];
        Self::with_globals(Globals {
            compositor: true,
            subcompositor: true,
            shm: true,
            viewporter: true,
            dmabuf: true,
            xdg_wm_base: true,
            fullscreen_shell: false,
            seat: true,
            shm_formats,
            dmabuf_formats,
        })
    }

    pub fn with_globals(globals: Globals) -> Self {
        Self {
            state: Mutex::new(HeadlessState {
                globals,
                connected: true,
                auto_release: true,
                auto_configure: Some((0, 0)),
                ..HeadlessState::default()
            }),
            wake: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fire frame callbacks as soon as their commit is applied
    pub fn auto_frame_done(self, enabled: bool) -> Self {
        self.state.lock().auto_frame_done = enabled;
        self
    }

    /// Release the previous buffer when a new one is applied
    pub fn auto_release(self, enabled: bool) -> Self {
        self.state.lock().auto_release = enabled;
        self
    }

    /// Configure size sent right after a toplevel is created; `None` never configures
    pub fn auto_configure(self, size: Option<(i32, i32)>) -> Self {
        self.state.lock().auto_configure = size;
        self
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn queue_event(&self, state: &mut HeadlessState, event: ProtocolEvent) {
        trace!("🧪 headless event {:?}", event);
        state.queue.push_back(event);
        self.wake.notify_all();
    }

    pub fn push_event(&self, event: ProtocolEvent) {
        let mut state = self.state.lock();
        self.queue_event(&mut state, event);
    }

    /// Delivers `done` for every callback whose commit has been applied
    pub fn complete_frames(&self) -> usize {
        let mut state = self.state.lock();
        let presented = std::mem::take(&mut state.presented);
        let count = presented.len();
        for callback in presented {
            self.queue_event(&mut state, ProtocolEvent::FrameDone { callback, time: 0 });
        }
        count
    }

    pub fn release_buffer(&self, buffer: BufferId) {
        self.push_event(ProtocolEvent::BufferReleased(buffer));
    }

    pub fn configure_toplevel(&self, toplevel: ToplevelId, width: i32, height: i32) {
        self.push_event(ProtocolEvent::ToplevelConfigured { toplevel, width, height });
    }

    pub fn close_toplevel(&self, toplevel: ToplevelId) {
        self.push_event(ProtocolEvent::ToplevelClosed { toplevel });
    }

    /// The next dispatch fails as if the socket broke
    pub fn fail_dispatch(&self, message: &str) {
        let mut state = self.state.lock();
        state.dispatch_error = Some(message.to_string());
        self.wake.notify_all();
    }

    /// The next buffer creation fails
    pub fn fail_next_buffer(&self, message: &str) {
        self.state.lock().buffer_error = Some(message.to_string());
    }

    pub fn roundtrips(&self) -> u64 {
        self.state.lock().roundtrips
    }

    pub fn dispatch_calls(&self) -> u64 {
        self.state.lock().dispatch_calls
    }

    pub fn frame_requests(&self) -> u64 {
        self.state.lock().frame_requests
    }

    pub fn pending_events(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn surface(&self, surface: SurfaceId) -> Option<SurfaceSnapshot> {
        self.state.lock().surfaces.get(&surface).map(|s| s.current.clone())
    }

    pub fn surfaces(&self) -> Vec<SurfaceId> {
        let mut ids: Vec<_> = self.state.lock().surfaces.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn buffer(&self, buffer: BufferId) -> Option<BufferRecord> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn toplevels(&self) -> Vec<(ToplevelId, ToplevelRecord)> {
        let mut toplevels: Vec<_> = self
            .state
            .lock()
            .toplevels
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        toplevels.sort_by_key(|(id, _)| *id);
        toplevels
    }

    pub fn moves(&self) -> Vec<(ToplevelId, SeatId, u32)> {
        self.state.lock().moves.clone()
    }

    /// Stacking request last issued for the subsurface of `surface`
    pub fn placement(&self, surface: SurfaceId) -> Option<(SurfaceId, bool)> {
        let state = self.state.lock();
        let sub = state.surfaces.get(&surface)?.subsurface?;
        state.subsurfaces.get(&sub)?.placement
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn globals_released(&self) -> bool {
        self.state.lock().globals_released
    }

    fn effectively_sync(state: &HeadlessState, surface: SurfaceId) -> bool {
        let mut current = surface;
        while let Some(sub) = state.surfaces.get(&current).and_then(|s| s.subsurface) {
            let Some(record) = state.subsurfaces.get(&sub) else {
                return false;
            };
            if record.sync {
                return true;
            }
            current = record.parent;
        }
        false
    }

    fn apply(&self, state: &mut HeadlessState, surface: SurfaceId, content: SurfaceContent) {
        let auto_release = state.auto_release;
        let auto_frame_done = state.auto_frame_done;
        let mut released = None;
        let callbacks = {
            let Some(record) = state.surfaces.get_mut(&surface) else {
                return;
            };
            let current = &mut record.current;
            if let Some(buffer) = content.buffer {
                if current.buffer != buffer {
                    released = current.buffer;
                }
                current.buffer = buffer;
            }
            if let Some(opaque) = content.opaque {
                current.opaque = opaque;
            }
            if let Some(source) = content.source {
                current.source = source;
            }
            if let Some(destination) = content.destination {
                current.destination = if destination.0 > 0 && destination.1 > 0 {
                    Some(destination)
                } else {
                    None
                };
            }
            current.applied_updates += 1;
            content.callbacks
        };

        if auto_release {
            if let Some(buffer) = released {
                self.queue_event(state, ProtocolEvent::BufferReleased(buffer));
            }
        }
        for callback in callbacks {
            if auto_frame_done {
                self.queue_event(state, ProtocolEvent::FrameDone { callback, time: 0 });
            } else {
                state.presented.push(callback);
            }
        }

        // Parent state applied: children pick up position and cached commits
        let children: Vec<(SubsurfaceId, SurfaceId)> = state
            .subsurfaces
            .iter()
            .filter(|(_, sub)| sub.parent == surface)
            .map(|(id, sub)| (*id, sub.surface))
            .collect();
        for (sub_id, child) in children {
            let position = state.subsurfaces.get_mut(&sub_id).and_then(|sub| sub.pending_position.take());
            let cached = state.surfaces.get_mut(&child).and_then(|record| {
                if let Some(position) = position {
                    record.current.position = position;
                }
                record.cached.take()
            });
            if let Some(cached) = cached {
                self.apply(state, child, cached);
            }
        }
    }
}

impl ProtocolBackend for HeadlessBackend {
    fn roundtrip(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SinkError::ProtocolIo("headless compositor disconnected".into()));
        }
        state.roundtrips += 1;
        Ok(())
    }

    fn globals(&self) -> Globals {
        self.state.lock().globals.clone()
    }

    fn dispatch_blocking(&self, events: &mut Vec<ProtocolEvent>) -> Result<DispatchStatus> {
        let mut state = self.state.lock();
        state.dispatch_calls += 1;
        loop {
            if let Some(message) = state.dispatch_error.take() {
                return Err(SinkError::ProtocolIo(message));
            }
            if state.cancel_pending {
                state.cancel_pending = false;
                return Ok(DispatchStatus::Cancelled);
            }
            if !state.queue.is_empty() {
                events.extend(state.queue.drain(..));
                return Ok(DispatchStatus::Dispatched);
            }
            if !state.connected {
                return Err(SinkError::ProtocolIo("headless compositor disconnected".into()));
            }
            self.wake.wait(&mut state);
        }
    }

    fn cancel_dispatch(&self) {
        let mut state = self.state.lock();
        state.cancel_pending = true;
        self.wake.notify_all();
    }

    fn flush(&self) -> Result<()> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(SinkError::ProtocolIo("headless compositor disconnected".into()))
        }
    }

    fn create_surface(&self) -> Result<SurfaceId> {
        let id = SurfaceId(self.next_id());
        self.state.lock().surfaces.insert(id, SurfaceRecord::default());
        Ok(id)
    }

    fn destroy_surface(&self, surface: SurfaceId) {
        self.state.lock().surfaces.remove(&surface);
    }

    fn create_subsurface(&self, surface: SurfaceId, parent: SurfaceId) -> Result<SubsurfaceId> {
        let mut state = self.state.lock();
        if !state.surfaces.contains_key(&parent) {
            return Err(SinkError::InvalidWindowHandle(format!("unknown parent {}", parent)));
        }
        let id = SubsurfaceId(self.next_id());
        let record = state
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| SinkError::InvalidWindowHandle(format!("unknown surface {}", surface)))?;
        record.subsurface = Some(id);
        state.subsurfaces.insert(
            id,
            SubsurfaceRecord {
                surface,
                parent,
                sync: true,
                pending_position: None,
                placement: None,
            },
        );
        Ok(id)
    }

    fn subsurface_set_position(&self, subsurface: SubsurfaceId, x: i32, y: i32) {
        if let Some(sub) = self.state.lock().subsurfaces.get_mut(&subsurface) {
            sub.pending_position = Some((x, y));
        }
    }

    fn subsurface_set_sync(&self, subsurface: SubsurfaceId, sync: bool) {
        if let Some(sub) = self.state.lock().subsurfaces.get_mut(&subsurface) {
            sub.sync = sync;
        }
    }

    fn subsurface_place(&self, subsurface: SubsurfaceId, sibling: SurfaceId, above: bool) {
        if let Some(sub) = self.state.lock().subsurfaces.get_mut(&subsurface) {
            sub.placement = Some((sibling, above));
        }
    }

    fn destroy_subsurface(&self, subsurface: SubsurfaceId) {
        let mut state = self.state.lock();
        if let Some(sub) = state.subsurfaces.remove(&subsurface) {
            if let Some(record) = state.surfaces.get_mut(&sub.surface) {
                record.subsurface = None;
            }
        }
    }

    fn create_viewport(&self, surface: SurfaceId) -> Result<ViewportId> {
        let mut state = self.state.lock();
        if !state.globals.viewporter {
            return Err(SinkError::Connection("wp_viewporter not available".into()));
        }
        let id = ViewportId(self.next_id());
        let record = state
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| SinkError::InvalidWindowHandle(format!("unknown surface {}", surface)))?;
        record.viewport = Some(id);
        state.viewports.insert(id, surface);
        Ok(id)
    }

    fn viewport_set_source(&self, viewport: ViewportId, source: Option<SourceRect>) {
        let mut state = self.state.lock();
        if let Some(surface) = state.viewports.get(&viewport).copied() {
            if let Some(record) = state.surfaces.get_mut(&surface) {
                record.pending.source = Some(source);
            }
        }
    }

    fn viewport_set_destination(&self, viewport: ViewportId, width: i32, height: i32) {
        let mut state = self.state.lock();
        if let Some(surface) = state.viewports.get(&viewport).copied() {
            if let Some(record) = state.surfaces.get_mut(&surface) {
                record.pending.destination = Some((width, height));
            }
        }
    }

    fn destroy_viewport(&self, viewport: ViewportId) {
        let mut state = self.state.lock();
        if let Some(surface) = state.viewports.remove(&viewport) {
            if let Some(record) = state.surfaces.get_mut(&surface) {
                record.viewport = None;
            }
        }
    }

    fn surface_attach(&self, surface: SurfaceId, buffer: Option<BufferId>) {
        if let Some(record) = self.state.lock().surfaces.get_mut(&surface) {
            record.pending.buffer = Some(buffer);
            record.current.attaches += 1;
        }
    }

    fn surface_damage(&self, surface: SurfaceId, _x: i32, _y: i32, _width: i32, _height: i32) {
        if let Some(record) = self.state.lock().surfaces.get_mut(&surface) {
            record.pending.damaged = true;
        }
    }

    fn surface_set_opaque(&self, surface: SurfaceId, size: Option<(i32, i32)>) {
        if let Some(record) = self.state.lock().surfaces.get_mut(&surface) {
            record.pending.opaque = Some(size);
        }
    }

    fn surface_frame(&self, surface: SurfaceId) -> Result<CallbackId> {
        let id = CallbackId(self.next_id());
        let mut state = self.state.lock();
        let record = state
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| SinkError::ProtocolIo(format!("frame on unknown {}", surface)))?;
        record.pending.callbacks.push(id);
        state.frame_requests += 1;
        Ok(id)
    }

    fn surface_commit(&self, surface: SurfaceId) {
        let mut state = self.state.lock();
        let sync = Self::effectively_sync(&state, surface);
        let staged = {
            let Some(record) = state.surfaces.get_mut(&surface) else {
                return;
            };
            record.current.commits += 1;
            let pending = std::mem::take(&mut record.pending);
            let mut staged = record.cached.take().unwrap_or_default();
            staged.merge(pending);
            if sync {
                record.cached = Some(staged);
                None
            } else {
                Some(staged)
            }
        };
        match staged {
            Some(content) => self.apply(&mut state, surface, content),
            None => trace!("🧪 {} commit cached (synchronized)", surface),
        }
    }

    fn create_shm_buffer(&self, desc: &ShmBufferDesc<'_>) -> Result<BufferId> {
        let mut state = self.state.lock();
        if let Some(message) = state.buffer_error.take() {
            return Err(SinkError::allocation(message));
        }
        if !state.globals.shm_formats.contains(&desc.format) {
            return Err(SinkError::allocation(format!("shm format {:#x} not advertised", desc.format)));
        }
        let needed = desc.offset + desc.stride as usize * desc.height as usize;
        if needed > desc.pool_size {
            return Err(SinkError::allocation(format!(
                "buffer needs {} bytes but pool has {}",
                needed, desc.pool_size
            )));
        }
        let id = BufferId(self.next_id());
        state.buffers.insert(
            id,
            BufferRecord {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                modifier: None,
                dmabuf: false,
            },
        );
        Ok(id)
    }

    fn create_dmabuf_buffer(&self, desc: &DmabufBufferDesc<'_>) -> Result<BufferId> {
        let mut state = self.state.lock();
        if let Some(message) = state.buffer_error.take() {
            return Err(SinkError::allocation(message));
        }
        if !state.globals.dmabuf_formats.contains(&(desc.format, desc.modifier)) {
            return Err(SinkError::allocation(format!(
                "dmabuf {:#x}/{:#x} rejected",
                desc.format, desc.modifier
            )));
        }
        let id = BufferId(self.next_id());
        state.buffers.insert(
            id,
            BufferRecord {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                modifier: Some(desc.modifier),
                dmabuf: true,
            },
        );
        Ok(id)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn create_toplevel(&self, surface: SurfaceId, fullscreen: bool) -> Result<ToplevelId> {
        let mut state = self.state.lock();
        if !state.globals.xdg_wm_base && !state.globals.fullscreen_shell {
            return Err(SinkError::Connection("no shell protocol available".into()));
        }
        let id = ToplevelId(self.next_id());
        state.toplevels.insert(id, ToplevelRecord { surface, fullscreen });
        if let Some((width, height)) = state.auto_configure {
            self.queue_event(&mut state, ProtocolEvent::ToplevelConfigured { toplevel: id, width, height });
        }
        debug!("🧪 headless toplevel {} for {}", id, surface);
        Ok(id)
    }

    fn toplevel_set_fullscreen(&self, toplevel: ToplevelId, fullscreen: bool) {
        if let Some(record) = self.state.lock().toplevels.get_mut(&toplevel) {
            record.fullscreen = fullscreen;
        }
    }

    fn toplevel_move(&self, toplevel: ToplevelId, seat: SeatId, serial: u32) {
        self.state.lock().moves.push((toplevel, seat, serial));
    }

    fn destroy_toplevel(&self, toplevel: ToplevelId) {
        self.state.lock().toplevels.remove(&toplevel);
    }

    fn release_globals(&self) {
        self.state.lock().globals_released = true;
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsFd, BorrowedFd};

    #[test]
    fn test_sync_subsurface_caches_until_parent_commit() {
        let backend = HeadlessBackend::new();
        let parent = backend.create_surface().unwrap();
        let child = backend.create_surface().unwrap();
        let sub = backend.create_subsurface(child, parent).unwrap();

        backend.subsurface_set_position(sub, 10, 20);
        backend.surface_set_opaque(child, Some((4, 4)));
        backend.surface_commit(child);
        assert_eq!(backend.surface(child).unwrap().applied_updates, 0);

        backend.surface_commit(parent);
        let snapshot = backend.surface(child).unwrap();
        assert_eq!(snapshot.applied_updates, 1);
        assert_eq!(snapshot.position, (10, 20));
        assert_eq!(snapshot.opaque, Some((4, 4)));
    }

    #[test]
    fn test_desync_subsurface_applies_immediately() {
        let backend = HeadlessBackend::new();
        let parent = backend.create_surface().unwrap();
        let child = backend.create_surface().unwrap();
        let sub = backend.create_subsurface(child, parent).unwrap();
        backend.subsurface_set_sync(sub, false);

        backend.surface_commit(child);
        assert_eq!(backend.surface(child).unwrap().applied_updates, 1);
    }

    fn shm_desc(fd: BorrowedFd<'_>) -> ShmBufferDesc<'_> {
        ShmBufferDesc {
            fd,
            pool_size: 64,
            offset: 0,
            width: 4,
            height: 4,
            stride: 16,
            format: VideoFormat::BGRx.shm_format(),
        }
    }

    #[test]
    fn test_replaced_buffer_is_released() {
        let backend = HeadlessBackend::new();
        let file = std::fs::File::open("/dev/null").unwrap();
        let surface = backend.create_surface().unwrap();
        let first = backend.create_shm_buffer(&shm_desc(file.as_fd())).unwrap();
        let second = backend.create_shm_buffer(&shm_desc(file.as_fd())).unwrap();

        backend.surface_attach(surface, Some(first));
        backend.surface_commit(surface);
        backend.surface_attach(surface, Some(second));
        backend.surface_commit(surface);

        let mut events = Vec::new();
        assert_eq!(backend.dispatch_blocking(&mut events).unwrap(), DispatchStatus::Dispatched);
        assert!(events.contains(&ProtocolEvent::BufferReleased(first)));
    }

    #[test]
    fn test_cancel_before_wait_is_not_lost() {
        let backend = HeadlessBackend::new();
        backend.cancel_dispatch();
        let mut events = Vec::new();
        assert_eq!(backend.dispatch_blocking(&mut events).unwrap(), DispatchStatus::Cancelled);
    }

    #[test]
    fn test_frame_callbacks_fire_on_demand() {
        let backend = HeadlessBackend::new();
        let surface = backend.create_surface().unwrap();
        let callback = backend.surface_frame(surface).unwrap();
        backend.surface_commit(surface);
        assert_eq!(backend.pending_events(), 0);

        assert_eq!(backend.complete_frames(), 1);
        let mut events = Vec::new();
        backend.dispatch_blocking(&mut events).unwrap();
        assert_eq!(events, vec![ProtocolEvent::FrameDone { callback, time: 0 }]);
    }
}
