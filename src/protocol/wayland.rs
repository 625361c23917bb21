//! `wayland-client` implementation of the protocol seam
//!
//! The backend owns a private event queue. The dispatch thread pumps it with a
//! `poll` over the connection fd and an `eventfd` used to interrupt the wait
//! at shutdown; the queue lock is never held while blocked, so other threads
//! can keep issuing requests through the shared object table.

use super::{
    BufferId, CallbackId, DispatchStatus, DmabufBufferDesc, Globals, ProtocolBackend, ProtocolEvent,
    SeatId, ShmBufferDesc, SourceRect, SubsurfaceId, SurfaceId, ToplevelId, ViewportId,
};
use crate::error::{Result, SinkError};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wayland_backend::client::{ObjectId, WaylandError};
use wayland_client::protocol::{
    wl_buffer::{self, WlBuffer},
    wl_callback::{self, WlCallback},
    wl_compositor::WlCompositor,
    wl_pointer::{self, WlPointer},
    wl_region::WlRegion,
    wl_registry::{self, WlRegistry},
    wl_seat::{self, WlSeat},
    wl_shm::{self, WlShm},
    wl_shm_pool::WlShmPool,
    wl_subcompositor::WlSubcompositor,
    wl_subsurface::WlSubsurface,
    wl_surface::WlSurface,
    wl_touch::{self, WlTouch},
};
use wayland_client::{delegate_noop, Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols::wp::fullscreen_shell::zv1::client::zwp_fullscreen_shell_v1::{
    self, ZwpFullscreenShellV1,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1::{self, ZwpLinuxBufferParamsV1},
    zwp_linux_dmabuf_v1::{self, ZwpLinuxDmabufV1},
};
use wayland_protocols::wp::viewporter::client::{wp_viewport::WpViewport, wp_viewporter::WpViewporter};
use wayland_protocols::xdg::shell::client::{
    xdg_surface::{self, XdgSurface},
    xdg_toplevel::{self, XdgToplevel},
    xdg_wm_base::{self, XdgWmBase},
};

enum Shell {
    Xdg { xdg_surface: XdgSurface, toplevel: XdgToplevel },
    Fullscreen,
}

/// Proxies shared between request callers and the dispatch thread
#[derive(Default)]
struct ObjectTable {
    globals: Globals,
    compositor: Option<WlCompositor>,
    subcompositor: Option<WlSubcompositor>,
    shm: Option<WlShm>,
    viewporter: Option<WpViewporter>,
    dmabuf: Option<ZwpLinuxDmabufV1>,
    wm_base: Option<XdgWmBase>,
    fullscreen_shell: Option<ZwpFullscreenShellV1>,
    seats: HashMap<SeatId, WlSeat>,
    surfaces: HashMap<SurfaceId, WlSurface>,
    surface_ids: HashMap<ObjectId, SurfaceId>,
    subsurfaces: HashMap<SubsurfaceId, WlSubsurface>,
    viewports: HashMap<ViewportId, WpViewport>,
    buffers: HashMap<BufferId, WlBuffer>,
    toplevels: HashMap<ToplevelId, Shell>,
}

/// Event-queue state, only touched while the queue is dispatched
struct State {
    table: Arc<Mutex<ObjectTable>>,
    events: Vec<ProtocolEvent>,
    pointer_focus: HashMap<SeatId, Option<SurfaceId>>,
    pending_sizes: HashMap<ToplevelId, (i32, i32)>,
}

impl State {
    fn surface_id(&self, surface: &WlSurface) -> Option<SurfaceId> {
        self.table.lock().surface_ids.get(&surface.id()).copied()
    }
}

/// Live compositor connection
pub struct WaylandBackend {
    connection: Mutex<Option<Connection>>,
    queue: Mutex<Option<(EventQueue<State>, State)>>,
    qh: QueueHandle<State>,
    table: Arc<Mutex<ObjectTable>>,
    cancel_fd: OwnedFd,
    next_id: AtomicU64,
}

impl WaylandBackend {
    /// Connects to `name` (a socket under `$XDG_RUNTIME_DIR` or an absolute
    /// path), or to `$WAYLAND_DISPLAY` when `name` is `None`
    pub fn connect(name: Option<&str>) -> Result<Self> {
        let connection = match name {
            None => Connection::connect_to_env()
                .map_err(|e| SinkError::Connection(format!("failed to connect to the default display: {}", e)))?,
            Some(name) => {
                let path = Self::socket_path(name)?;
                let stream = UnixStream::connect(&path).map_err(|e| {
                    SinkError::Connection(format!("failed to connect to {}: {}", path.display(), e))
                })?;
                Connection::from_socket(stream)
                    .map_err(|e| SinkError::Connection(format!("failed to connect to {}: {}", name, e)))?
            }
        };
        info!("🔌 Connected to Wayland display {}", name.unwrap_or("(default)"));
        Self::from_connection(connection)
    }

    fn socket_path(name: &str) -> Result<PathBuf> {
        let path = PathBuf::from(name);
        if path.is_absolute() {
            return Ok(path);
        }
        let runtime = std::env::var_os("XDG_RUNTIME_DIR")
            .ok_or_else(|| SinkError::Connection("XDG_RUNTIME_DIR is not set".into()))?;
        Ok(PathBuf::from(runtime).join(path))
    }

    /// Builds a backend over a connection the caller already holds
    pub fn from_connection(connection: Connection) -> Result<Self> {
        let queue = connection.new_event_queue();
        let qh = queue.handle();
        let table = Arc::new(Mutex::new(ObjectTable::default()));
        connection.display().get_registry(&qh, ());

        // SAFETY: plain syscall, the result is checked before use.
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(SinkError::Connection(format!(
                "eventfd failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: raw is a freshly created descriptor we own.
        let cancel_fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let state = State {
            table: table.clone(),
            events: Vec::new(),
            pointer_focus: HashMap::new(),
            pending_sizes: HashMap::new(),
        };
        Ok(Self {
            connection: Mutex::new(Some(connection)),
            queue: Mutex::new(Some((queue, state))),
            qh,
            table,
            cancel_fd,
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers a surface created by the host so windows can be embedded in it
    pub fn adopt_surface(&self, surface: WlSurface) -> SurfaceId {
        let id = SurfaceId(self.next_id());
        let mut table = self.table.lock();
        table.surface_ids.insert(surface.id(), id);
        table.surfaces.insert(id, surface);
        id
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn io_error(err: impl std::fmt::Display) -> SinkError {
        SinkError::ProtocolIo(err.to_string())
    }

    fn surface(&self, surface: SurfaceId) -> Option<WlSurface> {
        self.table.lock().surfaces.get(&surface).cloned()
    }

    fn drain_cancel(&self) {
        let mut value = 0u64;
        // SAFETY: reading 8 bytes into a u64 from our own eventfd.
        unsafe {
            libc::read(
                self.cancel_fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl ProtocolBackend for WaylandBackend {
    fn roundtrip(&self) -> Result<()> {
        let mut guard = self.queue.lock();
        let (queue, state) = guard.as_mut().ok_or(SinkError::Shutdown)?;
        queue.roundtrip(state).map_err(Self::io_error)?;
        Ok(())
    }

    fn globals(&self) -> Globals {
        self.table.lock().globals.clone()
    }

    fn dispatch_blocking(&self, events: &mut Vec<ProtocolEvent>) -> Result<DispatchStatus> {
        loop {
            let read_guard = {
                let mut guard = self.queue.lock();
                let (queue, state) = guard.as_mut().ok_or(SinkError::Shutdown)?;
                queue.dispatch_pending(state).map_err(Self::io_error)?;
                if !state.events.is_empty() {
                    events.append(&mut state.events);
                    return Ok(DispatchStatus::Dispatched);
                }
                if let Err(e) = queue.flush() {
                    if !matches!(&e, WaylandError::Io(io) if io.kind() == std::io::ErrorKind::WouldBlock) {
                        return Err(Self::io_error(e));
                    }
                }
                match queue.prepare_read() {
                    Some(read_guard) => read_guard,
                    None => continue,
                }
            };

            let mut fds = [
                libc::pollfd {
                    fd: read_guard.connection_fd().as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.cancel_fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            // SAFETY: fds is a valid array of two pollfd structs.
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(SinkError::ProtocolIo(format!("poll failed: {}", err)));
            }

            if fds[1].revents & libc::POLLIN != 0 {
                self.drain_cancel();
                trace!("🛑 Dispatch wait cancelled");
                return Ok(DispatchStatus::Cancelled);
            }

            if fds[0].revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
                match read_guard.read() {
                    Ok(_) => {}
                    Err(WaylandError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(Self::io_error(e)),
                }
            }
        }
    }

    fn cancel_dispatch(&self) {
        let value = 1u64;
        // SAFETY: writing 8 bytes from a u64 into our own eventfd.
        let ret = unsafe {
            libc::write(
                self.cancel_fd.as_raw_fd(),
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            warn!("⚠️ Failed to signal dispatch cancellation: {}", std::io::Error::last_os_error());
        }
    }

    fn flush(&self) -> Result<()> {
        let connection = self.connection.lock();
        let connection = connection.as_ref().ok_or(SinkError::Shutdown)?;
        match connection.flush() {
            Ok(()) => Ok(()),
            Err(WaylandError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(Self::io_error(e)),
        }
    }

    fn create_surface(&self) -> Result<SurfaceId> {
        let mut table = self.table.lock();
        let compositor = table
            .compositor
            .as_ref()
            .ok_or_else(|| SinkError::Connection("wl_compositor not bound".into()))?;
        let surface = compositor.create_surface(&self.qh, ());
        let id = SurfaceId(self.next_id());
        table.surface_ids.insert(surface.id(), id);
        table.surfaces.insert(id, surface);
        Ok(id)
    }

    fn destroy_surface(&self, surface: SurfaceId) {
        let mut table = self.table.lock();
        if let Some(proxy) = table.surfaces.remove(&surface) {
            table.surface_ids.remove(&proxy.id());
            proxy.destroy();
        }
    }

    fn create_subsurface(&self, surface: SurfaceId, parent: SurfaceId) -> Result<SubsurfaceId> {
        let mut table = self.table.lock();
        let subcompositor = table
            .subcompositor
            .as_ref()
            .ok_or_else(|| SinkError::Connection("wl_subcompositor not bound".into()))?;
        let child = table
            .surfaces
            .get(&surface)
            .ok_or_else(|| SinkError::InvalidWindowHandle(format!("unknown {}", surface)))?;
        let parent_proxy = table
            .surfaces
            .get(&parent)
            .ok_or_else(|| SinkError::InvalidWindowHandle(format!("unknown parent {}", parent)))?;
        let subsurface = subcompositor.get_subsurface(child, parent_proxy, &self.qh, ());
        let id = SubsurfaceId(self.next_id());
        table.subsurfaces.insert(id, subsurface);
        Ok(id)
    }

    fn subsurface_set_position(&self, subsurface: SubsurfaceId, x: i32, y: i32) {
        if let Some(sub) = self.table.lock().subsurfaces.get(&subsurface) {
            sub.set_position(x, y);
        }
    }

    fn subsurface_set_sync(&self, subsurface: SubsurfaceId, sync: bool) {
        if let Some(sub) = self.table.lock().subsurfaces.get(&subsurface) {
            if sync {
                sub.set_sync();
            } else {
                sub.set_desync();
            }
        }
    }

    fn subsurface_place(&self, subsurface: SubsurfaceId, sibling: SurfaceId, above: bool) {
        let table = self.table.lock();
        if let (Some(sub), Some(sibling)) = (table.subsurfaces.get(&subsurface), table.surfaces.get(&sibling)) {
            if above {
                sub.place_above(sibling);
            } else {
                sub.place_below(sibling);
            }
        }
    }

    fn destroy_subsurface(&self, subsurface: SubsurfaceId) {
        if let Some(sub) = self.table.lock().subsurfaces.remove(&subsurface) {
            sub.destroy();
        }
    }

    fn create_viewport(&self, surface: SurfaceId) -> Result<ViewportId> {
        let mut table = self.table.lock();
        let viewporter = table
            .viewporter
            .as_ref()
            .ok_or_else(|| SinkError::Connection("wp_viewporter not available".into()))?;
        let proxy = table
            .surfaces
            .get(&surface)
            .ok_or_else(|| SinkError::InvalidWindowHandle(format!("unknown {}", surface)))?;
        let viewport = viewporter.get_viewport(proxy, &self.qh, ());
        let id = ViewportId(self.next_id());
        table.viewports.insert(id, viewport);
        Ok(id)
    }

    fn viewport_set_source(&self, viewport: ViewportId, source: Option<SourceRect>) {
        if let Some(proxy) = self.table.lock().viewports.get(&viewport) {
            match source {
                Some(rect) => proxy.set_source(rect.x, rect.y, rect.width, rect.height),
                None => proxy.set_source(-1.0, -1.0, -1.0, -1.0),
            }
        }
    }

    fn viewport_set_destination(&self, viewport: ViewportId, width: i32, height: i32) {
        if let Some(proxy) = self.table.lock().viewports.get(&viewport) {
            if width > 0 && height > 0 {
                proxy.set_destination(width, height);
            } else {
                proxy.set_destination(-1, -1);
            }
        }
    }

    fn destroy_viewport(&self, viewport: ViewportId) {
        if let Some(proxy) = self.table.lock().viewports.remove(&viewport) {
            proxy.destroy();
        }
    }

    fn surface_attach(&self, surface: SurfaceId, buffer: Option<BufferId>) {
        let table = self.table.lock();
        if let Some(proxy) = table.surfaces.get(&surface) {
            let buffer = buffer.and_then(|id| table.buffers.get(&id));
            proxy.attach(buffer, 0, 0);
        }
    }

    fn surface_damage(&self, surface: SurfaceId, x: i32, y: i32, width: i32, height: i32) {
        if let Some(proxy) = self.surface(surface) {
            if proxy.version() >= 4 {
                proxy.damage_buffer(x, y, width, height);
            } else {
                proxy.damage(x, y, width, height);
            }
        }
    }

    fn surface_set_opaque(&self, surface: SurfaceId, size: Option<(i32, i32)>) {
        let table = self.table.lock();
        let Some(proxy) = table.surfaces.get(&surface) else {
            return;
        };
        match (size, table.compositor.as_ref()) {
            (Some((width, height)), Some(compositor)) => {
                let region = compositor.create_region(&self.qh, ());
                region.add(0, 0, width, height);
                proxy.set_opaque_region(Some(&region));
                region.destroy();
            }
            _ => proxy.set_opaque_region(None),
        }
    }

    fn surface_frame(&self, surface: SurfaceId) -> Result<CallbackId> {
        let proxy = self
            .surface(surface)
            .ok_or_else(|| SinkError::ProtocolIo(format!("frame request on unknown {}", surface)))?;
        let id = CallbackId(self.next_id());
        proxy.frame(&self.qh, id);
        Ok(id)
    }

    fn surface_commit(&self, surface: SurfaceId) {
        if let Some(proxy) = self.surface(surface) {
            proxy.commit();
        }
    }

    fn create_shm_buffer(&self, desc: &ShmBufferDesc<'_>) -> Result<BufferId> {
        let mut table = self.table.lock();
        let shm = table
            .shm
            .as_ref()
            .ok_or_else(|| SinkError::allocation("wl_shm not bound"))?;
        let format = wl_shm::Format::try_from(desc.format)
            .map_err(|_| SinkError::allocation(format!("unknown wl_shm format {:#x}", desc.format)))?;
        let pool_size = i32::try_from(desc.pool_size)
            .map_err(|_| SinkError::allocation(format!("shm pool of {} bytes is too large", desc.pool_size)))?;
        let offset = i32::try_from(desc.offset)
            .map_err(|_| SinkError::allocation(format!("shm offset {} is too large", desc.offset)))?;

        let id = BufferId(self.next_id());
        let pool = shm.create_pool(desc.fd, pool_size, &self.qh, ());
        let buffer = pool.create_buffer(offset, desc.width, desc.height, desc.stride, format, &self.qh, id);
        pool.destroy();
        table.buffers.insert(id, buffer);
        trace!("🧱 wl_shm buffer {} {}x{} stride {}", id, desc.width, desc.height, desc.stride);
        Ok(id)
    }

    fn create_dmabuf_buffer(&self, desc: &DmabufBufferDesc<'_>) -> Result<BufferId> {
        let mut table = self.table.lock();
        let dmabuf = table
            .dmabuf
            .as_ref()
            .ok_or_else(|| SinkError::allocation("zwp_linux_dmabuf_v1 not bound"))?;

        let id = BufferId(self.next_id());
        let params = dmabuf.create_params(&self.qh, ());
        let modifier_hi = (desc.modifier >> 32) as u32;
        let modifier_lo = (desc.modifier & 0xffff_ffff) as u32;
        for (index, plane) in desc.planes.iter().enumerate() {
            params.add(plane.fd, index as u32, plane.offset, plane.stride, modifier_hi, modifier_lo);
        }
        let mut flags = zwp_linux_buffer_params_v1::Flags::empty();
        if desc.interlaced {
            flags |= zwp_linux_buffer_params_v1::Flags::Interlaced;
            if desc.bottom_first {
                flags |= zwp_linux_buffer_params_v1::Flags::BottomFirst;
            }
        }
        let buffer = params.create_immed(desc.width, desc.height, desc.format, flags, &self.qh, id);
        params.destroy();
        table.buffers.insert(id, buffer);
        trace!(
            "🧱 dmabuf buffer {} {}x{} fourcc {:#x} modifier {:#x}",
            id,
            desc.width,
            desc.height,
            desc.format,
            desc.modifier
        );
        Ok(id)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        if let Some(proxy) = self.table.lock().buffers.remove(&buffer) {
            proxy.destroy();
        }
    }

    fn create_toplevel(&self, surface: SurfaceId, fullscreen: bool) -> Result<ToplevelId> {
        let mut table = self.table.lock();
        let proxy = table
            .surfaces
            .get(&surface)
            .cloned()
            .ok_or_else(|| SinkError::InvalidWindowHandle(format!("unknown {}", surface)))?;
        let id = ToplevelId(self.next_id());

        let shell = if let Some(wm_base) = table.wm_base.as_ref() {
            let xdg_surface = wm_base.get_xdg_surface(&proxy, &self.qh, id);
            let toplevel = xdg_surface.get_toplevel(&self.qh, id);
            toplevel.set_title("wlsink".into());
            toplevel.set_app_id("wlsink".into());
            if fullscreen {
                toplevel.set_fullscreen(None);
            }
            Shell::Xdg { xdg_surface, toplevel }
        } else if let Some(shell) = table.fullscreen_shell.as_ref() {
            shell.present_surface(Some(&proxy), zwp_fullscreen_shell_v1::PresentMethod::Default, None);
            Shell::Fullscreen
        } else {
            return Err(SinkError::Connection("no shell protocol available".into()));
        };
        table.toplevels.insert(id, shell);
        debug!("🪟 Created toplevel {} for {}", id, surface);
        Ok(id)
    }

    fn toplevel_set_fullscreen(&self, toplevel: ToplevelId, fullscreen: bool) {
        if let Some(Shell::Xdg { toplevel, .. }) = self.table.lock().toplevels.get(&toplevel) {
            if fullscreen {
                toplevel.set_fullscreen(None);
            } else {
                toplevel.unset_fullscreen();
            }
        }
    }

    fn toplevel_move(&self, toplevel: ToplevelId, seat: SeatId, serial: u32) {
        let table = self.table.lock();
        if let (Some(Shell::Xdg { toplevel, .. }), Some(seat)) = (table.toplevels.get(&toplevel), table.seats.get(&seat)) {
            toplevel._move(seat, serial);
        }
    }

    fn destroy_toplevel(&self, toplevel: ToplevelId) {
        if let Some(Shell::Xdg { xdg_surface, toplevel }) = self.table.lock().toplevels.remove(&toplevel) {
            toplevel.destroy();
            xdg_surface.destroy();
        }
    }

    fn release_globals(&self) {
        let mut table = self.table.lock();
        if let Some(viewporter) = table.viewporter.take() {
            viewporter.destroy();
        }
        if let Some(dmabuf) = table.dmabuf.take() {
            dmabuf.destroy();
        }
        if let Some(wm_base) = table.wm_base.take() {
            wm_base.destroy();
        }
        if let Some(shell) = table.fullscreen_shell.take() {
            shell.release();
        }
        if let Some(subcompositor) = table.subcompositor.take() {
            subcompositor.destroy();
        }
        if let Some(shm) = table.shm.take() {
            if shm.version() >= 2 {
                shm.release();
            }
        }
        for (_, seat) in table.seats.drain() {
            if seat.version() >= 5 {
                seat.release();
            }
        }
    }

    fn disconnect(&self) {
        let queue = self.queue.lock().take();
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            let _ = connection.flush();
        }
        drop(queue);
        info!("🔌 Wayland connection closed");
    }
}

impl Dispatch<WlRegistry, ()> for State {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let wl_registry::Event::Global { name, interface, version } = event else {
            return;
        };
        let mut table = state.table.lock();
        match interface.as_str() {
            "wl_compositor" => {
                table.compositor = Some(registry.bind(name, version.min(4), qh, ()));
                table.globals.compositor = true;
            }
            "wl_subcompositor" => {
                table.subcompositor = Some(registry.bind(name, 1, qh, ()));
                table.globals.subcompositor = true;
            }
            "wl_shm" => {
                table.shm = Some(registry.bind(name, version.min(2), qh, ()));
                table.globals.shm = true;
            }
            "wp_viewporter" => {
                table.viewporter = Some(registry.bind(name, 1, qh, ()));
                table.globals.viewporter = true;
            }
            "zwp_linux_dmabuf_v1" => {
                if version < 3 {
                    warn!("⚠️ zwp_linux_dmabuf_v1 v{} does not advertise modifiers, ignoring", version);
                    return;
                }
                table.dmabuf = Some(registry.bind(name, 3, qh, ()));
                table.globals.dmabuf = true;
            }
            "xdg_wm_base" => {
                table.wm_base = Some(registry.bind(name, 1, qh, ()));
                table.globals.xdg_wm_base = true;
            }
            "zwp_fullscreen_shell_v1" => {
                table.fullscreen_shell = Some(registry.bind(name, 1, qh, ()));
                table.globals.fullscreen_shell = true;
            }
            "wl_seat" => {
                let id = SeatId(name as u64);
                let seat: WlSeat = registry.bind(name, version.min(5), qh, id);
                table.seats.insert(id, seat);
                table.globals.seat = true;
            }
            _ => {}
        }
    }
}

impl Dispatch<WlShm, ()> for State {
    fn event(state: &mut Self, _: &WlShm, event: wl_shm::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {
        if let wl_shm::Event::Format { format } = event {
            let code = match format {
                WEnum::Value(format) => u32::from(format),
                WEnum::Unknown(code) => code,
            };
            let mut table = state.table.lock();
            if !table.globals.shm_formats.contains(&code) {
                table.globals.shm_formats.push(code);
            }
        }
    }
}

impl Dispatch<ZwpLinuxDmabufV1, ()> for State {
    fn event(
        state: &mut Self,
        _: &ZwpLinuxDmabufV1,
        event: zwp_linux_dmabuf_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let zwp_linux_dmabuf_v1::Event::Modifier { format, modifier_hi, modifier_lo } = event {
            let modifier = ((modifier_hi as u64) << 32) | modifier_lo as u64;
            let mut table = state.table.lock();
            if !table.globals.dmabuf_formats.contains(&(format, modifier)) {
                table.globals.dmabuf_formats.push((format, modifier));
            }
        }
    }
}

impl Dispatch<WlBuffer, BufferId> for State {
    fn event(state: &mut Self, _: &WlBuffer, event: wl_buffer::Event, id: &BufferId, _: &Connection, _: &QueueHandle<Self>) {
        if let wl_buffer::Event::Release = event {
            state.events.push(ProtocolEvent::BufferReleased(*id));
        }
    }
}

impl Dispatch<WlCallback, CallbackId> for State {
    fn event(
        state: &mut Self,
        _: &WlCallback,
        event: wl_callback::Event,
        id: &CallbackId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { callback_data } = event {
            state.events.push(ProtocolEvent::FrameDone { callback: *id, time: callback_data });
        }
    }
}

impl Dispatch<XdgWmBase, ()> for State {
    fn event(_: &mut Self, wm_base: &XdgWmBase, event: xdg_wm_base::Event, _: &(), _: &Connection, _: &QueueHandle<Self>) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<XdgSurface, ToplevelId> for State {
    fn event(
        state: &mut Self,
        xdg_surface: &XdgSurface,
        event: xdg_surface::Event,
        id: &ToplevelId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            xdg_surface.ack_configure(serial);
            let (width, height) = state.pending_sizes.remove(id).unwrap_or((0, 0));
            state.events.push(ProtocolEvent::ToplevelConfigured { toplevel: *id, width, height });
        }
    }
}

impl Dispatch<XdgToplevel, ToplevelId> for State {
    fn event(
        state: &mut Self,
        _: &XdgToplevel,
        event: xdg_toplevel::Event,
        id: &ToplevelId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                state.pending_sizes.insert(*id, (width, height));
            }
            xdg_toplevel::Event::Close => {
                state.events.push(ProtocolEvent::ToplevelClosed { toplevel: *id });
            }
            _ => {}
        }
    }
}

impl Dispatch<WlSeat, SeatId> for State {
    fn event(state: &mut Self, seat: &WlSeat, event: wl_seat::Event, id: &SeatId, _: &Connection, qh: &QueueHandle<Self>) {
        if let wl_seat::Event::Capabilities { capabilities: WEnum::Value(caps) } = event {
            if caps.contains(wl_seat::Capability::Pointer) && !state.pointer_focus.contains_key(id) {
                seat.get_pointer(qh, *id);
                state.pointer_focus.insert(*id, None);
            }
            if caps.contains(wl_seat::Capability::Touch) {
                seat.get_touch(qh, *id);
            }
        }
    }
}

impl Dispatch<WlPointer, SeatId> for State {
    fn event(state: &mut Self, _: &WlPointer, event: wl_pointer::Event, seat: &SeatId, _: &Connection, _: &QueueHandle<Self>) {
        match event {
            wl_pointer::Event::Enter { surface, .. } => {
                let focus = state.surface_id(&surface);
                state.pointer_focus.insert(*seat, focus);
            }
            wl_pointer::Event::Leave { .. } => {
                state.pointer_focus.insert(*seat, None);
            }
            wl_pointer::Event::Button { serial, button, state: button_state, .. } => {
                let pressed = matches!(button_state, WEnum::Value(wl_pointer::ButtonState::Pressed));
                let surface = state.pointer_focus.get(seat).copied().flatten();
                state.events.push(ProtocolEvent::PointerButton { seat: *seat, surface, serial, button, pressed });
            }
            _ => {}
        }
    }
}

impl Dispatch<WlTouch, SeatId> for State {
    fn event(state: &mut Self, _: &WlTouch, event: wl_touch::Event, seat: &SeatId, _: &Connection, _: &QueueHandle<Self>) {
        if let wl_touch::Event::Down { serial, surface, .. } = event {
            let surface = state.surface_id(&surface);
            state.events.push(ProtocolEvent::TouchDown { seat: *seat, surface, serial });
        }
    }
}

delegate_noop!(State: WlCompositor);
delegate_noop!(State: WlSubcompositor);
delegate_noop!(State: WlSubsurface);
delegate_noop!(State: WlShmPool);
delegate_noop!(State: WlRegion);
delegate_noop!(State: WpViewporter);
delegate_noop!(State: WpViewport);
delegate_noop!(State: ignore WlSurface);
delegate_noop!(State: ignore ZwpLinuxBufferParamsV1);
delegate_noop!(State: ignore ZwpFullscreenShellV1);
