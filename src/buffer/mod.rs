//! Renderable buffers shared with the compositor
//!
//! A [`RenderableBuffer`] pairs one memory block with the `wl_buffer` built
//! for it on a particular display. Its lifecycle is driven from two sides:
//!
//! - the render path attaches it ([`RenderableBuffer::attach`]), after which
//!   it is Busy and keeps its memory alive
//! - the compositor's `wl_buffer.release`, delivered on the dispatch thread,
//!   moves it back to Released ([`RenderableBuffer::on_release`])
//!
//! The [`registry::BufferRegistry`] owns every buffer; a buffer only knows
//! its registry through a [`DisplayToken`].

pub mod dmabuf;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod shm;

use crate::protocol::{BufferId, ProtocolBackend, SurfaceId};
use log::{trace, warn};
use memory::{Memory, MemoryId};
use parking_lot::{Condvar, Mutex};
use registry::BufferRegistry;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Attached to a surface, commit not yet issued
    Attached,
    /// In use by the compositor
    Busy,
    /// Free for the producer to reuse
    Released,
}

/// How a wrapped buffer was built, tried in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSource {
    /// Imported through `zwp_linux_dmabuf_v1`
    Dmabuf,
    /// Frame memory wrapped directly as `wl_shm`
    Shm,
    /// Frame copied into an internal `wl_shm` pool buffer
    Copy,
}

impl BufferSource {
    pub const ORDER: [BufferSource; 3] = [BufferSource::Dmabuf, BufferSource::Shm, BufferSource::Copy];
}

/// Non-owning back-reference from a buffer to its display's registry
///
/// The generation changes when the registry shuts down, so a token taken
/// before shutdown can never unregister anything afterwards.
#[derive(Debug, Clone)]
pub struct DisplayToken {
    registry: Weak<BufferRegistry>,
    generation: u64,
}

impl DisplayToken {
    pub(crate) fn new(registry: Weak<BufferRegistry>, generation: u64) -> Self {
        Self { registry, generation }
    }

    /// True while the registry is alive and not shut down
    pub fn is_valid(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.generation() == self.generation)
    }

    pub fn unregister(&self, memory: MemoryId) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister_from(self.generation, memory);
        }
    }

    pub fn same_display(&self, other: &DisplayToken) -> bool {
        Weak::ptr_eq(&self.registry, &other.registry)
    }
}

#[derive(Debug)]
struct Slot {
    state: BufferState,
    /// Keeps the memory alive while the compositor may read it
    held: Option<Memory>,
}

/// One `wl_buffer` and the state of its use by the compositor
pub struct RenderableBuffer {
    memory: MemoryId,
    server: BufferId,
    source: BufferSource,
    width: u32,
    height: u32,
    backend: Arc<dyn ProtocolBackend>,
    token: DisplayToken,
    slot: Mutex<Slot>,
    released: Condvar,
}

impl std::fmt::Debug for RenderableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderableBuffer")
            .field("memory", &self.memory)
            .field("server", &self.server)
            .field("source", &self.source)
            .field("state", &self.state())
            .finish()
    }
}

impl RenderableBuffer {
    pub(crate) fn new(
        memory: MemoryId,
        server: BufferId,
        source: BufferSource,
        (width, height): (u32, u32),
        backend: Arc<dyn ProtocolBackend>,
        token: DisplayToken,
    ) -> Self {
        Self {
            memory,
            server,
            source,
            width,
            height,
            backend,
            token,
            slot: Mutex::new(Slot {
                state: BufferState::Released,
                held: None,
            }),
            released: Condvar::new(),
        }
    }

    pub fn memory_id(&self) -> MemoryId {
        self.memory
    }

    pub fn server_id(&self) -> BufferId {
        self.server
    }

    pub fn source(&self) -> BufferSource {
        self.source
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn token(&self) -> &DisplayToken {
        &self.token
    }

    pub fn state(&self) -> BufferState {
        self.slot.lock().state
    }

    pub fn is_busy(&self) -> bool {
        self.state() != BufferState::Released
    }

    /// Attaches to `surface` and holds `memory` until the compositor releases
    /// the buffer. Returns false (and attaches nothing) if it is still in use.
    pub fn attach(&self, surface: SurfaceId, memory: Memory) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != BufferState::Released {
            warn!("⚠️ {} is still used by the compositor, not attaching it twice", self.server);
            return false;
        }
        slot.state = BufferState::Attached;
        slot.held = Some(memory);
        self.backend.surface_attach(surface, Some(self.server));
        true
    }

    /// The commit carrying this buffer has been issued
    pub fn mark_busy(&self) {
        let mut slot = self.slot.lock();
        if slot.state == BufferState::Attached {
            slot.state = BufferState::Busy;
        }
    }

    /// Server-driven release: Busy → Released
    pub fn on_release(&self) {
        let held = {
            let mut slot = self.slot.lock();
            if slot.state == BufferState::Released {
                trace!("{} released while not in use", self.server);
            }
            slot.state = BufferState::Released;
            slot.held.take()
        };
        self.released.notify_all();
        trace!("🔓 {} released", self.server);
        // Dropping the last memory handle may unregister this buffer, so it
        // must happen outside the slot lock.
        drop(held);
    }

    /// Marks released without waiting for the compositor
    pub fn force_release(&self) {
        self.on_release();
    }

    /// Blocks until the buffer is not in use, or `timeout` elapses
    pub fn wait_released(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.state != BufferState::Released {
            if self.released.wait_until(&mut slot, deadline).timed_out() {
                return slot.state == BufferState::Released;
            }
        }
        true
    }
}

impl Drop for RenderableBuffer {
    fn drop(&mut self) {
        trace!("🗑️ Destroying {} for {}", self.server, self.memory);
        self.backend.destroy_buffer(self.server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::headless::HeadlessBackend;

    fn buffer() -> (Arc<HeadlessBackend>, RenderableBuffer) {
        let backend = Arc::new(HeadlessBackend::new());
        let token = DisplayToken::new(Weak::new(), 0);
        let buffer = RenderableBuffer::new(
            Memory::from_vec(vec![0; 4]).id(),
            BufferId(99),
            BufferSource::Shm,
            (1, 1),
            backend.clone(),
            token,
        );
        (backend, buffer)
    }

    #[test]
    fn test_attach_release_cycle() {
        let (backend, buffer) = buffer();
        let surface = backend.create_surface().unwrap();
        let memory = Memory::from_vec(vec![0; 4]);

        assert_eq!(buffer.state(), BufferState::Released);
        assert!(buffer.attach(surface, memory.clone()));
        assert_eq!(buffer.state(), BufferState::Attached);
        buffer.mark_busy();
        assert_eq!(buffer.state(), BufferState::Busy);
        assert_eq!(memory.handle_count(), 2);

        assert!(!buffer.attach(surface, memory.clone()));

        buffer.on_release();
        assert_eq!(buffer.state(), BufferState::Released);
        assert_eq!(memory.handle_count(), 1);
    }

    #[test]
    fn test_wait_released_times_out_while_busy() {
        let (backend, buffer) = buffer();
        let surface = backend.create_surface().unwrap();
        buffer.attach(surface, Memory::from_vec(vec![0; 4]));
        buffer.mark_busy();
        assert!(!buffer.wait_released(Duration::from_millis(10)));
        buffer.force_release();
        assert!(buffer.wait_released(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_released_wakes_on_release() {
        let (backend, buffer) = buffer();
        let buffer = Arc::new(buffer);
        let surface = backend.create_surface().unwrap();
        buffer.attach(surface, Memory::from_vec(vec![0; 4]));
        buffer.mark_busy();

        let releaser = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                buffer.on_release();
            })
        };
        assert!(buffer.wait_released(Duration::from_secs(5)));
        releaser.join().unwrap();
    }

    #[test]
    fn test_dangling_token_is_invalid() {
        let (_, buffer) = buffer();
        assert!(!buffer.token().is_valid());
        buffer.token().unregister(buffer.memory_id());
    }
}
