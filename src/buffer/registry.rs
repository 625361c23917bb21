//! Buffer ownership registry
//!
//! Maps memory identity to the [`RenderableBuffer`] wrapping it on one
//! display. The registry holds the only long-lived strong reference to each
//! buffer; a buffer leaves the registry when its memory is freed (through a
//! destroy notification) or when the display shuts down.

use super::memory::{Memory, MemoryId};
use super::{DisplayToken, RenderableBuffer};
use crate::error::{Result, SinkError};
use crate::protocol::BufferId;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Default)]
struct Entries {
    by_memory: HashMap<MemoryId, Arc<RenderableBuffer>>,
    by_server: HashMap<BufferId, MemoryId>,
    shutting_down: bool,
}

pub struct BufferRegistry {
    entries: Mutex<Entries>,
    generation: AtomicU64,
    this: Weak<BufferRegistry>,
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("buffers", &self.len())
            .field("generation", &self.generation())
            .finish()
    }
}

impl BufferRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            entries: Mutex::new(Entries::default()),
            generation: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Back-reference handed to buffers built for this registry
    pub fn token(&self) -> DisplayToken {
        DisplayToken::new(self.this.clone(), self.generation())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().by_memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.entries.lock().shutting_down
    }

    pub fn lookup(&self, memory: MemoryId) -> Option<Arc<RenderableBuffer>> {
        self.entries.lock().by_memory.get(&memory).cloned()
    }

    pub fn lookup_by_server(&self, server: BufferId) -> Option<Arc<RenderableBuffer>> {
        let entries = self.entries.lock();
        let memory = entries.by_server.get(&server)?;
        entries.by_memory.get(memory).cloned()
    }

    /// Returns the buffer wrapping `memory`, building and registering it with
    /// `construct` if there is none. A failed construction registers nothing.
    pub fn get_or_wrap<F>(&self, memory: &Memory, construct: F) -> Result<Arc<RenderableBuffer>>
    where
        F: FnOnce(DisplayToken) -> Result<RenderableBuffer>,
    {
        let buffer = {
            let mut entries = self.entries.lock();
            if let Some(existing) = entries.by_memory.get(&memory.id()) {
                return Ok(existing.clone());
            }
            if entries.shutting_down {
                return Err(SinkError::Shutdown);
            }
            let buffer = Arc::new(construct(self.token())?);
            entries.by_server.insert(buffer.server_id(), memory.id());
            entries.by_memory.insert(memory.id(), buffer.clone());
            buffer
        };

        let token = buffer.token().clone();
        memory.add_destroy_notify(move |id| token.unregister(id));
        debug!("📎 Registered {} as {} ({:?})", memory.id(), buffer.server_id(), buffer.source());
        Ok(buffer)
    }

    /// Removes the entry for `memory`; a no-op once shutdown has begun
    pub fn unregister(&self, memory: MemoryId) {
        self.unregister_from(self.generation(), memory);
    }

    pub(crate) fn unregister_from(&self, generation: u64, memory: MemoryId) {
        let removed = {
            let mut entries = self.entries.lock();
            if entries.shutting_down || generation != self.generation() {
                return;
            }
            let removed = entries.by_memory.remove(&memory);
            if let Some(buffer) = &removed {
                entries.by_server.remove(&buffer.server_id());
            }
            removed
        };
        if removed.is_some() {
            trace!("📎 Unregistered {}", memory);
        }
        // The wl_buffer is destroyed here, outside the lock
        drop(removed);
    }

    /// Marks every buffer released without waiting for the compositor and
    /// empties the registry
    pub fn force_release_all(&self) -> usize {
        let drained: Vec<Arc<RenderableBuffer>> = {
            let mut entries = self.entries.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            entries.by_server.clear();
            entries.by_memory.drain().map(|(_, buffer)| buffer).collect()
        };
        let count = drained.len();
        for buffer in &drained {
            buffer.force_release();
        }
        if count > 0 {
            debug!("🧹 Force-released {} buffers", count);
        }
        count
    }

    /// Stops accepting registrations and drains every buffer
    pub fn shutdown(&self) -> usize {
        self.entries.lock().shutting_down = true;
        self.force_release_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferSource, BufferState};
    use crate::protocol::headless::HeadlessBackend;
    use crate::protocol::{ProtocolBackend, SurfaceId};

    fn wrap(
        registry: &BufferRegistry,
        backend: &Arc<HeadlessBackend>,
        memory: &Memory,
        server: u64,
    ) -> Result<Arc<RenderableBuffer>> {
        registry.get_or_wrap(memory, |token| {
            Ok(RenderableBuffer::new(
                memory.id(),
                BufferId(server),
                BufferSource::Shm,
                (1, 1),
                backend.clone(),
                token,
            ))
        })
    }

    #[test]
    fn test_get_or_wrap_is_idempotent() {
        let backend = Arc::new(HeadlessBackend::new());
        let registry = BufferRegistry::new();
        let memory = Memory::from_vec(vec![0; 4]);

        let first = wrap(&registry, &backend, &memory, 1).unwrap();
        let mut constructed = false;
        let second = registry
            .get_or_wrap(&memory, |_| {
                constructed = true;
                Err(SinkError::allocation("must not be called"))
            })
            .unwrap();
        assert!(!constructed);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_construction_registers_nothing() {
        let registry = BufferRegistry::new();
        let memory = Memory::from_vec(vec![0; 4]);
        let err = registry
            .get_or_wrap(&memory, |_| Err(SinkError::allocation("import failed")))
            .unwrap_err();
        assert!(matches!(err, SinkError::Allocation(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_memory_destruction_unregisters() {
        let backend = Arc::new(HeadlessBackend::new());
        let registry = BufferRegistry::new();
        let memory = Memory::from_vec(vec![0; 4]);
        let buffer = wrap(&registry, &backend, &memory, 7).unwrap();
        assert!(registry.lookup_by_server(BufferId(7)).is_some());
        drop(buffer);

        drop(memory);
        assert!(registry.is_empty());
        assert!(registry.lookup_by_server(BufferId(7)).is_none());
    }

    #[test]
    fn test_force_release_all_leaves_nothing_busy() {
        let backend = Arc::new(HeadlessBackend::new());
        let registry = BufferRegistry::new();
        let surface: SurfaceId = backend.create_surface().unwrap();
        let memories: Vec<Memory> = (0..3).map(|_| Memory::from_vec(vec![0; 4])).collect();
        let buffers: Vec<_> = memories
            .iter()
            .enumerate()
            .map(|(i, m)| wrap(&registry, &backend, m, 10 + i as u64).unwrap())
            .collect();
        for (buffer, memory) in buffers.iter().zip(&memories) {
            buffer.attach(surface, memory.clone());
            buffer.mark_busy();
        }

        assert_eq!(registry.shutdown(), 3);
        assert!(buffers.iter().all(|b| b.state() == BufferState::Released));
        assert!(registry.is_empty());

        let late = Memory::from_vec(vec![0; 4]);
        assert!(matches!(wrap(&registry, &backend, &late, 20), Err(SinkError::Shutdown)));
    }

    #[test]
    fn test_stale_token_cannot_unregister() {
        let backend = Arc::new(HeadlessBackend::new());
        let registry = BufferRegistry::new();
        let memory = Memory::from_vec(vec![0; 4]);
        let token = registry.token();
        wrap(&registry, &backend, &memory, 1).unwrap();

        registry.force_release_all();
        let fresh = wrap(&registry, &backend, &memory, 2).unwrap();
        token.unregister(memory.id());
        assert!(registry.lookup(memory.id()).is_some());
        assert_eq!(fresh.server_id(), BufferId(2));
    }
}
