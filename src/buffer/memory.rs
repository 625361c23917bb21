//! Memory blocks backing video frames
//!
//! A [`Memory`] is a reference-counted block of frame data. It is either a
//! dmabuf (GPU-backed, never mapped by the sink), an fd-backed shared-memory
//! block, or plain process memory. When the last reference goes away the
//! registered destroy notifications run, which is how wrapped buffers learn
//! that their backing memory is gone.

use crate::error::{Result, SinkError};
use crate::format::VideoFormat;
use crate::format::VideoInfo;
use log::{debug, trace};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::ffi::CString;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a memory block, stable for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryId(u64);

impl MemoryId {
    fn next() -> Self {
        MemoryId(NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// GPU buffer shared as a dmabuf fd
    Dmabuf,
    /// Mappable fd-backed system memory (memfd, shm segment)
    Fd,
    /// Process-local memory, only usable through a copy
    Heap,
}

type DestroyNotify = Box<dyn FnOnce(MemoryId) + Send>;

struct MemoryInner {
    id: MemoryId,
    kind: MemoryKind,
    fd: Option<OwnedFd>,
    heap: Option<Mutex<Vec<u8>>>,
    size: usize,
    notifies: Mutex<Vec<DestroyNotify>>,
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        let notifies = std::mem::take(self.notifies.get_mut());
        trace!("🧹 {} freed, {} destroy notifications", self.id, notifies.len());
        for notify in notifies {
            notify(self.id);
        }
    }
}

/// Shared handle to a memory block
#[derive(Clone)]
pub struct Memory(Arc<MemoryInner>);

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("size", &self.0.size)
            .finish()
    }
}

impl Memory {
    pub fn from_fd(fd: OwnedFd, size: usize, kind: MemoryKind) -> Self {
        Self::build(kind, Some(fd), None, size)
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let size = data.len();
        Self::build(MemoryKind::Heap, None, Some(Mutex::new(data)), size)
    }

    fn build(kind: MemoryKind, fd: Option<OwnedFd>, heap: Option<Mutex<Vec<u8>>>, size: usize) -> Self {
        Memory(Arc::new(MemoryInner {
            id: MemoryId::next(),
            kind,
            fd,
            heap,
            size,
            notifies: Mutex::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> MemoryId {
        self.0.id
    }

    pub fn kind(&self) -> MemoryKind {
        self.0.kind
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.0.fd.as_ref().map(|fd| fd.as_fd())
    }

    pub fn is_fd_backed(&self) -> bool {
        self.0.fd.is_some() && self.0.kind == MemoryKind::Fd
    }

    /// Runs `notify` once the last handle to this memory is dropped
    pub fn add_destroy_notify(&self, notify: impl FnOnce(MemoryId) + Send + 'static) {
        self.0.notifies.lock().push(Box::new(notify));
    }

    /// Reads the block through a temporary mapping
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if let Some(heap) = &self.0.heap {
            return Ok(f(&heap.lock()));
        }
        let map = self.map_mut()?;
        Ok(f(&map[..]))
    }

    /// Writes the block through a temporary mapping
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        if let Some(heap) = &self.0.heap {
            return Ok(f(&mut heap.lock()));
        }
        let mut map = self.map_mut()?;
        Ok(f(&mut map[..]))
    }

    fn map_mut(&self) -> Result<MmapMut> {
        if self.0.kind == MemoryKind::Dmabuf {
            return Err(SinkError::allocation(format!("{} is a dmabuf and cannot be mapped", self.0.id)));
        }
        let fd = self
            .0
            .fd
            .as_ref()
            .ok_or_else(|| SinkError::allocation(format!("{} has no backing fd", self.0.id)))?;
        // SAFETY: the fd stays open for the lifetime of the mapping and the
        // block is only written by the producer before it is queued.
        unsafe { MmapOptions::new().len(self.0.size).map_mut(fd) }
            .map_err(|e| SinkError::allocation(format!("failed to map {}: {}", self.0.id, e)))
    }

    /// Number of live handles, including this one
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Externally produced memory handed to [`MemoryAllocator::import`]
#[derive(Debug)]
pub struct ExternalDescriptor {
    pub fd: OwnedFd,
    pub size: usize,
    pub kind: MemoryKind,
}

/// Allocation collaborator used by the copy pool and the CLI
#[cfg_attr(test, mockall::automock)]
pub trait MemoryAllocator: Send + Sync {
    /// Allocates a block large enough for one frame in canonical layout
    fn allocate(&self, format: VideoFormat, width: u32, height: u32) -> Result<Memory>;

    /// Wraps an externally created fd
    fn import(&self, descriptor: ExternalDescriptor) -> Result<Memory>;

    /// Whether the memory lives on the GPU and must go through dmabuf import
    fn is_gpu_backed(&self, memory: &Memory) -> bool;
}

/// Allocator handing out anonymous `memfd` segments
#[derive(Debug, Default)]
pub struct MemfdAllocator;

impl MemfdAllocator {
    pub fn new() -> Self {
        Self
    }

    fn create_memfd(size: usize) -> Result<OwnedFd> {
        let name = CString::new("wlsink-pool")
            .map_err(|e| SinkError::allocation(format!("invalid memfd name: {}", e)))?;
        // SAFETY: name is a valid NUL-terminated string.
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
        if raw < 0 {
            return Err(SinkError::allocation(format!(
                "memfd_create failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: raw is a freshly created descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        // SAFETY: fd is valid for the duration of the call.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            return Err(SinkError::allocation(format!(
                "ftruncate({}) failed: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(fd)
    }
}

impl MemoryAllocator for MemfdAllocator {
    fn allocate(&self, format: VideoFormat, width: u32, height: u32) -> Result<Memory> {
        let size = VideoInfo::new(format, width, height).size;
        if size == 0 {
            return Err(SinkError::allocation(format!("empty {} frame {}x{}", format, width, height)));
        }
        let fd = Self::create_memfd(size)?;
        debug!("📦 Allocated {} bytes of memfd for {} {}x{}", size, format, width, height);
        Ok(Memory::from_fd(fd, size, MemoryKind::Fd))
    }

    fn import(&self, descriptor: ExternalDescriptor) -> Result<Memory> {
        if descriptor.size == 0 {
            return Err(SinkError::allocation("cannot import an empty block"));
        }
        Ok(Memory::from_fd(descriptor.fd, descriptor.size, descriptor.kind))
    }

    fn is_gpu_backed(&self, memory: &Memory) -> bool {
        memory.kind() == MemoryKind::Dmabuf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_destroy_notify_runs_on_last_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let memory = Memory::from_vec(vec![0; 16]);
        let clone = memory.clone();
        let counter = fired.clone();
        memory.add_destroy_notify(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(memory);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Memory::from_vec(vec![1]);
        let b = Memory::from_vec(vec![1]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_memfd_allocation_is_mappable() {
        let allocator = MemfdAllocator::new();
        let memory = allocator.allocate(VideoFormat::BGRx, 4, 4).unwrap();
        assert_eq!(memory.size(), 64);
        assert!(memory.is_fd_backed());
        assert!(!allocator.is_gpu_backed(&memory));

        memory.with_bytes_mut(|bytes| bytes[0] = 0xab).unwrap();
        let first = memory.with_bytes(|bytes| bytes[0]).unwrap();
        assert_eq!(first, 0xab);
    }

    #[test]
    fn test_dmabuf_cannot_be_mapped() {
        let allocator = MemfdAllocator::new();
        let backing = allocator.allocate(VideoFormat::NV12, 16, 16).unwrap();
        let fd = backing.fd().unwrap().try_clone_to_owned().unwrap();
        let dmabuf = allocator
            .import(ExternalDescriptor { fd, size: backing.size(), kind: MemoryKind::Dmabuf })
            .unwrap();
        assert!(allocator.is_gpu_backed(&dmabuf));
        assert!(dmabuf.with_bytes(|_| ()).is_err());
    }
}
