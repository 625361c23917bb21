//! `wl_shm` wrapping of fd-backed memory

use super::memory::Memory;
use super::{BufferSource, RenderableBuffer};
use crate::display::Display;
use crate::error::{Result, SinkError};
use crate::format::VideoInfo;
use crate::protocol::ShmBufferDesc;
use log::debug;
use std::sync::Arc;

/// Wraps `memory`, laid out as `info`, as a `wl_shm` buffer on `display`.
/// Used both for frames that arrive in shared memory and for copy-pool
/// buffers.
pub fn wrap_shm(
    display: &Display,
    memory: &Memory,
    info: &VideoInfo,
    source: BufferSource,
) -> Result<Arc<RenderableBuffer>> {
    display.register_buffer(memory, |token| {
        let fd = memory
            .fd()
            .filter(|_| memory.is_fd_backed())
            .ok_or_else(|| SinkError::allocation(format!("{} is not fd-backed shared memory", memory.id())))?;
        if !info.is_shm_compatible() {
            return Err(SinkError::allocation(format!(
                "{} plane layout cannot be described to wl_shm",
                info.format
            )));
        }
        if info.size > memory.size() {
            return Err(SinkError::allocation(format!(
                "{} holds {} bytes but the frame needs {}",
                memory.id(),
                memory.size(),
                info.size
            )));
        }

        let desc = ShmBufferDesc {
            fd,
            pool_size: memory.size(),
            offset: info.offset[0],
            width: info.width as i32,
            height: info.height as i32,
            stride: info.stride[0] as i32,
            format: info.format.shm_format(),
        };
        let server = display.backend().create_shm_buffer(&desc)?;
        debug!(
            "🧱 wl_shm {} {}x{} {} ({:?})",
            server, info.width, info.height, info.format, source
        );
        Ok(RenderableBuffer::new(
            memory.id(),
            server,
            source,
            (info.width, info.height),
            display.backend().clone(),
            token,
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::memory::{MemfdAllocator, MemoryAllocator};
    use crate::format::VideoFormat;
    use crate::protocol::headless::HeadlessBackend;

    #[test]
    fn test_wraps_memfd_once() {
        let backend = Arc::new(HeadlessBackend::new());
        let display = Display::with_backend(backend.clone(), true).unwrap();
        let info = VideoInfo::new(VideoFormat::BGRx, 8, 8);
        let memory = MemfdAllocator::new().allocate(info.format, 8, 8).unwrap();

        let first = wrap_shm(&display, &memory, &info, BufferSource::Shm).unwrap();
        let second = wrap_shm(&display, &memory, &info, BufferSource::Shm).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.live_buffers(), 1);
        assert_eq!(backend.buffer(first.server_id()).unwrap().format, 1);
    }

    #[test]
    fn test_heap_memory_is_rejected() {
        let display = Display::with_backend(Arc::new(HeadlessBackend::new()), true).unwrap();
        let info = VideoInfo::new(VideoFormat::BGRx, 2, 2);
        let memory = Memory::from_vec(vec![0; info.size]);
        assert!(wrap_shm(&display, &memory, &info, BufferSource::Shm).is_err());
        assert!(display.registry().is_empty());
    }
}
