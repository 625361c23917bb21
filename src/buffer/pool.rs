//! Copy pool for frames the compositor cannot use directly
//!
//! Frames whose memory can be neither imported as a dmabuf nor wrapped as
//! `wl_shm` are copied into buffers from this pool. Pool buffers always use
//! the canonical layout for the negotiated format and size.

use super::memory::{Memory, MemoryAllocator, MemoryId};
use super::registry::BufferRegistry;
use crate::error::{Result, SinkError};
use crate::format::{VideoFrame, VideoInfo};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// One buffer stays on screen while the next frame is copied
pub const MIN_POOL_BUFFERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub min_buffers: usize,
    pub max_buffers: usize,
    pub release_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min_buffers: 2,
            max_buffers: 4,
            release_timeout: Duration::from_millis(500),
        }
    }
}

struct PoolState {
    memories: Vec<Memory>,
    cursor: usize,
}

pub struct BufferPool {
    allocator: Arc<dyn MemoryAllocator>,
    info: VideoInfo,
    limits: PoolLimits,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Creates a pool for `info`, reverted to the canonical layout
    pub fn new(allocator: Arc<dyn MemoryAllocator>, info: &VideoInfo, limits: PoolLimits) -> Result<Self> {
        let canonical = VideoInfo::new(info.format, info.width, info.height)
            .with_pixel_aspect_ratio(info.par_n, info.par_d);
        let limits = PoolLimits {
            max_buffers: limits.max_buffers.max(MIN_POOL_BUFFERS),
            ..limits
        };
        let pool = Self {
            allocator,
            info: canonical,
            limits,
            state: Mutex::new(PoolState {
                memories: Vec::new(),
                cursor: 0,
            }),
        };
        {
            let mut state = pool.state.lock();
            for _ in 0..limits.min_buffers.min(limits.max_buffers) {
                let memory = pool.allocate()?;
                state.memories.push(memory);
            }
        }
        debug!(
            "🏊 Copy pool for {} {}x{} ({} bytes per buffer)",
            pool.info.format, pool.info.width, pool.info.height, pool.info.size
        );
        Ok(pool)
    }

    fn allocate(&self) -> Result<Memory> {
        self.allocator.allocate(self.info.format, self.info.width, self.info.height)
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    pub fn len(&self) -> usize {
        self.state.lock().memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a pool memory the compositor is not using, growing the pool
    /// up to its limit and otherwise waiting for a release. `on_screen` is
    /// never handed out, even once the compositor released it.
    pub fn acquire(&self, registry: &BufferRegistry, on_screen: Option<MemoryId>) -> Result<Memory> {
        let waited_on = {
            let mut state = self.state.lock();
            let count = state.memories.len();
            let mut oldest_busy = None;
            for step in 0..count {
                let index = (state.cursor + step) % count;
                let memory = &state.memories[index];
                if Some(memory.id()) == on_screen {
                    continue;
                }
                let busy = registry.lookup(memory.id()).is_some_and(|b| b.is_busy());
                if !busy {
                    let memory = memory.clone();
                    state.cursor = (index + 1) % count;
                    return Ok(memory);
                }
                if oldest_busy.is_none() {
                    oldest_busy = Some(index);
                }
            }

            if count < self.limits.max_buffers {
                let memory = self.allocate()?;
                state.memories.push(memory.clone());
                debug!("🏊 Copy pool grew to {} buffers", state.memories.len());
                return Ok(memory);
            }

            let Some(index) = oldest_busy else {
                return Err(SinkError::allocation("copy pool has no buffer off screen"));
            };
            state.cursor = (index + 1) % count;
            state.memories[index].clone()
        };

        match registry.lookup(waited_on.id()) {
            Some(buffer) if !buffer.wait_released(self.limits.release_timeout) => {
                warn!("⏳ No copy buffer released within {:?}", self.limits.release_timeout);
                Err(SinkError::allocation("timed out waiting for a free copy buffer"))
            }
            _ => Ok(waited_on),
        }
    }

    /// Copies `frame` (laid out as `src_info`) into `dst`, plane by plane
    pub fn copy_frame(&self, frame: &VideoFrame, src_info: &VideoInfo, dst: &Memory) -> Result<()> {
        if src_info.format != self.info.format {
            return Err(SinkError::allocation(format!(
                "cannot copy {} into a {} pool",
                src_info.format, self.info.format
            )));
        }
        let dst_info = &self.info;
        with_frame_bytes(frame, |src| {
            dst.with_bytes_mut(|out| copy_planes(src, src_info, out, dst_info))?
        })?
    }
}

fn with_frame_bytes<R>(frame: &VideoFrame, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
    match frame.memories.as_slice() {
        [] => Err(SinkError::allocation("frame has no memory")),
        [single] => single.with_bytes(f),
        many => {
            let mut joined = Vec::with_capacity(frame.total_size());
            for memory in many {
                memory.with_bytes(|bytes| joined.extend_from_slice(bytes))?;
            }
            Ok(f(&joined))
        }
    }
}

fn plane_rows(info: &VideoInfo, plane: usize) -> usize {
    let stride = info.stride[plane] as usize;
    if stride == 0 {
        return 0;
    }
    let end = if plane + 1 < info.n_planes() {
        info.offset[plane + 1]
    } else {
        info.size
    };
    end.saturating_sub(info.offset[plane]) / stride
}

fn copy_planes(src: &[u8], src_info: &VideoInfo, dst: &mut [u8], dst_info: &VideoInfo) -> Result<()> {
    for plane in 0..dst_info.n_planes() {
        let rows = plane_rows(dst_info, plane);
        let src_stride = src_info.stride[plane] as usize;
        let dst_stride = dst_info.stride[plane] as usize;
        let row_bytes = src_stride.min(dst_stride);
        for row in 0..rows {
            let s = src_info.offset[plane] + row * src_stride;
            let d = dst_info.offset[plane] + row * dst_stride;
            let (Some(from), Some(to)) = (src.get(s..s + row_bytes), dst.get_mut(d..d + row_bytes)) else {
                return Err(SinkError::allocation(format!(
                    "plane {} row {} is outside the frame ({} / {} bytes)",
                    plane,
                    row,
                    src.len(),
                    dst.len()
                )));
            };
            to.copy_from_slice(from);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::memory::{MemfdAllocator, MockMemoryAllocator};
    use crate::format::{VideoFormat, VideoMeta};

    #[test]
    fn test_pool_preallocates_min_buffers() {
        let mut allocator = MockMemoryAllocator::new();
        allocator
            .expect_allocate()
            .times(2)
            .returning(|_, _, _| Ok(Memory::from_vec(vec![0; 64])));
        let info = VideoInfo::new(VideoFormat::BGRx, 4, 4);
        let pool = BufferPool::new(Arc::new(allocator), &info, PoolLimits::default()).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let mut allocator = MockMemoryAllocator::new();
        allocator
            .expect_allocate()
            .returning(|_, _, _| Err(SinkError::allocation("out of memory")));
        let info = VideoInfo::new(VideoFormat::BGRx, 4, 4);
        let result = BufferPool::new(Arc::new(allocator), &info, PoolLimits::default());
        assert!(matches!(result, Err(SinkError::Allocation(_))));
    }

    #[test]
    fn test_acquire_rotates_through_free_buffers() {
        let info = VideoInfo::new(VideoFormat::BGRx, 4, 4);
        let pool = BufferPool::new(Arc::new(MemfdAllocator::new()), &info, PoolLimits::default()).unwrap();
        let registry = BufferRegistry::new();
        let a = pool.acquire(&registry, None).unwrap();
        let b = pool.acquire(&registry, None).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.acquire(&registry, None).unwrap().id(), a.id());
    }

    #[test]
    fn test_acquire_skips_the_buffer_on_screen() {
        let info = VideoInfo::new(VideoFormat::BGRx, 4, 4);
        let limits = PoolLimits {
            min_buffers: 1,
            max_buffers: 1,
            ..PoolLimits::default()
        };
        let pool = BufferPool::new(Arc::new(MemfdAllocator::new()), &info, limits).unwrap();
        let registry = BufferRegistry::new();

        let shown = pool.acquire(&registry, None).unwrap();
        let next = pool.acquire(&registry, Some(shown.id())).unwrap();
        assert_ne!(next.id(), shown.id());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.acquire(&registry, Some(next.id())).unwrap().id(), shown.id());
    }

    #[test]
    fn test_copy_reverts_padded_strides() {
        let info = VideoInfo::new(VideoFormat::NV12, 4, 2);
        let pool = BufferPool::new(Arc::new(MemfdAllocator::new()), &info, PoolLimits::default()).unwrap();
        let registry = BufferRegistry::new();

        // 8-byte padded strides: luma rows then chroma row
        let mut src = vec![0u8; 8 * 3];
        src[0..4].copy_from_slice(&[1, 2, 3, 4]);
        src[8..12].copy_from_slice(&[5, 6, 7, 8]);
        src[16..20].copy_from_slice(&[9, 10, 11, 12]);
        let meta = VideoMeta {
            width: 4,
            height: 2,
            n_planes: 2,
            stride: [8, 8, 0, 0],
            offset: [0, 16, 0, 0],
        };
        let frame = VideoFrame::new(Memory::from_vec(src)).with_meta(meta);
        let src_info = frame.effective_info(&info);

        let dst = pool.acquire(&registry, None).unwrap();
        pool.copy_frame(&frame, &src_info, &dst).unwrap();
        let copied = dst.with_bytes(|bytes| bytes.to_vec()).unwrap();
        assert_eq!(copied, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }
}
