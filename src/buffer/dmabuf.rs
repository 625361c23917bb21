//! `zwp_linux_dmabuf_v1` import
//!
//! Builds a `wl_buffer` out of the dmabuf fds of a frame. AFBC frames use the
//! formats Mali expects: a single plane with a scaled stride.

use super::{BufferSource, RenderableBuffer};
use crate::display::Display;
use crate::error::{Result, SinkError};
use crate::format::{drm, VideoFormat, VideoFrame, VideoInfo};
use crate::protocol::{DmabufBufferDesc, DmabufPlane};
use log::debug;
use std::sync::Arc;

/// DRM format, plane count and stride multiplier used for an AFBC frame
pub fn afbc_layout(format: VideoFormat) -> Option<(u32, usize, f32)> {
    match format {
        VideoFormat::NV12 => Some((drm::YUV420_8BIT, 1, 1.5)),
        VideoFormat::NV12_10LE40 => Some((drm::YUV420_10BIT, 1, 1.5)),
        VideoFormat::NV16 => Some((drm::YUYV, 1, 2.0)),
        _ => None,
    }
}

/// Wraps the dmabufs of `frame` (laid out as `info`) for `display`
pub fn wrap_dmabuf(display: &Display, frame: &VideoFrame, info: &VideoInfo) -> Result<Arc<RenderableBuffer>> {
    let primary = frame
        .primary()
        .ok_or_else(|| SinkError::allocation("frame has no memory"))?;

    display.register_buffer(primary, |token| {
        let (format, n_planes, stride_scale, modifier) = if info.afbc {
            let (format, n_planes, scale) = afbc_layout(info.format).ok_or_else(|| SinkError::FormatUnsupported {
                format: info.format.to_string(),
                domain: "dmabuf (AFBC)".into(),
            })?;
            (format, n_planes, scale, drm::AFBC_MODIFIER)
        } else {
            (info.format.drm_fourcc(), info.n_planes(), 1.0, drm::LINEAR_MODIFIER)
        };

        let mut planes = Vec::with_capacity(n_planes);
        for plane in 0..n_planes {
            let offset = info.offset[plane];
            let stride = (info.stride[plane] as f32 * stride_scale) as u32;
            let (memory, skip) = find_memory(frame, offset).ok_or_else(|| {
                SinkError::allocation(format!(
                    "frame memory does not reach plane {} at offset {}",
                    plane, offset
                ))
            })?;
            let fd = memory
                .fd()
                .ok_or_else(|| SinkError::allocation(format!("{} has no dmabuf fd", memory.id())))?;
            planes.push(DmabufPlane {
                fd,
                offset: skip as u32,
                stride,
            });
        }

        let desc = DmabufBufferDesc {
            planes,
            width: info.width as i32,
            height: info.height as i32,
            format,
            modifier,
            interlaced: frame.interlaced,
            bottom_first: frame.interlaced && frame.bottom_field_first,
        };
        let server = display.backend().create_dmabuf_buffer(&desc)?;
        debug!(
            "🧬 dmabuf {} {}x{} fourcc {:#x}, {} planes{}",
            server,
            info.width,
            info.height,
            format,
            n_planes,
            if info.afbc { " (AFBC)" } else { "" }
        );
        Ok(RenderableBuffer::new(
            primary.id(),
            server,
            BufferSource::Dmabuf,
            (info.width, info.height),
            display.backend().clone(),
            token,
        ))
    })
}

/// Memory block holding byte `offset` of the frame, and the offset inside it
fn find_memory(frame: &VideoFrame, offset: usize) -> Option<(&crate::buffer::memory::Memory, usize)> {
    let mut start = 0usize;
    for memory in &frame.memories {
        if offset < start + memory.size() {
            return Some((memory, offset - start));
        }
        start += memory.size();
    }
    None
}
