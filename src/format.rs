//! Video formats and plane layouts
//!
//! Maps the video formats the sink understands onto the DRM fourcc codes
//! used by `zwp_linux_dmabuf_v1` and the `wl_shm` format enum, and computes
//! the canonical plane layout used by internally allocated buffers.

use crate::buffer::memory::Memory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// DRM fourcc codes used by the sink
pub mod drm {
    use super::fourcc;

    pub const XRGB8888: u32 = fourcc(b"XR24");
    pub const ARGB8888: u32 = fourcc(b"AR24");
    pub const XBGR8888: u32 = fourcc(b"XB24");
    pub const RGBX8888: u32 = fourcc(b"RX24");
    pub const BGRX8888: u32 = fourcc(b"BX24");
    pub const ABGR8888: u32 = fourcc(b"AB24");
    pub const RGBA8888: u32 = fourcc(b"RA24");
    pub const BGRA8888: u32 = fourcc(b"BA24");
    pub const BGR888: u32 = fourcc(b"BG24");
    pub const RGB888: u32 = fourcc(b"RG24");
    pub const RGB565: u32 = fourcc(b"RG16");
    pub const BGR565: u32 = fourcc(b"BG16");
    pub const YUYV: u32 = fourcc(b"YUYV");
    pub const YVYU: u32 = fourcc(b"YVYU");
    pub const UYVY: u32 = fourcc(b"UYVY");
    pub const AYUV: u32 = fourcc(b"AYUV");
    pub const NV12: u32 = fourcc(b"NV12");
    pub const NV21: u32 = fourcc(b"NV21");
    pub const NV16: u32 = fourcc(b"NV16");
    pub const NV61: u32 = fourcc(b"NV61");
    pub const NV15: u32 = fourcc(b"NV15");
    pub const YUV410: u32 = fourcc(b"YUV9");
    pub const YVU410: u32 = fourcc(b"YVU9");
    pub const YUV411: u32 = fourcc(b"411Y");
    pub const YUV420: u32 = fourcc(b"YU12");
    pub const YVU420: u32 = fourcc(b"YV12");
    pub const YUV422: u32 = fourcc(b"YU16");
    pub const VUY888: u32 = fourcc(b"VU24");
    pub const YUV420_8BIT: u32 = fourcc(b"YU08");
    pub const YUV420_10BIT: u32 = fourcc(b"YU10");

    /// ARM AFBC modifier: 16x16 superblocks, sparse layout
    pub const AFBC_MODIFIER: u64 = 0x0800_0000_0000_0041;
    pub const LINEAR_MODIFIER: u64 = 0;
}

/// `wl_shm` uses its own codes for the two mandatory formats
const SHM_ARGB8888: u32 = 0;
const SHM_XRGB8888: u32 = 1;

/// Video formats accepted by the sink
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoFormat {
    BGRx,
    BGRA,
    RGBx,
    xBGR,
    xRGB,
    RGBA,
    ABGR,
    ARGB,
    RGB,
    BGR,
    RGB16,
    BGR16,
    YUY2,
    YVYU,
    UYVY,
    AYUV,
    NV12,
    NV21,
    NV16,
    NV61,
    YUV9,
    YVU9,
    Y41B,
    I420,
    YV12,
    Y42B,
    v308,
    NV12_10LE40,
}

/// Memory domain a format is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryDomain {
    Shm,
    Dmabuf,
}

impl fmt::Display for MemoryDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryDomain::Shm => f.write_str("shm"),
            MemoryDomain::Dmabuf => f.write_str("dmabuf"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    /// Single plane, fixed bytes per pixel
    Packed(u32),
    /// Packed 4:2:2 (two pixels share a macropixel)
    Packed422,
    /// Luma plane plus interleaved chroma plane
    SemiPlanar { v_sub: u32 },
    /// Three planes with subsampled chroma
    Planar { h_sub: u32, v_sub: u32 },
    /// 10-bit semi-planar packed into 40-bit groups
    SemiPlanar10Le40,
}

impl VideoFormat {
    pub const ALL: [VideoFormat; 28] = [
        VideoFormat::BGRx,
        VideoFormat::BGRA,
        VideoFormat::RGBx,
        VideoFormat::xBGR,
        VideoFormat::xRGB,
        VideoFormat::RGBA,
        VideoFormat::ABGR,
        VideoFormat::ARGB,
        VideoFormat::RGB,
        VideoFormat::BGR,
        VideoFormat::RGB16,
        VideoFormat::BGR16,
        VideoFormat::YUY2,
        VideoFormat::YVYU,
        VideoFormat::UYVY,
        VideoFormat::AYUV,
        VideoFormat::NV12,
        VideoFormat::NV21,
        VideoFormat::NV16,
        VideoFormat::NV61,
        VideoFormat::YUV9,
        VideoFormat::YVU9,
        VideoFormat::Y41B,
        VideoFormat::I420,
        VideoFormat::YV12,
        VideoFormat::Y42B,
        VideoFormat::v308,
        VideoFormat::NV12_10LE40,
    ];

    pub fn name(self) -> &'static str {
        match self {
            VideoFormat::BGRx => "BGRx",
            VideoFormat::BGRA => "BGRA",
            VideoFormat::RGBx => "RGBx",
            VideoFormat::xBGR => "xBGR",
            VideoFormat::xRGB => "xRGB",
            VideoFormat::RGBA => "RGBA",
            VideoFormat::ABGR => "ABGR",
            VideoFormat::ARGB => "ARGB",
            VideoFormat::RGB => "RGB",
            VideoFormat::BGR => "BGR",
            VideoFormat::RGB16 => "RGB16",
            VideoFormat::BGR16 => "BGR16",
            VideoFormat::YUY2 => "YUY2",
            VideoFormat::YVYU => "YVYU",
            VideoFormat::UYVY => "UYVY",
            VideoFormat::AYUV => "AYUV",
            VideoFormat::NV12 => "NV12",
            VideoFormat::NV21 => "NV21",
            VideoFormat::NV16 => "NV16",
            VideoFormat::NV61 => "NV61",
            VideoFormat::YUV9 => "YUV9",
            VideoFormat::YVU9 => "YVU9",
            VideoFormat::Y41B => "Y41B",
            VideoFormat::I420 => "I420",
            VideoFormat::YV12 => "YV12",
            VideoFormat::Y42B => "Y42B",
            VideoFormat::v308 => "v308",
            VideoFormat::NV12_10LE40 => "NV12_10LE40",
        }
    }

    /// DRM fourcc used for dmabuf import
    pub fn drm_fourcc(self) -> u32 {
        match self {
            VideoFormat::BGRx => drm::XRGB8888,
            VideoFormat::BGRA => drm::ARGB8888,
            VideoFormat::RGBx => drm::XBGR8888,
            VideoFormat::xBGR => drm::RGBX8888,
            VideoFormat::xRGB => drm::BGRX8888,
            VideoFormat::RGBA => drm::ABGR8888,
            VideoFormat::ABGR => drm::RGBA8888,
            VideoFormat::ARGB => drm::BGRA8888,
            VideoFormat::RGB => drm::BGR888,
            VideoFormat::BGR => drm::RGB888,
            VideoFormat::RGB16 => drm::RGB565,
            VideoFormat::BGR16 => drm::BGR565,
            VideoFormat::YUY2 => drm::YUYV,
            VideoFormat::YVYU => drm::YVYU,
            VideoFormat::UYVY => drm::UYVY,
            VideoFormat::AYUV => drm::AYUV,
            VideoFormat::NV12 => drm::NV12,
            VideoFormat::NV21 => drm::NV21,
            VideoFormat::NV16 => drm::NV16,
            VideoFormat::NV61 => drm::NV61,
            VideoFormat::YUV9 => drm::YUV410,
            VideoFormat::YVU9 => drm::YVU410,
            VideoFormat::Y41B => drm::YUV411,
            VideoFormat::I420 => drm::YUV420,
            VideoFormat::YV12 => drm::YVU420,
            VideoFormat::Y42B => drm::YUV422,
            VideoFormat::v308 => drm::VUY888,
            VideoFormat::NV12_10LE40 => drm::NV15,
        }
    }

    /// `wl_shm` format code
    pub fn shm_format(self) -> u32 {
        match self.drm_fourcc() {
            drm::XRGB8888 => SHM_XRGB8888,
            drm::ARGB8888 => SHM_ARGB8888,
            other => other,
        }
    }

    pub fn from_drm_fourcc(code: u32) -> Option<VideoFormat> {
        Self::ALL.iter().copied().find(|f| f.drm_fourcc() == code)
    }

    pub fn from_shm_format(code: u32) -> Option<VideoFormat> {
        Self::ALL.iter().copied().find(|f| f.shm_format() == code)
    }

    /// Whether the format carries an alpha channel
    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            VideoFormat::BGRA
                | VideoFormat::RGBA
                | VideoFormat::ABGR
                | VideoFormat::ARGB
                | VideoFormat::AYUV
        )
    }

    fn layout(self) -> Layout {
        match self {
            VideoFormat::BGRx
            | VideoFormat::BGRA
            | VideoFormat::RGBx
            | VideoFormat::xBGR
            | VideoFormat::xRGB
            | VideoFormat::RGBA
            | VideoFormat::ABGR
            | VideoFormat::ARGB
            | VideoFormat::AYUV => Layout::Packed(4),
            VideoFormat::RGB | VideoFormat::BGR | VideoFormat::v308 => Layout::Packed(3),
            VideoFormat::RGB16 | VideoFormat::BGR16 => Layout::Packed(2),
            VideoFormat::YUY2 | VideoFormat::YVYU | VideoFormat::UYVY => Layout::Packed422,
            VideoFormat::NV12 | VideoFormat::NV21 => Layout::SemiPlanar { v_sub: 2 },
            VideoFormat::NV16 | VideoFormat::NV61 => Layout::SemiPlanar { v_sub: 1 },
            VideoFormat::YUV9 | VideoFormat::YVU9 => Layout::Planar { h_sub: 4, v_sub: 4 },
            VideoFormat::Y41B => Layout::Planar { h_sub: 4, v_sub: 1 },
            VideoFormat::I420 | VideoFormat::YV12 => Layout::Planar { h_sub: 2, v_sub: 2 },
            VideoFormat::Y42B => Layout::Planar { h_sub: 2, v_sub: 1 },
            VideoFormat::NV12_10LE40 => Layout::SemiPlanar10Le40,
        }
    }

    pub fn n_planes(self) -> usize {
        match self.layout() {
            Layout::Packed(_) | Layout::Packed422 => 1,
            Layout::SemiPlanar { .. } | Layout::SemiPlanar10Le40 => 2,
            Layout::Planar { .. } => 3,
        }
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VideoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown video format: {}", s))
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

pub const MAX_PLANES: usize = 4;

/// Negotiated description of the frames a sink receives
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    /// Pixel aspect ratio numerator / denominator
    pub par_n: u32,
    pub par_d: u32,
    pub stride: [u32; MAX_PLANES],
    pub offset: [usize; MAX_PLANES],
    pub size: usize,
    /// Frames use the ARM AFBC compressed layout
    pub afbc: bool,
    /// Frames arrive as dmabufs rather than mappable memory
    pub domain: MemoryDomain,
}

impl VideoInfo {
    /// Builds the canonical (unpadded) layout for a format and size
    pub fn new(format: VideoFormat, width: u32, height: u32) -> Self {
        let mut stride = [0u32; MAX_PLANES];
        let mut offset = [0usize; MAX_PLANES];
        let mut heights = [0u32; MAX_PLANES];

        match format.layout() {
            Layout::Packed(bpp) => {
                stride[0] = round_up(width * bpp, 4);
                heights[0] = height;
            }
            Layout::Packed422 => {
                stride[0] = round_up(round_up(width, 2) * 2, 4);
                heights[0] = height;
            }
            Layout::SemiPlanar { v_sub } => {
                stride[0] = round_up(width, 4);
                stride[1] = round_up(round_up(width, 2), 4);
                heights[0] = height;
                heights[1] = height.div_ceil(v_sub);
            }
            Layout::Planar { h_sub, v_sub } => {
                stride[0] = round_up(width, 4);
                stride[1] = round_up(width.div_ceil(h_sub), 4);
                stride[2] = stride[1];
                heights[0] = height;
                heights[1] = height.div_ceil(v_sub);
                heights[2] = heights[1];
            }
            Layout::SemiPlanar10Le40 => {
                stride[0] = round_up((width * 5).div_ceil(4), 4);
                stride[1] = stride[0];
                heights[0] = height;
                heights[1] = height.div_ceil(2);
            }
        }

        let mut size = 0usize;
        for plane in 0..format.n_planes() {
            offset[plane] = size;
            size += stride[plane] as usize * heights[plane] as usize;
        }

        Self {
            format,
            width,
            height,
            par_n: 1,
            par_d: 1,
            stride,
            offset,
            size,
            afbc: false,
            domain: MemoryDomain::Shm,
        }
    }

    pub fn with_domain(mut self, domain: MemoryDomain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_afbc(mut self, afbc: bool) -> Self {
        self.afbc = afbc;
        self
    }

    pub fn with_pixel_aspect_ratio(mut self, par_n: u32, par_d: u32) -> Self {
        self.par_n = par_n.max(1);
        self.par_d = par_d.max(1);
        self
    }

    pub fn n_planes(&self) -> usize {
        self.format.n_planes()
    }

    /// Display width after applying the pixel aspect ratio
    pub fn display_width(&self) -> u32 {
        let scaled = (self.width as u64 * self.par_n as u64 + self.par_d as u64 / 2) / self.par_d as u64;
        scaled as u32
    }

    /// Overrides size and plane layout with per-frame video meta
    pub fn apply_meta(&mut self, meta: &VideoMeta, buffer_size: usize) {
        self.width = meta.width;
        self.height = meta.height;
        for plane in 0..self.n_planes().min(meta.n_planes) {
            self.stride[plane] = meta.stride[plane];
            self.offset[plane] = meta.offset[plane];
        }
        self.size = buffer_size;
    }

    /// True when planes follow each other the way `wl_shm` expects
    /// (only plane 0 stride is sent over the wire)
    pub fn is_shm_compatible(&self) -> bool {
        let canonical = VideoInfo::new(self.format, self.width, self.height);
        let base = self.offset[0];
        (1..self.n_planes()).all(|plane| {
            let scale = self.stride[0] as f64 / canonical.stride[0] as f64;
            let expected = base + (canonical.offset[plane] as f64 * scale) as usize;
            self.offset[plane] == expected
        })
    }
}

/// Per-frame layout override (padded size, strides, offsets)
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMeta {
    pub width: u32,
    pub height: u32,
    pub n_planes: usize,
    pub stride: [u32; MAX_PLANES],
    pub offset: [usize; MAX_PLANES],
}

impl VideoMeta {
    pub fn from_info(info: &VideoInfo) -> Self {
        Self {
            width: info.width,
            height: info.height,
            n_planes: info.n_planes(),
            stride: info.stride,
            offset: info.offset,
        }
    }
}

/// Per-frame crop rectangle in buffer coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropMeta {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One frame handed to the sink: memory blocks plus optional metadata
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub memories: Vec<Memory>,
    pub meta: Option<VideoMeta>,
    pub crop: Option<CropMeta>,
    pub interlaced: bool,
    pub bottom_field_first: bool,
}

impl VideoFrame {
    pub fn new(memory: Memory) -> Self {
        Self::from_memories(vec![memory])
    }

    pub fn from_memories(memories: Vec<Memory>) -> Self {
        Self {
            memories,
            meta: None,
            crop: None,
            interlaced: false,
            bottom_field_first: false,
        }
    }

    pub fn with_meta(mut self, meta: VideoMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_crop(mut self, crop: CropMeta) -> Self {
        self.crop = Some(crop);
        self
    }

    /// Identity used for registry lookups (first memory block)
    pub fn primary(&self) -> Option<&Memory> {
        self.memories.first()
    }

    pub fn total_size(&self) -> usize {
        self.memories.iter().map(Memory::size).sum()
    }

    /// Layout of this frame: negotiated info overridden by its meta
    pub fn effective_info(&self, negotiated: &VideoInfo) -> VideoInfo {
        let mut info = negotiated.clone();
        if let Some(meta) = &self.meta {
            info.apply_meta(meta, self.total_size());
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_codes_for_mandatory_formats() {
        assert_eq!(VideoFormat::BGRA.shm_format(), 0);
        assert_eq!(VideoFormat::BGRx.shm_format(), 1);
        assert_eq!(VideoFormat::NV12.shm_format(), drm::NV12);
        assert_eq!(VideoFormat::from_shm_format(1), Some(VideoFormat::BGRx));
    }

    #[test]
    fn test_drm_fourcc_lookup() {
        assert_eq!(drm::NV12, 0x3231_564e);
        assert_eq!(VideoFormat::from_drm_fourcc(drm::NV15), Some(VideoFormat::NV12_10LE40));
        assert_eq!(VideoFormat::from_drm_fourcc(drm::YUV420_8BIT), None);
    }

    #[test]
    fn test_format_names_parse() {
        for format in VideoFormat::ALL {
            assert_eq!(format.name().parse::<VideoFormat>(), Ok(format));
        }
        assert!("P010".parse::<VideoFormat>().is_err());
    }

    #[test]
    fn test_packed_layout() {
        let info = VideoInfo::new(VideoFormat::RGB, 3, 2);
        assert_eq!(info.stride[0], 12);
        assert_eq!(info.size, 24);
        assert_eq!(info.n_planes(), 1);
    }

    #[test]
    fn test_nv12_layout() {
        let info = VideoInfo::new(VideoFormat::NV12, 1920, 1080);
        assert_eq!(info.stride[0], 1920);
        assert_eq!(info.stride[1], 1920);
        assert_eq!(info.offset[1], 1920 * 1080);
        assert_eq!(info.size, 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn test_i420_odd_size_layout() {
        let info = VideoInfo::new(VideoFormat::I420, 5, 3);
        assert_eq!(info.stride[0], 8);
        assert_eq!(info.stride[1], 4);
        assert_eq!(info.offset[1], 24);
        assert_eq!(info.offset[2], 24 + 8);
        assert_eq!(info.size, 24 + 8 + 8);
    }

    #[test]
    fn test_padded_meta_keeps_shm_compatibility() {
        let mut info = VideoInfo::new(VideoFormat::NV12, 1280, 720);
        let mut meta = VideoMeta::from_info(&info);
        meta.stride = [1536, 1536, 0, 0];
        meta.offset = [0, 1536 * 720, 0, 0];
        info.apply_meta(&meta, 1536 * 720 * 3 / 2);
        assert!(info.is_shm_compatible());

        meta.offset[1] += 4096;
        info.apply_meta(&meta, 1536 * 720 * 3 / 2 + 4096);
        assert!(!info.is_shm_compatible());
    }

    #[test]
    fn test_display_width_uses_pixel_aspect_ratio() {
        let info = VideoInfo::new(VideoFormat::I420, 720, 576).with_pixel_aspect_ratio(16, 15);
        assert_eq!(info.display_width(), 768);
    }
}
