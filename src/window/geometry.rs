//! Fill-mode geometry
//!
//! Computes where the video surface goes inside the render rectangle and
//! which part of the buffer it shows. All results are relative to the area
//! surface, whose origin is the top-left corner of the render rectangle.

use crate::protocol::SourceRect;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rectangle {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn contains(&self, other: &Rectangle) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// How the video is mapped into the render rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    /// Ignore aspect ratio
    Stretch,
    /// Keep aspect ratio, letterbox the remainder
    #[default]
    Fit,
    /// Keep aspect ratio by expanding, crop the overflow
    Crop,
}

impl FromStr for FillMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stretch" => Ok(FillMode::Stretch),
            "fit" => Ok(FillMode::Fit),
            "crop" => Ok(FillMode::Crop),
            other => Err(format!("unknown fill mode: {}", other)),
        }
    }
}

/// Stacking of an embedded window relative to its parent surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Top,
    #[default]
    Normal,
    Bottom,
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "top" => Ok(Layer::Top),
            "normal" => Ok(Layer::Normal),
            "bottom" => Ok(Layer::Bottom),
            other => Err(format!("unknown layer: {}", other)),
        }
    }
}

/// Region of the buffer to show, in buffer pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropBox {
    pub fn is_set(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Centers `src` inside `dst`, scaling it to fit when `scaling` is set
pub fn center_rect(src: (i32, i32), dst: Rectangle, scaling: bool) -> Rectangle {
    let (src_w, src_h) = src;
    if !scaling {
        let width = src_w.min(dst.width);
        let height = src_h.min(dst.height);
        return Rectangle::new(dst.x + (dst.width - width) / 2, dst.y + (dst.height - height) / 2, width, height);
    }
    if src_w <= 0 || src_h <= 0 || dst.is_empty() {
        return dst;
    }

    let src_ratio = src_w as f64 / src_h as f64;
    let dst_ratio = dst.width as f64 / dst.height as f64;
    if src_ratio > dst_ratio {
        let height = ((dst.width as f64 / src_ratio) as i32).clamp(1, dst.height);
        Rectangle::new(dst.x, dst.y + (dst.height - height) / 2, dst.width, height)
    } else if src_ratio < dst_ratio {
        let width = ((dst.height as f64 * src_ratio) as i32).clamp(1, dst.width);
        Rectangle::new(dst.x + (dst.width - width) / 2, dst.y, width, dst.height)
    } else {
        dst
    }
}

/// Scales `src` to the smallest size covering `dst` and centers it
pub fn cover_rect(src: (i32, i32), dst: Rectangle) -> Rectangle {
    let (src_w, src_h) = src;
    if src_w <= 0 || src_h <= 0 || dst.is_empty() {
        return dst;
    }

    let src_ratio = src_w as f64 / src_h as f64;
    let dst_ratio = dst.width as f64 / dst.height as f64;
    if src_ratio > dst_ratio {
        let width = ((dst.height as f64 * src_ratio).ceil() as i32).max(dst.width);
        Rectangle::new(dst.x + (dst.width - width) / 2, dst.y, width, dst.height)
    } else if src_ratio < dst_ratio {
        let height = ((dst.width as f64 / src_ratio).ceil() as i32).max(dst.height);
        Rectangle::new(dst.x, dst.y + (dst.height - height) / 2, dst.width, height)
    } else {
        dst
    }
}

/// Where and how the video surface is shown
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    /// Scaled video rectangle; extends past the render rectangle in Crop mode
    pub video: Rectangle,
    /// Video subsurface position relative to the area surface
    pub position: (i32, i32),
    /// Viewport destination, `None` when the video is shown unscaled
    pub destination: Option<(i32, i32)>,
    /// Viewport source in buffer pixels, `None` for the whole buffer
    pub source: Option<SourceRect>,
}

/// Maps a video of `video_size` display pixels (buffer region `crop`, or the
/// whole `buffer_size`) into a render rectangle of `render_size`
pub fn compute_placement(
    mode: FillMode,
    render_size: (i32, i32),
    video_size: (i32, i32),
    buffer_size: (u32, u32),
    crop: CropBox,
    scaling: bool,
) -> Placement {
    let dst = Rectangle::from_size(render_size.0, render_size.1);
    let (region_x, region_y, region_w, region_h) = if crop.is_set() {
        (crop.x as f64, crop.y as f64, crop.width as f64, crop.height as f64)
    } else {
        (0.0, 0.0, buffer_size.0 as f64, buffer_size.1 as f64)
    };
    // Display size of the shown region keeps the pixel aspect ratio of the video
    let shown = if crop.is_set() && buffer_size.0 > 0 && buffer_size.1 > 0 {
        (
            (video_size.0 as f64 * region_w / buffer_size.0 as f64).round() as i32,
            (video_size.1 as f64 * region_h / buffer_size.1 as f64).round() as i32,
        )
    } else {
        video_size
    };
    let whole_region = crop.is_set().then_some(SourceRect {
        x: region_x,
        y: region_y,
        width: region_w,
        height: region_h,
    });

    if !scaling {
        let video = center_rect(shown, dst, false);
        return Placement {
            video,
            position: (video.x, video.y),
            destination: None,
            source: None,
        };
    }

    match mode {
        FillMode::Stretch | FillMode::Fit => {
            let video = if mode == FillMode::Stretch {
                dst
            } else {
                center_rect(shown, dst, true)
            };
            Placement {
                video,
                position: (video.x, video.y),
                destination: Some((video.width, video.height)),
                source: whole_region,
            }
        }
        FillMode::Crop => {
            let video = cover_rect(shown, dst);
            if video.is_empty() || region_w <= 0.0 || region_h <= 0.0 {
                return Placement {
                    video,
                    position: (0, 0),
                    destination: Some((dst.width, dst.height)),
                    source: whole_region,
                };
            }
            let scale_x = region_w / video.width as f64;
            let scale_y = region_h / video.height as f64;
            let source = SourceRect {
                x: region_x + (dst.x - video.x) as f64 * scale_x,
                y: region_y + (dst.y - video.y) as f64 * scale_y,
                width: dst.width as f64 * scale_x,
                height: dst.height as f64 * scale_y,
            };
            Placement {
                video,
                position: (0, 0),
                destination: Some((dst.width, dst.height)),
                source: Some(source),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NO_CROP: CropBox = CropBox { x: 0, y: 0, width: 0, height: 0 };

    #[test]
    fn test_fit_letterboxes_wide_video() {
        let placement = compute_placement(FillMode::Fit, (800, 600), (1920, 800), (1920, 800), NO_CROP, true);
        assert_eq!(placement.video, Rectangle::new(0, 133, 800, 333));
        assert_eq!(placement.position, (0, 133));
        assert_eq!(placement.destination, Some((800, 333)));
        assert_eq!(placement.source, None);
    }

    #[test]
    fn test_crop_fills_and_trims_sides() {
        let placement = compute_placement(FillMode::Crop, (800, 600), (1920, 800), (1920, 800), NO_CROP, true);
        assert_eq!(placement.video, Rectangle::new(-320, 0, 1440, 600));
        assert_eq!(placement.destination, Some((800, 600)));
        let source = placement.source.unwrap();
        assert!((source.x - 426.666).abs() < 0.01);
        assert!((source.width - 1066.666).abs() < 0.01);
        assert_eq!(source.y, 0.0);
        assert_eq!(source.height, 800.0);
    }

    #[test]
    fn test_stretch_is_verbatim() {
        let placement = compute_placement(FillMode::Stretch, (640, 480), (1920, 800), (1920, 800), NO_CROP, true);
        assert_eq!(placement.video, Rectangle::from_size(640, 480));
        assert_eq!(placement.destination, Some((640, 480)));
    }

    #[test]
    fn test_without_viewporter_video_is_centered_unscaled() {
        let placement = compute_placement(FillMode::Fit, (800, 600), (320, 240), (320, 240), NO_CROP, false);
        assert_eq!(placement.video, Rectangle::new(240, 180, 320, 240));
        assert_eq!(placement.destination, None);

        let larger = compute_placement(FillMode::Fit, (800, 600), (1920, 1080), (1920, 1080), NO_CROP, false);
        assert_eq!(larger.video, Rectangle::new(0, 0, 800, 600));
    }

    #[test]
    fn test_crop_meta_becomes_viewport_source() {
        let crop = CropBox { x: 0, y: 60, width: 1920, height: 960 };
        let placement = compute_placement(FillMode::Fit, (1920, 960), (1920, 1080), (1920, 1080), crop, true);
        assert_eq!(placement.video, Rectangle::from_size(1920, 960));
        assert_eq!(
            placement.source,
            Some(SourceRect { x: 0.0, y: 60.0, width: 1920.0, height: 960.0 })
        );
    }

    #[test]
    fn test_fit_keeps_extreme_aspect_ratios_visible() {
        let placement = compute_placement(FillMode::Fit, (2, 600), (1920, 800), (1920, 800), NO_CROP, true);
        assert_eq!(placement.video, Rectangle::new(0, 299, 2, 1));
        assert_eq!(placement.destination, Some((2, 1)));
    }

    #[test]
    fn test_fill_mode_parsing() {
        assert_eq!("Crop".parse::<FillMode>(), Ok(FillMode::Crop));
        assert!("zoom".parse::<FillMode>().is_err());
        assert_eq!("bottom".parse::<Layer>(), Ok(Layer::Bottom));
    }

    prop_compose! {
        fn arb_size()(width in 1i32..4096, height in 1i32..4096) -> (i32, i32) {
            (width, height)
        }
    }

    proptest! {
        #[test]
        fn fit_never_exceeds_render_rectangle(render in arb_size(), video in arb_size()) {
            let buffer = (video.0 as u32, video.1 as u32);
            let placement = compute_placement(FillMode::Fit, render, video, buffer, NO_CROP, true);
            let dst = Rectangle::from_size(render.0, render.1);
            prop_assert!(dst.contains(&placement.video));
        }

        #[test]
        fn fit_destination_is_never_empty(
            render in (1i32..8, 1i32..8),
            video in arb_size(),
        ) {
            let buffer = (video.0 as u32, video.1 as u32);
            let placement = compute_placement(FillMode::Fit, render, video, buffer, NO_CROP, true);
            let (width, height) = placement.destination.unwrap();
            prop_assert!(width >= 1 && height >= 1);
            prop_assert!(width <= render.0 && height <= render.1);
        }

        #[test]
        fn crop_never_undershoots_render_rectangle(render in arb_size(), video in arb_size()) {
            let buffer = (video.0 as u32, video.1 as u32);
            let placement = compute_placement(FillMode::Crop, render, video, buffer, NO_CROP, true);
            let dst = Rectangle::from_size(render.0, render.1);
            prop_assert!(placement.video.contains(&dst));
            prop_assert_eq!(placement.destination, Some(render));
        }

        #[test]
        fn stretch_equals_render_rectangle(render in arb_size(), video in arb_size()) {
            let buffer = (video.0 as u32, video.1 as u32);
            let placement = compute_placement(FillMode::Stretch, render, video, buffer, NO_CROP, true);
            prop_assert_eq!(placement.video, Rectangle::from_size(render.0, render.1));
        }
    }
}
