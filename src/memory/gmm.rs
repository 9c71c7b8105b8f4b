//! Resource description: size, pitch and tiling of images and buffers.

use crate::kmd::TilingMode;
use crate::utils::{PAGE_SIZE, align_up_usize};
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub bytes_per_pixel: usize,
    /// Request linear storage even where tiling is possible.
    pub force_linear: bool,
}

impl ImageDescriptor {
    #[must_use]
    pub const fn new_2d(width: usize, height: usize, bytes_per_pixel: usize) -> Self {
        Self {
            width,
            height,
            depth: 1,
            bytes_per_pixel,
            force_linear: false,
        }
    }

    #[must_use]
    pub const fn linear(mut self) -> Self {
        self.force_linear = true;
        self
    }
}

/// The storage requirements of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub size: usize,
    pub row_pitch: usize,
    pub tiling: TilingMode,
    pub linear: bool,
}

/// Computes storage layouts. Implemented by the platform's memory-description
/// library; [`DefaultDescriber`] covers the common Y-tiled/linear cases.
pub trait ResourceDescriber: Send + Sync + Debug {
    fn describe_image(&self, desc: &ImageDescriptor) -> ImageLayout;

    fn describe_buffer(&self, size: usize) -> ImageLayout;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDescriber;

impl DefaultDescriber {
    // A Y tile is 128 bytes wide and 32 rows tall.
    const TILE_Y_WIDTH: usize = 128;
    const TILE_Y_HEIGHT: usize = 32;
    const LINEAR_PITCH_ALIGNMENT: usize = 64;
}

impl ResourceDescriber for DefaultDescriber {
    fn describe_image(&self, desc: &ImageDescriptor) -> ImageLayout {
        let row_bytes = desc.width.max(1) * desc.bytes_per_pixel.max(1);
        let height = desc.height.max(1);
        let depth = desc.depth.max(1);

        // 1D images have nothing to gain from tiling.
        if desc.force_linear || height == 1 {
            let row_pitch = align_up_usize(row_bytes, Self::LINEAR_PITCH_ALIGNMENT);
            return ImageLayout {
                size: align_up_usize(row_pitch * height * depth, PAGE_SIZE),
                row_pitch,
                tiling: TilingMode::None,
                linear: true,
            };
        }

        let row_pitch = align_up_usize(row_bytes, Self::TILE_Y_WIDTH);
        let rows = align_up_usize(height, Self::TILE_Y_HEIGHT) * depth;
        ImageLayout {
            size: align_up_usize(row_pitch * rows, PAGE_SIZE),
            row_pitch,
            tiling: TilingMode::Y,
            linear: false,
        }
    }

    fn describe_buffer(&self, size: usize) -> ImageLayout {
        let size = align_up_usize(size.max(1), PAGE_SIZE);
        ImageLayout {
            size,
            row_pitch: size,
            tiling: TilingMode::None,
            linear: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiled_image_pads_to_tile_rows() {
        let layout = DefaultDescriber.describe_image(&ImageDescriptor::new_2d(100, 10, 4));
        assert_eq!(layout.row_pitch, 512);
        assert_eq!(layout.tiling, TilingMode::Y);
        assert!(!layout.linear);
        assert_eq!(layout.size, 512 * 32);
    }

    #[test]
    fn one_dimensional_and_forced_images_are_linear() {
        let one_d = DefaultDescriber.describe_image(&ImageDescriptor::new_2d(1000, 1, 4));
        assert!(one_d.linear);
        assert_eq!(one_d.row_pitch, 4032);
        assert_eq!(one_d.size, PAGE_SIZE);

        let forced = DefaultDescriber.describe_image(&ImageDescriptor::new_2d(64, 64, 4).linear());
        assert!(forced.linear);
        assert_eq!(forced.tiling, TilingMode::None);
    }

    #[test]
    fn buffers_round_to_pages() {
        assert_eq!(DefaultDescriber.describe_buffer(1).size, PAGE_SIZE);
        assert_eq!(DefaultDescriber.describe_buffer(0).size, PAGE_SIZE);
    }
}
