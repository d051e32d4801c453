// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Layout of the planes of a frame within its [`FrameBuffer`].
//!
//! Every plane is surrounded by a border so that prediction can read past the edges of the
//! frame. Rows are padded to a multiple of 16 bytes and samples take two bytes, stored in little
//! endian, when the bit depth is above 8.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::codec::av1::header::MAX_NUM_PLANES;
use crate::decoder::frame_buffer::FrameBuffer;
use crate::decoder::frame_buffer::FrameBufferAllocator;
use crate::decoder::frame_buffer::FrameBufferError;
use crate::utils::align;
use crate::ImageFormat;

/// Alignment of the start of each plane.
const PLANE_ALIGNMENT: usize = 16;
/// Frame dimensions are padded to a multiple of this.
const FRAME_SIZE_ALIGNMENT: usize = 8;
const BORDER_ALIGNMENT: u32 = 32;

/// Format and geometry of the frames to allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    pub bitdepth: u32,
    pub is_monochrome: bool,
    pub width: u32,
    pub height: u32,
    pub subsampling_x: u32,
    pub subsampling_y: u32,
    /// Border in pixels on each side of the luma plane. Must be a multiple of 32.
    pub border: u32,
    /// Alignment of the first visible pixel of each plane: 0, or a power of two no smaller than
    /// 16.
    pub byte_alignment: u32,
}

impl FrameFormat {
    pub fn validate(&self) -> Result<(), FrameBufferError> {
        if self.border % BORDER_ALIGNMENT != 0 {
            return Err(FrameBufferError::InvalidBorder(self.border));
        }

        if self.byte_alignment != 0
            && (self.byte_alignment < 16 || !self.byte_alignment.is_power_of_two())
        {
            return Err(FrameBufferError::InvalidByteAlignment(self.byte_alignment));
        }

        if self.width == 0 || self.height == 0 || self.subsampling_x > 1 || self.subsampling_y > 1
        {
            return Err(FrameBufferError::InvalidGeometry {
                width: self.width,
                height: self.height,
            });
        }

        Ok(())
    }

    fn pixel_size(&self) -> usize {
        if self.bitdepth > 8 {
            2
        } else {
            1
        }
    }
}

/// Geometry of one plane, in samples except for the stride.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PlaneGeometry {
    stride: usize,
    size: usize,
    border_width: usize,
    border_height: usize,
}

fn plane_geometry(
    format: &FrameFormat,
    aligned_width: usize,
    aligned_height: usize,
    subsampling_x: u32,
    subsampling_y: u32,
) -> Option<PlaneGeometry> {
    let width = aligned_width >> subsampling_x;
    let height = aligned_height >> subsampling_y;
    let border_width = (format.border >> subsampling_x) as usize;
    let border_height = (format.border >> subsampling_y) as usize;

    let row_bytes = width.checked_add(2 * border_width)?.checked_mul(format.pixel_size())?;
    let stride = align(row_bytes, PLANE_ALIGNMENT);
    let size = height
        .checked_add(2 * border_height)?
        .checked_mul(stride)?
        .checked_add(format.byte_alignment as usize)?;

    Some(PlaneGeometry { stride, size, border_width, border_height })
}

/// Plane layout of a frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct YuvBuffer {
    bitdepth: u32,
    is_monochrome: bool,
    subsampling_x: u32,
    subsampling_y: u32,
    y_crop_width: u32,
    y_crop_height: u32,
    uv_crop_width: u32,
    uv_crop_height: u32,
    stride: [usize; MAX_NUM_PLANES],
    border_width: [usize; MAX_NUM_PLANES],
    border_height: [usize; MAX_NUM_PLANES],
    /// Offset of the first visible sample of each plane in the frame buffer.
    plane_offset: [usize; MAX_NUM_PLANES],
}

impl YuvBuffer {
    /// Makes `frame_buffer` large enough to hold a frame of `format` and lays the planes out in
    /// it.
    ///
    /// The allocator is only asked for new memory if the current planes are too small. On
    /// invalid arguments nothing is modified.
    pub fn realloc(
        &mut self,
        format: &FrameFormat,
        allocator: &mut dyn FrameBufferAllocator,
        frame_buffer: &mut FrameBuffer,
    ) -> Result<(), FrameBufferError> {
        format.validate()?;

        let invalid_geometry =
            || FrameBufferError::InvalidGeometry { width: format.width, height: format.height };

        let aligned_width = align(format.width as usize, FRAME_SIZE_ALIGNMENT);
        let aligned_height = align(format.height as usize, FRAME_SIZE_ALIGNMENT);
        let y = plane_geometry(format, aligned_width, aligned_height, 0, 0)
            .ok_or_else(invalid_geometry)?;
        let uv = plane_geometry(
            format,
            aligned_width,
            aligned_height,
            format.subsampling_x,
            format.subsampling_y,
        )
        .ok_or_else(invalid_geometry)?;

        // Leave room to align the start of each plane.
        let y_plane_min_size = y.size + PLANE_ALIGNMENT - 1;
        let uv_plane_min_size = uv.size + PLANE_ALIGNMENT - 1;

        if !frame_buffer.can_hold(y_plane_min_size, uv_plane_min_size) {
            if frame_buffer.is_allocated() {
                allocator.release_frame_buffer(frame_buffer).map_err(FrameBufferError::Allocator)?;
            }
            // The previous layout does not describe the new planes, if any.
            *self = Default::default();

            allocator
                .get_frame_buffer(y_plane_min_size, uv_plane_min_size, frame_buffer)
                .map_err(FrameBufferError::Allocator)?;

            if !frame_buffer.can_hold(y_plane_min_size, uv_plane_min_size) {
                log::error!(
                    "frame buffer allocator returned planes of {:?} bytes, requested {}/{}",
                    frame_buffer.planes.iter().map(Vec::len).collect::<Vec<_>>(),
                    y_plane_min_size,
                    uv_plane_min_size
                );
                debug_assert!(false, "frame buffer allocator malfunction");
                return Err(FrameBufferError::AllocatorMalfunction);
            }
        }

        let pixel_size = format.pixel_size();
        let geometries = [y, uv, uv];
        for (plane, geometry) in geometries.iter().enumerate() {
            let base = frame_buffer.planes[plane].as_ptr() as usize;
            let mut start = align(base, PLANE_ALIGNMENT)
                + geometry.border_height * geometry.stride
                + geometry.border_width * pixel_size;
            if format.byte_alignment != 0 {
                start = align(start, format.byte_alignment as usize);
            }

            self.stride[plane] = geometry.stride;
            self.border_width[plane] = geometry.border_width;
            self.border_height[plane] = geometry.border_height;
            self.plane_offset[plane] = start - base;
        }

        self.bitdepth = format.bitdepth;
        self.is_monochrome = format.is_monochrome;
        self.subsampling_x = format.subsampling_x;
        self.subsampling_y = format.subsampling_y;
        self.y_crop_width = format.width;
        self.y_crop_height = format.height;
        self.uv_crop_width = (format.width + format.subsampling_x) >> format.subsampling_x;
        self.uv_crop_height = (format.height + format.subsampling_y) >> format.subsampling_y;

        Ok(())
    }

    pub fn bitdepth(&self) -> u32 {
        self.bitdepth
    }

    pub fn is_monochrome(&self) -> bool {
        self.is_monochrome
    }

    pub fn subsampling_x(&self) -> u32 {
        self.subsampling_x
    }

    pub fn subsampling_y(&self) -> u32 {
        self.subsampling_y
    }

    pub fn image_format(&self) -> ImageFormat {
        ImageFormat::new(self.is_monochrome, self.subsampling_x, self.subsampling_y)
    }

    /// Size of a sample in bytes.
    pub fn pixel_size(&self) -> usize {
        if self.bitdepth > 8 {
            2
        } else {
            1
        }
    }

    pub fn displayed_width(&self, plane: usize) -> u32 {
        if plane == 0 {
            self.y_crop_width
        } else {
            self.uv_crop_width
        }
    }

    pub fn displayed_height(&self, plane: usize) -> u32 {
        if plane == 0 {
            self.y_crop_height
        } else {
            self.uv_crop_height
        }
    }

    /// Distance in bytes between two rows of `plane`.
    pub fn stride(&self, plane: usize) -> usize {
        self.stride[plane]
    }

    /// Border on the left and right of `plane`, in samples.
    pub fn border_width(&self, plane: usize) -> usize {
        self.border_width[plane]
    }

    /// Border above and below `plane`, in samples.
    pub fn border_height(&self, plane: usize) -> usize {
        self.border_height[plane]
    }

    /// Bytes spanned by the visible part of `plane`, from its first to its last sample.
    fn visible_size(&self, plane: usize) -> usize {
        let height = self.displayed_height(plane) as usize;
        if height == 0 {
            return 0;
        }

        (height - 1) * self.stride[plane] + self.displayed_width(plane) as usize * self.pixel_size()
    }

    /// The visible samples of `plane`, starting at the first one. Rows are `stride(plane)`
    /// bytes apart.
    pub fn plane<'a>(&self, frame_buffer: &'a FrameBuffer, plane: usize) -> &'a [u8] {
        let offset = self.plane_offset[plane];
        &frame_buffer.planes[plane][offset..offset + self.visible_size(plane)]
    }

    pub fn plane_mut<'a>(&self, frame_buffer: &'a mut FrameBuffer, plane: usize) -> &'a mut [u8] {
        let offset = self.plane_offset[plane];
        let size = self.visible_size(plane);
        &mut frame_buffer.planes[plane][offset..offset + size]
    }

    /// The visible samples of `row` in `plane`.
    pub fn row<'a>(&self, frame_buffer: &'a FrameBuffer, plane: usize, row: usize) -> &'a [u8] {
        let start = row * self.stride[plane];
        let len = self.displayed_width(plane) as usize * self.pixel_size();
        &self.plane(frame_buffer, plane)[start..start + len]
    }

    pub fn row_mut<'a>(
        &self,
        frame_buffer: &'a mut FrameBuffer,
        plane: usize,
        row: usize,
    ) -> &'a mut [u8] {
        let start = row * self.stride[plane];
        let len = self.displayed_width(plane) as usize * self.pixel_size();
        &mut self.plane_mut(frame_buffer, plane)[start..start + len]
    }

    /// Reads the samples of `row` of a frame whose bit depth is above 8.
    pub fn read_row_u16(
        &self,
        frame_buffer: &FrameBuffer,
        plane: usize,
        row: usize,
        samples: &mut [u16],
    ) {
        debug_assert_eq!(self.pixel_size(), 2);
        LittleEndian::read_u16_into(self.row(frame_buffer, plane, row), samples);
    }

    /// Writes the samples of `row` of a frame whose bit depth is above 8.
    pub fn write_row_u16(
        &self,
        frame_buffer: &mut FrameBuffer,
        plane: usize,
        row: usize,
        samples: &[u16],
    ) {
        debug_assert_eq!(self.pixel_size(), 2);
        LittleEndian::write_u16_into(samples, self.row_mut(frame_buffer, plane, row));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::decoder::frame_buffer::testing::Behavior;
    use crate::decoder::frame_buffer::testing::TestAllocator;
    use crate::decoder::frame_buffer::InternalFrameBufferList;

    fn format(width: u32, height: u32) -> FrameFormat {
        FrameFormat {
            bitdepth: 8,
            is_monochrome: false,
            width,
            height,
            subsampling_x: 1,
            subsampling_y: 1,
            border: 32,
            byte_alignment: 0,
        }
    }

    #[test]
    fn layout_8bit_420() {
        let (mut allocator, calls) = TestAllocator::new(Behavior::Normal);
        let mut frame_buffer = FrameBuffer::default();
        let mut yuv = YuvBuffer::default();

        yuv.realloc(&format(100, 50), &mut allocator, &mut frame_buffer).unwrap();

        // 104x56 padded frame with 32 pixels of border.
        assert_eq!(yuv.stride(0), 176);
        assert_eq!(frame_buffer.planes[0].len(), 120 * 176 + 15);
        // 52x28 padded chroma with 16 pixels of border.
        assert_eq!(yuv.stride(1), 96);
        assert_eq!(frame_buffer.planes[1].len(), 60 * 96 + 15);
        assert_eq!(frame_buffer.planes[2].len(), 60 * 96 + 15);

        assert_eq!((yuv.displayed_width(0), yuv.displayed_height(0)), (100, 50));
        assert_eq!((yuv.displayed_width(1), yuv.displayed_height(1)), (50, 25));
        assert_eq!(yuv.image_format(), ImageFormat::Yuv420);
        assert_eq!((yuv.border_width(1), yuv.border_height(1)), (16, 16));
        assert_eq!(calls.gets.load(Ordering::SeqCst), 1);

        // The first visible sample sits after the top and left borders of an aligned plane.
        let start = yuv.plane(&frame_buffer, 0).as_ptr() as usize;
        assert_eq!((start - 32) % 16, 0);
        assert_eq!(yuv.plane(&frame_buffer, 0).len(), 49 * 176 + 100);
        assert_eq!(yuv.row(&frame_buffer, 1, 24).len(), 50);
    }

    #[test]
    fn layout_high_bitdepth_with_alignment() {
        let mut allocator = InternalFrameBufferList::new(1);
        let mut frame_buffer = FrameBuffer::default();
        let mut yuv = YuvBuffer::default();
        let format = FrameFormat { bitdepth: 10, byte_alignment: 64, ..format(100, 50) };

        yuv.realloc(&format, &mut allocator, &mut frame_buffer).unwrap();

        assert_eq!(yuv.pixel_size(), 2);
        assert_eq!(yuv.stride(0), 336);
        assert_eq!(frame_buffer.planes[0].len(), 120 * 336 + 64 + 15);
        for plane in 0..3 {
            assert_eq!(yuv.plane(&frame_buffer, plane).as_ptr() as usize % 64, 0);
        }

        let samples: Vec<u16> = (0..50).map(|i| i * 20).collect();
        yuv.write_row_u16(&mut frame_buffer, 2, 3, &samples);
        let mut read_back = vec![0u16; 50];
        yuv.read_row_u16(&frame_buffer, 2, 3, &mut read_back);
        assert_eq!(read_back, samples);
        assert_eq!(yuv.row(&frame_buffer, 2, 3)[2..4], [20, 0]);
    }

    #[test]
    fn odd_dimensions_with_subsampling() {
        let mut allocator = InternalFrameBufferList::new(1);
        let mut frame_buffer = FrameBuffer::default();
        let mut yuv = YuvBuffer::default();
        let format = FrameFormat { subsampling_y: 0, ..format(33, 17) };

        yuv.realloc(&format, &mut allocator, &mut frame_buffer).unwrap();
        assert_eq!((yuv.displayed_width(1), yuv.displayed_height(1)), (17, 17));
        assert_eq!(yuv.image_format(), ImageFormat::Yuv422);
    }

    #[test]
    fn invalid_arguments_leave_state_untouched() {
        let (mut allocator, calls) = TestAllocator::new(Behavior::Normal);
        let mut frame_buffer = FrameBuffer::default();
        let mut yuv = YuvBuffer::default();
        yuv.realloc(&format(64, 64), &mut allocator, &mut frame_buffer).unwrap();
        let before = yuv.clone();

        for bad in [
            FrameFormat { border: 16, ..format(64, 64) },
            FrameFormat { byte_alignment: 8, ..format(64, 64) },
            FrameFormat { byte_alignment: 48, ..format(64, 64) },
            FrameFormat { width: 0, ..format(64, 64) },
        ] {
            assert!(yuv.realloc(&bad, &mut allocator, &mut frame_buffer).is_err());
            assert_eq!(yuv, before);
        }

        let bad_border = FrameFormat { border: 33, ..format(64, 64) };
        assert!(matches!(
            yuv.realloc(&bad_border, &mut allocator, &mut frame_buffer),
            Err(FrameBufferError::InvalidBorder(33))
        ));
        assert_eq!(calls.gets.load(Ordering::SeqCst), 1);
        assert_eq!(calls.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reallocation_only_when_growing() {
        let (mut allocator, calls) = TestAllocator::new(Behavior::Normal);
        let mut frame_buffer = FrameBuffer::default();
        let mut yuv = YuvBuffer::default();

        yuv.realloc(&format(128, 128), &mut allocator, &mut frame_buffer).unwrap();
        yuv.realloc(&format(64, 64), &mut allocator, &mut frame_buffer).unwrap();
        assert_eq!(calls.gets.load(Ordering::SeqCst), 1);
        assert_eq!(yuv.displayed_width(0), 64);

        yuv.realloc(&format(256, 128), &mut allocator, &mut frame_buffer).unwrap();
        assert_eq!(calls.gets.load(Ordering::SeqCst), 2);
        assert_eq!(calls.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn allocator_failure() {
        let (mut allocator, _) = TestAllocator::new(Behavior::Fail);
        let mut frame_buffer = FrameBuffer::default();
        let mut yuv = YuvBuffer::default();

        assert!(matches!(
            yuv.realloc(&format(64, 64), &mut allocator, &mut frame_buffer),
            Err(FrameBufferError::Allocator(_))
        ));
        assert!(!frame_buffer.is_allocated());
    }

    #[test]
    fn failed_growth_clears_layout() {
        let (mut allocator, calls) = TestAllocator::new(Behavior::Normal);
        let mut frame_buffer = FrameBuffer::default();
        let mut yuv = YuvBuffer::default();

        yuv.realloc(&format(64, 64), &mut allocator, &mut frame_buffer).unwrap();
        assert_ne!(yuv, YuvBuffer::default());

        allocator.behavior = Behavior::Fail;
        assert!(matches!(
            yuv.realloc(&format(256, 256), &mut allocator, &mut frame_buffer),
            Err(FrameBufferError::Allocator(_))
        ));
        assert_eq!(calls.outstanding(), 0);
        assert!(!frame_buffer.is_allocated());
        assert_eq!(yuv, YuvBuffer::default());
        assert!(yuv.plane(&frame_buffer, 0).is_empty());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic)]
    fn allocator_malfunction() {
        let (mut allocator, _) = TestAllocator::new(Behavior::ShortPlanes);
        let mut frame_buffer = FrameBuffer::default();
        let mut yuv = YuvBuffer::default();

        assert!(matches!(
            yuv.realloc(&format(64, 64), &mut allocator, &mut frame_buffer),
            Err(FrameBufferError::AllocatorMalfunction)
        ));
    }
}
