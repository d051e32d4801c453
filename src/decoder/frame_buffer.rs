// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Storage of decoded frames and the allocators providing it.

use std::collections::TryReserveError;

use anyhow::anyhow;
use thiserror::Error;

use crate::codec::av1::header::MAX_NUM_PLANES;

#[derive(Debug, Error)]
pub enum FrameBufferError {
    #[error("border {0} is not a multiple of 32")]
    InvalidBorder(u32),
    #[error("byte alignment {0} must be 0 or a power of two no smaller than 16")]
    InvalidByteAlignment(u32),
    #[error("invalid frame geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },
    #[error("frame buffer allocator failed: {0:#}")]
    Allocator(anyhow::Error),
    #[error("frame buffer allocator returned planes smaller than requested")]
    AllocatorMalfunction,
    #[error("failed to allocate frame side data: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

/// Memory of the three planes of a frame, as provided by a [`FrameBufferAllocator`].
///
/// Either all planes are allocated or none is.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pub planes: [Vec<u8>; MAX_NUM_PLANES],
    /// Token identifying the buffer for the allocator that provided it.
    pub private_data: Option<usize>,
}

impl FrameBuffer {
    pub fn is_allocated(&self) -> bool {
        !self.planes[0].is_empty()
    }

    /// Whether the planes can hold at least `y_plane_size` and `uv_plane_size` bytes.
    pub fn can_hold(&self, y_plane_size: usize, uv_plane_size: usize) -> bool {
        self.planes[0].len() >= y_plane_size
            && self.planes[1].len() >= uv_plane_size
            && self.planes[2].len() >= uv_plane_size
    }
}

/// Provider of frame buffer memory.
///
/// The decoder calls `get_frame_buffer` whenever a frame needs larger planes than the ones it
/// holds, and `release_frame_buffer` once it has no use for a frame buffer anymore.
pub trait FrameBufferAllocator: Send {
    /// Fills `frame_buffer` with planes of at least `y_plane_min_size` bytes for the luma
    /// plane and `uv_plane_min_size` bytes for each chroma plane.
    fn get_frame_buffer(
        &mut self,
        y_plane_min_size: usize,
        uv_plane_min_size: usize,
        frame_buffer: &mut FrameBuffer,
    ) -> anyhow::Result<()>;

    /// Takes back the planes of `frame_buffer`, leaving it unallocated.
    fn release_frame_buffer(&mut self, frame_buffer: &mut FrameBuffer) -> anyhow::Result<()>;
}

struct InternalFrameBuffer {
    planes: [Vec<u8>; MAX_NUM_PLANES],
    in_use: bool,
}

/// Allocator used when the client does not provide one.
///
/// Keeps a fixed number of buffers which only ever grow, and lends them out by moving their
/// planes into the requesting [`FrameBuffer`].
pub struct InternalFrameBufferList {
    buffers: Vec<InternalFrameBuffer>,
}

impl InternalFrameBufferList {
    pub fn new(num_buffers: usize) -> Self {
        let buffers = (0..num_buffers)
            .map(|_| InternalFrameBuffer { planes: Default::default(), in_use: false })
            .collect();

        Self { buffers }
    }

    pub fn num_buffers_in_use(&self) -> usize {
        self.buffers.iter().filter(|b| b.in_use).count()
    }
}

fn grow_plane(plane: &mut Vec<u8>, min_size: usize) -> Result<(), TryReserveError> {
    if plane.len() < min_size {
        plane.try_reserve_exact(min_size - plane.len())?;
        plane.resize(min_size, 0);
    }

    Ok(())
}

impl FrameBufferAllocator for InternalFrameBufferList {
    fn get_frame_buffer(
        &mut self,
        y_plane_min_size: usize,
        uv_plane_min_size: usize,
        frame_buffer: &mut FrameBuffer,
    ) -> anyhow::Result<()> {
        let num_buffers = self.buffers.len();
        let (index, buffer) = self
            .buffers
            .iter_mut()
            .enumerate()
            .find(|(_, b)| !b.in_use)
            .ok_or_else(|| anyhow!("all {} internal frame buffers are in use", num_buffers))?;

        let min_sizes = [y_plane_min_size, uv_plane_min_size, uv_plane_min_size];
        for (plane, min_size) in buffer.planes.iter_mut().zip(min_sizes) {
            grow_plane(plane, min_size)?;
        }

        for (dst, src) in frame_buffer.planes.iter_mut().zip(buffer.planes.iter_mut()) {
            *dst = std::mem::take(src);
        }
        frame_buffer.private_data = Some(index);
        buffer.in_use = true;

        Ok(())
    }

    fn release_frame_buffer(&mut self, frame_buffer: &mut FrameBuffer) -> anyhow::Result<()> {
        let index = frame_buffer
            .private_data
            .take()
            .ok_or_else(|| anyhow!("frame buffer was not provided by this allocator"))?;
        let buffer = self
            .buffers
            .get_mut(index)
            .filter(|b| b.in_use)
            .ok_or_else(|| anyhow!("internal frame buffer {} is not in use", index))?;

        for (dst, src) in buffer.planes.iter_mut().zip(frame_buffer.planes.iter_mut()) {
            *dst = std::mem::take(src);
        }
        buffer.in_use = false;

        Ok(())
    }
}
