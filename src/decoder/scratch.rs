// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-thread working memory of the tile decoders.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::codec::av1::header::MAX_NUM_PLANES;
use crate::decoder::MAX_THREADS;

/// Largest block size, in luma samples.
pub const MAX_BLOCK_SIZE: usize = 128;
/// Size of the intermediate buffer of the convolution filters, per 16-bit sample.
pub const CONVOLVE_BUFFER_SIZE: usize = 2 * MAX_BLOCK_SIZE * (2 * MAX_BLOCK_SIZE + 16);
/// Side of the chroma-from-luma buffer.
pub const CFL_LUMA_BUFFER_SIZE: usize = 32;
/// Side of a superblock in 4x4 blocks, plus one on each side for the neighbors.
const BLOCK_DECODED_STRIDE: usize = MAX_BLOCK_SIZE / 4 + 2;

/// Buffers only needed while decoding either inter or intra blocks.
///
/// A block is never predicted both ways at once, so the two sets of buffers never live together.
#[derive(Debug, Default)]
pub enum BlockScratch {
    #[default]
    Unused,
    Inter {
        /// Compound prediction of both references.
        prediction_buffer: [Box<[u16]>; 2],
    },
    Intra {
        cfl_luma_buffer: Box<[[i16; CFL_LUMA_BUFFER_SIZE]; CFL_LUMA_BUFFER_SIZE]>,
        quantized_buffer: Box<[i32]>,
    },
}

/// Working memory of one tile decoding thread.
pub struct DecoderScratchBuffer {
    /// Mask of the compound wedge and difference-weighted predictions.
    pub prediction_mask: Box<[u8]>,
    block: BlockScratch,
    pub convolve_block_buffer: Box<[u16]>,
    /// Whether `cfl_luma_buffer` holds the luma of the current block.
    pub cfl_luma_buffer_valid: bool,
    block_decoded: Box<[[[bool; BLOCK_DECODED_STRIDE]; BLOCK_DECODED_STRIDE]; MAX_NUM_PLANES]>,
}

impl DecoderScratchBuffer {
    pub fn new() -> Self {
        Self {
            prediction_mask: vec![0; MAX_BLOCK_SIZE * MAX_BLOCK_SIZE].into_boxed_slice(),
            block: BlockScratch::Unused,
            convolve_block_buffer: vec![0; CONVOLVE_BUFFER_SIZE].into_boxed_slice(),
            cfl_luma_buffer_valid: false,
            block_decoded: Box::new(
                [[[false; BLOCK_DECODED_STRIDE]; BLOCK_DECODED_STRIDE]; MAX_NUM_PLANES],
            ),
        }
    }

    pub fn block(&self) -> &BlockScratch {
        &self.block
    }

    /// The compound prediction buffers, replacing the intra buffers if needed.
    pub fn inter_mut(&mut self) -> &mut [Box<[u16]>; 2] {
        if !matches!(self.block, BlockScratch::Inter { .. }) {
            let size = MAX_BLOCK_SIZE * MAX_BLOCK_SIZE;
            self.block = BlockScratch::Inter {
                prediction_buffer: [
                    vec![0; size].into_boxed_slice(),
                    vec![0; size].into_boxed_slice(),
                ],
            };
            self.cfl_luma_buffer_valid = false;
        }

        match &mut self.block {
            BlockScratch::Inter { prediction_buffer } => prediction_buffer,
            _ => unreachable!(),
        }
    }

    /// The chroma-from-luma and dequantization buffers, replacing the inter buffers if needed.
    pub fn intra_mut(
        &mut self,
    ) -> (&mut [[i16; CFL_LUMA_BUFFER_SIZE]; CFL_LUMA_BUFFER_SIZE], &mut [i32]) {
        if !matches!(self.block, BlockScratch::Intra { .. }) {
            self.block = BlockScratch::Intra {
                cfl_luma_buffer: Box::new([[0; CFL_LUMA_BUFFER_SIZE]; CFL_LUMA_BUFFER_SIZE]),
                quantized_buffer: vec![0; 64 * 64].into_boxed_slice(),
            };
            self.cfl_luma_buffer_valid = false;
        }

        match &mut self.block {
            BlockScratch::Intra { cfl_luma_buffer, quantized_buffer } => {
                (cfl_luma_buffer, quantized_buffer)
            }
            _ => unreachable!(),
        }
    }

    /// Whether the 4x4 block at (`row4x4`, `column4x4`) of the superblock has been decoded in
    /// `plane`. Coordinates of -1 and up to 32 address the neighboring superblocks.
    pub fn block_decoded(&self, plane: usize, row4x4: isize, column4x4: isize) -> bool {
        self.block_decoded[plane][(row4x4 + 1) as usize][(column4x4 + 1) as usize]
    }

    pub fn set_block_decoded(
        &mut self,
        plane: usize,
        row4x4: isize,
        column4x4: isize,
        value: bool,
    ) {
        self.block_decoded[plane][(row4x4 + 1) as usize][(column4x4 + 1) as usize] = value;
    }

    /// Marks every block of every plane as not decoded.
    pub fn clear_block_decoded(&mut self) {
        for plane in self.block_decoded.iter_mut() {
            for row in plane.iter_mut() {
                row.fill(false);
            }
        }
    }
}

impl Default for DecoderScratchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Scratch buffer borrowed from a [`DecoderScratchBufferPool`]. Goes back to the pool when
/// dropped.
pub struct PooledScratchBuffer<'a> {
    buffer: Option<Box<DecoderScratchBuffer>>,
    pool: &'a DecoderScratchBufferPool,
}

impl Deref for PooledScratchBuffer<'_> {
    type Target = DecoderScratchBuffer;

    fn deref(&self) -> &Self::Target {
        // `buffer` is only `None` while dropping.
        self.buffer.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledScratchBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledScratchBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

/// Scratch buffers kept across frames. Never blocks: a new buffer is allocated when none is
/// available.
#[derive(Default)]
pub struct DecoderScratchBufferPool {
    buffers: Mutex<Vec<Box<DecoderScratchBuffer>>>,
}

impl DecoderScratchBufferPool {
    pub fn get(&self) -> PooledScratchBuffer<'_> {
        let buffer = self.buffers.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let buffer = buffer.unwrap_or_else(|| {
            log::debug!("allocating a new scratch buffer");
            Box::new(DecoderScratchBuffer::new())
        });

        PooledScratchBuffer { buffer: Some(buffer), pool: self }
    }

    /// Gives `buffer` back to the pool. Buffers beyond the number of tile threads are freed.
    pub fn release(&self, buffer: Box<DecoderScratchBuffer>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < MAX_THREADS {
            buffers.push(buffer);
        }
    }

    pub fn num_available(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
