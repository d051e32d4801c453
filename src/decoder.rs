// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod av1;
pub mod buffer_pool;
pub mod frame_buffer;
pub mod scratch;
pub mod yuv_buffer;

use thiserror::Error;

use crate::decoder::av1::TileError;
use crate::decoder::frame_buffer::FrameBufferAllocator;
use crate::decoder::frame_buffer::FrameBufferError;

/// Maximum number of threads a decoder can use to decode tiles.
pub const MAX_THREADS: usize = 32;

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("not enough resources to decode the frame: {0}")]
    OutOfResources(#[from] FrameBufferError),
    #[error("all {0} frame buffers are in use")]
    NoFreeBuffer(usize),
    #[error("the queue of encoded frames is full")]
    QueueFull,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("broken stream: {0}")]
    BrokenStream(String),
    #[error("broken stream: {0}")]
    Tile(#[from] TileError),
    #[error("failed to parse temporal unit: {0:#}")]
    Parser(anyhow::Error),
    #[error("failed to decode tile: {0:#}")]
    TileDecoder(anyhow::Error),
}

impl DecodeError {
    /// Whether the error is due to a lack of memory or frame buffers, as opposed to a problem
    /// with the stream.
    pub fn is_out_of_resources(&self) -> bool {
        matches!(self, DecodeError::OutOfResources(_) | DecodeError::NoFreeBuffer(_))
    }
}

/// Set of post-processing stages a tile decoder is allowed to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostFilterMask(u8);

impl PostFilterMask {
    pub const DEBLOCK: Self = Self(1 << 0);
    pub const CDEF: Self = Self(1 << 1);
    pub const SUPERRES: Self = Self(1 << 2);
    pub const LOOP_RESTORATION: Self = Self(1 << 3);
    pub const FILM_GRAIN: Self = Self(1 << 4);
    pub const ALL: Self = Self(0x1f);
    pub const NONE: Self = Self(0);

    /// Builds a mask from its raw value. Bits above the five known stages are ignored.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for PostFilterMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl std::ops::BitOr for PostFilterMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Decoder configuration.
pub struct DecoderSettings {
    /// Number of threads used to decode the tiles of a frame.
    pub threads: usize,
    /// Allow decoding several frames at the same time.
    pub frame_parallel: bool,
    /// Allocator of the frame buffers. If `None`, an internal allocator is used.
    pub frame_buffer_allocator: Option<Box<dyn FrameBufferAllocator>>,
    pub post_filter_mask: PostFilterMask,
    /// Border around each plane, in pixels. Must be a multiple of 32.
    pub border: u32,
    /// Alignment of the first visible pixel of each plane. Must be 0 or a power of two no
    /// smaller than 16.
    pub byte_alignment: u32,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            threads: 1,
            frame_parallel: false,
            frame_buffer_allocator: None,
            post_filter_mask: Default::default(),
            border: 64,
            byte_alignment: 0,
        }
    }
}

impl std::fmt::Debug for DecoderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderSettings")
            .field("threads", &self.threads)
            .field("frame_parallel", &self.frame_parallel)
            .field("external_allocator", &self.frame_buffer_allocator.is_some())
            .field("post_filter_mask", &self.post_filter_mask)
            .field("border", &self.border)
            .field("byte_alignment", &self.byte_alignment)
            .finish()
    }
}

/// How the work of decoding a frame is spread across threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadingStrategy {
    tile_threads: usize,
}

impl ThreadingStrategy {
    pub fn new(settings: &DecoderSettings) -> Self {
        if settings.frame_parallel {
            log::debug!("frame parallel mode requested, frames are decoded one after the other");
        }

        Self { tile_threads: settings.threads.clamp(1, MAX_THREADS) }
    }

    /// Number of threads used to decode a frame made of `num_tiles` tiles.
    pub fn tile_workers(&self, num_tiles: usize) -> usize {
        self.tile_threads.min(num_tiles).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_filter_mask() {
        let mask = PostFilterMask::DEBLOCK | PostFilterMask::CDEF;
        assert!(mask.contains(PostFilterMask::CDEF));
        assert!(!mask.contains(PostFilterMask::FILM_GRAIN));
        assert_eq!(PostFilterMask::from_bits_truncate(0xff), PostFilterMask::ALL);
        assert_eq!(PostFilterMask::default().bits(), 0x1f);
    }

    #[test]
    fn threading_strategy() {
        let settings = DecoderSettings { threads: 0, ..Default::default() };
        assert_eq!(ThreadingStrategy::new(&settings).tile_workers(4), 1);

        let settings = DecoderSettings { threads: 4, ..Default::default() };
        let strategy = ThreadingStrategy::new(&settings);
        assert_eq!(strategy.tile_workers(2), 2);
        assert_eq!(strategy.tile_workers(16), 4);
        assert_eq!(strategy.tile_workers(0), 1);

        let settings = DecoderSettings { threads: 1000, ..Default::default() };
        assert_eq!(ThreadingStrategy::new(&settings).tile_workers(1000), MAX_THREADS);
    }
}
