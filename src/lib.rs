// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Core of an AV1 software decoder.
//!
//! This crate provides the pieces of an AV1 decoder that govern memory ownership and symbol
//! decoding, independently of the pixel processing stages:
//!
//! * The [adaptive symbol decoder](codec::av1::entropy::EntropyDecoder) used by every parsing
//!   stage of a tile, together with the [CDF tables](codec::av1::cdf::SymbolDecoderContext) it
//!   adapts.
//! * A [pool](decoder::buffer_pool::BufferPool) of reference-counted frames, backed by an
//!   injectable [frame buffer allocator](decoder::frame_buffer::FrameBufferAllocator).
//! * The [decoder](decoder::av1::Av1Decoder) that drives the frame lifecycle: acquiring a frame,
//!   decoding its tiles, updating the reference frames and publishing the output.
//!
//! OBU parsing and tile reconstruction are provided by the client through the
//! [`ObuParser`](decoder::av1::ObuParser) and [`TileDecoder`](decoder::av1::TileDecoder) traits.

pub mod codec;
pub mod decoder;
pub mod utils;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Layout of the planes of a decoded frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
    Monochrome400,
}

impl ImageFormat {
    pub fn new(is_monochrome: bool, subsampling_x: u32, subsampling_y: u32) -> Self {
        if is_monochrome {
            return ImageFormat::Monochrome400;
        }

        match (subsampling_x, subsampling_y) {
            (0, 0) => ImageFormat::Yuv444,
            (1, 0) => ImageFormat::Yuv422,
            _ => ImageFormat::Yuv420,
        }
    }

    /// Number of planes carried by frames of this format.
    pub fn num_planes(&self) -> usize {
        match self {
            ImageFormat::Monochrome400 => 1,
            _ => 3,
        }
    }
}
