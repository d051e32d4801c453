// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! AV1 decoder core.
//!
//! [`Av1Decoder`] drives the lifecycle of the frames of a stream: it takes a frame from its
//! [`BufferPool`], has its tiles decoded by a [`TileDecoder`], stores it into the reference
//! frame slots selected by the frame header and hands shown frames to the client. Parsing the
//! OBUs is left to an [`ObuParser`].

#[cfg(test)]
mod dummy;

use std::collections::VecDeque;
use std::sync::RwLockReadGuard;
use std::thread;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use bytes::Bytes;
use thiserror::Error;

use crate::codec::av1::cdf::SymbolDecoderContext;
use crate::codec::av1::entropy::EntropyDecoder;
use crate::codec::av1::header::ChromaSamplePosition;
use crate::codec::av1::header::FrameHeader;
use crate::codec::av1::header::FrameType;
use crate::codec::av1::header::SequenceHeader;
use crate::codec::av1::header::DEFAULT_LOOP_FILTER_REF_DELTAS;
use crate::codec::av1::header::NUM_REFERENCE_FRAME_TYPES;
use crate::codec::av1::header::NUM_REF_FRAMES;
use crate::codec::av1::header::PRIMARY_REF_NONE;
use crate::codec::av1::helpers::get_relative_dist;
use crate::decoder::buffer_pool::BufferPool;
use crate::decoder::buffer_pool::RefCountedBuffer;
use crate::decoder::buffer_pool::RefCountedBufferPtr;
use crate::decoder::scratch::DecoderScratchBuffer;
use crate::decoder::scratch::DecoderScratchBufferPool;
use crate::decoder::yuv_buffer::FrameFormat;
use crate::decoder::DecodeError;
use crate::decoder::DecoderSettings;
use crate::decoder::PostFilterMask;
use crate::decoder::Result;
use crate::decoder::ThreadingStrategy;
use crate::ImageFormat;
use crate::Resolution;

/// Maximum number of encoded frames waiting to be decoded.
pub const MAX_ENCODED_FRAMES: usize = 32;

/// Compressed data of tiles `tile_start..=tile_end` of a frame.
#[derive(Clone, Debug)]
pub struct TileGroup {
    pub data: Bytes,
    pub tile_start: usize,
    pub tile_end: usize,
}

/// A frame header and the tile groups following it.
#[derive(Clone, Debug)]
pub struct FrameUnit {
    pub header: FrameHeader,
    pub tile_groups: Vec<TileGroup>,
}

/// Parsed content of a temporal unit.
#[derive(Clone, Debug, Default)]
pub struct TemporalUnit {
    /// Set if the unit carries a sequence header.
    pub sequence_header: Option<SequenceHeader>,
    pub frames: Vec<FrameUnit>,
}

/// Splits temporal units into headers and tile groups.
pub trait ObuParser {
    fn parse_temporal_unit(&mut self, data: &Bytes) -> anyhow::Result<TemporalUnit>;
}

/// A tile to decode, and what is known of its frame.
pub struct Tile<'a> {
    pub index: usize,
    pub row: usize,
    pub column: usize,
    /// Area covered by the tile, in 4x4 blocks.
    pub mi_row_start: u32,
    pub mi_row_end: u32,
    pub mi_col_start: u32,
    pub mi_col_end: u32,
    pub data: &'a [u8],
    pub header: &'a FrameHeader,
    pub sequence_header: &'a SequenceHeader,
    pub post_filter_mask: PostFilterMask,
    pub reference_frame_sign_bias: &'a [bool; NUM_REFERENCE_FRAME_TYPES],
}

/// Decodes the blocks of a tile into the current frame.
///
/// Tiles of the same frame may be decoded at the same time from different threads, each with
/// its own entropy decoder, symbol context and scratch buffer.
pub trait TileDecoder: Sync {
    fn decode_tile(
        &self,
        tile: &Tile,
        reader: &mut EntropyDecoder,
        context: &mut SymbolDecoderContext,
        scratch: &mut DecoderScratchBuffer,
        frame: &RefCountedBufferPtr,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum TileError {
    #[error("tile_size_bytes must be between 1 and 4, got {0}")]
    InvalidTileSizeBytes(u32),
    #[error("tile {tile} is {size} bytes long but only {available} bytes are left")]
    TileSizeTooLarge { tile: usize, size: usize, available: usize },
    #[error("tile group {start}..={end} is out of the {num_tiles} tiles of the frame")]
    InvalidTileRange { start: usize, end: usize, num_tiles: usize },
    #[error("frame has {expected} tiles but its tile groups cover {actual}")]
    TileCountMismatch { expected: usize, actual: usize },
    #[error("invalid tile layout: {0}")]
    InvalidLayout(String),
}

/// Splits the payload of a tile group into the data of each of its tiles.
///
/// Every tile but the last is preceded by its size minus one, stored as a little-endian integer
/// of `tile_size_bytes` bytes. The last tile takes the rest of the payload.
pub fn split_tile_group(
    data: &[u8],
    tile_start: usize,
    tile_end: usize,
    tile_size_bytes: u32,
) -> std::result::Result<Vec<&[u8]>, TileError> {
    if !(1..=4).contains(&tile_size_bytes) {
        return Err(TileError::InvalidTileSizeBytes(tile_size_bytes));
    }
    if tile_end < tile_start {
        return Err(TileError::InvalidTileRange {
            start: tile_start,
            end: tile_end,
            num_tiles: tile_end + 1,
        });
    }

    let size_len = tile_size_bytes as usize;
    let mut tiles = Vec::with_capacity(tile_end - tile_start + 1);
    let mut remaining = data;

    for tile in tile_start..tile_end {
        if remaining.len() < size_len {
            return Err(TileError::TileSizeTooLarge {
                tile,
                size: size_len,
                available: remaining.len(),
            });
        }

        let size = LittleEndian::read_uint(&remaining[..size_len], size_len) as usize + 1;
        let rest = &remaining[size_len..];
        if size > rest.len() {
            return Err(TileError::TileSizeTooLarge { tile, size, available: rest.len() });
        }

        let (tile_data, rest) = rest.split_at(size);
        tiles.push(tile_data);
        remaining = rest;
    }
    tiles.push(remaining);

    Ok(tiles)
}

/// State carried from frame to frame.
#[derive(Default)]
pub struct DecoderState {
    pub sequence_header: Option<SequenceHeader>,
    pub reference_frame: [Option<RefCountedBufferPtr>; NUM_REF_FRAMES],
    pub reference_order_hint: [u32; NUM_REF_FRAMES],
    /// Whether each slot may be used as a reference. Only meaningful when the sequence carries
    /// frame ids.
    pub reference_valid: [bool; NUM_REF_FRAMES],
    pub reference_frame_id: [u16; NUM_REF_FRAMES],
    /// Id of the frame being decoded, or of the last one decoded. `None` if the sequence has no
    /// frame ids.
    pub current_frame_id: Option<u16>,
    /// Whether each reference of the current frame is a backward reference.
    pub reference_frame_sign_bias: [bool; NUM_REFERENCE_FRAME_TYPES],
    /// The frame being decoded.
    pub current_frame: Option<RefCountedBufferPtr>,
}

impl DecoderState {
    fn clear_reference_frames(&mut self) {
        self.reference_frame = Default::default();
        self.reference_order_hint = Default::default();
        self.reference_valid = Default::default();
        self.reference_frame_id = Default::default();
        self.current_frame_id = None;
    }

    /// Marks every reference slot as unusable, as done by a shown key frame.
    fn invalidate_references(&mut self) {
        self.reference_valid = Default::default();
    }

    /// Checks that the slots referenced by an inter frame hold frames that may be referenced.
    fn check_references_valid(&self, header: &FrameHeader) -> Result<()> {
        for slot in header.ref_frame_idx {
            if !self.reference_valid.get(slot as usize).copied().unwrap_or(false) {
                return Err(DecodeError::BrokenStream(format!(
                    "reference slot {} is not valid",
                    slot
                )));
            }
        }

        Ok(())
    }

    /// Stores `frame` into every slot set in `refresh_frame_flags`.
    fn update_reference_frames(
        &mut self,
        refresh_frame_flags: u8,
        frame: &RefCountedBufferPtr,
        order_hint: u32,
    ) {
        for i in 0..NUM_REF_FRAMES {
            if refresh_frame_flags & (1 << i) != 0 {
                log::debug!("reference slot {} now holds frame buffer {}", i, frame.index());
                self.reference_frame[i] = Some(frame.clone());
                self.reference_order_hint[i] = order_hint;
                self.reference_valid[i] = true;
                self.reference_frame_id[i] = self.current_frame_id.unwrap_or(0);
            }
        }
    }
}

struct EncodedFrame {
    data: Bytes,
    user_private_data: i64,
}

/// A decoded frame, as returned by [`Av1Decoder::dequeue_frame`].
///
/// Borrows the decoder: the frame stays valid until the next call to the decoder.
pub struct DecoderBuffer<'a> {
    frame: RwLockReadGuard<'a, RefCountedBuffer>,
    user_private_data: i64,
}

impl DecoderBuffer<'_> {
    /// Visible samples of `plane`, starting with the top-left one. Rows are `stride(plane)`
    /// bytes apart.
    pub fn plane(&self, plane: usize) -> &[u8] {
        self.frame.plane(plane)
    }

    pub fn row(&self, plane: usize, row: usize) -> &[u8] {
        self.frame.row(plane, row)
    }

    pub fn stride(&self, plane: usize) -> usize {
        self.frame.yuv_buffer().stride(plane)
    }

    pub fn displayed_width(&self, plane: usize) -> u32 {
        self.frame.yuv_buffer().displayed_width(plane)
    }

    pub fn displayed_height(&self, plane: usize) -> u32 {
        self.frame.yuv_buffer().displayed_height(plane)
    }

    pub fn bitdepth(&self) -> u32 {
        self.frame.yuv_buffer().bitdepth()
    }

    pub fn image_format(&self) -> ImageFormat {
        self.frame.yuv_buffer().image_format()
    }

    pub fn num_planes(&self) -> usize {
        self.image_format().num_planes()
    }

    pub fn chroma_sample_position(&self) -> ChromaSamplePosition {
        self.frame.chroma_sample_position()
    }

    pub fn render_resolution(&self) -> Resolution {
        Resolution { width: self.frame.render_width(), height: self.frame.render_height() }
    }

    /// Tag passed to [`Av1Decoder::enqueue_frame`] with the temporal unit of this frame.
    pub fn user_private_data(&self) -> i64 {
        self.user_private_data
    }

    /// Token given by the frame buffer allocator to the memory of this frame.
    pub fn buffer_private_data(&self) -> Option<usize> {
        self.frame.buffer_private_data()
    }
}

/// A tile of a frame and its data.
struct TileData<'a> {
    index: usize,
    data: &'a [u8],
}

/// What the workers decoding the tiles of a frame share.
struct TileJob<'a, T> {
    tile_decoder: &'a T,
    scratch_pool: &'a DecoderScratchBufferPool,
    header: &'a FrameHeader,
    sequence_header: &'a SequenceHeader,
    post_filter_mask: PostFilterMask,
    reference_frame_sign_bias: &'a [bool; NUM_REFERENCE_FRAME_TYPES],
    initial_context: &'a SymbolDecoderContext,
    frame: &'a RefCountedBufferPtr,
}

impl<T: TileDecoder> TileJob<'_, T> {
    /// Decodes one tile. Returns its final symbol context if the frame context is taken from it.
    fn decode_tile(
        &self,
        tile: &TileData,
        scratch: &mut DecoderScratchBuffer,
    ) -> Result<Option<SymbolDecoderContext>> {
        let tile_info = &self.header.tile_info;
        let row = tile.index / tile_info.tile_cols as usize;
        let column = tile.index % tile_info.tile_cols as usize;

        let tile_desc = Tile {
            index: tile.index,
            row,
            column,
            mi_row_start: tile_info.mi_row_starts[row],
            mi_row_end: tile_info.mi_row_starts[row + 1],
            mi_col_start: tile_info.mi_col_starts[column],
            mi_col_end: tile_info.mi_col_starts[column + 1],
            data: tile.data,
            header: self.header,
            sequence_header: self.sequence_header,
            post_filter_mask: self.post_filter_mask,
            reference_frame_sign_bias: self.reference_frame_sign_bias,
        };

        let mut context = self.initial_context.clone();
        let mut reader = EntropyDecoder::new(tile.data, !self.header.disable_cdf_update);

        self.tile_decoder
            .decode_tile(&tile_desc, &mut reader, &mut context, scratch, self.frame)
            .map_err(DecodeError::TileDecoder)?;

        let is_context_tile = tile.index == tile_info.context_update_tile_id as usize;
        Ok(is_context_tile.then_some(context))
    }

    /// Decodes every `step`-th tile starting from `first`.
    fn run_worker(
        &self,
        tiles: &[TileData],
        first: usize,
        step: usize,
    ) -> Result<Option<SymbolDecoderContext>> {
        let mut scratch = self.scratch_pool.get();
        let mut saved_context = None;

        for tile in tiles.iter().skip(first).step_by(step) {
            if let Some(context) = self.decode_tile(tile, &mut scratch)? {
                saved_context = Some(context);
            }
        }

        Ok(saved_context)
    }

    /// Decodes all `tiles` with `workers` threads. Returns the symbol context of the tile the
    /// frame context is taken from.
    fn run(&self, tiles: &[TileData], workers: usize) -> Result<Option<SymbolDecoderContext>> {
        if workers <= 1 {
            return self.run_worker(tiles, 0, 1);
        }

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| s.spawn(move || self.run_worker(tiles, worker, workers)))
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect::<Vec<_>>()
        });

        let mut saved_context = None;
        for result in results {
            if let Some(context) = result? {
                saved_context = Some(context);
            }
        }

        Ok(saved_context)
    }
}

/// Decoder of AV1 streams, parsing them with `P` and decoding tiles with `T`.
pub struct Av1Decoder<P: ObuParser, T: TileDecoder> {
    parser: P,
    tile_decoder: T,
    encoded_frames: VecDeque<EncodedFrame>,
    state: DecoderState,
    threading: ThreadingStrategy,
    post_filter_mask: PostFilterMask,
    border: u32,
    byte_alignment: u32,
    /// Reference to the frame returned by the last call to `dequeue_frame`.
    output_frame: Option<RefCountedBufferPtr>,
    output_user_private_data: i64,
    scratch_pool: DecoderScratchBufferPool,
    /// Must stay the last field: every frame referenced above is returned to it when dropped.
    buffer_pool: BufferPool,
}

impl<P: ObuParser, T: TileDecoder> Av1Decoder<P, T> {
    pub fn new(settings: DecoderSettings, parser: P, tile_decoder: T) -> Result<Self> {
        let probe = FrameFormat {
            bitdepth: 8,
            is_monochrome: false,
            width: 1,
            height: 1,
            subsampling_x: 1,
            subsampling_y: 1,
            border: settings.border,
            byte_alignment: settings.byte_alignment,
        };
        probe.validate().map_err(|e| DecodeError::InvalidArgument(e.to_string()))?;

        let threading = ThreadingStrategy::new(&settings);
        log::debug!("creating AV1 decoder with {:?}", settings);

        let DecoderSettings {
            frame_buffer_allocator,
            post_filter_mask,
            border,
            byte_alignment,
            ..
        } = settings;

        Ok(Self {
            parser,
            tile_decoder,
            encoded_frames: VecDeque::with_capacity(MAX_ENCODED_FRAMES),
            state: Default::default(),
            threading,
            post_filter_mask,
            border,
            byte_alignment,
            output_frame: None,
            output_user_private_data: 0,
            scratch_pool: Default::default(),
            buffer_pool: BufferPool::new(frame_buffer_allocator),
        })
    }

    /// Queues a temporal unit for decoding. `user_private_data` is returned with the frame
    /// shown by this unit, if any.
    ///
    /// An empty `data` marks the end of the stream: once the frames queued before it are
    /// decoded, every reference frame is released.
    pub fn enqueue_frame(&mut self, data: Bytes, user_private_data: i64) -> Result<()> {
        if self.encoded_frames.len() >= MAX_ENCODED_FRAMES {
            return Err(DecodeError::QueueFull);
        }

        if data.is_empty() && self.encoded_frames.is_empty() {
            return self.signal_end_of_stream();
        }

        self.encoded_frames.push_back(EncodedFrame { data, user_private_data });

        Ok(())
    }

    /// Drops the queued temporal units and releases every frame held by the decoder. The
    /// sequence header is kept.
    pub fn signal_end_of_stream(&mut self) -> Result<()> {
        log::debug!("end of stream, dropping {} queued units", self.encoded_frames.len());

        self.encoded_frames.clear();
        self.release_output_frame();
        self.state.clear_reference_frames();

        Ok(())
    }

    /// Decodes the queued temporal units until one of them shows a frame, and returns that
    /// frame. Returns `None` once the queue is empty.
    ///
    /// The frame returned by the previous call is released first.
    pub fn dequeue_frame(&mut self) -> Result<Option<DecoderBuffer<'_>>> {
        self.release_output_frame();

        while let Some(encoded) = self.encoded_frames.pop_front() {
            if encoded.data.is_empty() {
                log::debug!("reached end of stream marker");
                self.state.clear_reference_frames();
                continue;
            }

            let temporal_unit =
                self.parser.parse_temporal_unit(&encoded.data).map_err(DecodeError::Parser)?;
            self.decode_temporal_unit(temporal_unit)?;

            if self.output_frame.is_some() {
                self.output_user_private_data = encoded.user_private_data;
                break;
            }
        }

        Ok(self.output_frame.as_ref().map(|frame| DecoderBuffer {
            frame: frame.read(),
            user_private_data: self.output_user_private_data,
        }))
    }

    /// Number of frames of the pool currently referenced.
    pub fn num_frames_in_use(&self) -> usize {
        self.buffer_pool.num_buffers_in_use()
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    fn release_output_frame(&mut self) {
        if let Some(frame) = self.output_frame.take() {
            log::debug!("releasing output frame buffer {}", frame.index());
        }
    }

    fn set_output_frame(&mut self, frame: RefCountedBufferPtr) {
        log::debug!("frame buffer {} ready for output", frame.index());

        if let Some(previous) = self.output_frame.replace(frame) {
            log::debug!("frame buffer {} superseded by a later shown frame", previous.index());
        }
    }

    fn decode_temporal_unit(&mut self, temporal_unit: TemporalUnit) -> Result<()> {
        if let Some(sequence_header) = temporal_unit.sequence_header {
            if !matches!(sequence_header.bit_depth, 8 | 10 | 12) {
                return Err(DecodeError::BrokenStream(format!(
                    "unsupported bit depth {}",
                    sequence_header.bit_depth
                )));
            }

            log::debug!(
                "new sequence header: {} bits, monochrome {}, subsampling {}x{}",
                sequence_header.bit_depth,
                sequence_header.mono_chrome,
                sequence_header.subsampling_x,
                sequence_header.subsampling_y
            );
            self.state.sequence_header = Some(sequence_header);
        }

        for frame in temporal_unit.frames {
            let Some(sequence_header) = self.state.sequence_header.clone() else {
                log::warn!("frame received before any sequence header");
                return Err(DecodeError::BrokenStream(
                    "frame received before any sequence header".into(),
                ));
            };

            if frame.header.show_existing_frame {
                self.show_existing_frame(&sequence_header, &frame.header)?;
            } else {
                let result = self.decode_frame(&sequence_header, frame);
                // Whatever happened, the frame being decoded is no longer current.
                self.state.current_frame = None;
                result?;
            }
        }

        Ok(())
    }

    fn show_existing_frame(
        &mut self,
        sequence_header: &SequenceHeader,
        header: &FrameHeader,
    ) -> Result<()> {
        let index = header.frame_to_show_map_idx as usize;
        let frame = self.state.reference_frame.get(index).cloned().flatten().ok_or_else(|| {
            DecodeError::BrokenStream(format!("no frame to show in reference slot {}", index))
        })?;

        if sequence_header.frame_id_numbers_present_flag
            && (!self.state.reference_valid[index]
                || self.state.reference_frame_id[index] != header.display_frame_id)
        {
            return Err(DecodeError::BrokenStream(format!(
                "frame id {} does not match reference slot {}",
                header.display_frame_id, index
            )));
        }

        let (showable, frame_type) = {
            let buffer = frame.read();
            (buffer.showable_frame(), buffer.frame_type())
        };
        if !showable {
            return Err(DecodeError::BrokenStream(format!(
                "frame in reference slot {} cannot be shown",
                index
            )));
        }

        log::debug!("showing existing frame {} from slot {}", frame.index(), index);

        if frame_type == FrameType::KeyFrame {
            // Showing a key frame resets the references as decoding it would have.
            frame.write().set_showable_frame(false);
            if sequence_header.frame_id_numbers_present_flag {
                self.state.current_frame_id = Some(self.state.reference_frame_id[index]);
            }
            let order_hint = self.state.reference_order_hint[index];
            self.state.update_reference_frames(0xff, &frame, order_hint);
        }

        self.set_output_frame(frame);

        Ok(())
    }

    /// Takes a frame from the pool and makes it ready for the decoding of `header`.
    fn allocate_current_frame(
        &self,
        sequence_header: &SequenceHeader,
        header: &FrameHeader,
    ) -> Result<RefCountedBufferPtr> {
        let frame = self
            .buffer_pool
            .get_free_buffer()
            .ok_or(DecodeError::NoFreeBuffer(self.buffer_pool.num_buffers()))?;

        frame.realloc(&FrameFormat {
            bitdepth: sequence_header.bit_depth,
            is_monochrome: sequence_header.mono_chrome,
            width: header.upscaled_width,
            height: header.frame_height,
            subsampling_x: sequence_header.subsampling_x,
            subsampling_y: sequence_header.subsampling_y,
            border: self.border,
            byte_alignment: self.byte_alignment,
        })?;

        {
            let mut buffer = frame.write();
            buffer.set_frame_dimensions(header)?;
            buffer.set_frame_type(header.frame_type);
            buffer.set_chroma_sample_position(sequence_header.chroma_sample_position);
            buffer.set_showable_frame(header.showable_frame);
        }

        log::debug!(
            "decoding {:?} {}x{} into frame buffer {}",
            header.frame_type,
            header.upscaled_width,
            header.frame_height,
            frame.index()
        );

        Ok(frame)
    }

    /// The reference frame this frame inherits its state from.
    fn primary_reference_frame(&self, header: &FrameHeader) -> Result<Option<RefCountedBufferPtr>> {
        if header.primary_ref_frame == PRIMARY_REF_NONE {
            return Ok(None);
        }

        let slot = header
            .ref_frame_idx
            .get(header.primary_ref_frame as usize)
            .copied()
            .ok_or_else(|| {
                DecodeError::BrokenStream(format!(
                    "invalid primary_ref_frame {}",
                    header.primary_ref_frame
                ))
            })?;

        match self.state.reference_frame.get(slot as usize).cloned().flatten() {
            Some(frame) => Ok(Some(frame)),
            None => Err(DecodeError::BrokenStream(format!(
                "primary reference frame in slot {} is missing",
                slot
            ))),
        }
    }

    /// Completes the loop filter deltas and segmentation features of `header` with those of
    /// the primary reference frame when the frame does not update them.
    fn load_previous_parameters(header: &mut FrameHeader, primary: Option<&RefCountedBufferPtr>) {
        let loop_filter = &mut header.loop_filter_params;
        let segmentation = &mut header.segmentation_params;

        match primary {
            None => {
                if !loop_filter.loop_filter_delta_update {
                    loop_filter.loop_filter_ref_deltas = DEFAULT_LOOP_FILTER_REF_DELTAS;
                    loop_filter.loop_filter_mode_deltas = Default::default();
                }
            }
            Some(primary) => {
                let buffer = primary.read();
                if !loop_filter.loop_filter_delta_update {
                    loop_filter.loop_filter_ref_deltas = *buffer.loop_filter_ref_deltas();
                    loop_filter.loop_filter_mode_deltas = *buffer.loop_filter_mode_deltas();
                }
                if segmentation.segmentation_enabled && !segmentation.segmentation_update_data {
                    buffer.get_segmentation_parameters(segmentation);
                }
            }
        }
    }

    /// Sets up the segmentation map of the current frame when it is not decoded from the
    /// tiles.
    fn set_segmentation_map(
        header: &FrameHeader,
        current: &mut RefCountedBuffer,
        primary: Option<&RefCountedBufferPtr>,
    ) {
        let segmentation = &header.segmentation_params;

        if !segmentation.segmentation_enabled {
            current.segmentation_map_mut().fill(0);
        } else if !segmentation.segmentation_update_map {
            let previous = primary.map(|p| p.read());
            match previous {
                Some(previous)
                    if previous.rows4x4() == header.rows4x4
                        && previous.columns4x4() == header.columns4x4 =>
                {
                    current.segmentation_map_mut().copy_from(previous.segmentation_map());
                }
                _ => current.segmentation_map_mut().fill(0),
            }
        }
    }

    /// Matches the tile groups of a frame with the tiles of its layout.
    fn collect_tiles<'a>(
        header: &FrameHeader,
        tile_groups: &'a [TileGroup],
    ) -> Result<Vec<TileData<'a>>> {
        let tile_info = &header.tile_info;
        let num_tiles = tile_info.num_tiles();

        if num_tiles == 0
            || tile_info.mi_col_starts.len() != tile_info.tile_cols as usize + 1
            || tile_info.mi_row_starts.len() != tile_info.tile_rows as usize + 1
        {
            return Err(TileError::InvalidLayout(format!(
                "{}x{} tiles with {} column and {} row starts",
                tile_info.tile_cols,
                tile_info.tile_rows,
                tile_info.mi_col_starts.len(),
                tile_info.mi_row_starts.len()
            ))
            .into());
        }
        for (starts, size, what) in [
            (&tile_info.mi_col_starts, header.columns4x4, "column"),
            (&tile_info.mi_row_starts, header.rows4x4, "row"),
        ] {
            let increasing = starts.windows(2).all(|w| w[0] < w[1]);
            if starts.first() != Some(&0) || starts.last() != Some(&size) || !increasing {
                return Err(TileError::InvalidLayout(format!(
                    "tile {} starts {:?} do not split {} blocks",
                    what, starts, size
                ))
                .into());
            }
        }
        if tile_info.context_update_tile_id as usize >= num_tiles {
            return Err(TileError::InvalidLayout(format!(
                "context_update_tile_id {} out of {} tiles",
                tile_info.context_update_tile_id, num_tiles
            ))
            .into());
        }

        let mut tiles = Vec::with_capacity(num_tiles);
        for group in tile_groups {
            if group.tile_start != tiles.len() || group.tile_end >= num_tiles {
                return Err(TileError::InvalidTileRange {
                    start: group.tile_start,
                    end: group.tile_end,
                    num_tiles,
                }
                .into());
            }

            let datas = split_tile_group(
                &group.data,
                group.tile_start,
                group.tile_end,
                tile_info.tile_size_bytes,
            )?;
            for (index, data) in (group.tile_start..).zip(datas) {
                tiles.push(TileData { index, data });
            }
        }

        if tiles.len() != num_tiles {
            return Err(TileError::TileCountMismatch { expected: num_tiles, actual: tiles.len() }
                .into());
        }

        Ok(tiles)
    }

    fn decode_frame(&mut self, sequence_header: &SequenceHeader, frame: FrameUnit) -> Result<()> {
        let FrameUnit { mut header, tile_groups } = frame;

        let tiles = Self::collect_tiles(&header, &tile_groups)?;
        if sequence_header.frame_id_numbers_present_flag && !header.frame_is_intra() {
            self.state.check_references_valid(&header)?;
        }
        let primary = self.primary_reference_frame(&header)?;

        let current = self.allocate_current_frame(sequence_header, &header)?;
        self.state.current_frame = Some(current.clone());

        Self::load_previous_parameters(&mut header, primary.as_ref());

        let initial_context = match &primary {
            Some(primary) => primary.read().frame_context().clone(),
            None => SymbolDecoderContext::default(),
        };

        let mut sign_bias = [false; NUM_REFERENCE_FRAME_TYPES];
        if !header.frame_is_intra() {
            for (i, bias) in sign_bias.iter_mut().enumerate().skip(1) {
                *bias = get_relative_dist(
                    sequence_header.enable_order_hint,
                    sequence_header.order_hint_bits,
                    header.order_hints[i] as i32,
                    header.order_hint as i32,
                ) > 0;
            }
        }
        self.state.reference_frame_sign_bias = sign_bias;

        {
            let mut buffer = current.write();
            buffer.set_order_hints(&header.order_hints);
            buffer.set_global_motions(&header.global_motion);
            buffer.set_loop_filter_deltas(&header.loop_filter_params);
            buffer.set_segmentation_parameters(&header.segmentation_params);
            buffer.set_film_grain_params(&header.film_grain_params);
            Self::set_segmentation_map(&header, &mut buffer, primary.as_ref());
        }
        drop(primary);

        let workers = self.threading.tile_workers(tiles.len());
        log::debug!("decoding {} tiles with {} workers", tiles.len(), workers);

        let job = TileJob {
            tile_decoder: &self.tile_decoder,
            scratch_pool: &self.scratch_pool,
            header: &header,
            sequence_header,
            post_filter_mask: self.post_filter_mask,
            reference_frame_sign_bias: &self.state.reference_frame_sign_bias,
            initial_context: &initial_context,
            frame: &current,
        };
        let tile_context = job.run(&tiles, workers)?;

        let saved_context = match tile_context {
            Some(context) if !header.disable_frame_end_update_cdf => context,
            _ => initial_context,
        };
        current.write().set_frame_context(&saved_context);

        self.state.current_frame_id =
            sequence_header.frame_id_numbers_present_flag.then_some(header.current_frame_id);

        let mut refresh_frame_flags = header.refresh_frame_flags;
        if header.frame_type == FrameType::KeyFrame && header.show_frame {
            self.state.invalidate_references();
            refresh_frame_flags = 0xff;
        }
        self.state.update_reference_frames(refresh_frame_flags, &current, header.order_hint);

        if header.show_frame {
            self.set_output_frame(current);
        }

        Ok(())
    }
}
