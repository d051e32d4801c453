// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parser and tile decoder whose only purpose is to let the decoder run so we can test it in
//! isolation.

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use bytes::Bytes;

use crate::codec::av1::cdf::SymbolDecoderContext;
use crate::codec::av1::cdf::INTRA_MODES;
use crate::codec::av1::cdf::MAX_SEGMENTS;
use crate::codec::av1::entropy::EntropyDecoder;
use crate::codec::av1::header::FrameHeader;
use crate::codec::av1::header::FrameType;
use crate::codec::av1::header::SequenceHeader;
use crate::codec::av1::header::TileInfo;
use crate::codec::av1::header::PRIMARY_REF_NONE;
use crate::decoder::av1::DecoderBuffer;
use crate::decoder::av1::FrameUnit;
use crate::decoder::av1::ObuParser;
use crate::decoder::av1::TemporalUnit;
use crate::decoder::av1::Tile;
use crate::decoder::av1::TileDecoder;
use crate::decoder::av1::TileGroup;
use crate::decoder::buffer_pool::RefCountedBufferPtr;
use crate::decoder::scratch::DecoderScratchBuffer;

/// Returns a scripted temporal unit for each call, whatever the input.
pub(crate) struct ScriptedParser {
    units: VecDeque<TemporalUnit>,
}

impl ScriptedParser {
    pub fn new(units: Vec<TemporalUnit>) -> Self {
        Self { units: units.into() }
    }
}

impl ObuParser for ScriptedParser {
    fn parse_temporal_unit(&mut self, data: &Bytes) -> anyhow::Result<TemporalUnit> {
        if data.is_empty() {
            bail!("empty temporal unit");
        }

        self.units.pop_front().ok_or_else(|| anyhow!("no temporal unit left"))
    }
}

/// Reads a segment id, a skip flag and a luma mode per 4x4 block, and paints the block with a
/// value derived from them.
pub(crate) struct SymbolTileDecoder;

impl TileDecoder for SymbolTileDecoder {
    fn decode_tile(
        &self,
        tile: &Tile,
        reader: &mut EntropyDecoder,
        context: &mut SymbolDecoderContext,
        scratch: &mut DecoderScratchBuffer,
        frame: &RefCountedBufferPtr,
    ) -> anyhow::Result<()> {
        let segmentation = &tile.header.segmentation_params;
        let read_segment_ids =
            segmentation.segmentation_enabled && segmentation.segmentation_update_map;

        let (width, height) = {
            let buffer = frame.read();
            if buffer.yuv_buffer().pixel_size() != 1 {
                bail!("only 8-bit frames are supported");
            }
            let yuv = buffer.yuv_buffer();
            (yuv.displayed_width(0) as usize, yuv.displayed_height(0) as usize)
        };

        scratch.clear_block_decoded();

        for row4x4 in tile.mi_row_start..tile.mi_row_end {
            for column4x4 in tile.mi_col_start..tile.mi_col_end {
                let segment_id = if read_segment_ids {
                    reader.read_symbol(&mut context.segment_id_cdf[0], MAX_SEGMENTS)
                } else {
                    0
                };
                let skip = reader.read_bool(&mut context.skip_cdf[0]);
                let mode = if tile.header.frame_is_intra() {
                    reader.read_symbol(&mut context.intra_frame_y_mode_cdf[0][0], INTRA_MODES)
                } else {
                    reader.read_symbol(&mut context.y_mode_cdf[0], INTRA_MODES)
                };

                let (row, column) = (row4x4 as usize, column4x4 as usize);
                let value =
                    0x80 | ((mode as u8) << 3) | ((segment_id as u8 & 0x3) << 1) | skip as u8;
                let x_start = (column * 4).min(width);
                let x_end = (x_start + 4).min(width);

                // Other tiles of the frame may be written at the same time.
                let mut buffer = frame.write();
                if read_segment_ids {
                    buffer.segmentation_map_mut()[(row, column)] = segment_id as i8;
                }
                for y in row * 4..(row * 4 + 4).min(height) {
                    buffer.row_mut(0, y)[x_start..x_end].fill(value);
                }
                drop(buffer);

                scratch.set_block_decoded(0, (row % 32) as isize, (column % 32) as isize, true);
            }
        }

        Ok(())
    }
}

/// [`SymbolTileDecoder`] recording how many tiles are decoded at the same time.
#[derive(Default)]
pub(crate) struct ConcurrencyTileDecoder {
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl TileDecoder for ConcurrencyTileDecoder {
    fn decode_tile(
        &self,
        tile: &Tile,
        reader: &mut EntropyDecoder,
        context: &mut SymbolDecoderContext,
        scratch: &mut DecoderScratchBuffer,
        frame: &RefCountedBufferPtr,
    ) -> anyhow::Result<()> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));

        let result = SymbolTileDecoder.decode_tile(tile, reader, context, scratch, frame);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        result
    }
}

/// Pseudo-random tile payload.
fn tile_payload(seed: u8, tile: usize) -> Vec<u8> {
    let mut state = ((u32::from(seed) << 8) | tile as u32).wrapping_mul(2654435761) | 1;

    (0..256)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Tile groups of two tiles each covering the layout of `tile_info`.
fn tile_groups(tile_info: &TileInfo, seed: u8) -> Vec<TileGroup> {
    let tiles: Vec<usize> = (0..tile_info.num_tiles()).collect();

    tiles
        .chunks(2)
        .map(|group| {
            let mut data = Vec::new();
            for (i, tile) in group.iter().enumerate() {
                let payload = tile_payload(seed, *tile);
                if i + 1 < group.len() {
                    data.extend_from_slice(&(payload.len() as u32 - 1).to_le_bytes());
                }
                data.extend_from_slice(&payload);
            }

            TileGroup {
                data: Bytes::from(data),
                tile_start: group[0],
                tile_end: group[group.len() - 1],
            }
        })
        .collect()
}

fn frame_unit(
    mut header: FrameHeader,
    width: u32,
    height: u32,
    tile_cols: u32,
    tile_rows: u32,
    seed: u8,
) -> FrameUnit {
    header.set_frame_size(width, height);
    header.tile_info = TileInfo::uniform(tile_cols, tile_rows, header.rows4x4, header.columns4x4);
    let tile_groups = tile_groups(&header.tile_info, seed);

    FrameUnit { header, tile_groups }
}

/// A shown key frame with its sequence header.
pub(crate) fn key_frame_unit(
    width: u32,
    height: u32,
    tile_cols: u32,
    tile_rows: u32,
    seed: u8,
) -> TemporalUnit {
    let header = FrameHeader {
        frame_type: FrameType::KeyFrame,
        show_frame: true,
        primary_ref_frame: PRIMARY_REF_NONE,
        refresh_frame_flags: 0xff,
        ..Default::default()
    };

    TemporalUnit {
        sequence_header: Some(SequenceHeader::default()),
        frames: vec![frame_unit(header, width, height, tile_cols, tile_rows, seed)],
    }
}

/// An inter frame taking its state from slot 0.
pub(crate) fn inter_frame_unit(
    width: u32,
    height: u32,
    tile_cols: u32,
    tile_rows: u32,
    seed: u8,
    refresh_frame_flags: u8,
    show_frame: bool,
) -> TemporalUnit {
    let header = FrameHeader {
        frame_type: FrameType::InterFrame,
        show_frame,
        primary_ref_frame: 0,
        ref_frame_idx: [0; 7],
        refresh_frame_flags,
        order_hint: u32::from(seed),
        ..Default::default()
    };

    TemporalUnit {
        sequence_header: None,
        frames: vec![frame_unit(header, width, height, tile_cols, tile_rows, seed)],
    }
}

/// Shows the frame of reference slot `slot`.
pub(crate) fn show_existing_unit(slot: u8) -> TemporalUnit {
    let header = FrameHeader {
        show_existing_frame: true,
        frame_to_show_map_idx: slot,
        ..Default::default()
    };

    TemporalUnit { sequence_header: None, frames: vec![FrameUnit { header, tile_groups: vec![] }] }
}

/// CRC of the visible luma samples of `frame`.
pub(crate) fn luma_crc(frame: &DecoderBuffer) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for y in 0..frame.displayed_height(0) as usize {
        hasher.update(frame.row(0, y));
    }

    hasher.finalize()
}
