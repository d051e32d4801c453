#![no_main]

use anyhow::bail;
use bytes::Bytes;
use cros_av1_core::codec::av1::cdf::SymbolDecoderContext;
use cros_av1_core::codec::av1::entropy::EntropyDecoder;
use cros_av1_core::codec::av1::header::FrameHeader;
use cros_av1_core::codec::av1::header::FrameType;
use cros_av1_core::codec::av1::header::SequenceHeader;
use cros_av1_core::codec::av1::header::TileInfo;
use cros_av1_core::codec::av1::header::PRIMARY_REF_NONE;
use cros_av1_core::decoder::av1::Av1Decoder;
use cros_av1_core::decoder::av1::FrameUnit;
use cros_av1_core::decoder::av1::ObuParser;
use cros_av1_core::decoder::av1::TemporalUnit;
use cros_av1_core::decoder::av1::Tile;
use cros_av1_core::decoder::av1::TileDecoder;
use cros_av1_core::decoder::av1::TileGroup;
use cros_av1_core::decoder::buffer_pool::RefCountedBufferPtr;
use cros_av1_core::decoder::scratch::DecoderScratchBuffer;
use cros_av1_core::decoder::DecoderSettings;
use cros_av1_core::utils::simple_decode_loop;
use cros_av1_core::utils::IvfIterator;
use libfuzzer_sys::fuzz_target;

/// Takes the frame header fields from the first four bytes of each unit. The rest is the data of
/// its single tile.
struct FuzzParser;

impl ObuParser for FuzzParser {
    fn parse_temporal_unit(&mut self, data: &Bytes) -> anyhow::Result<TemporalUnit> {
        if data.len() < 4 {
            bail!("temporal unit too short");
        }

        let flags = data[0];
        let mut header = FrameHeader {
            frame_type: if flags & 1 == 0 { FrameType::KeyFrame } else { FrameType::InterFrame },
            show_frame: flags & 2 == 0,
            show_existing_frame: flags & 0x40 != 0,
            frame_to_show_map_idx: data[1] & 0x7,
            refresh_frame_flags: data[1],
            disable_cdf_update: flags & 0x80 != 0,
            ..Default::default()
        };
        header.showable_frame = !header.show_frame;
        header.primary_ref_frame = match header.frame_type {
            FrameType::KeyFrame => PRIMARY_REF_NONE,
            _ => u32::from((flags >> 2) & 0x7),
        };
        header.set_frame_size(u32::from(data[2] & 0x7f) + 1, u32::from(data[3] & 0x7f) + 1);
        header.tile_info = TileInfo::uniform(1, 1, header.rows4x4, header.columns4x4);

        let sequence_header =
            (header.frame_type == FrameType::KeyFrame).then(SequenceHeader::default);
        let tile_groups = vec![TileGroup { data: data.slice(4..), tile_start: 0, tile_end: 0 }];

        Ok(TemporalUnit { sequence_header, frames: vec![FrameUnit { header, tile_groups }] })
    }
}

/// Paints each 4x4 luma block according to a skip flag.
struct FuzzTileDecoder;

impl TileDecoder for FuzzTileDecoder {
    fn decode_tile(
        &self,
        tile: &Tile,
        reader: &mut EntropyDecoder,
        context: &mut SymbolDecoderContext,
        _: &mut DecoderScratchBuffer,
        frame: &RefCountedBufferPtr,
    ) -> anyhow::Result<()> {
        let mut buffer = frame.write();
        let width = buffer.yuv_buffer().displayed_width(0) as usize;
        let height = buffer.yuv_buffer().displayed_height(0) as usize;

        for row in tile.mi_row_start as usize..tile.mi_row_end as usize {
            for column in tile.mi_col_start as usize..tile.mi_col_end as usize {
                let value = if reader.read_bool(&mut context.skip_cdf[0]) { 0x10 } else { 0xe0 };
                let x_start = (column * 4).min(width);
                let x_end = (column * 4 + 4).min(width);
                for y in row * 4..(row * 4 + 4).min(height) {
                    buffer.row_mut(0, y)[x_start..x_end].fill(value);
                }
            }
        }

        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let Ok(mut decoder) = Av1Decoder::new(DecoderSettings::default(), FuzzParser, FuzzTileDecoder)
    else {
        return;
    };

    let _ = simple_decode_loop(&mut decoder, &mut IvfIterator::new(data), |_| ());
});
