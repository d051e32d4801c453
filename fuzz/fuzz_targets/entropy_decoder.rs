#![no_main]

use cros_av1_core::codec::av1::cdf::SymbolDecoderContext;
use cros_av1_core::codec::av1::cdf::INTRA_MODES;
use cros_av1_core::codec::av1::entropy::EntropyDecoder;
use cros_av1_core::codec::av1::partition::read_partition;
use cros_av1_core::decoder::av1::split_tile_group;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&control, payload)) = data.split_first() else {
        return;
    };
    let tile_size_bytes = u32::from(control & 0x3) + 1;
    let num_tiles = usize::from((control >> 2) & 0x7) + 1;

    let Ok(tiles) = split_tile_group(payload, 0, num_tiles - 1, tile_size_bytes) else {
        return;
    };

    for tile in tiles {
        let mut context = SymbolDecoderContext::default();
        let mut reader = EntropyDecoder::new(tile, control & 0x80 == 0);

        for i in 0..64usize {
            match i % 5 {
                0 => {
                    reader.read_bit();
                }
                1 => {
                    let _ = reader.read_literal(i as u32 % 34);
                }
                2 => {
                    reader.read_symbol(&mut context.y_mode_cdf[i % 4], INTRA_MODES);
                }
                3 => {
                    reader.read_bool(&mut context.skip_cdf[i % 3]);
                }
                _ => {
                    read_partition(
                        &mut reader,
                        &mut context,
                        1 + i % 5,
                        i % 4,
                        i % 2 == 0,
                        i % 3 != 0,
                    );
                }
            }
        }
    }
});
