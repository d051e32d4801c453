// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding of the partition symbol of a square block.

use enumn::N;

use crate::codec::av1::cdf::partition_cdf_size;
use crate::codec::av1::cdf::SymbolDecoderContext;
use crate::codec::av1::entropy::EntropyDecoder;
use crate::codec::av1::entropy::CDF_MAX_PROBABILITY;

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Partition {
    #[default]
    None = 0,
    Horizontal = 1,
    Vertical = 2,
    Split = 3,
    HorizontalWithTopSplit = 4,
    HorizontalWithBottomSplit = 5,
    VerticalWithLeftSplit = 6,
    VerticalWithRightSplit = 7,
    Horizontal4 = 8,
    Vertical4 = 9,
}

/// Probability of `partition` in an inverted partition CDF.
fn element_probability(cdf: &[u16], partition: Partition) -> u16 {
    let index = partition as usize;
    let upper = if index > 0 { cdf[index - 1] } else { CDF_MAX_PROBABILITY };
    upper - cdf[index]
}

/// Builds the boolean CDF of "split" against the other choice from the probabilities of
/// `partitions`. Partitions that cannot be coded for the block size are skipped.
fn gather(cdf: &[u16], block_size_log2: usize, partitions: [Partition; 6]) -> [u16; 3] {
    let symbol_count = partition_cdf_size(block_size_log2);

    let mut probability = CDF_MAX_PROBABILITY;
    for partition in partitions.iter().filter(|p| (**p as usize) < symbol_count) {
        probability -= element_probability(cdf, *partition);
    }

    [CDF_MAX_PROBABILITY - probability, 0, 0]
}

/// Boolean CDF of "split" against "vertical", for blocks whose right half is outside the frame.
pub fn gather_horizontal_alike(cdf: &[u16], block_size_log2: usize) -> [u16; 3] {
    gather(
        cdf,
        block_size_log2,
        [
            Partition::Horizontal,
            Partition::Split,
            Partition::HorizontalWithTopSplit,
            Partition::HorizontalWithBottomSplit,
            Partition::VerticalWithLeftSplit,
            Partition::Horizontal4,
        ],
    )
}

/// Boolean CDF of "split" against "horizontal", for blocks whose bottom half is outside the
/// frame.
pub fn gather_vertical_alike(cdf: &[u16], block_size_log2: usize) -> [u16; 3] {
    gather(
        cdf,
        block_size_log2,
        [
            Partition::Vertical,
            Partition::Split,
            Partition::HorizontalWithTopSplit,
            Partition::VerticalWithLeftSplit,
            Partition::VerticalWithRightSplit,
            Partition::Vertical4,
        ],
    )
}

/// Reads the partition of a square block of `4 << block_size_log2` luma samples.
///
/// `has_rows` and `has_columns` tell whether the bottom and right halves of the block are
/// inside the frame. When only one of them is, the choice is reduced to "split" or a
/// partition along the frame edge, read with a CDF gathered from the full one and left
/// unadapted.
pub fn read_partition(
    reader: &mut EntropyDecoder,
    context: &mut SymbolDecoderContext,
    block_size_log2: usize,
    partition_context: usize,
    has_rows: bool,
    has_columns: bool,
) -> Partition {
    // Blocks smaller than 8x8 cannot be partitioned.
    if block_size_log2 == 0 {
        return Partition::None;
    }

    if !has_rows && !has_columns {
        return Partition::Split;
    }

    let (cdf, symbol_count) = context.partition_cdf_mut(block_size_log2, partition_context);

    if has_rows && has_columns {
        return Partition::n(reader.read_symbol(cdf, symbol_count) as u32).unwrap_or_default();
    }

    if has_columns {
        let cdf = gather_vertical_alike(cdf, block_size_log2);
        if reader.read_bool_without_cdf_update(&cdf) {
            Partition::Split
        } else {
            Partition::Horizontal
        }
    } else {
        let cdf = gather_horizontal_alike(cdf, block_size_log2);
        if reader.read_bool_without_cdf_update(&cdf) {
            Partition::Split
        } else {
            Partition::Vertical
        }
    }
}
