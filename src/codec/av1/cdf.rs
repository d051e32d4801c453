// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Adaptive CDF tables carried from one frame to the next.
//!
//! The default tables are written in the notation of the AV1 specification (increasing
//! probabilities, without the implied final 32768) and stored inverted, as expected by
//! [`EntropyDecoder`](crate::codec::av1::entropy::EntropyDecoder).

use crate::codec::av1::entropy::CDF_MAX_PROBABILITY;

pub const INTRA_MODES: usize = 13;
pub const INTRA_MODE_CONTEXTS: usize = 5;
pub const BLOCK_SIZE_GROUPS: usize = 4;
pub const PARTITION_BLOCK_SIZES: usize = 5;
pub const PARTITION_CONTEXTS: usize = 4;
pub const PARTITION_TYPES: usize = 10;
pub const SKIP_CONTEXTS: usize = 3;
pub const INTRA_INTER_CONTEXTS: usize = 4;
pub const DELTA_SYMBOLS: usize = 4;
pub const FRAME_LF_COUNT: usize = 4;
pub const SEGMENT_ID_CONTEXTS: usize = 3;
pub const SEGMENT_ID_PREDICTED_CONTEXTS: usize = 3;
pub const MAX_SEGMENTS: usize = 8;

/// Builds an inverted CDF of `M + 1` symbols from its first `M` increasing probabilities. The
/// remaining entries, adaptation counter included, are zero.
const fn inverse_cdf<const M: usize, const N: usize>(probabilities: [u16; M]) -> [u16; N] {
    assert!(N >= M + 2);

    let mut cdf = [0; N];
    let mut i = 0;
    while i < M {
        cdf[i] = CDF_MAX_PROBABILITY - probabilities[i];
        i += 1;
    }

    cdf
}

const DEFAULT_INTRA_FRAME_Y_MODE_CDF: [[[u16; INTRA_MODES + 1]; INTRA_MODE_CONTEXTS];
    INTRA_MODE_CONTEXTS] = [
    [
        inverse_cdf([
            15588, 17027, 19338, 20218, 20682, 21110, 21825, 23244, 24189, 28165, 29093, 30466,
        ]),
        inverse_cdf([
            12016, 18066, 19516, 20303, 20719, 21444, 21888, 23032, 24434, 28658, 30172, 31409,
        ]),
        inverse_cdf([
            10052, 10771, 22296, 22788, 23055, 23239, 24133, 25620, 26160, 29336, 29929, 31567,
        ]),
        inverse_cdf([
            14091, 15406, 16442, 18808, 19136, 19546, 19998, 22096, 24746, 29585, 30958, 32462,
        ]),
        inverse_cdf([
            12122, 13265, 15603, 16501, 18609, 20033, 22391, 25583, 26437, 30261, 31073, 32475,
        ]),
    ],
    [
        inverse_cdf([
            10023, 19585, 20848, 21440, 21832, 22760, 23089, 24023, 25381, 29014, 30482, 31436,
        ]),
        inverse_cdf([
            5983, 24099, 24560, 24886, 25066, 25795, 25913, 26423, 27610, 29905, 31276, 31794,
        ]),
        inverse_cdf([
            7444, 12781, 20177, 20728, 21077, 21607, 22170, 23405, 24469, 27915, 29090, 30492,
        ]),
        inverse_cdf([
            8537, 14689, 15432, 17087, 17408, 18172, 18408, 19825, 24649, 29153, 31096, 32210,
        ]),
        inverse_cdf([
            7543, 14231, 15496, 16195, 17905, 20717, 21984, 24516, 26001, 29675, 30981, 31994,
        ]),
    ],
    [
        inverse_cdf([
            12613, 13591, 21383, 22004, 22312, 22577, 23401, 25055, 25729, 29538, 30305, 32077,
        ]),
        inverse_cdf([
            9687, 13470, 18506, 19230, 19604, 20147, 20695, 22062, 23219, 27743, 29211, 30907,
        ]),
        inverse_cdf([
            6183, 6505, 26024, 26252, 26366, 26434, 27082, 28354, 28555, 30467, 30794, 32086,
        ]),
        inverse_cdf([
            10718, 11734, 14954, 17224, 17565, 17924, 18561, 21523, 23878, 28975, 30287, 32252,
        ]),
        inverse_cdf([
            9194, 9858, 16501, 17263, 18424, 19171, 21563, 25961, 26561, 30072, 30737, 32463,
        ]),
    ],
    [
        inverse_cdf([
            12602, 14399, 15488, 18381, 18778, 19315, 19724, 21419, 25060, 29696, 30917, 32409,
        ]),
        inverse_cdf([
            8203, 13821, 14524, 17105, 17439, 18131, 18404, 19468, 25225, 29485, 31158, 32342,
        ]),
        inverse_cdf([
            8451, 9731, 15004, 17643, 18012, 18425, 19070, 21538, 24605, 29118, 30078, 32018,
        ]),
        inverse_cdf([
            7714, 9048, 9516, 16667, 16817, 16994, 17153, 18767, 26743, 30389, 31536, 32528,
        ]),
        inverse_cdf([
            8843, 10280, 11496, 15317, 16652, 17943, 19108, 22718, 25769, 29953, 30983, 32485,
        ]),
    ],
    [
        inverse_cdf([
            12578, 13671, 15979, 16834, 19075, 20913, 22989, 25449, 26219, 30214, 31150, 32477,
        ]),
        inverse_cdf([
            9563, 13626, 15080, 15892, 17756, 20863, 22207, 24236, 25380, 29653, 31143, 32277,
        ]),
        inverse_cdf([
            8356, 8901, 17616, 18256, 19350, 20106, 22598, 25947, 26466, 29900, 30523, 32261,
        ]),
        inverse_cdf([
            10835, 11815, 13124, 16042, 17018, 18039, 18947, 22753, 24615, 29489, 30883, 32482,
        ]),
        inverse_cdf([
            7618, 8288, 9859, 10509, 15386, 18657, 22903, 28776, 29180, 31355, 31802, 32593,
        ]),
    ],
];

const DEFAULT_Y_MODE_CDF: [[u16; INTRA_MODES + 1]; BLOCK_SIZE_GROUPS] = [
    inverse_cdf([
        22801, 23489, 24293, 24756, 25601, 26123, 26606, 27418, 27945, 29228, 29791, 30662,
    ]),
    inverse_cdf([
        18673, 19845, 22631, 23318, 23950, 24649, 25527, 27364, 28152, 29701, 29984, 30852,
    ]),
    inverse_cdf([
        19770, 20979, 23396, 23939, 24241, 24654, 25136, 27073, 27830, 29360, 29730, 30659,
    ]),
    inverse_cdf([
        20155, 21301, 22838, 23178, 23261, 23533, 23703, 24804, 25352, 26575, 27016, 28049,
    ]),
];

const DEFAULT_PARTITION_CDF: [[[u16; PARTITION_TYPES + 1]; PARTITION_CONTEXTS];
    PARTITION_BLOCK_SIZES] = [
    // 8x8
    [
        inverse_cdf([19132, 25510, 30392]),
        inverse_cdf([13928, 19855, 28540]),
        inverse_cdf([12522, 23679, 28629]),
        inverse_cdf([9896, 18783, 25853]),
    ],
    // 16x16
    [
        inverse_cdf([15597, 20929, 24571, 26706, 27664, 28821, 29601, 30571, 31902]),
        inverse_cdf([7925, 11043, 16785, 22470, 23971, 25043, 26651, 28701, 29834]),
        inverse_cdf([5414, 13269, 15111, 20488, 22360, 24500, 25537, 26336, 32117]),
        inverse_cdf([2662, 6362, 8614, 20860, 23053, 24778, 26436, 27829, 31171]),
    ],
    // 32x32
    [
        inverse_cdf([18462, 20920, 23124, 27647, 28227, 29049, 29519, 30178, 31544]),
        inverse_cdf([7689, 9060, 12056, 24992, 25660, 26182, 26951, 28041, 29052]),
        inverse_cdf([6015, 9009, 10062, 24544, 25409, 26545, 27071, 27526, 32047]),
        inverse_cdf([1394, 2208, 2796, 28614, 29061, 29466, 29840, 30185, 31899]),
    ],
    // 64x64
    [
        inverse_cdf([20137, 21547, 23078, 29566, 29837, 30261, 30524, 30892, 31724]),
        inverse_cdf([6732, 7490, 9497, 27944, 28250, 28515, 28969, 29630, 30104]),
        inverse_cdf([5945, 7663, 8348, 28683, 29117, 29749, 30064, 30298, 32238]),
        inverse_cdf([870, 1212, 1487, 31198, 31394, 31574, 31743, 31881, 32332]),
    ],
    // 128x128
    [
        inverse_cdf([27899, 28219, 28529, 32484, 32539, 32619, 32639]),
        inverse_cdf([6607, 6990, 8268, 32060, 32219, 32338, 32371]),
        inverse_cdf([5429, 6676, 7122, 32027, 32227, 32531, 32582]),
        inverse_cdf([711, 966, 1172, 32448, 32538, 32617, 32664]),
    ],
];

const DEFAULT_SKIP_CDF: [[u16; 3]; SKIP_CONTEXTS] =
    [inverse_cdf([31671]), inverse_cdf([16515]), inverse_cdf([4576])];

const DEFAULT_INTRA_INTER_CDF: [[u16; 3]; INTRA_INTER_CONTEXTS] =
    [inverse_cdf([806]), inverse_cdf([16662]), inverse_cdf([20186]), inverse_cdf([26538])];

const DEFAULT_INTRABC_CDF: [u16; 3] = inverse_cdf([30531]);

const DEFAULT_DELTA_CDF: [u16; DELTA_SYMBOLS + 1] = inverse_cdf([28160, 32120, 32677]);

const DEFAULT_SEGMENT_ID_CDF: [[u16; MAX_SEGMENTS + 1]; SEGMENT_ID_CONTEXTS] = [
    inverse_cdf([5622, 7893, 16093, 18233, 27809, 28373, 32533]),
    inverse_cdf([14274, 18230, 22557, 24935, 29980, 30851, 32344]),
    inverse_cdf([27527, 28487, 28723, 28890, 32397, 32647, 32679]),
];

const DEFAULT_SEGMENT_ID_PREDICTED_CDF: [[u16; 3]; SEGMENT_ID_PREDICTED_CONTEXTS] =
    [inverse_cdf([16384]), inverse_cdf([16384]), inverse_cdf([16384])];

/// Number of partition types that can be coded for a square block whose width is
/// `4 << block_size_log2` luma samples.
pub const fn partition_cdf_size(block_size_log2: usize) -> usize {
    match block_size_log2 {
        // Horizontal, vertical, none and split only.
        1 => 4,
        // No 4-way splits.
        5 => 8,
        _ => PARTITION_TYPES,
    }
}

/// The set of CDFs used to decode the symbols of a frame.
///
/// Each tile starts from a copy of the context of the frame, and the context of one tile is
/// saved with the frame at the end of its decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolDecoderContext {
    pub intra_frame_y_mode_cdf:
        [[[u16; INTRA_MODES + 1]; INTRA_MODE_CONTEXTS]; INTRA_MODE_CONTEXTS],
    pub y_mode_cdf: [[u16; INTRA_MODES + 1]; BLOCK_SIZE_GROUPS],
    /// Indexed by `block_size_log2 - 1`, then by partition context.
    pub partition_cdf: [[[u16; PARTITION_TYPES + 1]; PARTITION_CONTEXTS]; PARTITION_BLOCK_SIZES],
    pub skip_cdf: [[u16; 3]; SKIP_CONTEXTS],
    pub intra_inter_cdf: [[u16; 3]; INTRA_INTER_CONTEXTS],
    pub intrabc_cdf: [u16; 3],
    pub delta_q_cdf: [u16; DELTA_SYMBOLS + 1],
    pub delta_lf_cdf: [u16; DELTA_SYMBOLS + 1],
    pub delta_lf_multi_cdf: [[u16; DELTA_SYMBOLS + 1]; FRAME_LF_COUNT],
    pub segment_id_cdf: [[u16; MAX_SEGMENTS + 1]; SEGMENT_ID_CONTEXTS],
    pub segment_id_predicted_cdf: [[u16; 3]; SEGMENT_ID_PREDICTED_CONTEXTS],
}

impl Default for SymbolDecoderContext {
    fn default() -> Self {
        Self {
            intra_frame_y_mode_cdf: DEFAULT_INTRA_FRAME_Y_MODE_CDF,
            y_mode_cdf: DEFAULT_Y_MODE_CDF,
            partition_cdf: DEFAULT_PARTITION_CDF,
            skip_cdf: DEFAULT_SKIP_CDF,
            intra_inter_cdf: DEFAULT_INTRA_INTER_CDF,
            intrabc_cdf: DEFAULT_INTRABC_CDF,
            delta_q_cdf: DEFAULT_DELTA_CDF,
            delta_lf_cdf: DEFAULT_DELTA_CDF,
            delta_lf_multi_cdf: [DEFAULT_DELTA_CDF; FRAME_LF_COUNT],
            segment_id_cdf: DEFAULT_SEGMENT_ID_CDF,
            segment_id_predicted_cdf: DEFAULT_SEGMENT_ID_PREDICTED_CDF,
        }
    }
}

impl SymbolDecoderContext {
    /// Restores the default CDFs of the intra frame luma modes.
    ///
    /// These are not carried from one frame to the next: the specification keeps them out of
    /// the saved CDFs.
    pub fn reset_intra_frame_y_mode_cdf(&mut self) {
        self.intra_frame_y_mode_cdf = DEFAULT_INTRA_FRAME_Y_MODE_CDF;
    }

    /// Clears the adaptation counter of every CDF, as done when a context is saved at the end
    /// of a frame.
    pub fn reset_counters(&mut self) {
        fn reset<const N: usize>(cdfs: &mut [[u16; N]], symbol_count: usize) {
            for cdf in cdfs {
                cdf[symbol_count] = 0;
            }
        }

        for cdfs in self.intra_frame_y_mode_cdf.iter_mut() {
            reset(cdfs, INTRA_MODES);
        }
        reset(&mut self.y_mode_cdf, INTRA_MODES);
        for (index, cdfs) in self.partition_cdf.iter_mut().enumerate() {
            reset(cdfs, partition_cdf_size(index + 1));
        }
        reset(&mut self.skip_cdf, 2);
        reset(&mut self.intra_inter_cdf, 2);
        reset(std::slice::from_mut(&mut self.intrabc_cdf), 2);
        reset(std::slice::from_mut(&mut self.delta_q_cdf), DELTA_SYMBOLS);
        reset(std::slice::from_mut(&mut self.delta_lf_cdf), DELTA_SYMBOLS);
        reset(&mut self.delta_lf_multi_cdf, DELTA_SYMBOLS);
        reset(&mut self.segment_id_cdf, MAX_SEGMENTS);
        reset(&mut self.segment_id_predicted_cdf, 2);
    }

    /// Returns the CDF of the partition of a square block of `4 << block_size_log2` luma
    /// samples, together with its symbol count.
    pub fn partition_cdf_mut(
        &mut self,
        block_size_log2: usize,
        context: usize,
    ) -> (&mut [u16; PARTITION_TYPES + 1], usize) {
        (&mut self.partition_cdf[block_size_log2 - 1][context], partition_cdf_size(block_size_log2))
    }
}
