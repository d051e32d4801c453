// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Adaptive multi-symbol arithmetic decoder, as described in section 8.2 of the AV1
//! specification.
//!
//! CDFs are stored inverted: entry `i` holds `32768 - P(symbol <= i)` in 15-bit precision, so an
//! array describing `n` symbols is decreasing and its entry `n - 1` is always zero. Entry `n` is
//! the adaptation counter, saturating at 32.

use thiserror::Error;

use crate::codec::av1::helpers::floor_log2;

/// Probability of the full range, in the 15-bit scale used by CDFs.
pub const CDF_MAX_PROBABILITY: u16 = 32768;
/// Largest value of the adaptation counter stored after the last CDF entry.
pub const CDF_MAX_COUNTER: u16 = 32;
/// Largest number of bits that can be read at once by [`EntropyDecoder::read_literal`].
pub const MAX_LITERAL_BITS: u32 = 32;

const WINDOW_SIZE: i32 = u64::BITS as i32;
const READ_BIT_MASK: u32 = !255;
const CDF_PRECISION: u32 = 6;
const MINIMUM_PROBABILITY_PER_SYMBOL: u32 = 4;
/// Bit count set once the input is exhausted, large enough to never trigger another refill.
const LARGE_BIT_COUNT: i32 = 0x4000;
/// Largest symbol count decoded with a linear scan of the CDF.
const LINEAR_SEARCH_MAX_SYMBOLS: usize = 13;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntropyDecoderError {
    #[error("cannot read {0} bits as a literal, at most {MAX_LITERAL_BITS} are supported")]
    TooManyBitsRequested(u32),
}

/// Decoder for the symbols of one tile.
///
/// Reading past the end of the input never fails: the decoder keeps producing symbols as if the
/// input were padded, and it is up to the caller to detect a corrupt tile.
pub struct EntropyDecoder<'a> {
    data: &'a [u8],
    data_index: usize,
    /// Number of bits available in `window_diff`, offset by 15.
    bits: i32,
    /// Same as SymbolRange, in `[32768, 65535]` between calls.
    values_in_range: u32,
    /// Difference between the high end of the current range and the actual coded value, minus
    /// one. The most significant bits are aligned with `values_in_range`.
    window_diff: u64,
    allow_update_cdf: bool,
}

impl<'a> EntropyDecoder<'a> {
    /// Creates a decoder reading the symbols of `data`. If `allow_update_cdf` is false, the
    /// CDFs passed to the symbol reading methods are never modified.
    pub fn new(data: &'a [u8], allow_update_cdf: bool) -> Self {
        let mut decoder = Self {
            data,
            data_index: 0,
            bits: -15,
            values_in_range: u32::from(CDF_MAX_PROBABILITY),
            window_diff: (1u64 << (WINDOW_SIZE - 1)) - 1,
            allow_update_cdf,
        };

        decoder.populate_bits();

        decoder
    }

    pub fn allow_update_cdf(&self) -> bool {
        self.allow_update_cdf
    }

    /// Reads an equiprobable bit.
    pub fn read_bit(&mut self) -> u32 {
        let curr = ((self.values_in_range & READ_BIT_MASK) >> 1) + MINIMUM_PROBABILITY_PER_SYMBOL;
        let zero_threshold = u64::from(curr) << (WINDOW_SIZE - 16);

        let bit = if self.window_diff >= zero_threshold {
            self.values_in_range -= curr;
            self.window_diff -= zero_threshold;
            0
        } else {
            self.values_in_range = curr;
            1
        };

        self.normalize_range();

        bit
    }

    /// Reads an unsigned literal of `num_bits` equiprobable bits, most significant bit first.
    pub fn read_literal(&mut self, num_bits: u32) -> Result<u32, EntropyDecoderError> {
        if num_bits > MAX_LITERAL_BITS {
            return Err(EntropyDecoderError::TooManyBitsRequested(num_bits));
        }

        let mut literal = 0;
        for bit in (0..num_bits).rev() {
            literal |= self.read_bit() << bit;
        }

        Ok(literal)
    }

    /// Reads a symbol in `[0, symbol_count)` using the inverted CDF in `cdf`, which must have
    /// at least `symbol_count + 1` entries. The CDF is adapted to the decoded symbol unless
    /// updates are disabled.
    pub fn read_symbol(&mut self, cdf: &mut [u16], symbol_count: usize) -> usize {
        debug_assert!((2..=16).contains(&symbol_count));
        debug_assert!(cdf.len() > symbol_count);

        let symbol = if symbol_count > LINEAR_SEARCH_MAX_SYMBOLS {
            self.read_symbol_binary_search(cdf, symbol_count)
        } else {
            self.read_symbol_linear_search(cdf, symbol_count)
        };

        if self.allow_update_cdf {
            update_cdf(cdf, symbol_count, symbol);
        }

        symbol
    }

    /// Same as [`EntropyDecoder::read_symbol`] for a symbol count known at compile time.
    pub fn read_symbol_n<const N: usize>(&mut self, cdf: &mut [u16]) -> usize {
        const { assert!(N >= 3 && N <= 16) };
        self.read_symbol(cdf, N)
    }

    /// Reads a boolean symbol using a 3-entry inverted CDF. The CDF is adapted to the decoded
    /// value unless updates are disabled.
    pub fn read_bool(&mut self, cdf: &mut [u16]) -> bool {
        debug_assert!(cdf.len() >= 3);

        let symbol = self.read_bool_impl(cdf[0]);
        if self.allow_update_cdf {
            update_bool_cdf(cdf, symbol);
        }

        symbol
    }

    /// Reads a boolean symbol whose CDF is never adapted, such as one assembled on the fly.
    pub fn read_bool_without_cdf_update(&mut self, cdf: &[u16]) -> bool {
        self.read_bool_impl(cdf[0])
    }

    fn read_bool_impl(&mut self, cdf: u16) -> bool {
        let symbol_value = (self.window_diff >> (WINDOW_SIZE - 16)) as u32;
        let curr = scale_cdf(self.values_in_range >> 8, cdf, 1);

        let symbol = symbol_value < curr;
        if symbol {
            self.values_in_range = curr;
        } else {
            self.values_in_range -= curr;
            self.window_diff -= u64::from(curr) << (WINDOW_SIZE - 16);
        }

        self.normalize_range();

        symbol
    }

    fn read_symbol_linear_search(&mut self, cdf: &[u16], symbol_count: usize) -> usize {
        debug_assert_eq!(cdf[symbol_count - 1], 0);

        let last_symbol = symbol_count - 1;
        let symbol_value = (self.window_diff >> (WINDOW_SIZE - 16)) as u32;
        let range = self.values_in_range >> 8;
        let mut delta = MINIMUM_PROBABILITY_PER_SYMBOL * last_symbol as u32;
        let mut prev;
        let mut curr = self.values_in_range;
        let mut symbol = 0;

        // The last entry of the CDF is zero, so the loop always ends there at the latest.
        loop {
            prev = curr;
            curr = ((range * (u32::from(cdf[symbol]) >> CDF_PRECISION)) >> 1) + delta;
            if symbol_value >= curr {
                break;
            }
            symbol += 1;
            delta -= MINIMUM_PROBABILITY_PER_SYMBOL;
        }

        self.consume_range(prev, curr);

        symbol
    }

    fn read_symbol_binary_search(&mut self, cdf: &[u16], symbol_count: usize) -> usize {
        debug_assert_eq!(cdf[symbol_count - 1], 0);

        let last_symbol = symbol_count - 1;
        let symbol_value = (self.window_diff >> (WINDOW_SIZE - 16)) as u32;
        let range = self.values_in_range >> 8;
        let mut prev = self.values_in_range;
        let mut curr = 0;
        let mut low = 0;
        let mut high = last_symbol;

        // Invariant: the decoded symbol lies in [low, high], and prev/curr are the scaled
        // probabilities bounding it.
        while low < high {
            let mid = (low + high) / 2;
            let scaled = scale_cdf(range, cdf[mid], last_symbol - mid);
            if symbol_value < scaled {
                low = mid + 1;
                prev = scaled;
            } else {
                high = mid;
                curr = scaled;
            }
        }

        self.consume_range(prev, curr);

        low
    }

    fn consume_range(&mut self, prev: u32, curr: u32) {
        self.values_in_range = prev - curr;
        self.window_diff -= u64::from(curr) << (WINDOW_SIZE - 16);
        self.normalize_range();
    }

    fn populate_bits(&mut self) {
        let mut shift = WINDOW_SIZE - 9 - (self.bits + 15);

        while shift >= 0 && self.data_index < self.data.len() {
            self.window_diff ^= u64::from(self.data[self.data_index]) << shift;
            self.data_index += 1;
            self.bits += 8;
            shift -= 8;
        }

        if self.data_index >= self.data.len() {
            self.bits = LARGE_BIT_COUNT;
        }
    }

    fn normalize_range(&mut self) {
        let bits_used = 15 - floor_log2(self.values_in_range);
        self.bits -= bits_used as i32;
        self.window_diff = (self.window_diff.wrapping_add(1) << bits_used).wrapping_sub(1);
        self.values_in_range <<= bits_used;

        if self.bits < 0 {
            self.populate_bits();
        }
    }
}

/// Scales the inverted probability `cdf` to the current range, keeping at least
/// MINIMUM_PROBABILITY_PER_SYMBOL for each of the `remaining_symbols` above it.
#[inline]
fn scale_cdf(range: u32, cdf: u16, remaining_symbols: usize) -> u32 {
    ((range * (u32::from(cdf) >> CDF_PRECISION)) >> 1)
        + MINIMUM_PROBABILITY_PER_SYMBOL * remaining_symbols as u32
}

/// Adapts `cdf` to the decoding of `symbol`, as described in section 8.2.6 of the
/// specification.
pub fn update_cdf(cdf: &mut [u16], symbol_count: usize, symbol: usize) {
    let count = cdf[symbol_count];
    let rate = (4 | (count >> 4)) + u16::from(symbol_count > 3);

    for (i, value) in cdf[..symbol_count - 1].iter_mut().enumerate() {
        if i < symbol {
            *value += (CDF_MAX_PROBABILITY - *value) >> rate;
        } else {
            *value -= *value >> rate;
        }
    }

    cdf[symbol_count] += u16::from(count < CDF_MAX_COUNTER);
}

fn update_bool_cdf(cdf: &mut [u16], symbol: bool) {
    let count = cdf[2];
    let rate = 4 | (count >> 4);

    if symbol {
        cdf[0] += (CDF_MAX_PROBABILITY - cdf[0]) >> rate;
    } else {
        cdf[0] -= cdf[0] >> rate;
    }

    cdf[2] += u16::from(count < CDF_MAX_COUNTER);
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: [u8; 12] =
        [0x3c, 0x5a, 0xa5, 0x96, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0];

    /// Inverted CDF of `n` equiprobable symbols, counter included.
    fn uniform_cdf(n: usize) -> Vec<u16> {
        let mut cdf: Vec<u16> = (1..n).map(|i| (32768 - (32768 * i) / n) as u16).collect();
        cdf.extend_from_slice(&[0, 0]);
        cdf
    }

    #[test]
    fn equiprobable_bits() {
        let mut decoder = EntropyDecoder::new(&[0x80, 0x00], false);
        let bits: Vec<u32> = (0..8).map(|_| decoder.read_bit()).collect();
        assert_eq!(bits, [1, 0, 0, 0, 0, 0, 0, 0]);

        let mut decoder = EntropyDecoder::new(&[0x00, 0x00], false);
        assert!((0..8).all(|_| decoder.read_bit() == 0));

        let mut decoder = EntropyDecoder::new(&[0xff, 0xff], false);
        assert!((0..8).all(|_| decoder.read_bit() == 1));
    }

    #[test]
    fn half_probability_bool_matches_bits() {
        let cdf = [16384, 0, 0];
        let mut decoder = EntropyDecoder::new(&[0x80, 0x00], false);
        let values: Vec<bool> =
            (0..8).map(|_| decoder.read_bool_without_cdf_update(&cdf)).collect();
        assert_eq!(values, [true, false, false, false, false, false, false, false]);

        let mut cdf = [16384, 0, 0];
        let mut decoder = EntropyDecoder::new(&[0x80, 0x00], false);
        assert!(decoder.read_bool(&mut cdf));
        assert!(!decoder.read_bool(&mut cdf));
        assert_eq!(cdf, [16384, 0, 0]);
    }

    #[test]
    fn literals() {
        let mut decoder = EntropyDecoder::new(&STREAM, false);
        assert_eq!(decoder.read_literal(32), Ok(1009050439));
        assert_eq!(decoder.read_literal(16), Ok(56758));
        assert_eq!(decoder.read_literal(0), Ok(0));
        assert_eq!(decoder.read_literal(33), Err(EntropyDecoderError::TooManyBitsRequested(33)));
    }

    #[test]
    fn adaptive_symbols() {
        let mut cdf4 = [24576, 16384, 8192, 0, 0];
        let mut cdf_bool = [16384, 0, 0];
        let mut cdf8 = [28672, 24576, 20480, 16384, 12288, 8192, 4096, 0, 0];

        let mut decoder = EntropyDecoder::new(&STREAM, true);
        assert_eq!(decoder.read_literal(4), Ok(3));

        let mut decoded = vec![];
        for _ in 0..6 {
            decoded.push((
                decoder.read_symbol_n::<4>(&mut cdf4),
                decoder.read_bool(&mut cdf_bool),
                decoder.read_symbol_n::<8>(&mut cdf8),
            ));
        }

        assert_eq!(
            decoded,
            [
                (3, false, 0),
                (2, false, 5),
                (3, false, 6),
                (3, true, 2),
                (0, false, 2),
                (2, true, 3)
            ]
        );
        assert_eq!(cdf4, [25004, 18232, 9537, 0, 6]);
        assert_eq!(cdf_bool, [14971, 0, 6]);
        assert_eq!(cdf8, [28507, 25121, 19785, 15376, 11990, 7703, 3387, 0, 6]);
    }

    #[test]
    fn sixteen_symbols() {
        let mut cdf = uniform_cdf(16);
        assert_eq!(cdf[0], 30720);

        let mut decoder = EntropyDecoder::new(&STREAM, true);
        let symbols: Vec<usize> = (0..10).map(|_| decoder.read_symbol_n::<16>(&mut cdf)).collect();

        assert_eq!(symbols, [3, 12, 10, 3, 8, 5, 8, 11, 14, 9]);
        assert_eq!(
            cdf,
            [
                31274, 29783, 28292, 25185, 23694, 21303, 19812, 18322, 15027, 12514, 10204,
                7752, 5467, 3976, 1494, 0, 10
            ]
        );
    }

    #[test]
    fn binary_search_matches_linear_scan() {
        let data: Vec<u8> = (0..256u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();

        for n in 2..=16 {
            let mut linear = EntropyDecoder::new(&data, false);
            let mut binary = EntropyDecoder::new(&data, false);
            let cdf = uniform_cdf(n);

            for _ in 0..200 {
                assert_eq!(
                    linear.read_symbol_linear_search(&cdf, n),
                    binary.read_symbol_binary_search(&cdf, n),
                    "symbol count {}",
                    n
                );
            }
        }
    }

    #[test]
    fn decoding_is_deterministic() {
        let decode = || {
            let mut cdf = uniform_cdf(7);
            let mut decoder = EntropyDecoder::new(&STREAM, true);
            let symbols: Vec<usize> = (0..40).map(|_| decoder.read_symbol(&mut cdf, 7)).collect();
            (symbols, cdf)
        };

        assert_eq!(decode(), decode());
    }

    #[test]
    fn disabled_updates_keep_cdf() {
        let mut cdf = uniform_cdf(11);
        let original = cdf.clone();
        let mut decoder = EntropyDecoder::new(&STREAM, false);
        assert!(!decoder.allow_update_cdf());

        for _ in 0..30 {
            decoder.read_symbol_n::<11>(&mut cdf);
        }
        assert_eq!(cdf, original);
    }

    #[test]
    fn adaptation_saturates() {
        let data = [0u8; 64];
        let mut cdf = uniform_cdf(5);
        let mut decoder = EntropyDecoder::new(&data, true);

        for _ in 0..200 {
            let symbol = decoder.read_symbol_n::<5>(&mut cdf);
            assert!(symbol < 5);
            assert!(cdf[..4].windows(2).all(|w| w[0] >= w[1]));
            assert!(cdf[0] <= CDF_MAX_PROBABILITY);
            assert_eq!(cdf[4], 0);
        }
        assert_eq!(cdf[5], CDF_MAX_COUNTER);
    }

    #[test]
    fn reading_past_the_end() {
        let mut decoder = EntropyDecoder::new(&[0xab], false);
        let bits: Vec<u32> = (0..40).map(|_| decoder.read_bit()).collect();
        assert_eq!(
            bits,
            [
                1, 0, 1, 0, 1, 0, 1, 1, 0, 0, 0, 0, 0, 1, 0, 1, 0, 1, 0, 0, 1, 1, 1, 1, 1, 0, 1,
                0, 1, 0, 1, 1, 0, 0, 0, 0, 0, 1, 0, 1
            ]
        );

        let mut decoder = EntropyDecoder::new(&[], true);
        let mut cdf = uniform_cdf(16);
        for _ in 0..1000 {
            assert!(decoder.read_symbol(&mut cdf, 16) < 16);
        }
    }
}
