// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use std::collections::TryReserveError;
use std::io::Cursor;
use std::ops::Index;
use std::ops::IndexMut;

use bytes::Buf;
use bytes::Bytes;

use crate::decoder::av1::Av1Decoder;
use crate::decoder::av1::DecoderBuffer;
use crate::decoder::av1::ObuParser;
use crate::decoder::av1::TileDecoder;
use crate::decoder::DecodeError;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub const fn align(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Row-major two-dimensional array whose storage is reused across resets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Array2D<T> {
    data: Vec<T>,
    rows: usize,
    columns: usize,
}

impl<T: Copy + Default> Array2D<T> {
    pub fn new() -> Self {
        Self { data: Vec::new(), rows: 0, columns: 0 }
    }

    /// Resizes the array to `rows` x `columns` and sets every element to its default value.
    ///
    /// The existing storage is kept if it is large enough. On allocation failure the array is
    /// left empty.
    pub fn reset(&mut self, rows: usize, columns: usize) -> Result<(), TryReserveError> {
        self.data.clear();
        self.rows = 0;
        self.columns = 0;

        // An overflowing size is reported as a capacity overflow by the reservation.
        let size = rows.checked_mul(columns).unwrap_or(usize::MAX);
        self.data.try_reserve_exact(size)?;
        self.data.resize(size, T::default());
        self.rows = rows;
        self.columns = columns;

        Ok(())
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Copies the contents of `other`, which must have the same dimensions.
    pub fn copy_from(&mut self, other: &Self) {
        debug_assert_eq!((self.rows, self.columns), (other.rows, other.columns));
        self.data.copy_from_slice(&other.data);
    }
}

impl<T> Array2D<T> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, row: usize) -> &[T] {
        &self.data[row * self.columns..(row + 1) * self.columns]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        &mut self.data[row * self.columns..(row + 1) * self.columns]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T> Index<(usize, usize)> for Array2D<T> {
    type Output = T;

    fn index(&self, (row, column): (usize, usize)) -> &Self::Output {
        debug_assert!(column < self.columns);
        &self.data[row * self.columns + column]
    }
}

impl<T> IndexMut<(usize, usize)> for Array2D<T> {
    fn index_mut(&mut self, (row, column): (usize, usize)) -> &mut Self::Output {
        debug_assert!(column < self.columns);
        &mut self.data[row * self.columns + column]
    }
}

/// Iterator over IVF packets.
pub struct IvfIterator<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> IvfIterator<'a> {
    const FILE_HEADER_SIZE: u64 = 32;
    const FRAME_HEADER_SIZE: usize = 12;

    pub fn new(data: &'a [u8]) -> Self {
        let mut cursor = Cursor::new(data);

        // Skip the IVF file header entirely. Iteration stops immediately on shorter inputs.
        cursor.set_position(Self::FILE_HEADER_SIZE.min(data.len() as u64));

        Self { cursor }
    }
}

impl<'a> Iterator for IvfIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.remaining() < Self::FRAME_HEADER_SIZE {
            return None;
        }

        let len = self.cursor.get_u32_le() as usize;
        // Skip PTS.
        let _ = self.cursor.get_u64_le();

        if self.cursor.remaining() < len {
            return None;
        }

        let start = self.cursor.position() as usize;
        self.cursor.advance(len);
        let end = self.cursor.position() as usize;

        Some(&self.cursor.get_ref()[start..end])
    }
}

/// Feeds every temporal unit of `stream` to `decoder` and calls `on_frame` for each frame it
/// outputs, in output order. The end of the stream is signaled once all frames are output.
///
/// The user data attached to each output frame is the index of the temporal unit it was decoded
/// from.
pub fn simple_decode_loop<'a, P, T, F>(
    decoder: &mut Av1Decoder<P, T>,
    stream: &mut dyn Iterator<Item = &'a [u8]>,
    mut on_frame: F,
) -> Result<(), DecodeError>
where
    P: ObuParser,
    T: TileDecoder,
    F: FnMut(&DecoderBuffer<'_>),
{
    for (index, temporal_unit) in stream.enumerate() {
        // Empty units are reserved for the end of stream signal.
        if temporal_unit.is_empty() {
            log::warn!("skipping empty temporal unit #{}", index);
            continue;
        }

        decoder.enqueue_frame(Bytes::copy_from_slice(temporal_unit), index as i64)?;

        while let Some(frame) = decoder.dequeue_frame()? {
            on_frame(&frame);
        }
    }

    decoder.signal_end_of_stream()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_power_of_two() {
        assert_eq!(align(0, 16), 0);
        assert_eq!(align(1, 16), 16);
        assert_eq!(align(16, 16), 16);
        assert_eq!(align(33, 8), 40);
    }

    #[test]
    fn array2d_reset_and_index() {
        let mut array = Array2D::<i8>::new();
        assert!(array.is_empty());

        array.reset(3, 4).unwrap();
        assert_eq!((array.rows(), array.columns()), (3, 4));
        assert!(array.as_slice().iter().all(|v| *v == 0));

        array[(2, 3)] = 7;
        assert_eq!(array.row(2), &[0, 0, 0, 7]);

        array.row_mut(1).fill(-1);
        assert_eq!(array[(1, 0)], -1);

        // Resetting clears the contents even if the storage is reused.
        array.reset(2, 2).unwrap();
        assert!(array.as_slice().iter().all(|v| *v == 0));
        assert_eq!(array.as_slice().len(), 4);
    }

    #[test]
    fn array2d_reset_overflow() {
        let mut array = Array2D::<u16>::new();
        array.reset(1, 1).unwrap();
        assert!(array.reset(usize::MAX, 2).is_err());
        assert!(array.is_empty());
        assert_eq!((array.rows(), array.columns()), (0, 0));
    }

    #[test]
    fn ivf_iterator() {
        let mut stream = vec![0u8; 32];
        for payload in [&[1u8, 2, 3][..], &[4u8][..]] {
            stream.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            stream.extend_from_slice(&0u64.to_le_bytes());
            stream.extend_from_slice(payload);
        }
        // Truncated trailing packet.
        stream.extend_from_slice(&10u32.to_le_bytes());
        stream.extend_from_slice(&0u64.to_le_bytes());
        stream.push(5);

        let packets: Vec<&[u8]> = IvfIterator::new(&stream).collect();
        assert_eq!(packets, vec![&[1u8, 2, 3][..], &[4u8][..]]);

        assert_eq!(IvfIterator::new(&[0u8; 10]).count(), 0);
    }
}
