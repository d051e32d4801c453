// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed AV1 headers, as consumed by the decoder core.
//!
//! These types only carry the fields that drive the frame lifecycle: allocation, reference
//! management and the state carried from one frame to the next. Producing them from OBUs is the
//! job of an [`ObuParser`](crate::decoder::av1::ObuParser).

use enumn::N;

pub const NUM_REF_FRAMES: usize = 8;
pub const REFS_PER_FRAME: usize = 7;
/// Number of reference frame types, including `Intra`.
pub const NUM_REFERENCE_FRAME_TYPES: usize = 8;
pub const MAX_SEGMENTS: usize = 8;
pub const SEG_LVL_MAX: usize = 8;
pub const MAX_NUM_PLANES: usize = 3;
pub const MAX_NUM_Y_POINTS: usize = 16;
pub const MAX_NUM_CB_POINTS: usize = 16;
pub const MAX_NUM_CR_POINTS: usize = 16;
pub const PRIMARY_REF_NONE: u32 = 7;
pub const LOOP_FILTER_MAX_MODE_DELTAS: usize = 2;
pub const WARPEDMODEL_PREC_BITS: u32 = 16;

/// Loop filter reference deltas in effect when a frame has no primary reference.
pub const DEFAULT_LOOP_FILTER_REF_DELTAS: [i8; NUM_REFERENCE_FRAME_TYPES] =
    [1, 0, 0, 0, -1, 0, -1, -1];

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
    IntraOnlyFrame = 2,
    SwitchFrame = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
pub enum ReferenceFrameType {
    #[default]
    None = -1,
    Intra = 0,
    Last = 1,
    Last2 = 2,
    Last3 = 3,
    Golden = 4,
    BwdRef = 5,
    AltRef2 = 6,
    AltRef = 7,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChromaSamplePosition {
    #[default]
    Unknown = 0,
    Vertical = 1,
    Colocated = 2,
    Reserved = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarpModelType {
    #[default]
    Identity = 0,
    Translation = 1,
    RotZoom = 2,
    Affine = 3,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceHeader {
    pub bit_depth: u32,
    pub mono_chrome: bool,
    pub subsampling_x: u32,
    pub subsampling_y: u32,
    pub chroma_sample_position: ChromaSamplePosition,
    pub enable_order_hint: bool,
    pub order_hint_bits: u32,
    /// Frames carry an id, checked against the ids of the frames they reference.
    pub frame_id_numbers_present_flag: bool,
    pub film_grain_params_present: bool,
}

impl Default for SequenceHeader {
    fn default() -> Self {
        Self {
            bit_depth: 8,
            mono_chrome: false,
            subsampling_x: 1,
            subsampling_y: 1,
            chroma_sample_position: Default::default(),
            enable_order_hint: true,
            order_hint_bits: 7,
            frame_id_numbers_present_flag: false,
            film_grain_params_present: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopFilterParams {
    pub loop_filter_level: [u8; 4],
    pub loop_filter_delta_enabled: bool,
    /// If not set, the deltas are carried over from the primary reference frame.
    pub loop_filter_delta_update: bool,
    pub loop_filter_ref_deltas: [i8; NUM_REFERENCE_FRAME_TYPES],
    pub loop_filter_mode_deltas: [i8; LOOP_FILTER_MAX_MODE_DELTAS],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentationParams {
    pub segmentation_enabled: bool,
    /// If not set, the segmentation map of the primary reference frame is used.
    pub segmentation_update_map: bool,
    pub segmentation_temporal_update: bool,
    /// If not set, the feature data is carried over from the primary reference frame.
    pub segmentation_update_data: bool,
    pub feature_enabled: [[bool; SEG_LVL_MAX]; MAX_SEGMENTS],
    pub feature_data: [[i16; SEG_LVL_MAX]; MAX_SEGMENTS],
    /// Same as SegIdPreSkip
    pub seg_id_pre_skip: bool,
    /// Same as LastActiveSegId
    pub last_active_seg_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalMotion {
    pub gm_type: WarpModelType,
    pub params: [i32; 6],
}

impl Default for GlobalMotion {
    fn default() -> Self {
        Self {
            gm_type: WarpModelType::Identity,
            params: [0, 0, 1 << WARPEDMODEL_PREC_BITS, 0, 0, 1 << WARPEDMODEL_PREC_BITS],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilmGrainParams {
    pub apply_grain: bool,
    pub grain_seed: u16,
    pub update_grain: bool,
    pub film_grain_params_ref_idx: u8,
    pub num_y_points: u8,
    pub point_y_value: [u8; MAX_NUM_Y_POINTS],
    pub point_y_scaling: [u8; MAX_NUM_Y_POINTS],
    pub chroma_scaling_from_luma: bool,
    pub num_cb_points: u8,
    pub point_cb_value: [u8; MAX_NUM_CB_POINTS],
    pub point_cb_scaling: [u8; MAX_NUM_CB_POINTS],
    pub num_cr_points: u8,
    pub point_cr_value: [u8; MAX_NUM_CR_POINTS],
    pub point_cr_scaling: [u8; MAX_NUM_CR_POINTS],
    pub grain_scaling_minus_8: u8,
    pub ar_coeff_lag: u32,
    pub ar_coeff_shift_minus_6: u8,
    pub grain_scale_shift: u8,
    pub overlap_flag: bool,
    pub clip_to_restricted_range: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileInfo {
    pub tile_cols: u32,
    pub tile_rows: u32,
    /// Specifies which tile to use for the CDF update
    pub context_update_tile_id: u32,
    /// Number of bytes used to code each `tile_size_minus_1`.
    pub tile_size_bytes: u32,
    /// Start column of each tile, in units of 4x4 luma samples. The last entry is the frame
    /// width in 4x4 units.
    pub mi_col_starts: Vec<u32>,
    /// Start row of each tile, in units of 4x4 luma samples. The last entry is the frame height
    /// in 4x4 units.
    pub mi_row_starts: Vec<u32>,
}

impl Default for TileInfo {
    fn default() -> Self {
        Self {
            tile_cols: 1,
            tile_rows: 1,
            context_update_tile_id: 0,
            tile_size_bytes: 4,
            mi_col_starts: vec![0, 0],
            mi_row_starts: vec![0, 0],
        }
    }
}

impl TileInfo {
    /// Splits a `rows4x4` x `columns4x4` frame into a grid of evenly sized tiles.
    pub fn uniform(tile_cols: u32, tile_rows: u32, rows4x4: u32, columns4x4: u32) -> Self {
        let starts = |count: u32, size: u32| -> Vec<u32> {
            (0..=count).map(|i| (i * size) / count.max(1)).collect()
        };

        Self {
            tile_cols,
            tile_rows,
            context_update_tile_id: 0,
            tile_size_bytes: 4,
            mi_col_starts: starts(tile_cols, columns4x4),
            mi_row_starts: starts(tile_rows, rows4x4),
        }
    }

    pub fn num_tiles(&self) -> usize {
        self.tile_cols as usize * self.tile_rows as usize
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// If set, the frame indexed by `frame_to_show_map_idx` is to be output. Nothing else in
    /// the header is relevant then.
    pub show_existing_frame: bool,
    pub frame_to_show_map_idx: u8,
    /// Expected id of the frame shown with `show_existing_frame`.
    pub display_frame_id: u16,
    pub frame_type: FrameType,
    pub show_frame: bool,
    pub showable_frame: bool,
    pub disable_cdf_update: bool,
    pub disable_frame_end_update_cdf: bool,
    pub current_frame_id: u16,
    pub primary_ref_frame: u32,
    /// Slot of the reference frame used by each of LAST_FRAME..ALTREF_FRAME.
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub refresh_frame_flags: u8,
    pub order_hint: u32,
    /// OrderHints[] of the frame, indexed by reference frame type.
    pub order_hints: [u32; NUM_REFERENCE_FRAME_TYPES],
    pub frame_width: u32,
    pub frame_height: u32,
    pub upscaled_width: u32,
    pub render_width: u32,
    pub render_height: u32,
    pub rows4x4: u32,
    pub columns4x4: u32,
    pub loop_filter_params: LoopFilterParams,
    pub segmentation_params: SegmentationParams,
    pub global_motion: [GlobalMotion; NUM_REFERENCE_FRAME_TYPES],
    pub film_grain_params: FilmGrainParams,
    pub tile_info: TileInfo,
}

impl FrameHeader {
    /// Sets the frame, upscaled and render sizes to `width` x `height` and derives the size of
    /// the frame in 4x4 units, as done by compute_image_size() (7.9).
    pub fn set_frame_size(&mut self, width: u32, height: u32) {
        self.frame_width = width;
        self.frame_height = height;
        self.upscaled_width = width;
        self.render_width = width;
        self.render_height = height;
        self.columns4x4 = 2 * ((width + 7) >> 3);
        self.rows4x4 = 2 * ((height + 7) >> 3);
    }

    /// Same as FrameIsIntra.
    pub fn frame_is_intra(&self) -> bool {
        matches!(self.frame_type, FrameType::KeyFrame | FrameType::IntraOnlyFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_in_4x4_units() {
        let mut header = FrameHeader::default();
        header.set_frame_size(100, 50);
        assert_eq!(header.columns4x4, 26);
        assert_eq!(header.rows4x4, 14);
        assert_eq!((header.upscaled_width, header.frame_height), (100, 50));
    }

    #[test]
    fn uniform_tile_grid() {
        let info = TileInfo::uniform(2, 3, 30, 40);
        assert_eq!(info.num_tiles(), 6);
        assert_eq!(info.mi_col_starts, vec![0, 20, 40]);
        assert_eq!(info.mi_row_starts, vec![0, 10, 20, 30]);
    }

    #[test]
    fn reference_frame_type_values() {
        assert_eq!(ReferenceFrameType::n(-1), Some(ReferenceFrameType::None));
        assert_eq!(ReferenceFrameType::n(7), Some(ReferenceFrameType::AltRef));
        assert_eq!(ReferenceFrameType::default() as i8, -1);
    }
}
