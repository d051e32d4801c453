// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pool of reference-counted frames.
//!
//! A frame is shared between the reference frame slots of the decoder, the frame being output
//! and the frame being decoded. It returns to its pool when the last [`RefCountedBufferPtr`]
//! pointing to it is dropped, at which point its pixel storage is given back to the frame buffer
//! allocator.

use std::fmt;
use std::sync::atomic::fence;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use crate::codec::av1::cdf::SymbolDecoderContext;
use crate::codec::av1::header::ChromaSamplePosition;
use crate::codec::av1::header::FilmGrainParams;
use crate::codec::av1::header::FrameHeader;
use crate::codec::av1::header::FrameType;
use crate::codec::av1::header::GlobalMotion;
use crate::codec::av1::header::LoopFilterParams;
use crate::codec::av1::header::ReferenceFrameType;
use crate::codec::av1::header::SegmentationParams;
use crate::codec::av1::header::LOOP_FILTER_MAX_MODE_DELTAS;
use crate::codec::av1::header::NUM_REFERENCE_FRAME_TYPES;
use crate::decoder::frame_buffer::FrameBuffer;
use crate::decoder::frame_buffer::FrameBufferAllocator;
use crate::decoder::frame_buffer::FrameBufferError;
use crate::decoder::frame_buffer::InternalFrameBufferList;
use crate::decoder::yuv_buffer::FrameFormat;
use crate::decoder::yuv_buffer::YuvBuffer;
use crate::utils::Array2D;

/// Number of frames in a decoder's pool: one per reference frame slot, plus the frame being
/// decoded. The output frame is released before a new frame is decoded, so it does not need a
/// buffer of its own.
pub const NUM_BUFFERS: usize = NUM_REFERENCE_FRAME_TYPES + 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MotionVector {
    pub row: i16,
    pub column: i16,
}

/// A frame and the state saved with it for the decoding of the frames referencing it.
pub struct RefCountedBuffer {
    frame_buffer: FrameBuffer,
    yuv_buffer: YuvBuffer,

    frame_type: FrameType,
    chroma_sample_position: ChromaSamplePosition,
    showable_frame: bool,
    /// Order hints of the references of the frame, indexed by reference frame type.
    order_hint: [u32; NUM_REFERENCE_FRAME_TYPES],

    upscaled_width: u32,
    frame_width: u32,
    frame_height: u32,
    render_width: u32,
    render_height: u32,
    rows4x4: u32,
    columns4x4: u32,

    /// Motion field of the frame, one entry per 8x8 block.
    motion_field_reference_frame: Array2D<ReferenceFrameType>,
    motion_field_mv: Array2D<MotionVector>,
    /// Segment id of each 4x4 block.
    segmentation_map: Array2D<i8>,

    global_motion: [GlobalMotion; NUM_REFERENCE_FRAME_TYPES],
    frame_context: SymbolDecoderContext,
    loop_filter_ref_deltas: [i8; NUM_REFERENCE_FRAME_TYPES],
    loop_filter_mode_deltas: [i8; LOOP_FILTER_MAX_MODE_DELTAS],
    segmentation_params: SegmentationParams,
    film_grain_params: FilmGrainParams,
}

impl RefCountedBuffer {
    fn new() -> Self {
        Self {
            frame_buffer: Default::default(),
            yuv_buffer: Default::default(),
            frame_type: Default::default(),
            chroma_sample_position: Default::default(),
            showable_frame: false,
            order_hint: Default::default(),
            upscaled_width: 0,
            frame_width: 0,
            frame_height: 0,
            render_width: 0,
            render_height: 0,
            rows4x4: 0,
            columns4x4: 0,
            motion_field_reference_frame: Array2D::new(),
            motion_field_mv: Array2D::new(),
            segmentation_map: Array2D::new(),
            global_motion: Default::default(),
            frame_context: Default::default(),
            loop_filter_ref_deltas: Default::default(),
            loop_filter_mode_deltas: Default::default(),
            segmentation_params: Default::default(),
            film_grain_params: Default::default(),
        }
    }

    pub fn yuv_buffer(&self) -> &YuvBuffer {
        &self.yuv_buffer
    }

    /// The visible samples of `plane`. See [`YuvBuffer::plane`].
    pub fn plane(&self, plane: usize) -> &[u8] {
        self.yuv_buffer.plane(&self.frame_buffer, plane)
    }

    pub fn row(&self, plane: usize, row: usize) -> &[u8] {
        self.yuv_buffer.row(&self.frame_buffer, plane, row)
    }

    pub fn row_mut(&mut self, plane: usize, row: usize) -> &mut [u8] {
        self.yuv_buffer.row_mut(&mut self.frame_buffer, plane, row)
    }

    pub fn read_row_u16(&self, plane: usize, row: usize, samples: &mut [u16]) {
        self.yuv_buffer.read_row_u16(&self.frame_buffer, plane, row, samples)
    }

    pub fn write_row_u16(&mut self, plane: usize, row: usize, samples: &[u16]) {
        self.yuv_buffer.write_row_u16(&mut self.frame_buffer, plane, row, samples)
    }

    /// Token given by the allocator to the frame buffer.
    pub fn buffer_private_data(&self) -> Option<usize> {
        self.frame_buffer.private_data
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn set_frame_type(&mut self, frame_type: FrameType) {
        self.frame_type = frame_type;
    }

    pub fn chroma_sample_position(&self) -> ChromaSamplePosition {
        self.chroma_sample_position
    }

    pub fn set_chroma_sample_position(&mut self, chroma_sample_position: ChromaSamplePosition) {
        self.chroma_sample_position = chroma_sample_position;
    }

    pub fn showable_frame(&self) -> bool {
        self.showable_frame
    }

    pub fn set_showable_frame(&mut self, showable_frame: bool) {
        self.showable_frame = showable_frame;
    }

    /// Order hint of the reference of type `reference_frame` of this frame.
    pub fn order_hint(&self, reference_frame: usize) -> u32 {
        self.order_hint[reference_frame]
    }

    pub fn set_order_hint(&mut self, reference_frame: usize, order_hint: u32) {
        self.order_hint[reference_frame] = order_hint;
    }

    pub fn set_order_hints(&mut self, order_hints: &[u32; NUM_REFERENCE_FRAME_TYPES]) {
        self.order_hint = *order_hints;
    }

    /// Copies the geometry of the frame from `header` and sizes the motion field and the
    /// segmentation map accordingly. On failure the frame must not be used.
    pub fn set_frame_dimensions(&mut self, header: &FrameHeader) -> Result<(), FrameBufferError> {
        self.upscaled_width = header.upscaled_width;
        self.frame_width = header.frame_width;
        self.frame_height = header.frame_height;
        self.render_width = header.render_width;
        self.render_height = header.render_height;
        self.rows4x4 = header.rows4x4;
        self.columns4x4 = header.columns4x4;

        let rows = (self.rows4x4 / 2) as usize;
        let columns = (self.columns4x4 / 2) as usize;
        self.motion_field_reference_frame.reset(rows, columns)?;
        self.motion_field_mv.reset(rows, columns)?;
        self.segmentation_map.reset(self.rows4x4 as usize, self.columns4x4 as usize)?;

        Ok(())
    }

    pub fn upscaled_width(&self) -> u32 {
        self.upscaled_width
    }

    pub fn frame_width(&self) -> u32 {
        self.frame_width
    }

    pub fn frame_height(&self) -> u32 {
        self.frame_height
    }

    pub fn render_width(&self) -> u32 {
        self.render_width
    }

    pub fn render_height(&self) -> u32 {
        self.render_height
    }

    pub fn rows4x4(&self) -> u32 {
        self.rows4x4
    }

    pub fn columns4x4(&self) -> u32 {
        self.columns4x4
    }

    pub fn motion_field_reference_frames(&self) -> &Array2D<ReferenceFrameType> {
        &self.motion_field_reference_frame
    }

    pub fn motion_field_reference_frames_mut(&mut self) -> &mut Array2D<ReferenceFrameType> {
        &mut self.motion_field_reference_frame
    }

    pub fn motion_field_mvs(&self) -> &Array2D<MotionVector> {
        &self.motion_field_mv
    }

    pub fn motion_field_mvs_mut(&mut self) -> &mut Array2D<MotionVector> {
        &mut self.motion_field_mv
    }

    pub fn segmentation_map(&self) -> &Array2D<i8> {
        &self.segmentation_map
    }

    pub fn segmentation_map_mut(&mut self) -> &mut Array2D<i8> {
        &mut self.segmentation_map
    }

    pub fn global_motions(&self) -> &[GlobalMotion; NUM_REFERENCE_FRAME_TYPES] {
        &self.global_motion
    }

    /// Saves the global motion parameters of the LAST_FRAME..ALTREF_FRAME references.
    pub fn set_global_motions(
        &mut self,
        global_motion: &[GlobalMotion; NUM_REFERENCE_FRAME_TYPES],
    ) {
        let first = ReferenceFrameType::Last as usize;
        self.global_motion[first..].copy_from_slice(&global_motion[first..]);
    }

    pub fn frame_context(&self) -> &SymbolDecoderContext {
        &self.frame_context
    }

    /// Saves `context` as the starting point of the frames using this one as primary
    /// reference. The intra frame luma mode CDFs and the adaptation counters are reset in the
    /// saved copy.
    pub fn set_frame_context(&mut self, context: &SymbolDecoderContext) {
        self.frame_context.clone_from(context);
        self.frame_context.reset_intra_frame_y_mode_cdf();
        self.frame_context.reset_counters();
    }

    pub fn loop_filter_ref_deltas(&self) -> &[i8; NUM_REFERENCE_FRAME_TYPES] {
        &self.loop_filter_ref_deltas
    }

    pub fn loop_filter_mode_deltas(&self) -> &[i8; LOOP_FILTER_MAX_MODE_DELTAS] {
        &self.loop_filter_mode_deltas
    }

    pub fn set_loop_filter_deltas(&mut self, loop_filter: &LoopFilterParams) {
        self.loop_filter_ref_deltas = loop_filter.loop_filter_ref_deltas;
        self.loop_filter_mode_deltas = loop_filter.loop_filter_mode_deltas;
    }

    /// Copies the saved segmentation features into `params`, leaving its other fields alone.
    pub fn get_segmentation_parameters(&self, params: &mut SegmentationParams) {
        params.feature_enabled = self.segmentation_params.feature_enabled;
        params.feature_data = self.segmentation_params.feature_data;
        params.seg_id_pre_skip = self.segmentation_params.seg_id_pre_skip;
        params.last_active_seg_id = self.segmentation_params.last_active_seg_id;
    }

    pub fn set_segmentation_parameters(&mut self, params: &SegmentationParams) {
        self.segmentation_params.feature_enabled = params.feature_enabled;
        self.segmentation_params.feature_data = params.feature_data;
        self.segmentation_params.seg_id_pre_skip = params.seg_id_pre_skip;
        self.segmentation_params.last_active_seg_id = params.last_active_seg_id;
    }

    pub fn film_grain_params(&self) -> &FilmGrainParams {
        &self.film_grain_params
    }

    pub fn set_film_grain_params(&mut self, params: &FilmGrainParams) {
        self.film_grain_params.clone_from(params);
    }
}

struct Slot {
    ref_count: AtomicUsize,
    buffer: RwLock<RefCountedBuffer>,
}

struct PoolState {
    in_use: Vec<bool>,
    allocator: Box<dyn FrameBufferAllocator>,
}

struct PoolShared {
    slots: Box<[Slot]>,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self, index: usize) -> RwLockWriteGuard<'_, RefCountedBuffer> {
        self.slots[index].buffer.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called when the last reference to the frame in slot `index` is dropped.
    fn return_unused_buffer(&self, index: usize) {
        let mut state = self.lock_state();

        if !state.in_use[index] {
            log::error!("frame buffer {} returned to the pool twice", index);
            debug_assert!(false, "frame buffer {} returned to the pool twice", index);
            return;
        }
        state.in_use[index] = false;

        let mut buffer = self.write_slot(index);
        if buffer.frame_buffer.is_allocated() {
            if let Err(e) = state.allocator.release_frame_buffer(&mut buffer.frame_buffer) {
                log::error!("failed to release frame buffer {}: {:#}", index, e);
            }
            buffer.frame_buffer = Default::default();
        }

        log::debug!("frame buffer {} returned to the pool", index);
    }
}

/// Shared reference to a frame of a [`BufferPool`].
///
/// Cloning the pointer adds a reference to the frame. Dropping the last reference returns the
/// frame to its pool.
pub struct RefCountedBufferPtr {
    pool: Arc<PoolShared>,
    index: usize,
}

impl RefCountedBufferPtr {
    fn slot(&self) -> &Slot {
        &self.pool.slots[self.index]
    }

    /// Locks the frame for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, RefCountedBuffer> {
        self.slot().buffer.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the frame for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, RefCountedBuffer> {
        self.pool.write_slot(self.index)
    }

    /// Makes the pixel storage of the frame suitable for `format`, through the allocator of the
    /// pool.
    ///
    /// Must not be called while the frame is locked by the caller.
    pub fn realloc(&self, format: &FrameFormat) -> Result<(), FrameBufferError> {
        // The frame is locked before the pool state, the reverse of `return_unused_buffer`. The
        // two never lock the same frame since this one is referenced.
        let mut buffer = self.write();
        let buffer = &mut *buffer;
        let mut state = self.pool.lock_state();

        buffer.yuv_buffer.realloc(format, state.allocator.as_mut(), &mut buffer.frame_buffer)
    }

    /// Index of the frame in its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of live references to the frame.
    pub fn ref_count(&self) -> usize {
        self.slot().ref_count.load(Ordering::Acquire)
    }

    /// Whether both pointers reference the same frame.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.pool, &other.pool) && this.index == other.index
    }
}

impl Clone for RefCountedBufferPtr {
    fn clone(&self) -> Self {
        self.slot().ref_count.fetch_add(1, Ordering::Relaxed);

        Self { pool: Arc::clone(&self.pool), index: self.index }
    }
}

impl Drop for RefCountedBufferPtr {
    fn drop(&mut self) {
        if self.slot().ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }

        // Make every access made through other references visible before the frame is reused.
        fence(Ordering::Acquire);
        self.pool.return_unused_buffer(self.index);
    }
}

impl fmt::Debug for RefCountedBufferPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountedBufferPtr")
            .field("index", &self.index)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Fixed set of frames, handed out as [`RefCountedBufferPtr`]s.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates a pool of [`NUM_BUFFERS`] frames whose storage comes from `allocator`, or from an
    /// [`InternalFrameBufferList`] if `None`.
    pub fn new(allocator: Option<Box<dyn FrameBufferAllocator>>) -> Self {
        Self::with_capacity(NUM_BUFFERS, allocator)
    }

    pub fn with_capacity(
        num_buffers: usize,
        allocator: Option<Box<dyn FrameBufferAllocator>>,
    ) -> Self {
        let allocator = allocator.unwrap_or_else(|| {
            log::debug!("using the internal frame buffer allocator");
            Box::new(InternalFrameBufferList::new(num_buffers))
        });

        let slots = (0..num_buffers)
            .map(|_| Slot {
                ref_count: AtomicUsize::new(0),
                buffer: RwLock::new(RefCountedBuffer::new()),
            })
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                slots,
                state: Mutex::new(PoolState { in_use: vec![false; num_buffers], allocator }),
            }),
        }
    }

    /// Takes an unused frame from the pool. Returns `None` if all frames are in use, which only
    /// happens if a reference to a frame is kept longer than needed.
    pub fn get_free_buffer(&self) -> Option<RefCountedBufferPtr> {
        let mut state = self.shared.lock_state();

        let Some(index) = state.in_use.iter().position(|in_use| !in_use) else {
            log::error!("all {} frame buffers are in use", state.in_use.len());
            return None;
        };

        state.in_use[index] = true;
        let previous = self.shared.slots[index].ref_count.swap(1, Ordering::Relaxed);
        debug_assert_eq!(previous, 0);

        Some(RefCountedBufferPtr { pool: Arc::clone(&self.shared), index })
    }

    pub fn num_buffers(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn num_buffers_in_use(&self) -> usize {
        self.shared.lock_state().in_use.iter().filter(|in_use| **in_use).count()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let in_use = self.num_buffers_in_use();

        if in_use > 0 {
            log::error!("buffer pool dropped while {} of its frames are still referenced", in_use);
            debug_assert_eq!(in_use, 0, "buffer pool dropped while frames are still referenced");
        }
    }
}
