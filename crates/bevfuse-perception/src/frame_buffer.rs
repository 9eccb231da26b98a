//! Temporal BEV feature ring buffer.
//!
//! [`FrameRingBuffer`] keeps the last `N` BEV feature maps together with the
//! scene token and ego pose each one was captured at.  All `N` feature blocks
//! live in one arena that is allocated (and zero-filled) once at
//! construction; every later write is an in-place copy.
//!
//! Logical offsets count backwards from the newest frame: `lookup(0)` is the
//! most recent save, `lookup(N - 1)` the oldest one still held.
//!
//! # Cold start
//!
//! The first [`save`][FrameRingBuffer::save] after construction or
//! [`reset`][FrameRingBuffer::reset] broadcasts the frame into every slot, so
//! a lookup never observes a slot that was not written for the current
//! sequence.
//!
//! # Example
//!
//! ```rust
//! use bevfuse_perception::frame_buffer::FrameRingBuffer;
//! use bevfuse_perception::transform::Pose;
//!
//! let mut ring = FrameRingBuffer::new(3, 4).unwrap();
//! ring.save(&[1, 1, 1, 1], "scene-a", Pose::identity()).unwrap();
//! ring.save(&[2, 2, 2, 2], "scene-a", Pose::identity()).unwrap();
//!
//! assert_eq!(ring.lookup(0).unwrap().feature, &[2, 2, 2, 2]);
//! assert_eq!(ring.lookup(1).unwrap().feature, &[1, 1, 1, 1]);
//! assert_eq!(ring.lookup(2).unwrap().feature, &[1, 1, 1, 1]);
//! ```

use bevfuse_types::BevError;
use tracing::debug;

use crate::transform::Pose;

// ────────────────────────────────────────────────────────────────────────────
// Slot metadata
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct SlotMeta {
    scene_token: String,
    pose: Pose,
}

/// Read-only view of one stored frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameView<'a> {
    pub feature: &'a [u8],
    pub scene_token: &'a str,
    pub pose: Pose,
}

// ────────────────────────────────────────────────────────────────────────────
// FrameRingBuffer
// ────────────────────────────────────────────────────────────────────────────

/// Fixed-capacity circular store of `(feature, scene token, pose)` frames.
///
/// Mutation takes `&mut self`: one writer per inference call, and no reader
/// can hold a [`FrameView`] across a [`save`][Self::save].
#[derive(Debug)]
pub struct FrameRingBuffer {
    capacity: usize,
    frame_bytes: usize,
    /// `capacity * frame_bytes` bytes, slot `i` at `i * frame_bytes`.
    arena: Vec<u8>,
    slots: Vec<SlotMeta>,
    /// Physical index of the most recently written slot.
    last: usize,
    /// Frames observed since the last reset, capped at `capacity`.
    buffer_num: usize,
    initialized: bool,
}

impl FrameRingBuffer {
    /// Allocate a ring of `capacity` slots of `frame_bytes` each.
    ///
    /// # Errors
    ///
    /// - [`BevError::Config`] when either dimension is zero.
    /// - [`BevError::Allocation`] when the arena cannot be reserved.
    pub fn new(capacity: usize, frame_bytes: usize) -> Result<Self, BevError> {
        if capacity == 0 || frame_bytes == 0 {
            return Err(BevError::Config(format!(
                "frame ring buffer needs non-zero capacity and frame size (got {capacity} × {frame_bytes})"
            )));
        }
        let bytes = capacity
            .checked_mul(frame_bytes)
            .ok_or(BevError::Allocation { bytes: usize::MAX })?;

        let mut arena = Vec::new();
        arena
            .try_reserve_exact(bytes)
            .map_err(|_| BevError::Allocation { bytes })?;
        arena.resize(bytes, 0);

        debug!(capacity, frame_bytes, "allocated frame ring buffer");

        Ok(Self {
            capacity,
            frame_bytes,
            arena,
            slots: vec![SlotMeta::default(); capacity],
            last: 0,
            buffer_num: 0,
            initialized: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Number of populated slots (frames seen since the last reset, capped
    /// at the capacity).
    pub fn len(&self) -> usize {
        self.buffer_num
    }

    pub fn is_empty(&self) -> bool {
        self.buffer_num == 0
    }

    /// Scene token of the most recent save, or `None` before the first save
    /// of a sequence.
    pub fn last_scene_token(&self) -> Option<&str> {
        self.initialized
            .then(|| self.slots[self.last].scene_token.as_str())
    }

    /// Forget the stored history without releasing the arena.
    ///
    /// The next [`save`][Self::save] broadcasts again.
    pub fn reset(&mut self) {
        self.last = 0;
        self.buffer_num = 0;
        self.initialized = false;
    }

    /// Store a new frame.
    ///
    /// # Errors
    ///
    /// Returns [`BevError::TensorShape`] when `feature` is not exactly
    /// [`frame_bytes`][Self::frame_bytes] long.
    pub fn save(&mut self, feature: &[u8], scene_token: &str, pose: Pose) -> Result<(), BevError> {
        if feature.len() != self.frame_bytes {
            return Err(BevError::TensorShape {
                name: "bev_feature".to_string(),
                expected: self.frame_bytes,
                actual: feature.len(),
            });
        }

        let writes = if self.initialized { 1 } else { self.capacity };
        for _ in 0..writes {
            self.last = (self.last + 1) % self.capacity;
            let offset = self.last * self.frame_bytes;
            self.arena[offset..offset + self.frame_bytes].copy_from_slice(feature);

            let slot = &mut self.slots[self.last];
            slot.scene_token.clear();
            slot.scene_token.push_str(scene_token);
            slot.pose = pose;

            self.buffer_num = (self.buffer_num + 1).min(self.capacity);
        }
        self.initialized = true;
        Ok(())
    }

    /// True when logical offset `k` holds a frame observed for the current
    /// sequence (broadcast copies included).
    pub fn has_frame(&self, k: usize) -> bool {
        k < self.buffer_num
    }

    /// Frame stored `k` saves ago.
    ///
    /// # Errors
    ///
    /// Returns [`BevError::IndexOutOfRange`] for `k >= capacity`.
    pub fn lookup(&self, k: usize) -> Result<FrameView<'_>, BevError> {
        let idx = self.physical_index(k)?;
        let offset = idx * self.frame_bytes;
        let slot = &self.slots[idx];
        Ok(FrameView {
            feature: &self.arena[offset..offset + self.frame_bytes],
            scene_token: &slot.scene_token,
            pose: slot.pose,
        })
    }

    fn physical_index(&self, k: usize) -> Result<usize, BevError> {
        if k >= self.capacity {
            return Err(BevError::IndexOutOfRange {
                index: k,
                len: self.capacity,
            });
        }
        Ok((self.last + self.capacity - k) % self.capacity)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{Quaternion, Vec3};

    fn pose_at(x: f32) -> Pose {
        Pose::try_new(Quaternion::identity(), Vec3::new(x, 0.0, 0.0)).unwrap()
    }

    fn frame(v: u8) -> [u8; 4] {
        [v; 4]
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(matches!(FrameRingBuffer::new(0, 4), Err(BevError::Config(_))));
        assert!(matches!(FrameRingBuffer::new(3, 0), Err(BevError::Config(_))));
    }

    #[test]
    fn fresh_buffer_is_empty_and_zeroed() {
        let ring = FrameRingBuffer::new(2, 4).unwrap();
        assert!(ring.is_empty());
        assert!(!ring.has_frame(0));
        assert_eq!(ring.last_scene_token(), None);
        assert_eq!(ring.lookup(1).unwrap().feature, &[0, 0, 0, 0]);
    }

    #[test]
    fn cold_start_broadcasts_first_frame() {
        let mut ring = FrameRingBuffer::new(4, 4).unwrap();
        ring.save(&frame(7), "scene-1", pose_at(3.0)).unwrap();

        for k in 0..4 {
            let view = ring.lookup(k).unwrap();
            assert_eq!(view.feature, &frame(7));
            assert_eq!(view.scene_token, "scene-1");
            assert_eq!(view.pose, pose_at(3.0));
            assert!(ring.has_frame(k));
        }
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn five_saves_into_capacity_three_keeps_newest_first() {
        let mut ring = FrameRingBuffer::new(3, 4).unwrap();
        for i in 1..=5u8 {
            ring.save(&frame(i), "scene", pose_at(i as f32)).unwrap();
        }
        assert_eq!(ring.lookup(0).unwrap().feature, &frame(5));
        assert_eq!(ring.lookup(1).unwrap().feature, &frame(4));
        assert_eq!(ring.lookup(2).unwrap().feature, &frame(3));
        assert_eq!(ring.lookup(2).unwrap().pose, pose_at(3.0));
    }

    #[test]
    fn wrap_invariant_holds_over_many_saves() {
        let n = 4;
        let mut ring = FrameRingBuffer::new(n, 4).unwrap();
        for m in 1..=20u8 {
            ring.save(&frame(m), "scene", pose_at(m as f32)).unwrap();
            if m as usize >= n {
                assert_eq!(ring.lookup(0).unwrap().feature, &frame(m));
                assert_eq!(ring.lookup(n - 1).unwrap().feature, &frame(m - (n as u8 - 1)));
            }
            for k in 0..(m as usize).min(n) {
                assert!(ring.has_frame(k), "k={k} after {m} saves");
            }
        }
    }

    #[test]
    fn reset_repeats_broadcast() {
        let mut ring = FrameRingBuffer::new(3, 4).unwrap();
        ring.save(&frame(1), "a", pose_at(1.0)).unwrap();
        ring.save(&frame(2), "a", pose_at(2.0)).unwrap();

        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.last_scene_token(), None);

        ring.save(&frame(9), "b", pose_at(9.0)).unwrap();
        for k in 0..3 {
            let view = ring.lookup(k).unwrap();
            assert_eq!(view.feature, &frame(9));
            assert_eq!(view.scene_token, "b");
        }
        assert_eq!(ring.last_scene_token(), Some("b"));
    }

    #[test]
    fn lookup_out_of_range_is_rejected() {
        let ring = FrameRingBuffer::new(3, 4).unwrap();
        let err = ring.lookup(3).unwrap_err();
        assert_eq!(err, BevError::IndexOutOfRange { index: 3, len: 3 });
    }

    #[test]
    fn save_rejects_wrong_feature_size() {
        let mut ring = FrameRingBuffer::new(3, 4).unwrap();
        let err = ring.save(&[1, 2, 3], "a", Pose::identity()).unwrap_err();
        assert!(matches!(err, BevError::TensorShape { expected: 4, actual: 3, .. }));
        // A rejected save must not count as the cold-start write.
        assert!(ring.is_empty());
    }

    #[test]
    fn scene_token_overwrite_does_not_leak_old_suffix() {
        let mut ring = FrameRingBuffer::new(1, 4).unwrap();
        ring.save(&frame(1), "a-very-long-token", Pose::identity()).unwrap();
        ring.save(&frame(2), "b", Pose::identity()).unwrap();
        assert_eq!(ring.lookup(0).unwrap().scene_token, "b");
    }
}
