use serde::Serialize;

use crate::detection::{BBox, Detection, HeadPose, Landmarks};
use crate::frame::Image;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    Idle,
    Alive,
    Miss,
}

/// Metadata of one face sighting, deep-copied out of the frame's detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceRecord {
    pub bbox: BBox,
    pub class_id: i32,
    pub landmarks: Option<Landmarks>,
    pub head_pose: Option<HeadPose>,
    pub quality: f32,
    /// Frame clock value of the sighting.
    pub frame: u64,
}

impl FaceRecord {
    pub fn from_detection(det: &Detection, quality: f32, frame: u64) -> Self {
        Self {
            bbox: det.bbox,
            class_id: det.class_id,
            landmarks: det.landmarks.clone(),
            head_pose: det.head_pose,
            quality,
            frame,
        }
    }
}

/// One entry of the capture buffer.
///
/// `image` is `Some` only outside `Idle`; [`Slot::clean`] is the single place
/// that returns a slot to `Idle` and drops its buffers.
#[derive(Debug, Clone)]
pub struct Slot {
    pub state: SlotState,
    pub track_id: Option<u64>,
    pub image: Option<Image>,
    /// Record the stored image was cropped from.
    pub best: Option<FaceRecord>,
    /// Record waiting for the capture pass to crop it.
    pub candidate: Option<FaceRecord>,
    /// Latest matched sighting, refreshed every frame the track is seen.
    pub last_seen: Option<FaceRecord>,
    pub miss_counter: u32,
    pub capture_pending: bool,
    /// Set by the capture pass when the slot becomes `Alive`.
    pub first_capture: bool,
    /// Reference frame for Δt.
    pub timestamp: u64,
    pub out_counter: u32,
    pub auto_fast_emitted: bool,
    pub auto_deadline_emitted: bool,
    /// Best shot is ready for the caller this cycle.
    pub output: bool,
    /// Capture denied by the memory budget this cycle.
    pub dropped: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: SlotState::Idle,
            track_id: None,
            image: None,
            best: None,
            candidate: None,
            last_seen: None,
            miss_counter: 0,
            capture_pending: false,
            first_capture: false,
            timestamp: 0,
            out_counter: 0,
            auto_fast_emitted: false,
            auto_deadline_emitted: false,
            output: false,
            dropped: false,
        }
    }
}

impl Slot {
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state == SlotState::Alive
    }

    /// The newest accepted record, pending or already cropped.
    #[inline]
    pub fn stored(&self) -> Option<&FaceRecord> {
        self.candidate.as_ref().or(self.best.as_ref())
    }

    /// Quality of [`Slot::stored`], -1 when nothing is stored.
    #[inline]
    pub fn stored_quality(&self) -> f32 {
        self.stored().map_or(-1.0, |b| b.quality)
    }

    /// Queue `record` for capture.
    pub fn accept(&mut self, record: FaceRecord) {
        self.candidate = Some(record);
        self.capture_pending = true;
    }

    /// Drop a queued capture, keeping whatever image is stored.
    pub fn reject_pending(&mut self) {
        self.candidate = None;
        self.capture_pending = false;
    }

    /// Bytes held by the stored image.
    #[inline]
    pub fn footprint(&self) -> u64 {
        self.image.as_ref().map_or(0, |img| img.footprint() as u64)
    }

    /// Free everything and go back to `Idle`.
    pub fn clean(&mut self) {
        *self = Slot::default();
    }

    /// Bind an idle slot to a track and queue its first capture.
    pub fn bind(&mut self, track_id: u64, record: FaceRecord, now: u64) {
        self.track_id = Some(track_id);
        self.miss_counter = 0;
        self.last_seen = Some(record.clone());
        self.accept(record);
        self.timestamp = now;
        self.out_counter = 0;
        self.auto_fast_emitted = false;
        self.auto_deadline_emitted = false;
    }
}
