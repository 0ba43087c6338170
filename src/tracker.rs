use serde::Serialize;
use std::collections::BTreeSet;

use crate::config::TrackerConfig;
use crate::detection::Detection;
use crate::error::Result;
use crate::kalman_filter::FilterBank;
use crate::matching::Associator;
use crate::track::{Track, TrackState};

/// Per-detection tracking result reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackStatus {
    /// The detection spawned a track this frame.
    New,
    /// Matched a track that is not confirmed yet.
    Unstable,
    /// Matched a confirmed track.
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackedDetection {
    pub track_id: u64,
    pub status: TrackStatus,
}

/// Hands out track IDs, optionally recycling the IDs of deleted tracks.
#[derive(Debug, Clone, Default)]
struct IdAllocator {
    next_id: u64,
    reuse: bool,
    free: BTreeSet<u64>,
}

impl IdAllocator {
    fn new(reuse: bool) -> Self {
        Self {
            next_id: 1,
            reuse,
            free: BTreeSet::new(),
        }
    }

    fn allocate(&mut self) -> u64 {
        if self.reuse {
            if let Some(id) = self.free.pop_first() {
                return id;
            }
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    fn release(&mut self, id: u64) {
        if self.reuse {
            self.free.insert(id);
        }
    }

    fn reset(&mut self) {
        self.next_id = 1;
        self.free.clear();
    }
}

/// DeepSORT-style multi-object tracker.
///
/// Owns every track, assigns IDs and drives the per-frame predict, associate
/// and update cycle. Not internally synchronised; one frame per call.
pub struct Tracker {
    config: TrackerConfig,
    filters: FilterBank,
    tracks: Vec<Track>,
    ids: IdAllocator,
    frame_count: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            use_reid = config.use_reid,
            use_specific_counter = config.use_specific_counter,
            "tracker created"
        );
        Ok(Self {
            filters: FilterBank::new(&config),
            ids: IdAllocator::new(config.use_specific_counter),
            config,
            tracks: Vec::new(),
            frame_count: 0,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Active tracks, including tentative ones.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Process one frame of detections.
    ///
    /// The result is aligned with `detections`; `None` marks a detection that
    /// neither matched a track nor spawned one.
    pub fn track(&mut self, detections: &[Detection]) -> Vec<Option<TrackedDetection>> {
        self.frame_count += 1;
        let mut results = vec![None; detections.len()];

        for track in self.tracks.iter_mut() {
            track.predict(self.filters.get(track.class_id()));
        }

        let assoc = Associator::new(&self.config, &self.filters).associate(&self.tracks, detections);

        for &(t, d) in &assoc.matches {
            let track = &mut self.tracks[t];
            let kf = self.filters.get(track.class_id());
            let was_tentative = track.is_tentative();
            track.update(kf, &detections[d]);
            if was_tentative && track.state() == TrackState::Stable {
                tracing::debug!(track_id = track.id(), "track confirmed");
            }
            let status = if track.is_confirmed() {
                TrackStatus::Stable
            } else {
                TrackStatus::Unstable
            };
            results[d] = Some(TrackedDetection {
                track_id: track.id(),
                status,
            });
        }

        for &t in &assoc.unmatched_tracks {
            self.tracks[t].mark_missed();
        }

        for &d in &assoc.unmatched_detections {
            let det = &detections[d];
            if det.bbox.is_degenerate() || det.confidence() < self.config.min_confidence {
                continue;
            }
            let id = self.ids.allocate();
            let (ktracker, _) = self.config.for_class(det.class_id);
            let track = Track::new(id, det, self.filters.get(det.class_id), ktracker);
            let status = if track.is_confirmed() {
                TrackStatus::Stable
            } else {
                TrackStatus::New
            };
            tracing::debug!(track_id = id, class_id = det.class_id, "track created");
            self.tracks.push(track);
            results[d] = Some(TrackedDetection {
                track_id: id,
                status,
            });
        }

        let ids = &mut self.ids;
        self.tracks.retain(|track| {
            if track.is_deleted() {
                tracing::debug!(track_id = track.id(), age = track.age(), "track deleted");
                ids.release(track.id());
                false
            } else {
                true
            }
        });

        results
    }

    /// Reset the ID counter and forget every reclaimable ID.
    pub fn clean_counter(&mut self) {
        self.ids.reset();
    }

    /// Drop every track.
    pub fn clear(&mut self) {
        for track in self.tracks.drain(..) {
            self.ids.release(track.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    fn config(n_init: u32, max_age: u32) -> TrackerConfig {
        let mut cfg = TrackerConfig::default();
        cfg.ktracker.accreditation_threshold = n_init;
        cfg.ktracker.max_unmatched_num = max_age;
        cfg
    }

    fn det_at(x: f32) -> Detection {
        Detection::new(BBox::new(x, 100.0, x + 60.0, 180.0, 0.9), 0)
    }

    #[test]
    fn test_confirmation_happens_once() {
        let mut tracker = Tracker::new(config(3, 5)).unwrap();

        let out = tracker.track(&[det_at(100.0)]);
        let first = out[0].unwrap();
        assert_eq!(first.status, TrackStatus::New);

        let out = tracker.track(&[det_at(101.0)]);
        assert_eq!(out[0].unwrap().status, TrackStatus::Unstable);
        assert_eq!(out[0].unwrap().track_id, first.track_id);

        let mut transitions = 0;
        let mut previous = TrackStatus::Unstable;
        for i in 2..10 {
            let out = tracker.track(&[det_at(100.0 + i as f32)]);
            let status = out[0].unwrap().status;
            if previous != TrackStatus::Stable && status == TrackStatus::Stable {
                transitions += 1;
            }
            previous = status;
            assert_eq!(tracker.tracks()[0].id(), first.track_id);
            assert_ne!(tracker.tracks()[0].state(), TrackState::Missed);
        }
        assert_eq!(transitions, 1);
        assert_eq!(tracker.tracks().len(), 1);
    }

    #[test]
    fn test_tentative_track_deleted_after_one_miss() {
        let mut tracker = Tracker::new(config(3, 5)).unwrap();
        tracker.track(&[det_at(100.0)]);
        assert_eq!(tracker.tracks().len(), 1);
        tracker.track(&[]);
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn test_confirmed_track_survives_misses() {
        let mut tracker = Tracker::new(config(2, 3)).unwrap();
        for _ in 0..3 {
            tracker.track(&[det_at(100.0)]);
        }
        let id = tracker.tracks()[0].id();
        for _ in 0..3 {
            tracker.track(&[]);
            assert_eq!(tracker.tracks()[0].state(), TrackState::Missed);
        }
        let out = tracker.track(&[det_at(100.0)]);
        assert_eq!(out[0].unwrap().track_id, id);
        assert_eq!(out[0].unwrap().status, TrackStatus::Stable);

        for _ in 0..4 {
            tracker.track(&[]);
        }
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn test_two_objects_keep_ids() {
        let mut tracker = Tracker::new(config(2, 5)).unwrap();
        let out = tracker.track(&[det_at(100.0), det_at(400.0)]);
        let (a, b) = (out[0].unwrap().track_id, out[1].unwrap().track_id);
        assert_ne!(a, b);

        for i in 1..6 {
            let x = i as f32 * 2.0;
            // detection order swapped on purpose
            let out = tracker.track(&[det_at(400.0 + x), det_at(100.0 + x)]);
            assert_eq!(out[0].unwrap().track_id, b);
            assert_eq!(out[1].unwrap().track_id, a);
        }
    }

    #[test]
    fn test_appearance_keeps_ids_through_a_swap() {
        let mut cfg = config(2, 5);
        cfg.use_reid = true;
        let mut tracker = Tracker::new(cfg).unwrap();
        let a = |x: f32| det_at(x).with_feature(vec![1.0, 0.0, 0.0, 0.0]);
        let b = |x: f32| det_at(x).with_feature(vec![0.0, 1.0, 0.0, 0.0]);

        let mut out = tracker.track(&[a(100.0), b(106.0)]);
        for _ in 0..3 {
            out = tracker.track(&[a(100.0), b(106.0)]);
        }
        let (id_a, id_b) = (out[0].unwrap().track_id, out[1].unwrap().track_id);
        assert_ne!(id_a, id_b);

        // both boxes sit inside each other's motion gate, only appearance tells them apart
        for _ in 0..3 {
            let out = tracker.track(&[a(106.0), b(100.0)]);
            assert_eq!(out[0].unwrap().track_id, id_a);
            assert_eq!(out[1].unwrap().track_id, id_b);
            assert_eq!(out[0].unwrap().status, TrackStatus::Stable);
        }
        assert_eq!(tracker.tracks().len(), 2);
    }

    #[test]
    fn test_min_confidence_and_degenerate_boxes() {
        let mut cfg = config(3, 5);
        cfg.min_confidence = 0.5;
        let mut tracker = Tracker::new(cfg).unwrap();
        let weak = Detection::new(BBox::new(0.0, 0.0, 50.0, 50.0, 0.3), 0);
        let flat = Detection::new(BBox::new(200.0, 0.0, 250.0, 0.0, 0.9), 0);
        let out = tracker.track(&[weak, flat]);
        assert_eq!(out, vec![None, None]);
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn test_monotonic_ids_without_reuse() {
        let mut tracker = Tracker::new(config(3, 5)).unwrap();
        let first = tracker.track(&[det_at(100.0)])[0].unwrap().track_id;
        tracker.track(&[]);
        let second = tracker.track(&[det_at(100.0)])[0].unwrap().track_id;
        assert!(second > first);
    }

    #[test]
    fn test_specific_counter_reuses_smallest_id() {
        let mut cfg = config(3, 5);
        cfg.use_specific_counter = true;
        let mut tracker = Tracker::new(cfg).unwrap();
        let out = tracker.track(&[det_at(100.0), det_at(400.0)]);
        let first = out[0].unwrap().track_id;
        tracker.track(&[]);
        assert!(tracker.tracks().is_empty());

        let again = tracker.track(&[det_at(700.0)])[0].unwrap().track_id;
        assert_eq!(again, first);
    }

    #[test]
    fn test_clean_counter_and_clear() {
        let mut tracker = Tracker::new(config(3, 5)).unwrap();
        tracker.track(&[det_at(100.0)]);
        tracker.track(&[det_at(100.0), det_at(500.0)]);
        tracker.clear();
        assert!(tracker.tracks().is_empty());
        tracker.clean_counter();
        assert_eq!(tracker.track(&[det_at(100.0)])[0].unwrap().track_id, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = TrackerConfig::default();
        cfg.max_distance_iou = 3.0;
        assert!(Tracker::new(cfg).is_err());
    }
}
