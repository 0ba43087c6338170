use serde::Serialize;
use std::collections::VecDeque;

use crate::config::KalmanTrackerConfig;
use crate::detection::{BBox, Detection};
use crate::kalman_filter::{KalmanFilter, Measurement, StateCovariance, StateVector};
use crate::utils;

/// Lifecycle of a track inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackState {
    /// Just created, not yet confirmed.
    Tentative,
    /// Matched `accreditation_threshold` consecutive times.
    Stable,
    /// Confirmed but unmatched in recent frames.
    Missed,
    /// Waiting to be removed from the active set.
    Deleted,
}

/// One tracked object: motion state, appearance gallery and lifecycle counters.
#[derive(Debug, Clone)]
pub struct Track {
    id: u64,
    class_id: i32,
    mean: StateVector,
    covariance: StateCovariance,
    state: TrackState,
    /// Consecutive successful matches
    hits: u32,
    /// Frames since last matched
    time_since_update: u32,
    age: u32,
    score: f32,
    features: VecDeque<Vec<f32>>,
    feature_counter: u32,
    config: KalmanTrackerConfig,
}

impl Track {
    /// Create a tentative track from an unmatched detection.
    pub fn new(id: u64, det: &Detection, kf: &KalmanFilter, config: &KalmanTrackerConfig) -> Self {
        let (mean, covariance) = kf.initiate(&det.bbox.to_xyah(), config);
        let mut track = Track {
            id,
            class_id: det.class_id,
            mean,
            covariance,
            state: TrackState::Tentative,
            hits: 1,
            time_since_update: 0,
            age: 1,
            score: det.confidence(),
            features: VecDeque::with_capacity(config.feature_budget_size),
            feature_counter: 0,
            config: config.clone(),
        };
        if let Some(feat) = &det.feature {
            track.push_feature(feat);
        }
        if track.hits >= track.config.accreditation_threshold {
            track.state = TrackState::Stable;
        }
        track
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn class_id(&self) -> i32 {
        self.class_id
    }

    #[inline]
    pub fn state(&self) -> TrackState {
        self.state
    }

    #[inline]
    pub fn hits(&self) -> u32 {
        self.hits
    }

    #[inline]
    pub fn time_since_update(&self) -> u32 {
        self.time_since_update
    }

    #[inline]
    pub fn age(&self) -> u32 {
        self.age
    }

    #[inline]
    pub fn score(&self) -> f32 {
        self.score
    }

    #[inline]
    pub fn mean(&self) -> &StateVector {
        &self.mean
    }

    #[inline]
    pub fn covariance(&self) -> &StateCovariance {
        &self.covariance
    }

    pub fn features(&self) -> impl Iterator<Item = &[f32]> {
        self.features.iter().map(|f| f.as_slice())
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, TrackState::Stable | TrackState::Missed)
    }

    #[inline]
    pub fn is_tentative(&self) -> bool {
        self.state == TrackState::Tentative
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.state == TrackState::Deleted
    }

    /// Current box estimate from the filter state.
    pub fn bbox(&self) -> BBox {
        let xyah: Measurement = self.mean.fixed_rows::<4>(0).into_owned();
        BBox::from_xyah(&xyah, self.score)
    }

    /// Advance the motion model by one frame.
    pub fn predict(&mut self, kf: &KalmanFilter) {
        let (mean, covariance) = kf.predict(&self.mean, &self.covariance);
        self.mean = mean;
        self.covariance = covariance;
        self.age += 1;
    }

    /// Apply a matched detection.
    pub fn update(&mut self, kf: &KalmanFilter, det: &Detection) {
        let (mean, covariance) = kf.update(&self.mean, &self.covariance, &det.bbox.to_xyah());
        self.mean = mean;
        self.covariance = covariance;
        self.score = det.confidence();
        self.hits += 1;
        self.time_since_update = 0;

        if let Some(feat) = &det.feature {
            self.feature_counter += 1;
            if self.feature_counter % self.config.feature_update_interval == 0 {
                self.push_feature(feat);
            }
        }

        match self.state {
            TrackState::Tentative if self.hits >= self.config.accreditation_threshold => {
                self.state = TrackState::Stable;
            }
            TrackState::Missed => self.state = TrackState::Stable,
            _ => {}
        }
    }

    /// Register a frame without a match.
    pub fn mark_missed(&mut self) {
        self.hits = 0;
        self.time_since_update += 1;
        self.state = match self.state {
            TrackState::Tentative => TrackState::Deleted,
            TrackState::Stable | TrackState::Missed
                if self.time_since_update > self.config.max_unmatched_num =>
            {
                TrackState::Deleted
            }
            TrackState::Stable | TrackState::Missed => TrackState::Missed,
            TrackState::Deleted => TrackState::Deleted,
        };
    }

    /// Smallest cosine distance between `feature` and the stored gallery.
    pub fn min_cosine_distance(&self, feature: &[f32]) -> Option<f32> {
        let mut query = feature.to_vec();
        utils::l2_normalize(&mut query);
        self.features
            .iter()
            .map(|f| utils::cosine_distance(f, &query))
            .min_by(|a, b| a.total_cmp(b))
    }

    fn push_feature(&mut self, feature: &[f32]) {
        let mut feat = feature.to_vec();
        utils::l2_normalize(&mut feat);
        if self.features.len() >= self.config.feature_budget_size {
            self.features.pop_front();
        }
        self.features.push_back(feat);
    }
}
