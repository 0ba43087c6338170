//! Data association between predicted tracks and the detections of one frame.
//!
//! Confirmed tracks go through a matching cascade ordered by frames since their
//! last match, using a gated motion (or appearance) cost solved with the
//! Hungarian algorithm. Whatever is left is offered an IoU-only match against
//! tentative and recently matched tracks.

use nalgebra::DMatrix;
use pathfinding::{kuhn_munkres::kuhn_munkres_min, matrix::Matrix};

use crate::config::TrackerConfig;
use crate::detection::Detection;
use crate::kalman_filter::{FilterBank, Measurement};
use crate::track::Track;
use crate::utils;

/// Cost of a pair that must never be matched.
pub const INFTY_COST: f32 = 1e5;

/// Integer scale for the Hungarian solver.
const COST_SCALE: f32 = 1e5;

/// Matches as `(track index, detection index)` plus the leftovers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchResult {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Solve a rectangular min-cost assignment. Returns `(row, col)` pairs, one per
/// row or column, whichever is smaller.
pub fn solve_assignment(cost: &DMatrix<f32>) -> Vec<(usize, usize)> {
    let (rows, cols) = cost.shape();
    if rows == 0 || cols == 0 {
        return Vec::new();
    }

    // kuhn_munkres needs rows <= columns
    let transpose = rows > cols;
    let (r, c) = if transpose { (cols, rows) } else { (rows, cols) };
    let mut weights = Matrix::new(r, c, 0i64);
    for i in 0..rows {
        for j in 0..cols {
            let v = cost[(i, j)];
            let v = if v.is_finite() { v.min(INFTY_COST) } else { INFTY_COST };
            let w = (v * COST_SCALE).round() as i64;
            if transpose {
                weights[(j, i)] = w;
            } else {
                weights[(i, j)] = w;
            }
        }
    }

    let (_total, assignment) = kuhn_munkres_min(&weights);
    assignment
        .into_iter()
        .enumerate()
        .map(|(row, col)| if transpose { (col, row) } else { (row, col) })
        .collect()
}

/// Thresholded minimum-cost matching on a cost sub-matrix.
///
/// `cost` is indexed `(i, j)` for `track_indices[i]` and `detection_indices[j]`;
/// assignments whose cost exceeds `max_distance` are rejected.
pub fn min_cost_matching(
    cost: &DMatrix<f32>,
    max_distance: f32,
    track_indices: &[usize],
    detection_indices: &[usize],
) -> MatchResult {
    if track_indices.is_empty() || detection_indices.is_empty() {
        return MatchResult {
            matches: Vec::new(),
            unmatched_tracks: track_indices.to_vec(),
            unmatched_detections: detection_indices.to_vec(),
        };
    }

    let gated = cost.map(|c| {
        if c.is_nan() || c > max_distance {
            max_distance + 1e-5
        } else {
            c
        }
    });

    let mut track_used = vec![false; track_indices.len()];
    let mut det_used = vec![false; detection_indices.len()];
    let mut matches = Vec::new();
    for (i, j) in solve_assignment(&gated) {
        if cost[(i, j)] > max_distance || cost[(i, j)].is_nan() {
            continue;
        }
        track_used[i] = true;
        det_used[j] = true;
        matches.push((track_indices[i], detection_indices[j]));
    }

    MatchResult {
        matches,
        unmatched_tracks: track_indices
            .iter()
            .zip(&track_used)
            .filter(|(_, &used)| !used)
            .map(|(&t, _)| t)
            .collect(),
        unmatched_detections: detection_indices
            .iter()
            .zip(&det_used)
            .filter(|(_, &used)| !used)
            .map(|(&d, _)| d)
            .collect(),
    }
}

/// Run `min_cost_matching` level by level, giving tracks matched more recently
/// the first pick of the detections.
pub fn matching_cascade<F>(
    distance: F,
    max_distance: f32,
    cascade_depth: u32,
    tracks: &[Track],
    track_indices: &[usize],
    detection_indices: &[usize],
) -> MatchResult
where
    F: Fn(&[usize], &[usize]) -> DMatrix<f32>,
{
    let mut unmatched_detections = detection_indices.to_vec();
    let mut matches = Vec::new();

    for level in 0..=cascade_depth {
        if unmatched_detections.is_empty() {
            break;
        }
        let level_tracks: Vec<usize> = track_indices
            .iter()
            .copied()
            .filter(|&k| tracks[k].time_since_update() == level)
            .collect();
        if level_tracks.is_empty() {
            continue;
        }
        let cost = distance(&level_tracks, &unmatched_detections);
        let result = min_cost_matching(&cost, max_distance, &level_tracks, &unmatched_detections);
        matches.extend(result.matches);
        unmatched_detections = result.unmatched_detections;
    }

    let unmatched_tracks = track_indices
        .iter()
        .copied()
        .filter(|k| !matches.iter().any(|(t, _)| t == k))
        .collect();

    MatchResult {
        matches,
        unmatched_tracks,
        unmatched_detections,
    }
}

/// Builds cost matrices and runs the full two-stage association.
pub struct Associator<'a> {
    config: &'a TrackerConfig,
    filters: &'a FilterBank,
}

impl<'a> Associator<'a> {
    pub fn new(config: &'a TrackerConfig, filters: &'a FilterBank) -> Self {
        Self { config, filters }
    }

    fn class_mismatch(&self, track: &Track, det: &Detection) -> bool {
        self.config.class_gating && track.class_id() != det.class_id
    }

    /// Squared Mahalanobis distance normalised by the gate, so 1.0 is the gate.
    pub fn motion_cost(
        &self,
        tracks: &[Track],
        dets: &[Detection],
        track_indices: &[usize],
        detection_indices: &[usize],
    ) -> DMatrix<f32> {
        let measurements: Vec<Measurement> = detection_indices
            .iter()
            .map(|&d| dets[d].bbox.to_xyah())
            .collect();
        let mut cost = DMatrix::from_element(track_indices.len(), detection_indices.len(), INFTY_COST);
        for (i, &t) in track_indices.iter().enumerate() {
            let track = &tracks[t];
            let kf = self.filters.get(track.class_id());
            let dist = kf.gating_distance(track.mean(), track.covariance(), &measurements);
            for (j, &d) in detection_indices.iter().enumerate() {
                if self.class_mismatch(track, &dets[d]) {
                    continue;
                }
                cost[(i, j)] = dist[j] / kf.chi2_threshold();
            }
        }
        cost
    }

    /// Minimum cosine distance against each track's gallery, gated by motion.
    /// Pairs without appearance data fall back to the scaled motion cost.
    pub fn appearance_cost(
        &self,
        tracks: &[Track],
        dets: &[Detection],
        track_indices: &[usize],
        detection_indices: &[usize],
    ) -> DMatrix<f32> {
        let motion = self.motion_cost(tracks, dets, track_indices, detection_indices);
        let mut cost = DMatrix::from_element(track_indices.len(), detection_indices.len(), INFTY_COST);
        for (i, &t) in track_indices.iter().enumerate() {
            for (j, &d) in detection_indices.iter().enumerate() {
                let m = motion[(i, j)];
                if m > 1.0 {
                    continue;
                }
                let appearance = dets[d]
                    .feature
                    .as_deref()
                    .and_then(|f| tracks[t].min_cosine_distance(f));
                cost[(i, j)] = match appearance {
                    Some(c) => c,
                    None => m * self.config.max_distance_cosine,
                };
            }
        }
        cost
    }

    /// `1 - IoU` between predicted boxes and detections.
    pub fn iou_cost(
        &self,
        tracks: &[Track],
        dets: &[Detection],
        track_indices: &[usize],
        detection_indices: &[usize],
    ) -> DMatrix<f32> {
        let mut cost = DMatrix::from_element(track_indices.len(), detection_indices.len(), INFTY_COST);
        for (i, &t) in track_indices.iter().enumerate() {
            let track_box = tracks[t].bbox();
            for (j, &d) in detection_indices.iter().enumerate() {
                if self.class_mismatch(&tracks[t], &dets[d]) {
                    continue;
                }
                cost[(i, j)] = 1.0 - utils::compute_iou(&track_box, &dets[d].bbox);
            }
        }
        cost
    }

    fn cascade_depth(&self) -> u32 {
        self.config
            .class_overrides
            .values()
            .map(|c| c.ktracker.max_unmatched_num)
            .chain(std::iter::once(self.config.ktracker.max_unmatched_num))
            .max()
            .unwrap_or(0)
    }

    /// Associate predicted tracks with this frame's detections.
    /// Degenerate boxes never take part and are returned as unmatched.
    pub fn associate(&self, tracks: &[Track], dets: &[Detection]) -> MatchResult {
        let mut degenerate = Vec::new();
        let mut detection_indices = Vec::with_capacity(dets.len());
        for (j, det) in dets.iter().enumerate() {
            if det.bbox.is_degenerate() {
                degenerate.push(j);
            } else {
                detection_indices.push(j);
            }
        }

        let live = |k: &usize| !tracks[*k].is_deleted();
        let confirmed: Vec<usize> = (0..tracks.len())
            .filter(live)
            .filter(|&k| tracks[k].is_confirmed())
            .collect();
        let unconfirmed: Vec<usize> = (0..tracks.len())
            .filter(live)
            .filter(|&k| tracks[k].is_tentative())
            .collect();

        // Stage 1: cascade over confirmed tracks
        let stage_a = if self.config.use_reid {
            matching_cascade(
                |t, d| self.appearance_cost(tracks, dets, t, d),
                self.config.max_distance_cosine,
                self.cascade_depth(),
                tracks,
                &confirmed,
                &detection_indices,
            )
        } else {
            matching_cascade(
                |t, d| self.motion_cost(tracks, dets, t, d),
                1.0,
                self.cascade_depth(),
                tracks,
                &confirmed,
                &detection_indices,
            )
        };

        // Stage 2: IoU against tentative and recently matched confirmed tracks
        let recent = self.config.max_unmatched_times_for_bbox_matching;
        let (iou_candidates, stale): (Vec<usize>, Vec<usize>) = stage_a
            .unmatched_tracks
            .iter()
            .partition(|&&k| tracks[k].time_since_update() <= recent);
        let iou_tracks: Vec<usize> = unconfirmed.into_iter().chain(iou_candidates).collect();
        let iou_cost = self.iou_cost(tracks, dets, &iou_tracks, &stage_a.unmatched_detections);
        let stage_b = min_cost_matching(
            &iou_cost,
            self.config.max_distance_iou,
            &iou_tracks,
            &stage_a.unmatched_detections,
        );

        let mut unmatched_detections = stage_b.unmatched_detections;
        unmatched_detections.extend(degenerate);
        unmatched_detections.sort_unstable();

        MatchResult {
            matches: stage_a.matches.into_iter().chain(stage_b.matches).collect(),
            unmatched_tracks: stale.into_iter().chain(stage_b.unmatched_tracks).collect(),
            unmatched_detections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use crate::kalman_filter::KalmanFilter;

    #[test]
    fn test_solve_assignment_square() {
        let cost = DMatrix::from_row_slice(3, 3, &[
            4.0, 1.0, 3.0,
            2.0, 0.0, 5.0,
            3.0, 2.0, 2.0,
        ]);
        let mut pairs = solve_assignment(&cost);
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(0, 1), (1, 0), (2, 2)]);
    }

    #[test]
    fn test_solve_assignment_tall() {
        // more rows than columns exercises the transpose path
        let cost = DMatrix::from_row_slice(3, 2, &[
            0.9, 0.1,
            0.2, 0.8,
            0.5, 0.5,
        ]);
        let mut pairs = solve_assignment(&cost);
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn test_min_cost_matching_gates() {
        let cost = DMatrix::from_row_slice(2, 2, &[
            0.1, 0.9,
            0.9, 0.95,
        ]);
        let result = min_cost_matching(&cost, 0.5, &[10, 11], &[20, 21]);
        assert_eq!(result.matches, vec![(10, 20)]);
        assert_eq!(result.unmatched_tracks, vec![11]);
        assert_eq!(result.unmatched_detections, vec![21]);
    }

    #[test]
    fn test_min_cost_matching_empty() {
        let cost = DMatrix::<f32>::zeros(0, 2);
        let result = min_cost_matching(&cost, 0.5, &[], &[0, 1]);
        assert!(result.matches.is_empty());
        assert_eq!(result.unmatched_detections, vec![0, 1]);
    }

    fn stable_track(id: u64, bbox: BBox, config: &TrackerConfig, kf: &KalmanFilter) -> Track {
        let det = Detection::new(bbox, 0);
        let mut track = Track::new(id, &det, kf, &config.ktracker);
        for _ in 0..config.ktracker.accreditation_threshold {
            track.update(kf, &det);
        }
        track
    }

    #[test]
    fn test_cascade_prefers_recent_tracks() {
        let config = TrackerConfig::default();
        let bank = FilterBank::new(&config);
        let kf = bank.get(0);
        let bbox = BBox::new(100.0, 100.0, 150.0, 200.0, 0.9);
        let fresh = stable_track(1, bbox, &config, kf);
        let mut old = stable_track(2, bbox, &config, kf);
        old.mark_missed();
        old.mark_missed();
        let tracks = vec![old, fresh];
        let dets = vec![Detection::new(bbox, 0)];

        let assoc = Associator::new(&config, &bank);
        let result = assoc.associate(&tracks, &dets);
        assert_eq!(result.matches, vec![(1, 0)]);
        assert_eq!(result.unmatched_tracks, vec![0]);
    }

    #[test]
    fn test_tentative_tracks_use_iou() {
        let config = TrackerConfig::default();
        let bank = FilterBank::new(&config);
        let kf = bank.get(0);
        let bbox = BBox::new(100.0, 100.0, 150.0, 200.0, 0.9);
        let tentative = Track::new(1, &Detection::new(bbox, 0), kf, &config.ktracker);
        let tracks = vec![tentative];
        let dets = vec![
            Detection::new(BBox::new(102.0, 101.0, 152.0, 201.0, 0.9), 0),
            Detection::new(BBox::new(400.0, 400.0, 450.0, 500.0, 0.9), 0),
        ];

        let result = Associator::new(&config, &bank).associate(&tracks, &dets);
        assert_eq!(result.matches, vec![(0, 0)]);
        assert_eq!(result.unmatched_detections, vec![1]);
    }

    #[test]
    fn test_class_gating_and_degenerate_boxes() {
        let config = TrackerConfig::default();
        let bank = FilterBank::new(&config);
        let kf = bank.get(0);
        let bbox = BBox::new(100.0, 100.0, 150.0, 200.0, 0.9);
        let tracks = vec![stable_track(1, bbox, &config, kf)];
        let dets = vec![
            Detection::new(bbox, 7),
            Detection::new(BBox::new(100.0, 100.0, 100.0, 200.0, 0.9), 0),
        ];

        let result = Associator::new(&config, &bank).associate(&tracks, &dets);
        assert!(result.matches.is_empty());
        assert_eq!(result.unmatched_tracks, vec![0]);
        assert_eq!(result.unmatched_detections, vec![0, 1]);
    }

    #[test]
    fn test_appearance_cost_uses_gallery() {
        let mut config = TrackerConfig::default();
        config.use_reid = true;
        let bank = FilterBank::new(&config);
        let kf = bank.get(0);
        let bbox = BBox::new(100.0, 100.0, 150.0, 200.0, 0.9);
        let det = Detection::new(bbox, 0).with_feature(vec![1.0, 0.0]);
        let track = Track::new(1, &det, kf, &config.ktracker);
        let tracks = vec![track];
        let dets = vec![
            Detection::new(bbox, 0).with_feature(vec![0.0, 1.0]),
            Detection::new(bbox, 0).with_feature(vec![2.0, 0.0]),
        ];

        let assoc = Associator::new(&config, &bank);
        let cost = assoc.appearance_cost(&tracks, &dets, &[0], &[0, 1]);
        assert!((cost[(0, 0)] - 1.0).abs() < 1e-5);
        assert!(cost[(0, 1)].abs() < 1e-5);
    }
}
