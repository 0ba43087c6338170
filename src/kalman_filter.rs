use nalgebra::{SMatrix, SVector};
use std::collections::HashMap;

use crate::config::{KalmanFilterConfig, KalmanTrackerConfig, TrackerConfig};

pub type StateVector = SVector<f32, 8>;
pub type StateCovariance = SMatrix<f32, 8, 8>;
pub type Measurement = SVector<f32, 4>;
pub type MeasurementCovariance = SMatrix<f32, 4, 4>;

const MIN_EXTENT: f32 = 1e-3;
const REGULARIZATION: f32 = 1e-6;

/// Constant-velocity Kalman filter over `(x, y, a, h, vx, vy, va, vh)`.
///
/// The filter itself is stateless; tracks own their mean and covariance and
/// pass them in, so one filter serves every track of a class.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    motion_mat: StateCovariance,
    update_mat: SMatrix<f32, 4, 8>,
    config: KalmanFilterConfig,
}

/// `alpha[i] + beta[i] * state[x_idx[i]]` for every dimension.
fn noise_std<const N: usize>(
    alpha: &[f32; N],
    beta: &[f32; N],
    x_idx: &[usize; N],
    state: &StateVector,
) -> SVector<f32, N> {
    SVector::<f32, N>::from_fn(|i, _| alpha[i] + beta[i] * state[x_idx[i].min(7)])
}

impl KalmanFilter {
    pub fn new(config: KalmanFilterConfig) -> Self {
        let ndim = 4;
        let dt = 1.0;
        let mut motion_mat = StateCovariance::identity();
        for i in 0..ndim {
            motion_mat[(i, ndim + i)] = dt;
        }
        let update_mat = SMatrix::<f32, 4, 8>::identity();
        KalmanFilter {
            motion_mat,
            update_mat,
            config,
        }
    }

    pub fn config(&self) -> &KalmanFilterConfig {
        &self.config
    }

    #[inline]
    pub fn chi2_threshold(&self) -> f32 {
        self.config.chi2_threshold
    }

    /// Create an unassociated state from a measurement; velocities start at zero.
    pub fn initiate(
        &self,
        measurement: &Measurement,
        tracker: &KalmanTrackerConfig,
    ) -> (StateVector, StateCovariance) {
        let mut mean = StateVector::zeros();
        mean.fixed_rows_mut::<4>(0).copy_from(measurement);
        let std = noise_std(&tracker.p_alpha, &tracker.p_beta, &tracker.p_x_idx, &mean);
        let covariance = StateCovariance::from_diagonal(&std.component_mul(&std));
        (mean, covariance)
    }

    /// Predict step: x' = F x, P' = F P F^T + Q
    pub fn predict(
        &self,
        mean: &StateVector,
        covariance: &StateCovariance,
    ) -> (StateVector, StateCovariance) {
        let std = noise_std(
            &self.config.q_alpha,
            &self.config.q_beta,
            &self.config.q_x_idx,
            mean,
        );
        let q = StateCovariance::from_diagonal(&std.component_mul(&std));

        let mut new_mean = self.motion_mat * mean;
        let new_cov = self.motion_mat * covariance * self.motion_mat.transpose() + q;

        if self.config.enable_bounding_stay {
            new_mean[2] = new_mean[2].max(MIN_EXTENT);
            new_mean[3] = new_mean[3].max(MIN_EXTENT);
        }

        (new_mean, symmetrize(&new_cov))
    }

    /// Project state to measurement space: z = Hx, S = H P H^T + R
    pub fn project(
        &self,
        mean: &StateVector,
        covariance: &StateCovariance,
    ) -> (Measurement, MeasurementCovariance) {
        let std = noise_std(
            &self.config.r_alpha,
            &self.config.r_beta,
            &self.config.r_x_idx,
            mean,
        );
        let r = MeasurementCovariance::from_diagonal(&std.component_mul(&std));

        let z_mean = self.update_mat * mean;
        let s_cov = self.update_mat * covariance * self.update_mat.transpose() + r;

        (z_mean, s_cov)
    }

    /// Correction step. The covariance is updated in Joseph form and
    /// re-symmetrised so it stays positive semi-definite.
    pub fn update(
        &self,
        mean: &StateVector,
        covariance: &StateCovariance,
        measurement: &Measurement,
    ) -> (StateVector, StateCovariance) {
        let (projected_mean, projected_cov) = self.project(mean, covariance);
        let r = projected_cov - self.update_mat * covariance * self.update_mat.transpose();

        // K^T = S^-1 (H P), S is symmetric
        let hp = self.update_mat * covariance;
        let k_t = match solve_spd(&projected_cov, &hp) {
            Some(k_t) => k_t,
            None => {
                tracing::warn!("innovation covariance is singular, skipping Kalman update");
                return (*mean, *covariance);
            }
        };
        let k = k_t.transpose();

        let innovation = measurement - projected_mean;
        let new_mean = mean + k * innovation;

        let i_kh = StateCovariance::identity() - k * self.update_mat;
        let new_cov = i_kh * covariance * i_kh.transpose() + k * r * k.transpose();

        (new_mean, symmetrize(&new_cov))
    }

    /// Squared Mahalanobis distance between the projected state and each measurement.
    /// Compare against [`KalmanFilter::chi2_threshold`].
    pub fn gating_distance(
        &self,
        mean: &StateVector,
        covariance: &StateCovariance,
        measurements: &[Measurement],
    ) -> Vec<f32> {
        let (z_mean, s_cov) = self.project(mean, covariance);
        measurements
            .iter()
            .map(|z| {
                let d = z - z_mean;
                match solve_spd(&s_cov, &d) {
                    Some(s_inv_d) => d.dot(&s_inv_d),
                    None => f32::INFINITY,
                }
            })
            .collect()
    }
}

/// One filter per class that carries its own noise settings, plus the default.
#[derive(Debug, Clone)]
pub struct FilterBank {
    default: KalmanFilter,
    per_class: HashMap<i32, KalmanFilter>,
}

impl FilterBank {
    pub fn new(config: &TrackerConfig) -> Self {
        let per_class = config
            .class_overrides
            .iter()
            .map(|(&class_id, c)| (class_id, KalmanFilter::new(c.kfilter.clone())))
            .collect();
        Self {
            default: KalmanFilter::new(config.kfilter.clone()),
            per_class,
        }
    }

    #[inline]
    pub fn get(&self, class_id: i32) -> &KalmanFilter {
        self.per_class.get(&class_id).unwrap_or(&self.default)
    }
}

fn symmetrize(m: &StateCovariance) -> StateCovariance {
    (m + m.transpose()) * 0.5
}

/// Solve `S x = b` for a symmetric positive definite `S`, falling back to a
/// regularised LU solve when Cholesky fails.
fn solve_spd<const C: usize>(
    s: &MeasurementCovariance,
    b: &SMatrix<f32, 4, C>,
) -> Option<SMatrix<f32, 4, C>> {
    if let Some(chol) = s.cholesky() {
        return Some(chol.solve(b));
    }
    let regularized = s + MeasurementCovariance::identity() * REGULARIZATION;
    regularized.lu().solve(b)
}
