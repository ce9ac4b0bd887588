//! State Estimator (spec.md §4.D) — constant-velocity Kalman filter over
//! the tracker's measured position.
//!
//! Grounded on `original_source/kalman_filter.py`'s `SkyWatchKalman` for the
//! model (state `[x, y, vx, vy]`, measurement `[x, y]`, linear transition
//! with `dt` re-set on every predict); the `nalgebra::SMatrix` plumbing
//! style (named matrix aliases, `try_inverse` Kalman gain, `(I - K*H) * P`
//! covariance update) is grounded on
//! `other_examples/09d2fde0_dirkwa-mayara-server__mayara-core-src-arpa-kalman.rs.rs`.

use nalgebra::SMatrix;

type Matrix2x2 = SMatrix<f64, 2, 2>;
type Matrix4x4 = SMatrix<f64, 4, 4>;
type Matrix4x2 = SMatrix<f64, 4, 2>;
type Matrix2x4 = SMatrix<f64, 2, 4>;
type Vector4 = SMatrix<f64, 4, 1>;
type Vector2 = SMatrix<f64, 2, 1>;

/// Linear constant-velocity Kalman filter tracking `(x, y, vx, vy)`.
#[derive(Debug, Clone)]
pub struct KalmanEstimator {
    state: Vector4,
    /// State transition matrix, `dt` re-set on every `predict`.
    f: Matrix4x4,
    /// Measurement matrix: observes position only.
    h: Matrix2x4,
    ht: Matrix4x2,
    /// Process noise covariance.
    q: Matrix4x4,
    /// Measurement noise covariance.
    r: Matrix2x2,
    /// Estimate error covariance.
    p: Matrix4x4,
    i: Matrix4x4,
}

impl KalmanEstimator {
    pub fn new(x0: f64, y0: f64, process_noise: f64, measurement_noise: f64) -> Self {
        let mut f = Matrix4x4::identity();
        f[(0, 2)] = 1.0;
        f[(1, 3)] = 1.0;

        let mut h = Matrix2x4::zeros();
        h[(0, 0)] = 1.0;
        h[(1, 1)] = 1.0;

        Self {
            state: Vector4::new(x0, y0, 0.0, 0.0),
            f,
            h,
            ht: h.transpose(),
            q: Matrix4x4::identity() * process_noise,
            r: Matrix2x2::identity() * measurement_noise,
            p: Matrix4x4::identity(),
            i: Matrix4x4::identity(),
        }
    }

    /// Predict the state `dt_eff` seconds ahead (spec.md §4.D: effective dt
    /// accounts for compensated system latency).
    pub fn predict(&mut self, dt_eff: f64) {
        self.f[(0, 2)] = dt_eff;
        self.f[(1, 3)] = dt_eff;

        self.state = self.f * self.state;
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    /// Correct the state with a new `(x, y)` measurement.
    pub fn update(&mut self, x: f64, y: f64) {
        let z = Vector2::new(x, y);
        let s = self.h * self.p * self.ht + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k = self.p * self.ht * s_inv;
        let innovation = z - self.h * self.state;
        self.state += k * innovation;
        self.p = (self.i - k * self.h) * self.p;
    }

    /// Returns `(x, y, vx, vy)`.
    pub fn state(&self) -> (f64, f64, f64, f64) {
        (self.state[(0, 0)], self.state[(1, 0)], self.state[(2, 0)], self.state[(3, 0)])
    }

    pub fn position(&self) -> (f64, f64) {
        (self.state[(0, 0)], self.state[(1, 0)])
    }

    pub fn velocity(&self) -> (f64, f64) {
        (self.state[(2, 0)], self.state[(3, 0)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_holds_seed_position_with_zero_velocity() {
        let kf = KalmanEstimator::new(10.0, 20.0, 1e-5, 1e-1);
        assert_eq!(kf.state(), (10.0, 20.0, 0.0, 0.0));
    }

    #[test]
    fn predict_projects_position_by_velocity() {
        let mut kf = KalmanEstimator::new(0.0, 0.0, 1e-5, 1e-1);
        // Seed a velocity via a couple of updates at a steady displacement.
        kf.predict(1.0);
        kf.update(5.0, 0.0);
        kf.predict(1.0);
        kf.update(10.0, 0.0);
        let (x_before, _, vx, _) = kf.state();
        kf.predict(1.0);
        let (x_after, _, _, _) = kf.state();
        assert!((x_after - (x_before + vx)).abs() < 1e-6);
    }

    #[test]
    fn converges_towards_noisy_linear_measurements() {
        let mut kf = KalmanEstimator::new(0.0, 0.0, 1e-3, 1e-1);
        // True trajectory: x = 2*t, y = 1*t, constant velocity.
        for t in 1..=50 {
            kf.predict(1.0);
            let true_x = 2.0 * t as f64;
            let true_y = 1.0 * t as f64;
            // Small deterministic jitter, no RNG (toolchain-free tests
            // must stay reproducible without `rand`).
            let jitter = if t % 2 == 0 { 0.3 } else { -0.3 };
            kf.update(true_x + jitter, true_y + jitter);
        }
        let (x, y, vx, vy) = kf.state();
        assert!((x - 100.0).abs() < 3.0, "x={x}");
        assert!((y - 50.0).abs() < 3.0, "y={y}");
        assert!((vx - 2.0).abs() < 0.3, "vx={vx}");
        assert!((vy - 1.0).abs() < 0.3, "vy={vy}");
    }

    #[test]
    fn stationary_target_stays_near_seed() {
        let mut kf = KalmanEstimator::new(100.0, 100.0, 1e-5, 1e-1);
        for _ in 0..20 {
            kf.predict(1.0);
            kf.update(100.0, 100.0);
        }
        let (x, y, vx, vy) = kf.state();
        assert!((x - 100.0).abs() < 1.0);
        assert!((y - 100.0).abs() < 1.0);
        assert!(vx.abs() < 0.1);
        assert!(vy.abs() < 0.1);
    }

    #[test]
    fn singular_innovation_covariance_is_a_noop() {
        // Zero measurement noise and zero process/error covariance can
        // drive S singular in degenerate configurations; update must not
        // panic and must leave the state unchanged.
        let mut kf = KalmanEstimator::new(1.0, 1.0, 0.0, 0.0);
        kf.p = Matrix4x4::zeros();
        let before = kf.state();
        kf.update(5.0, 5.0);
        assert_eq!(kf.state(), before);
    }
}
