//! Rigid alignment of 3-D point correspondences.
//!
//! [`kabsch`] is the closed-form least-squares solution (centroids, SVD of
//! the cross-covariance, reflection fix). [`robust_rigid_fit`] wraps it in
//! an iterative trim that discards correspondences whose residual exceeds
//! a threshold, which is what the tracker needs when some descriptor
//! matches are wrong.

use lar_types::Transform;
use nalgebra::{Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};

/// Relative size of the second singular value below which the point set is
/// considered collinear.
const COLLINEAR_RATIO: f64 = 1e-9;

/// Least-squares rigid transform `T` minimising `Σ ‖T·sourceᵢ − targetᵢ‖²`.
///
/// Needs at least three non-collinear correspondences.
pub fn kabsch(source: &[Vector3<f64>], target: &[Vector3<f64>]) -> Option<Transform> {
    let n = source.len();
    if n < 3 || n != target.len() {
        return None;
    }

    let centroid_src = source.iter().sum::<Vector3<f64>>() / n as f64;
    let centroid_tgt = target.iter().sum::<Vector3<f64>>() / n as f64;

    let mut h = Matrix3::zeros();
    for (s, t) in source.iter().zip(target) {
        h += (s - centroid_src) * (t - centroid_tgt).transpose();
    }

    let svd = h.svd(true, true);
    let mut singular: Vec<(usize, f64)> = svd.singular_values.iter().copied().enumerate().collect();
    singular.sort_by(|a, b| b.1.total_cmp(&a.1));
    if singular[0].1 <= f64::EPSILON || singular[1].1 < singular[0].1 * COLLINEAR_RATIO {
        return None;
    }

    let u = svd.u?;
    let mut v = svd.v_t?.transpose();
    let mut r = v * u.transpose();
    if r.determinant() < 0.0 {
        // Reflection: flip the axis of the smallest singular value.
        let weakest = singular[2].0;
        for row in 0..3 {
            v[(row, weakest)] = -v[(row, weakest)];
        }
        r = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let translation = centroid_tgt - rotation * centroid_src;
    Some(Transform::from_parts(Translation3::from(translation), rotation))
}

/// Tuning for [`robust_rigid_fit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustFitConfig {
    /// Residual (metres) below which a correspondence counts as an inlier.
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    pub max_iterations: usize,
}

impl Default for RobustFitConfig {
    fn default() -> Self {
        Self {
            inlier_threshold: 0.05,
            min_inliers: 6,
            max_iterations: 12,
        }
    }
}

/// Result of [`robust_rigid_fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct RigidFit {
    pub transform: Transform,
    /// Indices (into the input slices) of the inlier correspondences.
    pub inliers: Vec<usize>,
    pub rms_error: f64,
}

/// Outlier-tolerant rigid fit.
///
/// Starts from all correspondences; each round fits with [`kabsch`], keeps
/// those under `inlier_threshold`, and when too few survive trims the worst
/// fifth of the current set instead. Stops when the inlier set is stable.
pub fn robust_rigid_fit(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    config: &RobustFitConfig,
) -> Option<RigidFit> {
    if source.len() != target.len() || source.len() < config.min_inliers.max(3) {
        return None;
    }
    let residual =
        |t: &Transform, i: usize| (t * Point3::from(source[i]) - Point3::from(target[i])).norm();

    let mut active: Vec<usize> = (0..source.len()).collect();
    for _ in 0..config.max_iterations {
        let (src, tgt): (Vec<_>, Vec<_>) = active.iter().map(|&i| (source[i], target[i])).unzip();
        let transform = kabsch(&src, &tgt)?;

        let inliers: Vec<usize> = (0..source.len())
            .filter(|&i| residual(&transform, i) < config.inlier_threshold)
            .collect();

        if inliers.len() >= config.min_inliers {
            if inliers == active {
                let rms = (inliers.iter().map(|&i| residual(&transform, i).powi(2)).sum::<f64>()
                    / inliers.len() as f64)
                    .sqrt();
                return Some(RigidFit {
                    transform,
                    inliers,
                    rms_error: rms,
                });
            }
            active = inliers;
            continue;
        }

        let keep = (active.len() * 4 / 5).max(3);
        if keep >= active.len() {
            return None;
        }
        active.sort_by(|&a, &b| residual(&transform, a).total_cmp(&residual(&transform, b)));
        active.truncate(keep);
        active.sort_unstable();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud() -> Vec<Vector3<f64>> {
        (0..20)
            .map(|i| {
                let f = i as f64;
                Vector3::new((f * 0.7).sin() * 3.0, (f * 0.3).cos(), f * 0.25 - 2.0)
            })
            .collect()
    }

    fn known_transform() -> Transform {
        Transform::from_parts(
            Translation3::new(1.5, -0.2, 4.0),
            UnitQuaternion::from_euler_angles(0.1, -0.7, 0.3),
        )
    }

    fn apply(t: &Transform, pts: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        pts.iter().map(|p| (t * Point3::from(*p)).coords).collect()
    }

    #[test]
    fn kabsch_recovers_known_transform() {
        let src = cloud();
        let truth = known_transform();
        let tgt = apply(&truth, &src);

        let est = kabsch(&src, &tgt).unwrap();
        assert!((est.translation.vector - truth.translation.vector).norm() < 1e-9);
        assert!(est.rotation.angle_to(&truth.rotation) < 1e-9);
    }

    #[test]
    fn kabsch_rejects_too_few_or_collinear_points() {
        let two = vec![Vector3::zeros(), Vector3::x()];
        assert!(kabsch(&two, &two).is_none());

        let line: Vec<_> = (0..6).map(|i| Vector3::new(i as f64, 0.0, 0.0)).collect();
        assert!(kabsch(&line, &line).is_none());
    }

    #[test]
    fn robust_fit_discards_outliers() {
        let src = cloud();
        let truth = known_transform();
        let mut tgt = apply(&truth, &src);
        tgt[3] += Vector3::new(2.0, 0.0, 0.0);
        tgt[11] += Vector3::new(0.0, -1.5, 0.5);
        tgt[17] += Vector3::new(0.0, 0.0, 3.0);

        let fit = robust_rigid_fit(&src, &tgt, &RobustFitConfig::default()).unwrap();
        assert_eq!(fit.inliers.len(), 17);
        assert!(!fit.inliers.contains(&3));
        assert!(fit.rms_error < 1e-6);
        assert!((fit.transform.translation.vector - truth.translation.vector).norm() < 1e-6);
    }

    #[test]
    fn robust_fit_gives_up_on_noise() {
        let src = cloud();
        let tgt: Vec<_> = src
            .iter()
            .enumerate()
            .map(|(i, p)| p * ((i % 5) as f64 - 2.0) + Vector3::new(i as f64, 0.0, 0.0))
            .collect();
        assert!(robust_rigid_fit(&src, &tgt, &RobustFitConfig::default()).is_none());
    }
}
