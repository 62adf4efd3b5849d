//! Principal component reduction of genotype dosage matrices.
//!
//! Missing calls are replaced by the marker's mean dosage, columns are centred
//! (and optionally scaled to unit variance), and the covariance eigenproblem is
//! solved on whichever of `X Xᵀ` and `Xᵀ X` is smaller. The decomposition is
//! deterministic: the same matrix always yields the same scores, with each
//! component's sign fixed so that its largest-magnitude loading is positive.

use crate::genotype::MISSING_DOSAGE;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Eigenvalues below this fraction of the leading eigenvalue are treated as zero.
pub const EIGENVALUE_EPSILON: f64 = 1.0e-9;
const ABSOLUTE_EIGEN_FLOOR: f64 = 1.0e-10;
/// Markers whose standard deviation falls below this are left unscaled.
pub const SCALE_FLOOR: f64 = 1.0e-9;

#[derive(Debug, Error)]
pub enum PcaError {
    #[error("PCA requires at least two individuals, got {0}")]
    TooFewIndividuals(usize),

    #[error("requested component count must be at least one")]
    NoComponents,

    #[error("a {n_samples} x {n_markers} matrix supports no principal components")]
    InsufficientRank { n_samples: usize, n_markers: usize },

    #[error("eigendecomposition failed: {0}")]
    Eigen(#[from] LinalgError),

    #[error("all eigenvalues are numerically zero; the genotype matrix carries no variation")]
    NoVariation,

    #[error("projection input has {found} markers but the PCA was fitted on {expected}")]
    MarkerMismatch { found: usize, expected: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcaOptions {
    pub n_components: usize,
    pub center: bool,
    pub scale: bool,
}

impl PcaOptions {
    pub fn new(n_components: usize) -> Self {
        Self {
            n_components,
            center: true,
            scale: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaProjection {
    scores: Array2<f64>,
    loadings: Array2<f64>,
    eigenvalues: Array1<f64>,
    means: Array1<f64>,
    scales: Array1<f64>,
    center: bool,
    total_variance: f64,
}

/// Per-marker mean dosage over non-missing calls; 0 when a marker has no calls.
fn marker_means(dosages: ArrayView2<'_, u8>) -> Array1<f64> {
    dosages.map_axis(Axis(0), |column| {
        let (sum, calls) = column
            .iter()
            .filter(|&&d| d != MISSING_DOSAGE)
            .fold((0.0, 0usize), |(sum, calls), &d| (sum + d as f64, calls + 1));
        if calls == 0 { 0.0 } else { sum / calls as f64 }
    })
}

fn standardize(
    dosages: ArrayView2<'_, u8>,
    means: ArrayView1<'_, f64>,
    scales: ArrayView1<'_, f64>,
    center: bool,
) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros(dosages.dim());
    Zip::from(out.columns_mut())
        .and(dosages.columns())
        .and(means)
        .and(scales)
        .par_for_each(|mut col, raw, &mean, &scale| {
            let offset = if center { mean } else { 0.0 };
            for (slot, &d) in col.iter_mut().zip(raw.iter()) {
                let value = if d == MISSING_DOSAGE { mean } else { d as f64 };
                *slot = (value - offset) / scale;
            }
        });
    out
}

impl PcaProjection {
    /// Fits the projection on every row of `dosages`.
    pub fn fit(dosages: ArrayView2<'_, u8>, options: &PcaOptions) -> Result<Self, PcaError> {
        let (n, p) = dosages.dim();
        if n < 2 {
            return Err(PcaError::TooFewIndividuals(n));
        }
        if options.n_components == 0 {
            return Err(PcaError::NoComponents);
        }
        let max_rank = n.min(p).saturating_sub(1);
        if max_rank == 0 {
            return Err(PcaError::InsufficientRank {
                n_samples: n,
                n_markers: p,
            });
        }
        let target = options.n_components.min(max_rank);
        if target < options.n_components {
            log::debug!(
                "Clamped requested component count {} to {}",
                options.n_components,
                target
            );
        }

        let means = marker_means(dosages);
        let unscaled = Array1::<f64>::ones(p);
        let scales = if options.scale {
            let centered = standardize(dosages, means.view(), unscaled.view(), true);
            centered.map_axis(Axis(0), |col| {
                let sd = (col.dot(&col) / (n - 1) as f64).sqrt();
                if sd < SCALE_FLOOR { 1.0 } else { sd }
            })
        } else {
            unscaled
        };
        let x = standardize(dosages, means.view(), scales.view(), options.center);
        let denom = (n - 1) as f64;
        let total_variance = x.iter().map(|v| v * v).sum::<f64>() / denom;

        let (mut scores, mut loadings, raw_values) = if n <= p {
            let gram = x.dot(&x.t());
            let (values, vectors) = gram.eigh(UPLO::Lower)?;
            let order = leading_components(&values, target)?;
            let mut scores = Array2::<f64>::zeros((n, order.len()));
            let mut loadings = Array2::<f64>::zeros((p, order.len()));
            for (c, &idx) in order.iter().enumerate() {
                let root = values[idx].sqrt();
                let u = vectors.column(idx);
                scores.column_mut(c).assign(&(&u * root));
                loadings.column_mut(c).assign(&(x.t().dot(&u) / root));
            }
            let raw: Array1<f64> = order.iter().map(|&idx| values[idx]).collect();
            (scores, loadings, raw)
        } else {
            let cross = x.t().dot(&x);
            let (values, vectors) = cross.eigh(UPLO::Lower)?;
            let order = leading_components(&values, target)?;
            let mut loadings = Array2::<f64>::zeros((p, order.len()));
            for (c, &idx) in order.iter().enumerate() {
                loadings.column_mut(c).assign(&vectors.column(idx));
            }
            let scores = x.dot(&loadings);
            let raw: Array1<f64> = order.iter().map(|&idx| values[idx]).collect();
            (scores, loadings, raw)
        };

        fix_signs(&mut scores, &mut loadings);

        Ok(Self {
            scores,
            loadings,
            eigenvalues: raw_values / denom,
            means,
            scales,
            center: options.center,
            total_variance,
        })
    }

    pub fn n_components(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn n_samples(&self) -> usize {
        self.scores.nrows()
    }

    pub fn n_markers(&self) -> usize {
        self.loadings.nrows()
    }

    /// Individuals × components.
    pub fn scores(&self) -> ArrayView2<'_, f64> {
        self.scores.view()
    }

    /// Markers × components.
    pub fn loadings(&self) -> ArrayView2<'_, f64> {
        self.loadings.view()
    }

    /// Component variances in descending order.
    pub fn eigenvalues(&self) -> ArrayView1<'_, f64> {
        self.eigenvalues.view()
    }

    pub fn explained_variance_ratio(&self) -> Array1<f64> {
        if self.total_variance > 0.0 {
            &self.eigenvalues / self.total_variance
        } else {
            Array1::zeros(self.eigenvalues.len())
        }
    }

    /// The same projection restricted to its first `k` components.
    pub fn truncated(&self, k: usize) -> PcaProjection {
        let k = k.min(self.n_components());
        PcaProjection {
            scores: self.scores.slice(s![.., ..k]).to_owned(),
            loadings: self.loadings.slice(s![.., ..k]).to_owned(),
            eigenvalues: self.eigenvalues.slice(s![..k]).to_owned(),
            means: self.means.clone(),
            scales: self.scales.clone(),
            center: self.center,
            total_variance: self.total_variance,
        }
    }

    /// Projects individuals that were not part of the fit, imputing their
    /// missing calls with the fitted marker means.
    pub fn project_new(&self, dosages: ArrayView2<'_, u8>) -> Result<Array2<f64>, PcaError> {
        if dosages.ncols() != self.n_markers() {
            return Err(PcaError::MarkerMismatch {
                found: dosages.ncols(),
                expected: self.n_markers(),
            });
        }
        let x = standardize(dosages, self.means.view(), self.scales.view(), self.center);
        Ok(x.dot(&self.loadings))
    }
}

/// Indices of the `target` largest eigenvalues, descending, skipping numerical zeros.
fn leading_components(values: &Array1<f64>, target: usize) -> Result<Vec<usize>, PcaError> {
    let leading = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let cutoff = (EIGENVALUE_EPSILON * leading).max(ABSOLUTE_EIGEN_FLOOR);
    // eigh returns eigenvalues in ascending order.
    let order: Vec<usize> = (0..values.len())
        .rev()
        .take(target)
        .take_while(|&idx| values[idx] > cutoff)
        .collect();
    if order.is_empty() {
        return Err(PcaError::NoVariation);
    }
    if order.len() < target {
        log::debug!(
            "Retained {} of {} requested components; the rest have zero variance",
            order.len(),
            target
        );
    }
    Ok(order)
}

fn fix_signs(scores: &mut Array2<f64>, loadings: &mut Array2<f64>) {
    for c in 0..loadings.ncols() {
        let pivot = loadings
            .column(c)
            .iter()
            .cloned()
            .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            loadings.column_mut(c).mapv_inplace(|v| -v);
            scores.column_mut(c).mapv_inplace(|v| -v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seeding::trial_rng;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::Rng;

    fn random_dosages(n: usize, p: usize, seed: u64) -> Array2<u8> {
        let mut rng = trial_rng(seed, &[n as u64, p as u64]);
        Array2::from_shape_fn((n, p), |_| rng.gen_range(0..=2))
    }

    #[test]
    fn eigenvalues_are_non_increasing() {
        for (n, p) in [(12, 40), (40, 12)] {
            let dosages = random_dosages(n, p, 11);
            let pca = PcaProjection::fit(dosages.view(), &PcaOptions::new(8)).unwrap();
            assert_eq!(pca.n_components(), 8);
            for w in pca.eigenvalues().windows(2) {
                assert!(w[0] >= w[1]);
            }
        }
    }

    #[test]
    fn fit_is_deterministic() {
        let dosages = random_dosages(20, 60, 5);
        let a = PcaProjection::fit(dosages.view(), &PcaOptions::new(5)).unwrap();
        let b = PcaProjection::fit(dosages.view(), &PcaOptions::new(5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn score_variances_match_eigenvalues() {
        // Wide matrices go through the Gram path, tall ones through Xᵀ X.
        for (n, p) in [(10, 30), (30, 10)] {
            let dosages = random_dosages(n, p, 3);
            let pca = PcaProjection::fit(dosages.view(), &PcaOptions::new(4)).unwrap();
            for c in 0..pca.n_components() {
                let col = pca.scores().column(c).to_owned();
                let var = col.dot(&col) / (n - 1) as f64;
                assert_abs_diff_eq!(var, pca.eigenvalues()[c], epsilon = 1e-8);
                assert_abs_diff_eq!(col.sum(), 0.0, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn component_count_is_clamped() {
        let dosages = random_dosages(6, 50, 9);
        let pca = PcaProjection::fit(dosages.view(), &PcaOptions::new(100)).unwrap();
        assert!(pca.n_components() <= 5);
    }

    #[test]
    fn project_new_reproduces_training_scores() {
        let dosages = random_dosages(15, 25, 21);
        let pca = PcaProjection::fit(dosages.view(), &PcaOptions::new(6)).unwrap();
        let projected = pca.project_new(dosages.view()).unwrap();
        for (a, b) in projected.iter().zip(pca.scores().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
        }
    }

    #[test]
    fn missing_calls_project_like_the_marker_mean() {
        let dosages = array![
            [0, 1, 2, 0],
            [2, 1, 0, 1],
            [1, MISSING_DOSAGE, 1, 2],
            [0, 2, 2, 1],
        ];
        let pca = PcaProjection::fit(dosages.view(), &PcaOptions::new(2)).unwrap();
        // Column 1 mean over calls is 4/3, so its centred value for row 2 is zero.
        let x = standardize(
            dosages.view(),
            pca.means.view(),
            pca.scales.view(),
            true,
        );
        assert_abs_diff_eq!(x[(2, 1)], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pca.means[1], 4.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn largest_loading_is_positive() {
        let dosages = random_dosages(18, 30, 17);
        let pca = PcaProjection::fit(dosages.view(), &PcaOptions::new(4)).unwrap();
        for c in 0..pca.n_components() {
            let loadings = pca.loadings();
            let col = loadings.column(c);
            let pivot = col
                .iter()
                .cloned()
                .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
            assert!(pivot > 0.0);
        }
    }

    #[test]
    fn truncation_keeps_the_leading_prefix() {
        let dosages = random_dosages(20, 40, 31);
        let full = PcaProjection::fit(dosages.view(), &PcaOptions::new(10)).unwrap();
        let direct = PcaProjection::fit(dosages.view(), &PcaOptions::new(3)).unwrap();
        let truncated = full.truncated(3);
        assert_eq!(truncated.n_components(), 3);
        for (a, b) in truncated.scores().iter().zip(direct.scores().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
        }
    }

    #[test]
    fn scaling_gives_unit_variance_columns() {
        let dosages = random_dosages(25, 10, 41);
        let options = PcaOptions {
            n_components: 9,
            center: true,
            scale: true,
        };
        let pca = PcaProjection::fit(dosages.view(), &options).unwrap();
        let ratio_sum: f64 = pca.explained_variance_ratio().sum();
        assert!(ratio_sum <= 1.0 + 1e-9);
        assert_abs_diff_eq!(pca.total_variance, 10.0, epsilon = 1e-8);
    }

    #[test]
    fn identical_rows_have_no_variation() {
        let dosages = Array2::from_elem((5, 8), 1u8);
        let err = PcaProjection::fit(dosages.view(), &PcaOptions::new(2)).unwrap_err();
        assert!(matches!(err, PcaError::NoVariation));
    }

    #[test]
    fn rejects_degenerate_requests() {
        let one = Array2::from_elem((1, 8), 1u8);
        assert!(matches!(
            PcaProjection::fit(one.view(), &PcaOptions::new(2)),
            Err(PcaError::TooFewIndividuals(1))
        ));
        let two = array![[0, 1, 2, 1], [2, 1, 0, 0], [1, 2, 1, 0], [0, 0, 2, 2]];
        assert!(matches!(
            PcaProjection::fit(two.view(), &PcaOptions::new(0)),
            Err(PcaError::NoComponents)
        ));
        let pca = PcaProjection::fit(two.view(), &PcaOptions::new(2)).unwrap();
        let narrow = Array2::from_elem((2, 3), 0u8);
        assert!(matches!(
            pca.project_new(narrow.view()),
            Err(PcaError::MarkerMismatch { found: 3, expected: 4 })
        ));
    }
}
