//! Linear discriminant analysis on principal component scores.
//!
//! The generalized eigenproblem `B a = λ W a` (between-group against pooled
//! within-group covariance) is solved by whitening: `W` is eigendecomposed,
//! regularised when it is singular, and `W^{-1/2} B W^{-1/2}` is handed to a
//! symmetric eigensolver. Axes are mapped back through `W^{-1/2}`, so the
//! within-group covariance is the identity in discriminant space.
//!
//! Posterior membership follows the Gaussian discriminant rule in that space:
//! `P(k | z) ∝ π_k · exp(-½‖z − c_k‖²)` with `π_k` the training group
//! proportions. The same rule serves both fitting and cross-validation.

use crate::genotype::GenotypeMatrix;
use crate::pca::{PcaError, PcaOptions, PcaProjection};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ridge added to the within-group covariance, relative to its mean diagonal
/// (floored at one).
pub const RIDGE_FACTOR: f64 = 1.0e-6;
const SINGULAR_CONDITION: f64 = 1.0e-10;
const AXIS_EPSILON: f64 = 1.0e-9;
const DEGENERATE_SCATTER: f64 = 1.0e-12;

#[derive(Debug, Error)]
pub enum DiscriminantError {
    #[error("{n_labels} group labels supplied for {n_samples} individuals")]
    LabelMismatch { n_labels: usize, n_samples: usize },

    #[error("group labels must start at 1; found label 0")]
    ZeroLabel,

    #[error("group {label} has no members; labels must cover 1..={n_groups}")]
    EmptyGroup { label: usize, n_groups: usize },

    #[error("group {label} has zero within-group variance; within-group covariance was regularised")]
    DegenerateGroup { label: usize },

    #[error("PCA step failed: {0}")]
    Pca(#[from] PcaError),

    #[error("eigendecomposition failed: {0}")]
    Eigen(#[from] LinalgError),

    #[error("model was fitted on {expected} markers but {found} were supplied")]
    MarkerMismatch { found: usize, expected: usize },
}

/// Membership predictions for a batch of individuals.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    /// Individuals × discriminant axes.
    pub coordinates: Array2<f64>,
    /// Individuals × groups; rows sum to one.
    pub posterior: Array2<f64>,
    /// Maximum-posterior group, 1-based.
    pub assignments: Vec<usize>,
}

/// A fitted discriminant function over some score space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscriminantFit {
    /// Score dimensions × discriminant axes.
    axes: Array2<f64>,
    eigenvalues: Array1<f64>,
    grand_mean: Array1<f64>,
    /// Groups × discriminant axes.
    centroids: Array2<f64>,
    priors: Array1<f64>,
    group_sizes: Vec<usize>,
    degenerate_groups: Vec<usize>,
    ridge: f64,
}

/// Checks that `labels` are 1-based, aligned with `n_samples` rows and that no
/// group in `1..=max` is empty. Returns the group count.
pub fn count_groups(labels: &[usize], n_samples: usize) -> Result<usize, DiscriminantError> {
    if labels.len() != n_samples {
        return Err(DiscriminantError::LabelMismatch {
            n_labels: labels.len(),
            n_samples,
        });
    }
    if labels.contains(&0) {
        return Err(DiscriminantError::ZeroLabel);
    }
    let n_groups = labels.iter().copied().max().unwrap_or(0);
    let mut sizes = vec![0usize; n_groups];
    for &label in labels {
        sizes[label - 1] += 1;
    }
    if let Some(empty) = sizes.iter().position(|&s| s == 0) {
        return Err(DiscriminantError::EmptyGroup {
            label: empty + 1,
            n_groups,
        });
    }
    Ok(n_groups)
}

fn outer_accumulate(target: &mut Array2<f64>, block: ArrayView2<'_, f64>, weight: f64) {
    let product = block.t().dot(&block);
    target.scaled_add(weight, &product);
}

impl DiscriminantFit {
    /// Fits at most `n_da` discriminant axes to `scores` grouped by `labels`.
    pub fn fit(
        scores: ArrayView2<'_, f64>,
        labels: &[usize],
        n_da: usize,
    ) -> Result<Self, DiscriminantError> {
        let (n, d) = scores.dim();
        let n_groups = count_groups(labels, n)?;

        let grand_mean = scores
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(d));
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_groups];
        for (i, &label) in labels.iter().enumerate() {
            members[label - 1].push(i);
        }
        let group_sizes: Vec<usize> = members.iter().map(Vec::len).collect();

        let total_scatter: f64 = scores
            .rows()
            .into_iter()
            .map(|row| {
                let diff = &row - &grand_mean;
                diff.dot(&diff)
            })
            .sum();
        let degenerate_cutoff = DEGENERATE_SCATTER * total_scatter.max(1.0);

        let mut group_means = Array2::<f64>::zeros((n_groups, d));
        let mut within = Array2::<f64>::zeros((d, d));
        let mut between = Array2::<f64>::zeros((d, d));
        let mut degenerate_groups = Vec::new();
        for (k, rows) in members.iter().enumerate() {
            let block = scores.select(Axis(0), rows);
            let mean = block
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(d));
            let centered = &block - &mean;
            let scatter: f64 = centered.iter().map(|v| v * v).sum();
            if scatter <= degenerate_cutoff {
                degenerate_groups.push(k + 1);
            }
            outer_accumulate(&mut within, centered.view(), 1.0);

            let shift = (&mean - &grand_mean).insert_axis(Axis(0));
            outer_accumulate(&mut between, shift.view(), rows.len() as f64);
            group_means.row_mut(k).assign(&mean);
        }
        within /= n.saturating_sub(n_groups).max(1) as f64;
        between /= n_groups.saturating_sub(1).max(1) as f64;

        let (mut w_values, w_vectors) = within.eigh(UPLO::Lower)?;
        let w_max = w_values.iter().cloned().fold(0.0_f64, f64::max);
        let w_min = w_values.iter().cloned().fold(f64::INFINITY, f64::min);
        let singular = d > 0 && w_min <= SINGULAR_CONDITION * w_max.max(f64::MIN_POSITIVE);
        let ridge = if !degenerate_groups.is_empty() || singular {
            let mean_diag = if d > 0 { within.diag().sum() / d as f64 } else { 0.0 };
            let ridge = RIDGE_FACTOR * mean_diag.max(1.0);
            w_values.mapv_inplace(|v| v.max(0.0) + ridge);
            ridge
        } else {
            0.0
        };

        let inv_root = Array1::from_iter(w_values.iter().map(|&v| v.sqrt().recip()));
        let whitening = (&w_vectors * &inv_root).dot(&w_vectors.t());
        let product = whitening.dot(&between).dot(&whitening);
        let whitened_between = (&product + &product.t()) * 0.5;

        let (b_values, b_vectors) = whitened_between.eigh(UPLO::Lower)?;
        let max_axes = n_da.min(n_groups.saturating_sub(1)).min(d);
        let leading = b_values.iter().cloned().fold(0.0_f64, f64::max);
        let cutoff = (AXIS_EPSILON * leading).max(f64::MIN_POSITIVE);
        let selected: Vec<usize> = (0..b_values.len())
            .rev()
            .take(max_axes)
            .take_while(|&idx| b_values[idx] > cutoff)
            .collect();

        let mut axes = Array2::<f64>::zeros((d, selected.len()));
        for (c, &idx) in selected.iter().enumerate() {
            let mut axis = whitening.dot(&b_vectors.column(idx));
            let pivot = axis
                .iter()
                .cloned()
                .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
            if pivot < 0.0 {
                axis.mapv_inplace(|v| -v);
            }
            axes.column_mut(c).assign(&axis);
        }
        let eigenvalues: Array1<f64> = selected.iter().map(|&idx| b_values[idx]).collect();

        let centroids = (&group_means - &grand_mean).dot(&axes);
        let priors = Array1::from_iter(group_sizes.iter().map(|&s| s as f64 / n as f64));

        Ok(Self {
            axes,
            eigenvalues,
            grand_mean,
            centroids,
            priors,
            group_sizes,
            degenerate_groups,
            ridge,
        })
    }

    pub fn n_axes(&self) -> usize {
        self.axes.ncols()
    }

    pub fn n_groups(&self) -> usize {
        self.priors.len()
    }

    pub fn axes(&self) -> ArrayView2<'_, f64> {
        self.axes.view()
    }

    pub fn eigenvalues(&self) -> ArrayView1<'_, f64> {
        self.eigenvalues.view()
    }

    pub fn centroids(&self) -> ArrayView2<'_, f64> {
        self.centroids.view()
    }

    pub fn priors(&self) -> ArrayView1<'_, f64> {
        self.priors.view()
    }

    pub fn group_sizes(&self) -> &[usize] {
        &self.group_sizes
    }

    /// Groups (1-based) whose members collapsed onto a single point.
    pub fn degenerate_groups(&self) -> &[usize] {
        &self.degenerate_groups
    }

    /// The ridge added to the within-group covariance, zero when none was needed.
    pub fn ridge(&self) -> f64 {
        self.ridge
    }

    /// Coordinates of `scores` on the discriminant axes.
    pub fn transform(&self, scores: ArrayView2<'_, f64>) -> Array2<f64> {
        (&scores - &self.grand_mean).dot(&self.axes)
    }

    pub fn posterior(&self, coordinates: ArrayView2<'_, f64>) -> Array2<f64> {
        let n = coordinates.nrows();
        let k = self.n_groups();
        let log_priors = self.priors.mapv(f64::ln);
        let mut posterior = Array2::<f64>::zeros((n, k));
        for (z, mut out) in coordinates.rows().into_iter().zip(posterior.rows_mut()) {
            for (g, centroid) in self.centroids.rows().into_iter().enumerate() {
                let diff = &z - &centroid;
                out[g] = log_priors[g] - 0.5 * diff.dot(&diff);
            }
            let max = out.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            out.mapv_inplace(|v| (v - max).exp());
            let total = out.sum();
            out /= total;
        }
        posterior
    }

    pub fn predict(&self, scores: ArrayView2<'_, f64>) -> Prediction {
        let coordinates = self.transform(scores);
        let posterior = self.posterior(coordinates.view());
        let assignments = hard_assignments(posterior.view());
        Prediction {
            coordinates,
            posterior,
            assignments,
        }
    }
}

/// Arg-max of each posterior row as a 1-based label; ties go to the lower label.
pub fn hard_assignments(posterior: ArrayView2<'_, f64>) -> Vec<usize> {
    posterior
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            for (g, &p) in row.iter().enumerate() {
                if p > row[best] {
                    best = g;
                }
            }
            best + 1
        })
        .collect()
}

/// The final DAPC artifact: PCA, discriminant function and the fitted individuals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DapcModel {
    marker_ids: Vec<String>,
    sample_ids: Vec<String>,
    labels: Vec<usize>,
    pca: PcaProjection,
    discriminant: DiscriminantFit,
    coordinates: Array2<f64>,
    posterior: Array2<f64>,
    assignments: Vec<usize>,
    assign_per_group: Vec<f64>,
    marker_contributions: Array2<f64>,
}

/// Fits a DAPC model with centred, unscaled PCA.
pub fn fit(
    matrix: &GenotypeMatrix,
    labels: &[usize],
    n_pca: usize,
    n_da: usize,
) -> Result<DapcModel, DiscriminantError> {
    DapcModel::fit(matrix, labels, &PcaOptions::new(n_pca), n_da)
}

impl DapcModel {
    pub fn fit(
        matrix: &GenotypeMatrix,
        labels: &[usize],
        pca_options: &PcaOptions,
        n_da: usize,
    ) -> Result<Self, DiscriminantError> {
        count_groups(labels, matrix.n_samples())?;
        let pca = PcaProjection::fit(matrix.dosages(), pca_options)?;
        let discriminant = DiscriminantFit::fit(pca.scores(), labels, n_da)?;
        for &label in discriminant.degenerate_groups() {
            log::warn!("{}", DiscriminantError::DegenerateGroup { label });
        }
        if discriminant.ridge() > 0.0 && discriminant.degenerate_groups().is_empty() {
            log::warn!(
                "Within-group covariance is singular on {} PCs; added a ridge of {:.3e}",
                pca.n_components(),
                discriminant.ridge()
            );
        }
        log::info!(
            "Fitted {} discriminant axes on {} principal components for {} groups",
            discriminant.n_axes(),
            pca.n_components(),
            discriminant.n_groups()
        );

        let Prediction {
            coordinates,
            posterior,
            assignments,
        } = discriminant.predict(pca.scores());

        let n_groups = discriminant.n_groups();
        let mut hits = vec![0usize; n_groups];
        for (&truth, &assigned) in labels.iter().zip(&assignments) {
            if truth == assigned {
                hits[truth - 1] += 1;
            }
        }
        let assign_per_group = hits
            .iter()
            .zip(discriminant.group_sizes())
            .map(|(&h, &size)| h as f64 / size as f64)
            .collect();

        let marker_contributions = marker_contributions(pca.loadings(), discriminant.axes());

        Ok(Self {
            marker_ids: matrix.marker_ids().to_vec(),
            sample_ids: matrix.sample_ids().to_vec(),
            labels: labels.to_vec(),
            pca,
            discriminant,
            coordinates,
            posterior,
            assignments,
            assign_per_group,
            marker_contributions,
        })
    }

    pub fn n_groups(&self) -> usize {
        self.discriminant.n_groups()
    }

    pub fn n_axes(&self) -> usize {
        self.discriminant.n_axes()
    }

    pub fn n_pca(&self) -> usize {
        self.pca.n_components()
    }

    pub fn marker_ids(&self) -> &[String] {
        &self.marker_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// The labels the model was fitted on.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn pca(&self) -> &PcaProjection {
        &self.pca
    }

    pub fn discriminant(&self) -> &DiscriminantFit {
        &self.discriminant
    }

    pub fn axes(&self) -> ArrayView2<'_, f64> {
        self.discriminant.axes()
    }

    pub fn coordinates(&self) -> ArrayView2<'_, f64> {
        self.coordinates.view()
    }

    pub fn posterior(&self) -> ArrayView2<'_, f64> {
        self.posterior.view()
    }

    pub fn assignments(&self) -> &[usize] {
        &self.assignments
    }

    /// Fraction of each group's members reassigned to their own group.
    pub fn assign_per_group(&self) -> &[f64] {
        &self.assign_per_group
    }

    /// Proportion of overall reassignment to the fitted labels.
    pub fn overall_reassignment(&self) -> f64 {
        let hits = self
            .labels
            .iter()
            .zip(&self.assignments)
            .filter(|(a, b)| a == b)
            .count();
        hits as f64 / self.labels.len() as f64
    }

    /// Markers × discriminant axes; each column sums to one.
    pub fn marker_contributions(&self) -> ArrayView2<'_, f64> {
        self.marker_contributions.view()
    }

    /// Projects new individuals whose columns follow [`DapcModel::marker_ids`].
    pub fn predict(&self, matrix: &GenotypeMatrix) -> Result<Prediction, DiscriminantError> {
        if matrix.n_markers() != self.marker_ids.len() {
            return Err(DiscriminantError::MarkerMismatch {
                found: matrix.n_markers(),
                expected: self.marker_ids.len(),
            });
        }
        let scores = self.pca.project_new(matrix.dosages())?;
        Ok(self.discriminant.predict(scores.view()))
    }
}

fn marker_contributions(
    loadings: ArrayView2<'_, f64>,
    axes: ArrayView2<'_, f64>,
) -> Array2<f64> {
    let mut contributions = loadings.dot(&axes).mapv(|v| v * v);
    for mut column in contributions.columns_mut() {
        let total = column.sum();
        if total > 0.0 {
            column /= total;
        }
    }
    contributions
}
