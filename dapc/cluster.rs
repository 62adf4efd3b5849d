//! Unsupervised cluster discovery: repeated K-means over PCA scores with a
//! BIC model-selection criterion.

use crate::genotype::GenotypeMatrix;
use crate::pca::{PcaError, PcaOptions, PcaProjection};
use crate::seeding::{STREAM_KMEANS, trial_rng};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// WSS floor relative to the mean total sum of squares, keeping the BIC
/// finite when clusters collapse onto points.
const WSS_FLOOR: f64 = 1.0e-12;

#[derive(Debug, Error)]
pub enum ClusteringError {
    #[error("K-means failed for every tested K (1..={max_k})")]
    NoUsableK { max_k: usize },

    #[error("invalid clustering option: {0}")]
    InvalidOption(String),

    #[error("PCA step failed: {0}")]
    Pca(#[from] PcaError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KMeansOptions {
    pub max_k: usize,
    /// Principal components retained before clustering.
    pub n_pca: usize,
    /// Lloyd iterations allowed per start.
    pub n_iter: usize,
    pub n_starts: usize,
    /// Fraction of the total BIC improvement below which extra clusters are
    /// not worth adding.
    pub diminishing_returns: f64,
    pub scale: bool,
    pub seed: u64,
}

impl Default for KMeansOptions {
    fn default() -> Self {
        Self {
            max_k: 10,
            n_pca: 10,
            n_iter: 100_000,
            n_starts: 10,
            diminishing_returns: 0.05,
            scale: false,
            seed: 999,
        }
    }
}

impl KMeansOptions {
    pub fn validate(&self) -> Result<(), ClusteringError> {
        if self.max_k == 0 {
            return Err(ClusteringError::InvalidOption(
                "max_k must be at least 1".to_string(),
            ));
        }
        if self.n_starts == 0 {
            return Err(ClusteringError::InvalidOption(
                "n_starts must be at least 1".to_string(),
            ));
        }
        if self.n_iter == 0 {
            return Err(ClusteringError::InvalidOption(
                "n_iter must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.diminishing_returns) {
            return Err(ClusteringError::InvalidOption(format!(
                "diminishing_returns must lie in [0, 1], got {}",
                self.diminishing_returns
            )));
        }
        Ok(())
    }
}

/// Fit statistics for one tested K. `None` marks a K whose starts all failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KFit {
    pub k: usize,
    pub bic: Option<f64>,
    pub wss: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    /// Group label per individual, `1..=k`, numbered by first appearance.
    pub labels: Vec<usize>,
    pub k: usize,
    /// One entry per tested K; empty when `max_k == 1` skips the search.
    pub per_k: Vec<KFit>,
}

impl ClusterAssignment {
    pub fn group_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.k];
        for &label in &self.labels {
            sizes[label - 1] += 1;
        }
        sizes
    }
}

#[derive(Debug, PartialEq)]
enum StartFailure {
    NotConverged,
    /// A re-seeded cluster emptied again; the data hold fewer distinct points than K.
    Collapsed,
}

struct StartFit {
    labels: Vec<usize>,
    wss: f64,
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index and squared distance of the nearest centroid; ties go to the lower index.
fn nearest(point: ArrayView1<'_, f64>, centroids: &Array2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

fn kmeans_plus_plus(points: ArrayView2<'_, f64>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let (n, d) = points.dim();
    let mut centroids = Array2::<f64>::zeros((k, d));
    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&points.row(first));
    let mut closest: Vec<f64> = points
        .rows()
        .into_iter()
        .map(|p| squared_distance(p, points.row(first)))
        .collect();

    for c in 1..k {
        let total: f64 = closest.iter().sum();
        let chosen = if total > 0.0 {
            let target = rng.gen_range(0.0..total);
            let mut acc = 0.0;
            let mut pick = n - 1;
            for (i, &w) in closest.iter().enumerate() {
                acc += w;
                if acc > target {
                    pick = i;
                    break;
                }
            }
            pick
        } else {
            rng.gen_range(0..n)
        };
        centroids.row_mut(c).assign(&points.row(chosen));
        for (slot, p) in closest.iter_mut().zip(points.rows()) {
            let d = squared_distance(p, points.row(chosen));
            if d < *slot {
                *slot = d;
            }
        }
    }
    centroids
}

fn assign(points: ArrayView2<'_, f64>, centroids: &Array2<f64>) -> (Vec<usize>, Vec<f64>) {
    points
        .rows()
        .into_iter()
        .map(|p| nearest(p, centroids))
        .unzip()
}

/// Recomputes centroids as member means. An empty cluster takes the point
/// lying farthest from its own centroid; returns whether that happened.
fn update_centroids(
    points: ArrayView2<'_, f64>,
    labels: &mut [usize],
    distances: &mut [f64],
    centroids: &mut Array2<f64>,
) -> bool {
    let k = centroids.nrows();
    let mut reseeded = false;
    let mut counts = vec![0usize; k];
    for &label in labels.iter() {
        counts[label] += 1;
    }
    while let Some(empty) = counts.iter().position(|&c| c == 0) {
        let donor = (0..labels.len())
            .filter(|&i| counts[labels[i]] > 1)
            .fold(None, |best: Option<usize>, i| match best {
                Some(b) if distances[b] >= distances[i] => Some(b),
                _ => Some(i),
            });
        // Fewer points than clusters can leave nothing to move.
        let Some(donor) = donor else { break };
        counts[labels[donor]] -= 1;
        counts[empty] += 1;
        labels[donor] = empty;
        distances[donor] = 0.0;
        reseeded = true;
    }

    let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
    for (p, &label) in points.rows().into_iter().zip(labels.iter()) {
        let mut row = sums.row_mut(label);
        row += &p;
    }
    for (c, mut row) in centroids.rows_mut().into_iter().enumerate() {
        if counts[c] > 0 {
            row.assign(&(&sums.row(c) / counts[c] as f64));
        }
    }
    reseeded
}

fn run_start(
    points: ArrayView2<'_, f64>,
    k: usize,
    n_iter: usize,
    rng: &mut ChaCha8Rng,
) -> Result<StartFit, StartFailure> {
    let mut centroids = kmeans_plus_plus(points, k, rng);
    let (mut labels, mut distances) = assign(points, &centroids);
    for _ in 0..n_iter {
        let previous = labels.clone();
        let reseeded = update_centroids(points, &mut labels, &mut distances, &mut centroids);
        let (next, next_distances) = assign(points, &centroids);
        if reseeded && next == previous {
            return Err(StartFailure::Collapsed);
        }
        if next == labels && !reseeded {
            let wss = next_distances.iter().sum();
            return Ok(StartFit { labels: next, wss });
        }
        labels = next;
        distances = next_distances;
    }
    Err(StartFailure::NotConverged)
}

/// Runs every start for one K and keeps the lowest-WSS fit.
fn best_of_starts(points: ArrayView2<'_, f64>, k: usize, options: &KMeansOptions) -> Option<StartFit> {
    let fits: Vec<Result<StartFit, StartFailure>> = (0..options.n_starts)
        .into_par_iter()
        .map(|start| {
            let mut rng = trial_rng(options.seed, &[STREAM_KMEANS, k as u64, start as u64]);
            run_start(points, k, options.n_iter, &mut rng)
        })
        .collect();

    let failed = fits.iter().filter(|f| f.is_err()).count();
    if failed > 0 {
        log::debug!("K = {k}: {failed} of {} starts did not converge", options.n_starts);
    }
    fits.into_iter()
        .flatten()
        .fold(None, |best: Option<StartFit>, fit| match best {
            Some(b) if b.wss <= fit.wss => Some(b),
            _ => Some(fit),
        })
}

/// `n·ln(WSS/n) + K·ln(n)` with WSS floored at `1e-12 · TSS/n`.
pub fn bic(wss: f64, tss: f64, n: usize, k: usize) -> f64 {
    let n_f = n as f64;
    let floor = (WSS_FLOOR * tss / n_f).max(f64::MIN_POSITIVE);
    n_f * (wss.max(floor) / n_f).ln() + k as f64 * n_f.ln()
}

/// Applies the diminishing-returns rule to `(k, bic)` pairs of usable K.
pub fn choose_k(usable: &[(usize, f64)], threshold: f64) -> Option<usize> {
    let &(_, baseline) = usable.first()?;
    let &(k_star, minimum) = usable
        .iter()
        .fold(None, |best: Option<&(usize, f64)>, entry| match best {
            Some(b) if b.1 <= entry.1 => Some(b),
            _ => Some(entry),
        })?;
    let total = baseline - minimum;
    usable
        .iter()
        .take_while(|(k, _)| *k <= k_star)
        .find(|(_, b)| b - minimum <= threshold * total)
        .map(|&(k, _)| k)
}

/// Relabels to `1..=k` in order of first appearance.
fn relabel(raw: &[usize]) -> Vec<usize> {
    let mut mapping: Vec<Option<usize>> = vec![None; raw.iter().copied().max().map_or(0, |m| m + 1)];
    let mut next = 0;
    raw.iter()
        .map(|&label| {
            *mapping[label].get_or_insert_with(|| {
                next += 1;
                next
            })
        })
        .collect()
}

/// Clusters rows of `points` (typically PCA scores).
pub fn cluster_scores(
    points: ArrayView2<'_, f64>,
    options: &KMeansOptions,
) -> Result<ClusterAssignment, ClusteringError> {
    options.validate()?;
    let n = points.nrows();
    if options.max_k == 1 {
        return Ok(ClusterAssignment {
            labels: vec![1; n],
            k: 1,
            per_k: Vec::new(),
        });
    }

    let max_k = options.max_k.min(n);
    if max_k < options.max_k {
        log::debug!("Clamped max_k {} to the {} available individuals", options.max_k, n);
    }
    let tss = total_sum_of_squares(points);

    let mut per_k = Vec::with_capacity(max_k);
    let mut best_labels: Vec<Option<Vec<usize>>> = Vec::with_capacity(max_k);
    for k in 1..=max_k {
        match best_of_starts(points, k, options) {
            Some(fit) => {
                let bic = bic(fit.wss, tss, n, k);
                log::debug!("K = {k}: WSS {:.4}, BIC {:.4}", fit.wss, bic);
                per_k.push(KFit {
                    k,
                    bic: Some(bic),
                    wss: Some(fit.wss),
                });
                best_labels.push(Some(fit.labels));
            }
            None => {
                log::warn!("K = {k} is unusable: no K-means start converged");
                per_k.push(KFit {
                    k,
                    bic: None,
                    wss: None,
                });
                best_labels.push(None);
            }
        }
    }

    let usable: Vec<(usize, f64)> = per_k
        .iter()
        .filter_map(|fit| fit.bic.map(|b| (fit.k, b)))
        .collect();
    let k = choose_k(&usable, options.diminishing_returns)
        .ok_or(ClusteringError::NoUsableK { max_k })?;
    let raw = best_labels[k - 1]
        .take()
        .ok_or(ClusteringError::NoUsableK { max_k })?;
    let labels = relabel(&raw);
    let k = labels.iter().copied().max().unwrap_or(1);
    log::info!("Selected K = {k} of {max_k} tested");

    Ok(ClusterAssignment { labels, k, per_k })
}

fn total_sum_of_squares(points: ArrayView2<'_, f64>) -> f64 {
    let mean = points
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(points.ncols()));
    points
        .rows()
        .into_iter()
        .map(|row| squared_distance(row, mean.view()))
        .sum()
}

/// Projects `matrix` onto `options.n_pca` components and clusters the scores.
///
/// K is chosen by BIC, the only criterion offered, through [`choose_k`].
pub fn select_k(
    matrix: &GenotypeMatrix,
    options: &KMeansOptions,
) -> Result<ClusterAssignment, ClusteringError> {
    options.validate()?;
    if options.max_k == 1 {
        return Ok(ClusterAssignment {
            labels: vec![1; matrix.n_samples()],
            k: 1,
            per_k: Vec::new(),
        });
    }
    let pca_options = PcaOptions {
        n_components: options.n_pca,
        center: true,
        scale: options.scale,
    };
    let pca = PcaProjection::fit(matrix.dosages(), &pca_options)?;
    log::info!(
        "Clustering {} individuals on {} principal components",
        pca.n_samples(),
        pca.n_components()
    );
    cluster_scores(pca.scores(), options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn blobs(per_group: usize) -> (Array2<f64>, Vec<usize>) {
        let centres = [[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]];
        let n = per_group * centres.len();
        let mut points = Array2::<f64>::zeros((n, 2));
        let mut truth = Vec::with_capacity(n);
        // Interleave groups so first-appearance numbering is exercised.
        for i in 0..n {
            let g = i % centres.len();
            points[(i, 0)] = centres[g][0];
            points[(i, 1)] = centres[g][1];
            truth.push(g + 1);
        }
        (points, truth)
    }

    fn options(max_k: usize) -> KMeansOptions {
        KMeansOptions {
            max_k,
            n_pca: 2,
            n_iter: 100,
            n_starts: 5,
            diminishing_returns: 0.05,
            scale: false,
            seed: 999,
        }
    }

    #[test]
    fn single_group_when_max_k_is_one() {
        let (points, _) = blobs(5);
        let result = cluster_scores(points.view(), &options(1)).unwrap();
        assert_eq!(result.k, 1);
        assert!(result.labels.iter().all(|&l| l == 1));
    }

    #[test]
    fn recovers_three_noise_free_clusters() {
        let (points, truth) = blobs(20);
        let result = cluster_scores(points.view(), &options(6)).unwrap();
        assert_eq!(result.k, 3);
        assert_eq!(result.labels, truth);
        assert_eq!(result.group_sizes(), vec![20, 20, 20]);
        assert_eq!(result.per_k.len(), 6);
    }

    #[test]
    fn clustering_is_reproducible() {
        let points = array![
            [0.1, 0.2],
            [0.3, -0.1],
            [4.0, 4.2],
            [4.1, 3.9],
            [-3.0, 5.0],
            [-2.9, 5.2],
            [0.0, 0.0],
            [4.3, 4.0],
        ];
        let a = cluster_scores(points.view(), &options(4)).unwrap();
        let b = cluster_scores(points.view(), &options(4)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn diminishing_returns_prefers_fewer_clusters() {
        let bics = [(1, 100.0), (2, 40.0), (3, 0.0), (4, -1.0), (5, 2.0)];
        assert_eq!(choose_k(&bics, 0.05), Some(3));
        assert_eq!(choose_k(&bics, 0.0), Some(4));
        assert_eq!(choose_k(&bics, 0.5), Some(2));
        let rising = [(1, 0.0), (2, 3.0)];
        assert_eq!(choose_k(&rising, 0.05), Some(1));
        assert_eq!(choose_k(&[], 0.05), None);
    }

    #[test]
    fn unusable_k_values_are_skipped() {
        let bics = [(1, 50.0), (3, 10.0), (4, 11.0)];
        assert_eq!(choose_k(&bics, 0.05), Some(3));
    }

    #[test]
    fn bic_stays_finite_for_perfect_fits() {
        let value = bic(0.0, 10.0, 30, 3);
        assert!(value.is_finite());
        assert!(value < bic(1.0, 10.0, 30, 3));
    }

    #[test]
    fn relabels_by_first_appearance() {
        assert_eq!(relabel(&[2, 2, 0, 1, 0]), vec![1, 1, 2, 3, 2]);
    }

    #[test]
    fn empty_clusters_are_reseeded() {
        let points = array![[0.0], [0.0], [1.0], [5.0]];
        let mut labels = vec![0, 0, 0, 0];
        let mut distances = vec![4.0, 4.0, 1.0, 9.0];
        let mut centroids = array![[2.0], [100.0]];
        let reseeded = update_centroids(points.view(), &mut labels, &mut distances, &mut centroids);
        assert!(reseeded);
        assert_eq!(labels, vec![0, 0, 0, 1]);
        assert_eq!(centroids, array![[1.0 / 3.0], [5.0]]);
    }

    #[test]
    fn rejects_invalid_options() {
        let (points, _) = blobs(3);
        let mut bad = options(3);
        bad.n_starts = 0;
        assert!(matches!(
            cluster_scores(points.view(), &bad),
            Err(ClusteringError::InvalidOption(_))
        ));
    }
}
