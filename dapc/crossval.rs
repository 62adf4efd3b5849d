//! Cross-validated choice of how many principal components feed the
//! discriminant step.
//!
//! Each replicate draws a stratified training set, fits PCA on it once with the
//! largest candidate count and reuses the leading columns for every smaller
//! candidate. Held-out individuals are projected through the training PCA and
//! discriminant axes and assigned by maximum posterior.

use crate::discriminant::{DiscriminantError, DiscriminantFit, count_groups};
use crate::genotype::GenotypeMatrix;
use crate::pca::{PcaOptions, PcaProjection};
use crate::seeding::{STREAM_XVAL, trial_rng};
use ndarray::s;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrossValidationError {
    #[error("group {label} has {size} member(s); cross-validation needs at least 2 per group")]
    InsufficientSamples { label: usize, size: usize },

    #[error("invalid cross-validation option: {0}")]
    InvalidOption(String),

    #[error("no candidate PC count produced a usable replicate")]
    NoUsableCandidate,

    #[error(transparent)]
    Labels(#[from] DiscriminantError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationOptions {
    /// Explicit PC counts to test; generated from `max_pcs` when absent.
    pub pc_candidates: Option<Vec<usize>>,
    pub max_pcs: usize,
    pub n_candidates: usize,
    pub training_fraction: f64,
    pub n_replicates: usize,
    pub center: bool,
    pub scale: bool,
    pub seed: u64,
}

impl Default for CrossValidationOptions {
    fn default() -> Self {
        Self {
            pc_candidates: None,
            max_pcs: 300,
            n_candidates: 10,
            training_fraction: 0.9,
            n_replicates: 30,
            center: true,
            scale: false,
            seed: 999,
        }
    }
}

impl CrossValidationOptions {
    pub fn validate(&self) -> Result<(), CrossValidationError> {
        if !(self.training_fraction > 0.0 && self.training_fraction < 1.0) {
            return Err(CrossValidationError::InvalidOption(format!(
                "training_fraction must lie strictly between 0 and 1, got {}",
                self.training_fraction
            )));
        }
        if self.n_replicates == 0 {
            return Err(CrossValidationError::InvalidOption(
                "n_replicates must be at least 1".to_string(),
            ));
        }
        match &self.pc_candidates {
            Some(list) if list.is_empty() || list.contains(&0) => {
                Err(CrossValidationError::InvalidOption(
                    "pc_candidates must be non-empty and positive".to_string(),
                ))
            }
            None if self.max_pcs == 0 || self.n_candidates == 0 => {
                Err(CrossValidationError::InvalidOption(
                    "max_pcs and n_candidates must be at least 1".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Aggregated replicate outcomes for one PC count. Statistics are `None` when
/// no replicate succeeded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub n_pcs: usize,
    pub mse: Option<f64>,
    pub rmse: Option<f64>,
    pub mean_success: Option<f64>,
    pub usable_replicates: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationResult {
    pub candidates: Vec<CandidateScore>,
    pub optimal_pcs: usize,
}

impl CrossValidationResult {
    pub fn optimum(&self) -> Option<&CandidateScore> {
        self.candidates.iter().find(|c| c.n_pcs == self.optimal_pcs)
    }
}

/// Training members drawn from a group of `size`.
fn training_count(size: usize, fraction: f64) -> usize {
    let wanted = (size as f64 * fraction).round() as usize;
    wanted.clamp(1, size.saturating_sub(1).max(1))
}

/// Draws a stratified split; both index lists come back sorted.
pub fn stratified_split(
    labels: &[usize],
    n_groups: usize,
    fraction: f64,
    rng: &mut ChaCha8Rng,
) -> (Vec<usize>, Vec<usize>) {
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_groups];
    for (i, &label) in labels.iter().enumerate() {
        members[label - 1].push(i);
    }
    let mut train = Vec::new();
    let mut test = Vec::new();
    for mut group in members {
        let take = training_count(group.len(), fraction);
        group.shuffle(rng);
        train.extend_from_slice(&group[..take]);
        test.extend_from_slice(&group[take..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Up to `count` evenly spaced PC counts between 1 and `min(max_pcs, rank_limit)`.
pub fn default_candidates(max_pcs: usize, rank_limit: usize, count: usize) -> Vec<usize> {
    let upper = max_pcs.min(rank_limit);
    if upper == 0 || count == 0 {
        return Vec::new();
    }
    let count = count.min(upper);
    if count == 1 {
        return vec![upper];
    }
    let mut out: Vec<usize> = (0..count)
        .map(|i| 1 + ((i * (upper - 1)) as f64 / (count - 1) as f64).round() as usize)
        .collect();
    out.dedup();
    out
}

/// Success rate per candidate for one replicate; `None` marks a failed fit.
fn run_replicate(
    matrix: &GenotypeMatrix,
    labels: &[usize],
    n_groups: usize,
    candidates: &[usize],
    options: &CrossValidationOptions,
    replicate: usize,
) -> Vec<Option<f64>> {
    let mut rng = trial_rng(options.seed, &[STREAM_XVAL, replicate as u64]);
    let (train, test) = stratified_split(labels, n_groups, options.training_fraction, &mut rng);
    let all_markers: Vec<usize> = (0..matrix.n_markers()).collect();
    let train_matrix = matrix.subset(&train, &all_markers);
    let test_matrix = matrix.subset(&test, &all_markers);
    let train_labels: Vec<usize> = train.iter().map(|&i| labels[i]).collect();
    let test_labels: Vec<usize> = test.iter().map(|&i| labels[i]).collect();

    let largest = candidates.iter().copied().max().unwrap_or(1);
    let pca_options = PcaOptions {
        n_components: largest,
        center: options.center,
        scale: options.scale,
    };
    let pca = match PcaProjection::fit(train_matrix.dosages(), &pca_options) {
        Ok(pca) => pca,
        Err(e) => {
            log::warn!("Cross-validation replicate {replicate} discarded: {e}");
            return vec![None; candidates.len()];
        }
    };
    let test_scores = match pca.project_new(test_matrix.dosages()) {
        Ok(scores) => scores,
        Err(e) => {
            log::warn!("Cross-validation replicate {replicate} discarded: {e}");
            return vec![None; candidates.len()];
        }
    };

    candidates
        .iter()
        .map(|&k| {
            let k = k.min(pca.n_components());
            let train_k = pca.scores().slice_move(s![.., ..k]);
            let test_k = test_scores.slice(s![.., ..k]);
            match DiscriminantFit::fit(train_k, &train_labels, n_groups.saturating_sub(1)) {
                Ok(fit) => {
                    let predicted = fit.predict(test_k).assignments;
                    let hits = predicted
                        .iter()
                        .zip(&test_labels)
                        .filter(|(a, b)| a == b)
                        .count();
                    Some(hits as f64 / test_labels.len() as f64)
                }
                Err(e) => {
                    log::warn!(
                        "Cross-validation replicate {replicate} at {k} PCs discarded: {e}"
                    );
                    None
                }
            }
        })
        .collect()
}

fn aggregate(n_pcs: usize, successes: &[f64]) -> CandidateScore {
    if successes.is_empty() {
        return CandidateScore {
            n_pcs,
            mse: None,
            rmse: None,
            mean_success: None,
            usable_replicates: 0,
        };
    }
    let count = successes.len() as f64;
    let mean_success = successes.iter().sum::<f64>() / count;
    let mse = successes.iter().map(|s| (1.0 - s).powi(2)).sum::<f64>() / count;
    CandidateScore {
        n_pcs,
        mse: Some(mse),
        rmse: Some(mse.sqrt()),
        mean_success: Some(mean_success),
        usable_replicates: successes.len(),
    }
}

/// Scores every candidate PC count over repeated stratified splits of `matrix`.
pub fn cross_validate(
    matrix: &GenotypeMatrix,
    labels: &[usize],
    options: &CrossValidationOptions,
) -> Result<CrossValidationResult, CrossValidationError> {
    options.validate()?;
    let n_groups = count_groups(labels, matrix.n_samples())?;
    let mut sizes = vec![0usize; n_groups];
    for &label in labels {
        sizes[label - 1] += 1;
    }
    if let Some((idx, &size)) = sizes.iter().enumerate().find(|(_, s)| **s < 2) {
        return Err(CrossValidationError::InsufficientSamples {
            label: idx + 1,
            size,
        });
    }

    let n_train: usize = sizes
        .iter()
        .map(|&size| training_count(size, options.training_fraction))
        .sum();
    let rank_limit = n_train.min(matrix.n_markers()).saturating_sub(1);
    let mut candidates = match &options.pc_candidates {
        Some(list) => {
            let clamped: Vec<usize> = list
                .iter()
                .map(|&k| k.min(rank_limit))
                .filter(|&k| k > 0)
                .collect();
            if clamped.iter().zip(list).any(|(a, b)| a != b) {
                log::warn!(
                    "PC counts above the training rank ({rank_limit}) are tested at {rank_limit}"
                );
            }
            clamped
        }
        None => default_candidates(options.max_pcs, rank_limit, options.n_candidates),
    };
    candidates.sort_unstable();
    candidates.dedup();
    if candidates.is_empty() {
        return Err(CrossValidationError::InvalidOption(format!(
            "no PC counts to test with {n_train} training individuals and {} markers",
            matrix.n_markers()
        )));
    }
    log::info!(
        "Cross-validating {} PC counts ({:?}) over {} replicates",
        candidates.len(),
        candidates,
        options.n_replicates
    );

    let outcomes: Vec<Vec<Option<f64>>> = (0..options.n_replicates)
        .into_par_iter()
        .map(|r| run_replicate(matrix, labels, n_groups, &candidates, options, r))
        .collect();

    let scores: Vec<CandidateScore> = candidates
        .iter()
        .enumerate()
        .map(|(c, &n_pcs)| {
            let successes: Vec<f64> = outcomes.iter().filter_map(|rep| rep[c]).collect();
            let score = aggregate(n_pcs, &successes);
            log::debug!(
                "{n_pcs} PCs: {} usable replicates, MSE {:?}, mean success {:?}",
                score.usable_replicates,
                score.mse,
                score.mean_success
            );
            score
        })
        .collect();

    let optimal = scores
        .iter()
        .filter_map(|score| score.mse.map(|mse| (score.n_pcs, mse)))
        .fold(None, |best: Option<(usize, f64)>, (n_pcs, mse)| match best {
            Some(b) if b.1 <= mse => Some(b),
            _ => Some((n_pcs, mse)),
        })
        .ok_or(CrossValidationError::NoUsableCandidate)?;
    log::info!("Optimal PC count: {} (MSE {:.4})", optimal.0, optimal.1);

    Ok(CrossValidationResult {
        candidates: scores,
        optimal_pcs: optimal.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::{CohortSpec, simulate_cohort};

    #[test]
    fn training_counts_keep_one_on_each_side() {
        assert_eq!(training_count(2, 0.9), 1);
        assert_eq!(training_count(10, 0.9), 9);
        assert_eq!(training_count(20, 0.9), 18);
        assert_eq!(training_count(3, 0.1), 1);
    }

    #[test]
    fn split_is_stratified_and_disjoint() {
        let labels = vec![1, 2, 1, 2, 1, 2, 3, 3, 3, 3];
        let mut rng = trial_rng(4, &[STREAM_XVAL, 0]);
        let (train, test) = stratified_split(&labels, 3, 0.5, &mut rng);
        assert_eq!(train.len() + test.len(), labels.len());
        assert!(train.iter().all(|i| !test.contains(i)));
        for group in 1..=3 {
            assert!(train.iter().any(|&i| labels[i] == group));
            assert!(test.iter().any(|&i| labels[i] == group));
        }
    }

    #[test]
    fn default_candidates_are_evenly_spaced() {
        assert_eq!(default_candidates(300, 53, 10), vec![1, 7, 13, 18, 24, 30, 36, 41, 47, 53]);
        assert_eq!(default_candidates(3, 53, 10), vec![1, 2, 3]);
        assert_eq!(default_candidates(300, 5, 1), vec![5]);
        assert!(default_candidates(300, 0, 10).is_empty());
    }

    #[test]
    fn rejects_singleton_groups() {
        let cohort = simulate_cohort(&CohortSpec::new(vec![4, 1], 40, 3)).unwrap();
        let err = cross_validate(
            &cohort.matrix,
            &cohort.populations,
            &CrossValidationOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CrossValidationError::InsufficientSamples { label: 2, size: 1 }
        ));
    }

    #[test]
    fn scores_are_bounded_and_optimum_is_tested() {
        let cohort = simulate_cohort(&CohortSpec::new(vec![10, 10, 10], 120, 21)).unwrap();
        let options = CrossValidationOptions {
            pc_candidates: Some(vec![2, 5, 10]),
            n_replicates: 8,
            ..CrossValidationOptions::default()
        };
        let result = cross_validate(&cohort.matrix, &cohort.populations, &options).unwrap();
        assert_eq!(result.candidates.len(), 3);
        assert!(result.candidates.iter().any(|c| c.n_pcs == result.optimal_pcs));
        for candidate in &result.candidates {
            let success = candidate.mean_success.unwrap();
            assert!((0.0..=1.0).contains(&success));
            assert_eq!(candidate.usable_replicates, 8);
        }
        let again = cross_validate(&cohort.matrix, &cohort.populations, &options).unwrap();
        assert_eq!(result, again);
    }

    #[test]
    fn oversized_candidates_are_clamped_to_the_training_rank() {
        // 3 x 10 individuals at 0.9 train on 27, so at most 26 components.
        let cohort = simulate_cohort(&CohortSpec::new(vec![10, 10, 10], 120, 21)).unwrap();
        let options = CrossValidationOptions {
            pc_candidates: Some(vec![5, 300, 26]),
            n_replicates: 4,
            ..CrossValidationOptions::default()
        };
        let result = cross_validate(&cohort.matrix, &cohort.populations, &options).unwrap();
        let tested: Vec<usize> = result.candidates.iter().map(|c| c.n_pcs).collect();
        assert_eq!(tested, vec![5, 26]);
        assert!(result.optimal_pcs <= 26);
    }
}
