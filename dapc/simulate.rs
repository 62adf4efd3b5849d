//! Seeded synthetic cohorts with known population structure.
//!
//! Population allele frequencies follow the Balding-Nichols model: an
//! ancestral frequency `p ~ U(0.05, 0.95)` is drawn per marker and each
//! population's frequency is `Beta(p(1-F)/F, (1-p)(1-F)/F)` for divergence
//! `F`. Genotypes are two Bernoulli draws at the population frequency.

use crate::genotype::{GenotypeError, GenotypeMatrix, MISSING_DOSAGE};
use crate::seeding::{STREAM_SIMULATE, trial_rng};
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid cohort specification: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Genotype(#[from] GenotypeError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CohortSpec {
    pub population_sizes: Vec<usize>,
    pub n_markers: usize,
    /// Divergence of each population from the ancestral frequencies.
    pub fst: f64,
    /// Probability that any single call is missing.
    pub missing_rate: f64,
    pub seed: u64,
}

impl CohortSpec {
    pub fn new(population_sizes: Vec<usize>, n_markers: usize, seed: u64) -> Self {
        Self {
            population_sizes,
            n_markers,
            fst: 0.1,
            missing_rate: 0.0,
            seed,
        }
    }

    fn validate(&self) -> Result<(), SimulationError> {
        if self.population_sizes.is_empty() || self.population_sizes.contains(&0) {
            return Err(SimulationError::InvalidSpec(
                "every population needs at least one individual".to_string(),
            ));
        }
        if self.n_markers == 0 {
            return Err(SimulationError::InvalidSpec(
                "at least one marker is required".to_string(),
            ));
        }
        if !(self.fst > 0.0 && self.fst < 1.0) {
            return Err(SimulationError::InvalidSpec(format!(
                "fst must lie strictly between 0 and 1, got {}",
                self.fst
            )));
        }
        if !(0.0..1.0).contains(&self.missing_rate) {
            return Err(SimulationError::InvalidSpec(format!(
                "missing_rate must lie in [0, 1), got {}",
                self.missing_rate
            )));
        }
        Ok(())
    }
}

/// A synthetic matrix together with the population each row was drawn from.
#[derive(Clone, Debug)]
pub struct SimulatedCohort {
    pub matrix: GenotypeMatrix,
    /// 1-based population of origin per individual.
    pub populations: Vec<usize>,
}

pub fn simulate_cohort(spec: &CohortSpec) -> Result<SimulatedCohort, SimulationError> {
    spec.validate()?;
    let mut rng = trial_rng(spec.seed, &[STREAM_SIMULATE]);
    let n_pops = spec.population_sizes.len();
    let drift = (1.0 - spec.fst) / spec.fst;

    let mut frequencies = Array2::<f64>::zeros((n_pops, spec.n_markers));
    for j in 0..spec.n_markers {
        let ancestral: f64 = rng.gen_range(0.05..0.95);
        let beta = Beta::new(ancestral * drift, (1.0 - ancestral) * drift)
            .map_err(|e| SimulationError::InvalidSpec(e.to_string()))?;
        for g in 0..n_pops {
            frequencies[(g, j)] = beta.sample(&mut rng);
        }
    }

    let n_samples: usize = spec.population_sizes.iter().sum();
    let mut dosages = Array2::<u8>::zeros((n_samples, spec.n_markers));
    let mut populations = Vec::with_capacity(n_samples);
    let mut sample_ids = Vec::with_capacity(n_samples);
    let mut row = 0;
    for (g, &size) in spec.population_sizes.iter().enumerate() {
        for i in 0..size {
            for j in 0..spec.n_markers {
                let p = frequencies[(g, j)];
                let dosage = u8::from(rng.gen_bool(p)) + u8::from(rng.gen_bool(p));
                let missing = spec.missing_rate > 0.0 && rng.gen_bool(spec.missing_rate);
                dosages[(row, j)] = if missing { MISSING_DOSAGE } else { dosage };
            }
            populations.push(g + 1);
            sample_ids.push(format!("pop{}_ind{}", g + 1, i + 1));
            row += 1;
        }
    }
    let marker_ids = (1..=spec.n_markers).map(|j| format!("snp{j}")).collect();
    let matrix = GenotypeMatrix::new(dosages, sample_ids, marker_ids)?;
    log::debug!(
        "Simulated {} individuals in {} populations over {} markers (Fst {})",
        n_samples,
        n_pops,
        spec.n_markers,
        spec.fst
    );
    Ok(SimulatedCohort {
        matrix,
        populations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_and_labels_follow_population_sizes() {
        let cohort = simulate_cohort(&CohortSpec::new(vec![3, 5], 12, 1)).unwrap();
        assert_eq!(cohort.matrix.n_samples(), 8);
        assert_eq!(cohort.matrix.n_markers(), 12);
        assert_eq!(cohort.populations, vec![1, 1, 1, 2, 2, 2, 2, 2]);
        assert_eq!(cohort.matrix.sample_ids()[3], "pop2_ind1");
        assert!(cohort.matrix.dosages().iter().all(|&d| d <= 2));
    }

    #[test]
    fn same_seed_same_cohort() {
        let spec = CohortSpec::new(vec![4, 4], 30, 77);
        let a = simulate_cohort(&spec).unwrap();
        let b = simulate_cohort(&spec).unwrap();
        assert_eq!(a.matrix, b.matrix);
        let other = simulate_cohort(&CohortSpec::new(vec![4, 4], 30, 78)).unwrap();
        assert_ne!(a.matrix, other.matrix);
    }

    #[test]
    fn missing_calls_use_the_sentinel() {
        let spec = CohortSpec {
            missing_rate: 0.2,
            ..CohortSpec::new(vec![20], 50, 5)
        };
        let cohort = simulate_cohort(&spec).unwrap();
        let missing = cohort
            .matrix
            .dosages()
            .iter()
            .filter(|&&d| d == MISSING_DOSAGE)
            .count();
        assert!(missing > 100 && missing < 300, "{missing} missing of 1000");
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(simulate_cohort(&CohortSpec::new(vec![], 10, 1)).is_err());
        assert!(simulate_cohort(&CohortSpec::new(vec![2, 0], 10, 1)).is_err());
        let spec = CohortSpec {
            fst: 0.0,
            ..CohortSpec::new(vec![2], 10, 1)
        };
        assert!(simulate_cohort(&spec).is_err());
    }
}
