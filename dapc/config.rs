//! Run configuration, loadable from TOML with every field optional.

use crate::cluster::KMeansOptions;
use crate::crossval::CrossValidationOptions;
use crate::genotype::{GenotypeError, QcThresholds};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Upper bound on the automatic `max_k`.
pub const DEFAULT_MAX_K_CAP: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Threshold(#[from] GenotypeError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DapcConfig {
    /// The `[qc]` table.
    pub qc: QcThresholds,
    /// Largest K tried; `min(10, floor(sqrt(N)))` when unset.
    pub max_k: Option<usize>,
    /// PCs used for clustering; `floor(N / 3)` when unset.
    pub n_pca_clustering: Option<usize>,
    pub kmeans_starts: usize,
    pub kmeans_iterations: usize,
    pub diminishing_returns: f64,
    pub max_cv_pcs: usize,
    pub cv_candidates: usize,
    /// Explicit PC counts for cross-validation, overriding `max_cv_pcs`.
    pub pc_candidates: Option<Vec<usize>>,
    pub training_fraction: f64,
    pub n_replicates: usize,
    pub max_da_axes: usize,
    pub center: bool,
    pub scale: bool,
    pub seed: u64,
}

impl Default for DapcConfig {
    fn default() -> Self {
        Self {
            qc: QcThresholds::default(),
            max_k: None,
            n_pca_clustering: None,
            kmeans_starts: 10,
            kmeans_iterations: 100_000,
            diminishing_returns: 0.05,
            max_cv_pcs: 300,
            cv_candidates: 10,
            pc_candidates: None,
            training_fraction: 0.9,
            n_replicates: 30,
            max_da_axes: 3,
            center: true,
            scale: false,
            seed: 999,
        }
    }
}

impl DapcConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: DapcConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.qc.validate()?;
        if self.max_k == Some(0) {
            return Err(ConfigError::Invalid("max_k must be at least 1".into()));
        }
        if self.n_pca_clustering == Some(0) {
            return Err(ConfigError::Invalid(
                "n_pca_clustering must be at least 1".into(),
            ));
        }
        if self.kmeans_starts == 0 || self.kmeans_iterations == 0 {
            return Err(ConfigError::Invalid(
                "kmeans_starts and kmeans_iterations must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.diminishing_returns) {
            return Err(ConfigError::Invalid(format!(
                "diminishing_returns must lie in [0, 1], got {}",
                self.diminishing_returns
            )));
        }
        if !(self.training_fraction > 0.0 && self.training_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "training_fraction must lie strictly between 0 and 1, got {}",
                self.training_fraction
            )));
        }
        if self.n_replicates == 0 || self.max_cv_pcs == 0 || self.cv_candidates == 0 {
            return Err(ConfigError::Invalid(
                "n_replicates, max_cv_pcs and cv_candidates must be at least 1".into(),
            ));
        }
        if let Some(list) = &self.pc_candidates {
            if list.is_empty() || list.contains(&0) {
                return Err(ConfigError::Invalid(
                    "pc_candidates must be non-empty and positive".into(),
                ));
            }
        }
        if self.max_da_axes == 0 {
            return Err(ConfigError::Invalid("max_da_axes must be at least 1".into()));
        }
        // TOML integers are signed 64-bit; larger seeds cannot be written back.
        if i64::try_from(self.seed).is_err() {
            return Err(ConfigError::Invalid(format!(
                "seed must be at most {}, got {}",
                i64::MAX,
                self.seed
            )));
        }
        Ok(())
    }

    pub fn resolved_max_k(&self, n_samples: usize) -> usize {
        self.max_k.unwrap_or_else(|| {
            let root = (n_samples as f64).sqrt().floor() as usize;
            root.clamp(1, DEFAULT_MAX_K_CAP)
        })
    }

    pub fn resolved_clustering_pcs(&self, n_samples: usize) -> usize {
        self.n_pca_clustering.unwrap_or((n_samples / 3).max(1))
    }

    pub fn kmeans_options(&self, n_samples: usize) -> KMeansOptions {
        KMeansOptions {
            max_k: self.resolved_max_k(n_samples),
            n_pca: self.resolved_clustering_pcs(n_samples),
            n_iter: self.kmeans_iterations,
            n_starts: self.kmeans_starts,
            diminishing_returns: self.diminishing_returns,
            scale: self.scale,
            seed: self.seed,
        }
    }

    pub fn cross_validation_options(&self) -> CrossValidationOptions {
        CrossValidationOptions {
            pc_candidates: self.pc_candidates.clone(),
            max_pcs: self.max_cv_pcs,
            n_candidates: self.cv_candidates,
            training_fraction: self.training_fraction,
            n_replicates: self.n_replicates,
            center: self.center,
            scale: self.scale,
            seed: self.seed,
        }
    }
}
