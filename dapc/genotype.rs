//! Genotype dosage matrices and missing-data / allele-frequency quality control.
//!
//! Rows are individuals and columns are biallelic markers. Each cell holds the
//! alternate-allele dosage (0, 1 or 2) or [`MISSING_DOSAGE`].

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Sentinel stored in a dosage cell when the genotype call is missing.
pub const MISSING_DOSAGE: u8 = u8::MAX;

#[derive(Debug, Error)]
pub enum GenotypeError {
    #[error("malformed genotype input: {0}")]
    InputFormat(String),

    #[error(
        "quality control left {individuals} individuals and {markers} markers; at least one of each is required"
    )]
    InsufficientData { individuals: usize, markers: usize },

    #[error("invalid quality-control threshold: {0}")]
    InvalidThreshold(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenotypeMatrix {
    dosages: Array2<u8>,
    sample_ids: Vec<String>,
    marker_ids: Vec<String>,
}

impl GenotypeMatrix {
    /// Builds a matrix after checking identifier counts and the dosage domain.
    pub fn new(
        dosages: Array2<u8>,
        sample_ids: Vec<String>,
        marker_ids: Vec<String>,
    ) -> Result<Self, GenotypeError> {
        let (n, p) = dosages.dim();
        if n == 0 || p == 0 {
            return Err(GenotypeError::InputFormat(format!(
                "genotype matrix must be non-empty, got {n} individuals x {p} markers"
            )));
        }
        if sample_ids.len() != n {
            return Err(GenotypeError::InputFormat(format!(
                "{} sample identifiers supplied for {n} matrix rows",
                sample_ids.len()
            )));
        }
        if marker_ids.len() != p {
            return Err(GenotypeError::InputFormat(format!(
                "{} marker identifiers supplied for {p} matrix columns",
                marker_ids.len()
            )));
        }
        if let Some(((i, j), &value)) = dosages
            .indexed_iter()
            .find(|&(_, &v)| v > 2 && v != MISSING_DOSAGE)
        {
            return Err(GenotypeError::InputFormat(format!(
                "dosage {value} at sample '{}' marker '{}' is outside {{0, 1, 2}}",
                sample_ids[i], marker_ids[j]
            )));
        }

        Ok(Self {
            dosages,
            sample_ids,
            marker_ids,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.dosages.nrows()
    }

    pub fn n_markers(&self) -> usize {
        self.dosages.ncols()
    }

    pub fn dosages(&self) -> ArrayView2<'_, u8> {
        self.dosages.view()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn marker_ids(&self) -> &[String] {
        &self.marker_ids
    }

    /// Copies the given rows and columns, in the given order, into a new matrix.
    pub fn subset(&self, rows: &[usize], cols: &[usize]) -> GenotypeMatrix {
        let dosages = self
            .dosages
            .select(Axis(0), rows)
            .select(Axis(1), cols);
        GenotypeMatrix {
            dosages,
            sample_ids: rows.iter().map(|&i| self.sample_ids[i].clone()).collect(),
            marker_ids: cols.iter().map(|&j| self.marker_ids[j].clone()).collect(),
        }
    }

    /// Reorders columns to follow `marker_ids`, failing on the first one absent here.
    pub fn select_markers(&self, marker_ids: &[String]) -> Result<GenotypeMatrix, GenotypeError> {
        let index: HashMap<&str, usize> = self
            .marker_ids
            .iter()
            .enumerate()
            .map(|(j, id)| (id.as_str(), j))
            .collect();
        let cols = marker_ids
            .iter()
            .map(|id| {
                index.get(id.as_str()).copied().ok_or_else(|| {
                    GenotypeError::InputFormat(format!("marker '{id}' is not present in the input"))
                })
            })
            .collect::<Result<Vec<usize>, _>>()?;
        let rows: Vec<usize> = (0..self.n_samples()).collect();
        Ok(self.subset(&rows, &cols))
    }

    /// Fraction of missing calls in each row.
    pub fn sample_missing_fractions(&self) -> Vec<f64> {
        let p = self.n_markers() as f64;
        self.dosages
            .axis_iter(Axis(0))
            .map(|row| row.iter().filter(|&&v| v == MISSING_DOSAGE).count() as f64 / p)
            .collect()
    }
}

/// Thresholds applied by [`filter`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QcThresholds {
    /// Individuals with a missing fraction at or above this value are removed.
    pub max_individual_missing: f64,
    /// Markers with a missing fraction at or above this value are removed.
    pub max_marker_missing: f64,
    /// Markers with a minor allele frequency at or below this value are removed.
    pub min_maf: f64,
}

impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            max_individual_missing: 0.5,
            max_marker_missing: 0.1,
            min_maf: 0.05,
        }
    }
}

impl QcThresholds {
    pub fn validate(&self) -> Result<(), GenotypeError> {
        if !(0.0..=1.0).contains(&self.max_individual_missing) {
            return Err(GenotypeError::InvalidThreshold(format!(
                "max_individual_missing must lie in [0, 1], got {}",
                self.max_individual_missing
            )));
        }
        if !(0.0..=1.0).contains(&self.max_marker_missing) {
            return Err(GenotypeError::InvalidThreshold(format!(
                "max_marker_missing must lie in [0, 1], got {}",
                self.max_marker_missing
            )));
        }
        if !(0.0..=0.5).contains(&self.min_maf) {
            return Err(GenotypeError::InvalidThreshold(format!(
                "min_maf must lie in [0, 0.5], got {}",
                self.min_maf
            )));
        }
        Ok(())
    }
}

/// The filtered matrix together with what was kept and why.
#[derive(Clone, Debug)]
pub struct QcOutcome {
    pub matrix: GenotypeMatrix,
    /// Row indices of the input matrix that survived filtering.
    pub kept_samples: Vec<usize>,
    /// Column indices of the input matrix that survived filtering.
    pub kept_markers: Vec<usize>,
    /// Missing fraction of every input individual (computed on the full matrix).
    pub sample_missing: Vec<f64>,
    /// Missing fraction of each kept marker over the kept individuals.
    pub marker_missing: Vec<f64>,
    /// Minor allele frequency of each kept marker over the kept individuals.
    pub marker_maf: Vec<f64>,
    pub removed_individuals: usize,
    pub removed_missing_markers: usize,
    pub removed_low_maf_markers: usize,
}

#[derive(Clone, Copy, Debug)]
struct MarkerStats {
    missing_fraction: f64,
    maf: f64,
}

fn marker_stats(dosages: ArrayView2<'_, u8>, rows: &[usize], col: usize) -> MarkerStats {
    let mut missing = 0usize;
    let mut alt = 0usize;
    for &i in rows {
        match dosages[(i, col)] {
            MISSING_DOSAGE => missing += 1,
            d => alt += d as usize,
        }
    }
    let calls = rows.len() - missing;
    let maf = if calls == 0 {
        0.0
    } else {
        let freq = alt as f64 / (2 * calls) as f64;
        freq.min(1.0 - freq)
    };
    MarkerStats {
        missing_fraction: missing as f64 / rows.len() as f64,
        maf,
    }
}

/// Applies individual missingness, marker missingness and MAF filters, in that order.
///
/// Individual missingness is measured on the full input; marker statistics are
/// measured over the individuals that passed. Filters are applied once and are
/// not iterated to a fixed point.
pub fn filter(
    matrix: &GenotypeMatrix,
    thresholds: &QcThresholds,
) -> Result<QcOutcome, GenotypeError> {
    thresholds.validate()?;

    let sample_missing = matrix.sample_missing_fractions();
    let kept_samples: Vec<usize> = sample_missing
        .iter()
        .enumerate()
        .filter(|&(_, &f)| f < thresholds.max_individual_missing)
        .map(|(i, _)| i)
        .collect();
    let removed_individuals = matrix.n_samples() - kept_samples.len();
    log::info!(
        "Removed {} of {} individuals with missingness >= {}",
        removed_individuals,
        matrix.n_samples(),
        thresholds.max_individual_missing
    );
    if kept_samples.is_empty() {
        return Err(GenotypeError::InsufficientData {
            individuals: 0,
            markers: matrix.n_markers(),
        });
    }

    let dosages = matrix.dosages();
    let stats: Vec<MarkerStats> = (0..matrix.n_markers())
        .into_par_iter()
        .map(|j| marker_stats(dosages, &kept_samples, j))
        .collect();

    let mut kept_markers = Vec::new();
    let mut marker_missing = Vec::new();
    let mut marker_maf = Vec::new();
    let mut removed_missing_markers = 0usize;
    let mut removed_low_maf_markers = 0usize;
    for (j, s) in stats.iter().enumerate() {
        if s.missing_fraction >= thresholds.max_marker_missing {
            removed_missing_markers += 1;
        } else if s.maf <= thresholds.min_maf {
            removed_low_maf_markers += 1;
        } else {
            kept_markers.push(j);
            marker_missing.push(s.missing_fraction);
            marker_maf.push(s.maf);
        }
    }
    log::info!(
        "Removed {} markers with missingness >= {} and {} markers with MAF <= {}",
        removed_missing_markers,
        thresholds.max_marker_missing,
        removed_low_maf_markers,
        thresholds.min_maf
    );
    if kept_markers.is_empty() {
        return Err(GenotypeError::InsufficientData {
            individuals: kept_samples.len(),
            markers: 0,
        });
    }

    log::info!(
        "Quality control kept {} individuals and {} markers",
        kept_samples.len(),
        kept_markers.len()
    );

    Ok(QcOutcome {
        matrix: matrix.subset(&kept_samples, &kept_markers),
        kept_samples,
        kept_markers,
        sample_missing,
        marker_missing,
        marker_maf,
        removed_individuals,
        removed_missing_markers,
        removed_low_maf_markers,
    })
}
