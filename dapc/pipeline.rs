//! End-to-end DAPC run: quality control, cluster discovery, PC-count
//! cross-validation and the final discriminant fit, executed in that order on
//! immutable inputs.

use crate::cluster::{ClusterAssignment, ClusteringError, select_k};
use crate::config::{ConfigError, DapcConfig};
use crate::crossval::{CrossValidationError, CrossValidationResult, cross_validate};
use crate::discriminant::{DapcModel, DiscriminantError};
use crate::genotype::{GenotypeError, GenotypeMatrix, QcOutcome, filter};
use crate::pca::PcaOptions;
use crate::progress::{PipelineStage, ProgressObserver};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("quality control failed: {0}")]
    QualityControl(#[from] GenotypeError),

    #[error("cluster selection failed (max_k = {max_k}, n_pca = {n_pca}): {source}")]
    Clustering {
        max_k: usize,
        n_pca: usize,
        #[source]
        source: ClusteringError,
    },

    #[error("cross-validation failed ({n_replicates} replicates, K = {k}): {source}")]
    CrossValidation {
        n_replicates: usize,
        k: usize,
        #[source]
        source: CrossValidationError,
    },

    #[error("discriminant analysis failed (n_pca = {n_pca}, n_da = {n_da}): {source}")]
    Discriminant {
        n_pca: usize,
        n_da: usize,
        #[source]
        source: DiscriminantError,
    },
}

/// Headline numbers of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub n_individuals: usize,
    pub n_markers: usize,
    pub removed_individuals: usize,
    pub removed_markers: usize,
    pub selected_k: usize,
    pub optimal_pcs: usize,
    pub n_da_axes: usize,
    /// Mean held-out success at the optimal PC count.
    pub mean_success: Option<f64>,
    /// Proportion of individuals the final model reassigns to their own group.
    pub reassignment: f64,
    pub seed: u64,
}

/// One line of the final assignment table.
#[derive(Clone, Debug, PartialEq)]
pub struct AssignmentRow<'a> {
    pub sample_id: &'a str,
    pub group: usize,
    pub posterior: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct DapcReport {
    pub qc: QcOutcome,
    pub clusters: ClusterAssignment,
    pub cross_validation: CrossValidationResult,
    pub model: DapcModel,
    pub summary: RunSummary,
}

impl DapcReport {
    /// Sample identifier, assigned group and posterior per group, in input order
    /// of the individuals that passed quality control.
    pub fn assignment_rows(&self) -> Vec<AssignmentRow<'_>> {
        self.model
            .sample_ids()
            .iter()
            .zip(self.model.assignments())
            .zip(self.model.posterior().rows())
            .map(|((id, &group), posterior)| AssignmentRow {
                sample_id: id,
                group,
                posterior: posterior.to_vec(),
            })
            .collect()
    }
}

/// Runs every stage on `matrix`. Nothing is written anywhere; the caller
/// decides what to persist from the returned report.
pub fn run(
    matrix: &GenotypeMatrix,
    config: &DapcConfig,
    observer: &mut dyn ProgressObserver,
) -> Result<DapcReport, PipelineError> {
    config.validate()?;

    observer.on_stage_start(PipelineStage::QualityControl);
    let qc = filter(matrix, &config.qc)?;
    observer.on_stage_finish(PipelineStage::QualityControl);
    let filtered = &qc.matrix;
    let n = filtered.n_samples();

    observer.on_stage_start(PipelineStage::Clustering);
    let kmeans = config.kmeans_options(n);
    log::info!(
        "Searching K in 1..={} on {} PCs with {} starts per K",
        kmeans.max_k,
        kmeans.n_pca,
        kmeans.n_starts
    );
    let clusters = select_k(filtered, &kmeans).map_err(|source| PipelineError::Clustering {
        max_k: kmeans.max_k,
        n_pca: kmeans.n_pca,
        source,
    })?;
    observer.on_stage_finish(PipelineStage::Clustering);

    observer.on_stage_start(PipelineStage::CrossValidation);
    let cv_options = config.cross_validation_options();
    let cross_validation =
        cross_validate(filtered, &clusters.labels, &cv_options).map_err(|source| {
            PipelineError::CrossValidation {
                n_replicates: cv_options.n_replicates,
                k: clusters.k,
                source,
            }
        })?;
    observer.on_stage_finish(PipelineStage::CrossValidation);

    observer.on_stage_start(PipelineStage::Discriminant);
    let n_pca = cross_validation.optimal_pcs;
    let n_da = config.max_da_axes.min(clusters.k.saturating_sub(1));
    let pca_options = PcaOptions {
        n_components: n_pca,
        center: config.center,
        scale: config.scale,
    };
    let model = DapcModel::fit(filtered, &clusters.labels, &pca_options, n_da)
        .map_err(|source| PipelineError::Discriminant {
            n_pca,
            n_da,
            source,
        })?;
    observer.on_stage_finish(PipelineStage::Discriminant);

    let summary = RunSummary {
        n_individuals: n,
        n_markers: filtered.n_markers(),
        removed_individuals: qc.removed_individuals,
        removed_markers: qc.removed_missing_markers + qc.removed_low_maf_markers,
        selected_k: clusters.k,
        optimal_pcs: model.n_pca(),
        n_da_axes: model.n_axes(),
        mean_success: cross_validation.optimum().and_then(|c| c.mean_success),
        reassignment: model.overall_reassignment(),
        seed: config.seed,
    };
    log::info!(
        "DAPC finished: K = {}, {} PCs, {} discriminant axes, reassignment {:.3}",
        summary.selected_k,
        summary.optimal_pcs,
        summary.n_da_axes,
        summary.reassignment
    );

    Ok(DapcReport {
        qc,
        clusters,
        cross_validation,
        model,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopProgress;
    use crate::simulate::{CohortSpec, simulate_cohort};

    #[derive(Default)]
    struct Recorder(Vec<(PipelineStage, bool)>);

    impl ProgressObserver for Recorder {
        fn on_stage_start(&mut self, stage: PipelineStage) {
            self.0.push((stage, true));
        }
        fn on_stage_finish(&mut self, stage: PipelineStage) {
            self.0.push((stage, false));
        }
    }

    fn quick_config() -> DapcConfig {
        DapcConfig {
            n_replicates: 5,
            cv_candidates: 4,
            kmeans_starts: 4,
            max_k: Some(5),
            ..DapcConfig::default()
        }
    }

    #[test]
    fn stages_are_reported_in_order() {
        let cohort = simulate_cohort(&CohortSpec::new(vec![12, 12], 150, 8)).unwrap();
        let mut recorder = Recorder::default();
        run(&cohort.matrix, &quick_config(), &mut recorder).unwrap();
        let expected: Vec<(PipelineStage, bool)> = PipelineStage::ALL
            .iter()
            .flat_map(|&s| [(s, true), (s, false)])
            .collect();
        assert_eq!(recorder.0, expected);
    }

    #[test]
    fn assignment_rows_cover_every_kept_individual() {
        let cohort = simulate_cohort(&CohortSpec::new(vec![12, 12], 150, 8)).unwrap();
        let report = run(&cohort.matrix, &quick_config(), &mut NoopProgress).unwrap();
        let rows = report.assignment_rows();
        assert_eq!(rows.len(), report.summary.n_individuals);
        for row in &rows {
            assert_eq!(row.posterior.len(), report.summary.selected_k);
            assert!((1..=report.summary.selected_k).contains(&row.group));
        }
    }

    #[test]
    fn failures_name_the_stage() {
        let cohort = simulate_cohort(&CohortSpec::new(vec![6], 20, 1)).unwrap();
        let config = DapcConfig {
            qc: crate::genotype::QcThresholds {
                min_maf: 0.5,
                ..Default::default()
            },
            ..quick_config()
        };
        let err = run(&cohort.matrix, &config, &mut NoopProgress).unwrap_err();
        assert!(matches!(err, PipelineError::QualityControl(_)));
        assert!(err.to_string().starts_with("quality control failed"));
    }
}
