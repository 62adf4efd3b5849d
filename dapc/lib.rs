#![deny(dead_code)]
#![deny(unused_imports)]

pub mod cluster;
pub mod config;
pub mod crossval;
pub mod discriminant;
pub mod genotype;
pub mod io;
pub mod pca;
pub mod pipeline;
pub mod progress;
pub mod seeding;
pub mod simulate;

pub use cluster::{ClusterAssignment, ClusteringError, KMeansOptions, select_k};
pub use config::{ConfigError, DapcConfig};
pub use crossval::{
    CrossValidationError, CrossValidationOptions, CrossValidationResult, cross_validate,
};
pub use discriminant::{DapcModel, DiscriminantError, fit};
pub use genotype::{GenotypeError, GenotypeMatrix, MISSING_DOSAGE, QcOutcome, QcThresholds};
pub use pca::{PcaError, PcaOptions, PcaProjection};
pub use pipeline::{DapcReport, PipelineError, RunSummary, run};
