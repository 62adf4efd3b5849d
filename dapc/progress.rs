use std::fmt;

/// Stages reported while the pipeline runs, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    QualityControl,
    Clustering,
    CrossValidation,
    Discriminant,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        Self::QualityControl,
        Self::Clustering,
        Self::CrossValidation,
        Self::Discriminant,
    ];

    pub fn describe(self) -> &'static str {
        match self {
            Self::QualityControl => "quality control",
            Self::Clustering => "K-means cluster selection",
            Self::CrossValidation => "PC count cross-validation",
            Self::Discriminant => "discriminant analysis",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting stage boundaries while the pipeline runs.
pub trait ProgressObserver {
    fn on_stage_start(&mut self, stage: PipelineStage) {
        let _ = stage;
    }
    fn on_stage_finish(&mut self, stage: PipelineStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}
