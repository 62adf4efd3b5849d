//! Tab-separated boundary adapters: dosage matrices in, result tables out.
//!
//! Dosage files carry a header `sample<TAB>marker_1<TAB>...` followed by one
//! row per individual. Calls are `0`, `1` or `2`; `NA`, `.`, `-1`, `9` or an
//! empty cell mark a missing call.

use crate::cluster::ClusterAssignment;
use crate::crossval::CrossValidationResult;
use crate::discriminant::DapcModel;
use crate::genotype::{GenotypeError, GenotypeMatrix, MISSING_DOSAGE};
use crate::pipeline::{AssignmentRow, RunSummary};
use ndarray::Array2;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Failed to read or write file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed delimited file: {0}")]
    Csv(#[from] csv::Error),
    #[error("{path}, line {line}: {message}")]
    Format {
        path: String,
        line: u64,
        message: String,
    },
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    #[error("Failed to parse TOML file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

fn parse_call(token: &str) -> Option<u8> {
    match token.trim() {
        "" | "NA" | "." | "-1" | "9" => Some(MISSING_DOSAGE),
        "0" => Some(0),
        "1" => Some(1),
        "2" => Some(2),
        _ => None,
    }
}

fn tsv_writer<W: Write>(sink: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().delimiter(b'\t').from_writer(sink)
}

fn tsv_file(path: &Path) -> Result<csv::Writer<fs::File>, InputError> {
    Ok(tsv_writer(fs::File::create(path)?))
}

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, InputError> {
    writer.into_inner().map_err(|e| InputError::Io(e.into_error()))
}

fn optional(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

/// Reads an individuals × markers dosage table.
pub fn read_dosage_tsv(path: impl AsRef<Path>) -> Result<GenotypeMatrix, InputError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(InputError::Format {
            path: display,
            line: 1,
            message: "header needs a sample column and at least one marker".to_string(),
        });
    }
    let marker_ids: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
    let p = marker_ids.len();

    let mut sample_ids = Vec::new();
    let mut cells = Vec::new();
    for result in reader.records() {
        let record = result?;
        let line = record.position().map_or(0, |pos| pos.line());
        if record.len() != p + 1 {
            return Err(InputError::Format {
                path: display,
                line,
                message: format!("expected {} fields, found {}", p + 1, record.len()),
            });
        }
        sample_ids.push(record[0].to_string());
        for (j, token) in record.iter().skip(1).enumerate() {
            let call = parse_call(token).ok_or_else(|| InputError::Format {
                path: display.clone(),
                line,
                message: format!("unrecognised call '{token}' for marker '{}'", marker_ids[j]),
            })?;
            cells.push(call);
        }
    }

    let n = sample_ids.len();
    let dosages = Array2::from_shape_vec((n, p), cells).map_err(|e| InputError::Format {
        path: display.clone(),
        line: 0,
        message: e.to_string(),
    })?;
    let matrix = GenotypeMatrix::new(dosages, sample_ids, marker_ids)?;
    log::info!(
        "Read {} individuals x {} markers from {}",
        matrix.n_samples(),
        matrix.n_markers(),
        display
    );
    Ok(matrix)
}

/// Writes `matrix` in the format [`read_dosage_tsv`] accepts, with `NA` for
/// missing calls.
pub fn write_dosage_tsv(path: impl AsRef<Path>, matrix: &GenotypeMatrix) -> Result<(), InputError> {
    let mut writer = tsv_file(path.as_ref())?;
    let mut header = Vec::with_capacity(matrix.n_markers() + 1);
    header.push("sample");
    header.extend(matrix.marker_ids().iter().map(String::as_str));
    writer.write_record(&header)?;

    for (id, row) in matrix.sample_ids().iter().zip(matrix.dosages().rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(id.clone());
        record.extend(row.iter().map(|&d| {
            if d == MISSING_DOSAGE {
                "NA".to_string()
            } else {
                d.to_string()
            }
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `sample<TAB>label` pairs.
pub fn write_labels(
    path: impl AsRef<Path>,
    sample_ids: &[String],
    labels: &[usize],
    column: &str,
) -> Result<(), InputError> {
    let mut writer = tsv_file(path.as_ref())?;
    writer.write_record(["sample", column])?;
    for (id, label) in sample_ids.iter().zip(labels) {
        writer.write_record([id.clone(), label.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Per-K BIC and WSS, `NA` for unusable K.
pub fn render_bic_table(clusters: &ClusterAssignment) -> Result<Vec<u8>, InputError> {
    let mut writer = tsv_writer(Vec::new());
    writer.write_record(["k", "bic", "wss", "selected"])?;
    for fit in &clusters.per_k {
        writer.write_record([
            fit.k.to_string(),
            optional(fit.bic),
            optional(fit.wss),
            (fit.k == clusters.k).to_string(),
        ])?;
    }
    into_bytes(writer)
}

pub fn render_cv_table(result: &CrossValidationResult) -> Result<Vec<u8>, InputError> {
    let mut writer = tsv_writer(Vec::new());
    writer.write_record([
        "n_pcs",
        "mse",
        "rmse",
        "mean_success",
        "usable_replicates",
        "optimal",
    ])?;
    for candidate in &result.candidates {
        writer.write_record([
            candidate.n_pcs.to_string(),
            optional(candidate.mse),
            optional(candidate.rmse),
            optional(candidate.mean_success),
            candidate.usable_replicates.to_string(),
            (candidate.n_pcs == result.optimal_pcs).to_string(),
        ])?;
    }
    into_bytes(writer)
}

/// Sample, assigned group and one posterior column per group.
pub fn render_assignments(
    rows: &[AssignmentRow<'_>],
    n_groups: usize,
) -> Result<Vec<u8>, InputError> {
    let mut writer = tsv_writer(Vec::new());
    let mut header = vec!["sample".to_string(), "group".to_string()];
    header.extend((1..=n_groups).map(|g| format!("posterior_{g}")));
    writer.write_record(&header)?;
    for row in rows {
        let mut record = Vec::with_capacity(n_groups + 2);
        record.push(row.sample_id.to_string());
        record.push(row.group.to_string());
        record.extend(row.posterior.iter().map(|p| p.to_string()));
        writer.write_record(&record)?;
    }
    into_bytes(writer)
}

pub fn write_assignments(
    path: impl AsRef<Path>,
    rows: &[AssignmentRow<'_>],
    n_groups: usize,
) -> Result<(), InputError> {
    fs::write(path, render_assignments(rows, n_groups)?)?;
    Ok(())
}

pub fn render_summary(summary: &RunSummary) -> Result<String, InputError> {
    Ok(toml::to_string_pretty(summary)?)
}

pub fn render_model(model: &DapcModel) -> Result<String, InputError> {
    Ok(toml::to_string_pretty(model)?)
}

/// Saves a fitted model as TOML so new individuals can be assigned later.
pub fn save_model(path: impl AsRef<Path>, model: &DapcModel) -> Result<(), InputError> {
    fs::write(path, render_model(model)?)?;
    Ok(())
}

/// Writes already rendered `(file name, contents)` pairs into `dir`.
///
/// Either every file lands or none does: on failure the files written so far
/// are removed, together with `dir` when this call created it.
pub fn write_outputs(dir: &Path, files: &[(&str, Vec<u8>)]) -> Result<(), InputError> {
    let created = !dir.exists();
    fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(files.len());
    for (name, contents) in files {
        let path = dir.join(name);
        if let Err(e) = fs::write(&path, contents) {
            for path in &written {
                let _ = fs::remove_file(path);
            }
            let _ = fs::remove_file(&path);
            if created {
                let _ = fs::remove_dir(dir);
            }
            return Err(e.into());
        }
        written.push(path);
    }
    Ok(())
}

pub fn load_model(path: impl AsRef<Path>) -> Result<DapcModel, InputError> {
    let text = fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}
