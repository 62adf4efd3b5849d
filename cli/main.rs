#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use dapc::DapcConfig;
use dapc::io::{
    load_model, read_dosage_tsv, render_assignments, render_bic_table, render_cv_table,
    render_model, render_summary, write_assignments, write_dosage_tsv, write_labels,
    write_outputs,
};
use dapc::pipeline::AssignmentRow;
use dapc::progress::{PipelineStage, ProgressObserver};
use dapc::simulate::{CohortSpec, simulate_cohort};

#[derive(Parser)]
#[command(
    name = "dapc",
    about = "Population structure inference with Discriminant Analysis of Principal Components",
    long_about = "Infers genetic clusters from biallelic SNP dosages: quality control, K-means \
                 with BIC over principal components, cross-validated choice of the PC count \
                 and a final linear discriminant analysis with posterior memberships."
)]
struct Cli {
    /// Size of the worker thread pool (defaults to all cores)
    #[arg(long, global = true, value_name = "N")]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct RunArgs {
    /// Dosage TSV: header `sample<TAB>marker...`, then one row per individual
    #[arg(value_name = "GENOTYPE_TSV")]
    genotypes: PathBuf,

    /// TOML configuration; flags below override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory receiving bic.tsv, cv.tsv, assignments.tsv, summary.toml and model.toml
    #[arg(long, default_value = "dapc_out")]
    out_dir: PathBuf,

    /// Global random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Largest number of clusters to test
    #[arg(long, value_name = "K")]
    max_k: Option<usize>,

    /// Principal components retained for K-means
    #[arg(long, value_name = "N")]
    clustering_pcs: Option<usize>,

    /// Largest PC count considered by cross-validation
    #[arg(long, value_name = "N")]
    max_cv_pcs: Option<usize>,

    /// Explicit comma-separated PC counts to cross-validate
    #[arg(long, value_delimiter = ',', value_name = "N,N,...")]
    pc_candidates: Option<Vec<usize>>,

    /// Cross-validation replicates per PC count
    #[arg(long, value_name = "N")]
    replicates: Option<usize>,

    /// Maximum number of discriminant axes kept by the final model
    #[arg(long, value_name = "N")]
    max_da_axes: Option<usize>,

    /// Scale markers to unit variance before PCA
    #[arg(long)]
    scale: bool,
}

#[derive(Args)]
struct SimulateArgs {
    /// Output dosage TSV
    #[arg(value_name = "OUTPUT_TSV")]
    output: PathBuf,

    /// Comma-separated population sizes
    #[arg(long, value_delimiter = ',', default_value = "20,20,20")]
    populations: Vec<usize>,

    #[arg(long, default_value = "500")]
    markers: usize,

    /// Divergence of each population from the ancestral frequencies
    #[arg(long, default_value = "0.1")]
    fst: f64,

    /// Probability that a call is missing
    #[arg(long, default_value = "0.0")]
    missing_rate: f64,

    #[arg(long, default_value = "999")]
    seed: u64,

    /// Also write the true population of each individual here
    #[arg(long, value_name = "PATH")]
    labels: Option<PathBuf>,
}

#[derive(Args)]
struct AssignArgs {
    /// Dosage TSV of individuals to assign; must contain every model marker
    #[arg(value_name = "GENOTYPE_TSV")]
    genotypes: PathBuf,

    /// Model written by `dapc run` (model.toml)
    #[arg(long)]
    model: PathBuf,

    #[arg(long, default_value = "assignments.tsv")]
    output: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full DAPC pipeline on a dosage matrix
    #[command(about = "Run DAPC (outputs: bic.tsv, cv.tsv, assignments.tsv, summary.toml, model.toml)")]
    Run(RunArgs),

    /// Assign new individuals with a saved model
    #[command(about = "Assign individuals with a fitted model (outputs: assignments.tsv)")]
    Assign(AssignArgs),

    /// Write a synthetic structured cohort
    #[command(about = "Simulate a structured cohort (outputs: dosage TSV)")]
    Simulate(SimulateArgs),
}

struct StageBar {
    bar: ProgressBar,
}

impl StageBar {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(
            Some(PipelineStage::ALL.len() as u64),
            draw_target,
        );
        let style = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .map(|s| s.progress_chars("█▉▊▋▌▍▎▏  "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl ProgressObserver for StageBar {
    fn on_stage_start(&mut self, stage: PipelineStage) {
        self.bar.set_message(stage.describe());
    }

    fn on_stage_finish(&mut self, _stage: PipelineStage) {
        self.bar.inc(1);
    }
}

impl Drop for StageBar {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}

fn resolve_config(args: &RunArgs) -> Result<DapcConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => DapcConfig::from_toml_file(path)?,
        None => DapcConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(max_k) = args.max_k {
        config.max_k = Some(max_k);
    }
    if let Some(pcs) = args.clustering_pcs {
        config.n_pca_clustering = Some(pcs);
    }
    if let Some(pcs) = args.max_cv_pcs {
        config.max_cv_pcs = pcs;
    }
    if let Some(candidates) = &args.pc_candidates {
        config.pc_candidates = Some(candidates.clone());
    }
    if let Some(replicates) = args.replicates {
        config.n_replicates = replicates;
    }
    if let Some(axes) = args.max_da_axes {
        config.max_da_axes = axes;
    }
    if args.scale {
        config.scale = true;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args)?;
    let matrix = read_dosage_tsv(&args.genotypes)?;

    let report = {
        let mut bar = StageBar::new();
        dapc::run(&matrix, &config, &mut bar)?
    };

    // Everything is rendered before the output directory is touched.
    let outputs = [
        ("bic.tsv", render_bic_table(&report.clusters)?),
        ("cv.tsv", render_cv_table(&report.cross_validation)?),
        (
            "assignments.tsv",
            render_assignments(&report.assignment_rows(), report.model.n_groups())?,
        ),
        ("summary.toml", render_summary(&report.summary)?.into_bytes()),
        ("model.toml", render_model(&report.model)?.into_bytes()),
    ];
    write_outputs(&args.out_dir, &outputs)?;

    let summary = &report.summary;
    println!(
        "{} individuals, {} markers after QC; K = {}, {} PCs, {} discriminant axes",
        summary.n_individuals,
        summary.n_markers,
        summary.selected_k,
        summary.optimal_pcs,
        summary.n_da_axes
    );
    if let Some(success) = summary.mean_success {
        println!("Mean cross-validated assignment success: {success:.3}");
    }
    println!("Results written to {}", args.out_dir.display());
    Ok(())
}

fn assign(args: AssignArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = load_model(&args.model)?;
    let matrix = read_dosage_tsv(&args.genotypes)?.select_markers(model.marker_ids())?;
    let prediction = model.predict(&matrix)?;
    let rows: Vec<AssignmentRow<'_>> = matrix
        .sample_ids()
        .iter()
        .zip(&prediction.assignments)
        .zip(prediction.posterior.rows())
        .map(|((id, &group), posterior)| AssignmentRow {
            sample_id: id,
            group,
            posterior: posterior.to_vec(),
        })
        .collect();
    write_assignments(&args.output, &rows, model.n_groups())?;
    println!(
        "Assigned {} individuals to {} groups; wrote {}",
        rows.len(),
        model.n_groups(),
        args.output.display()
    );
    Ok(())
}

fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let spec = CohortSpec {
        population_sizes: args.populations,
        n_markers: args.markers,
        fst: args.fst,
        missing_rate: args.missing_rate,
        seed: args.seed,
    };
    let cohort = simulate_cohort(&spec)?;
    write_dosage_tsv(&args.output, &cohort.matrix)?;
    if let Some(path) = &args.labels {
        write_labels(path, cohort.matrix.sample_ids(), &cohort.populations, "population")?;
    }
    println!(
        "Simulated {} individuals x {} markers into {}",
        cohort.matrix.n_samples(),
        cohort.matrix.n_markers(),
        args.output.display()
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { threads, command } = Cli::parse();

    if let Some(threads) = threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            eprintln!("Error: could not size the thread pool: {e}");
            process::exit(1);
        }
    }

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Assign(args)) => assign(args),
        Some(Commands::Simulate(args)) => simulate(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
