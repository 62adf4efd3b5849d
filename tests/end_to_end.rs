use dapc::io::{load_model, save_model};
use dapc::progress::NoopProgress;
use dapc::simulate::{CohortSpec, SimulatedCohort, simulate_cohort};
use dapc::{DapcConfig, GenotypeMatrix, KMeansOptions, cross_validate, run, select_k};
use ndarray::Array2;
use tempfile::tempdir;

fn three_populations() -> SimulatedCohort {
    simulate_cohort(&CohortSpec::new(vec![20, 20, 20], 500, 999)).expect("simulated cohort")
}

#[test]
fn recovers_three_simulated_populations() {
    let cohort = three_populations();
    let config = DapcConfig::default();
    let report = run(&cohort.matrix, &config, &mut NoopProgress).expect("pipeline succeeds");

    assert_eq!(report.summary.selected_k, 3);
    assert_eq!(report.clusters.labels, cohort.populations);

    let tested: Vec<usize> = report
        .cross_validation
        .candidates
        .iter()
        .map(|c| c.n_pcs)
        .collect();
    assert!(tested.contains(&report.summary.optimal_pcs));
    assert!(report.summary.mean_success.expect("optimum has replicates") >= 0.9);
    assert!(report.summary.n_da_axes <= 2);

    let rows = report.assignment_rows();
    assert_eq!(rows.len(), 60);
    for row in &rows {
        assert_eq!(row.posterior.len(), 3);
        let total: f64 = row.posterior.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "posterior sums to {total}");
        assert!(row.posterior.iter().all(|p| (0.0..=1.0).contains(p)));
    }
}

#[test]
fn repeated_runs_are_bit_identical() {
    let cohort = simulate_cohort(&CohortSpec::new(vec![15, 15], 200, 3)).expect("cohort");
    let config = DapcConfig {
        n_replicates: 10,
        ..DapcConfig::default()
    };
    let first = run(&cohort.matrix, &config, &mut NoopProgress).expect("first run");
    let second = run(&cohort.matrix, &config, &mut NoopProgress).expect("second run");
    assert_eq!(first.clusters, second.clusters);
    assert_eq!(first.cross_validation, second.cross_validation);
    assert_eq!(first.model, second.model);
}

#[test]
fn results_do_not_depend_on_thread_count() {
    let cohort = simulate_cohort(&CohortSpec::new(vec![12, 12, 12], 150, 17)).expect("cohort");
    let options = KMeansOptions {
        max_k: 5,
        n_pca: 10,
        ..KMeansOptions::default()
    };
    let in_pool = |threads: usize| {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .expect("thread pool")
            .install(|| select_k(&cohort.matrix, &options).expect("clustering"))
    };
    assert_eq!(in_pool(1), in_pool(4));
}

#[test]
fn optimal_pc_count_is_stable_as_replicates_grow() {
    let cohort = three_populations();
    let config = DapcConfig::default();
    let few = DapcConfig {
        n_replicates: 10,
        ..config.clone()
    };
    let labels = &cohort.populations;
    let a = cross_validate(&cohort.matrix, labels, &few.cross_validation_options()).expect("cv");
    let b = cross_validate(&cohort.matrix, labels, &config.cross_validation_options()).expect("cv");

    let position = |n_pcs: usize| {
        a.candidates
            .iter()
            .position(|c| c.n_pcs == n_pcs)
            .expect("optimum is a tested candidate")
    };
    let (ia, ib) = (position(a.optimal_pcs), position(b.optimal_pcs));
    assert!(ia.abs_diff(ib) <= 1, "optimum moved from {} to {} PCs", a.optimal_pcs, b.optimal_pcs);
}

#[test]
fn saved_models_assign_like_the_original() {
    let cohort = simulate_cohort(&CohortSpec::new(vec![15, 15, 15], 200, 41)).expect("cohort");
    let config = DapcConfig {
        n_replicates: 8,
        ..DapcConfig::default()
    };
    let report = run(&cohort.matrix, &config, &mut NoopProgress).expect("pipeline");

    let dir = tempdir().expect("temporary directory");
    let path = dir.path().join("model.toml");
    save_model(&path, &report.model).expect("save");
    let restored = load_model(&path).expect("load");
    assert_eq!(restored, report.model);

    let aligned = cohort
        .matrix
        .select_markers(restored.marker_ids())
        .expect("model markers present");
    let prediction = restored.predict(&aligned).expect("predict");
    assert_eq!(prediction.assignments, report.model.assignments());
}

#[test]
fn noise_free_groups_are_recovered_exactly() {
    // Three groups of 20 identical rows; group g carries dosage (j + g) % 3 at marker j.
    let (per_group, n_markers) = (20, 30);
    let truth: Vec<usize> = (1..=3).flat_map(|g| vec![g; per_group]).collect();
    let dosages = Array2::from_shape_fn((truth.len(), n_markers), |(i, j)| {
        ((j + truth[i] - 1) % 3) as u8
    });
    let matrix = GenotypeMatrix::new(
        dosages,
        (0..truth.len()).map(|i| format!("ind{i}")).collect(),
        (0..n_markers).map(|j| format!("snp{j}")).collect(),
    )
    .expect("matrix");

    let config = DapcConfig {
        n_replicates: 5,
        ..DapcConfig::default()
    };
    let report = run(&matrix, &config, &mut NoopProgress).expect("pipeline succeeds");

    assert_eq!(report.summary.selected_k, 3);
    assert_eq!(report.clusters.labels, truth);
    assert_eq!(report.model.assignments(), truth.as_slice());
    assert_eq!(report.summary.optimal_pcs, report.model.n_pca());
    for row in report.assignment_rows() {
        for (g, &p) in row.posterior.iter().enumerate() {
            let expected = if g + 1 == row.group { 1.0 } else { 0.0 };
            assert!((p - expected).abs() < 1e-9, "{}: posterior {:?}", row.sample_id, row.posterior);
        }
    }
}
