// src/tests.rs

// Scenario tests for the search controller, driven by a scripted fitting routine.
use crate::config::{LengthscaleRegime, RetryPolicy, SearchConfig};
use crate::error::{SearchError, SimulationError};
use crate::inference::optimum::{DifferentialEvolution, Optimum};
use crate::inference::FittingRoutine;
use crate::models::parameters::{ParameterBounds, ParameterName, PriorSet, UniformPrior, N_PARAMS};
use crate::models::simulator::{
    SimulationBackend, SimulationOutput, SimulationRequest, SimulatorAdapter, SimulatorSettings,
};
use crate::models::summary::TimeBase;
use crate::models::{build_model, DISCREPANCY_NODE};
use crate::search::{SearchController, SearchState};
use crate::snapshot::{Snapshot, SnapshotStore, Stage};
use crate::surrogate::{Constraint, KernelSpec};

use ndarray::{Array1, Array2};
use std::collections::HashMap;
use std::sync::Arc;

// A helper for comparing floating-point numbers.
fn approx_eq(a: f64, b: f64, tolerance: f64) {
    assert!(
        (a - b).abs() < tolerance,
        "assertion failed: `(left ≈ right)`\n  left: `{}`, right: `{}`", a, b
    );
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Fit(usize),
    Cancel,
    Reset,
    Advance,
    Retune,
}

/// Fitting routine that reaches any target instantly, except for the
/// scripted number of failures per target.
struct Scripted {
    bounds: ParameterBounds,
    evidence: usize,
    next_batch_index: u64,
    round_start: u64,
    pending: usize,
    fit_failures: HashMap<usize, u32>,
    retune_failures: HashMap<usize, u32>,
    spec: KernelSpec,
    retunes: Vec<KernelSpec>,
    events: Vec<Event>,
}

impl Scripted {
    fn new(config: &SearchConfig) -> Self {
        Self {
            bounds: config.bounds,
            evidence: 0,
            next_batch_index: 0,
            round_start: 0,
            pending: 0,
            fit_failures: HashMap::new(),
            retune_failures: HashMap::new(),
            spec: config.kernel.initial_spec(),
            retunes: Vec::new(),
            events: Vec::new(),
        }
    }

    fn failing_fit(mut self, target: usize, times: u32) -> Self {
        self.fit_failures.insert(target, times);
        self
    }

    /// Fails the retune performed at evidence count `n_evidence`.
    fn failing_retune(mut self, n_evidence: usize, times: u32) -> Self {
        self.retune_failures.insert(n_evidence, times);
        self
    }

    fn injected() -> SearchError {
        SimulationError::Process { status: "exit status: 1".into(), stderr: "solver diverged".into() }.into()
    }
}

impl FittingRoutine for Scripted {
    fn fit(&mut self, n_evidence: usize) -> Result<(), SearchError> {
        self.events.push(Event::Fit(n_evidence));
        self.round_start = self.next_batch_index;
        if let Some(left) = self.fit_failures.get_mut(&n_evidence).filter(|left| **left > 0) {
            *left -= 1;
            self.next_batch_index += 1;
            self.pending = 1;
            return Err(Self::injected());
        }
        if n_evidence > self.evidence {
            self.next_batch_index += (n_evidence - self.evidence) as u64;
            self.evidence = n_evidence;
        }
        Ok(())
    }

    fn cancel_pending(&mut self) {
        self.events.push(Event::Cancel);
        self.pending = 0;
    }

    fn reset(&mut self) {
        self.events.push(Event::Reset);
        self.pending = 0;
        self.next_batch_index = self.round_start;
    }

    fn advance_batch_index(&mut self) {
        self.events.push(Event::Advance);
        self.next_batch_index += 1;
    }

    fn next_batch_index(&self) -> u64 {
        self.next_batch_index
    }

    fn n_evidence(&self) -> usize {
        self.evidence
    }

    fn bounds(&self) -> &ParameterBounds {
        &self.bounds
    }

    fn kernel_spec(&self) -> KernelSpec {
        self.spec.clone()
    }

    fn retune(&mut self, spec: KernelSpec, _max_iters: u64) -> Result<f64, SearchError> {
        self.events.push(Event::Retune);
        if let Some(left) = self.retune_failures.get_mut(&self.evidence).filter(|left| **left > 0) {
            *left -= 1;
            return Err(crate::error::SurrogateError::NotPositiveDefinite { jitter: 1e-3 }.into());
        }
        self.retunes.push(spec.clone());
        self.spec = spec;
        Ok(0.0)
    }

    fn snapshot(&self, label: &str) -> Snapshot {
        Snapshot {
            label: label.to_string(),
            n_evidence: self.evidence,
            next_batch_index: self.next_batch_index,
            parameter_names: ParameterName::ALL.to_vec(),
            evidence: vec![[0.5; N_PARAMS]; self.evidence],
            targets: vec![0.0; self.evidence],
            kernel: self.spec.clone(),
        }
    }

    fn optimum(&self, _de: &DifferentialEvolution) -> Result<Optimum<N_PARAMS>, SearchError> {
        let intervals = *self.bounds.intervals();
        let x = intervals.map(|iv| 0.5 * (iv.lo + iv.hi));
        Ok(Optimum { x, value: -1.0, generations: 0 })
    }
}

fn test_config(dir: &std::path::Path) -> SearchConfig {
    SearchConfig { output_dir: dir.to_path_buf(), retry: RetryPolicy::immediate(5), ..Default::default() }
}

#[test]
fn full_schedule_checkpoints_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut controller = SearchController::new(Scripted::new(&config), config.clone());
    let summary = controller.run().unwrap();

    assert_eq!(controller.state(), SearchState::Done);
    assert_eq!(summary.n_evidence, 1100);
    assert_eq!(summary.snapshots.len(), 1 + 20);

    let store = SnapshotStore::new(dir.path());
    assert!(store.exists(Stage::Initial, 150));
    assert_eq!(summary.snapshots[0], store.path_for(Stage::Initial, 150));
    for i in 0..20 {
        let n = 150 + 50 * i;
        assert!(store.exists(Stage::Refinement, n), "missing snapshot at {n}");
        assert_eq!(summary.snapshots[1 + i], store.path_for(Stage::Refinement, n));
    }

    let counts: Vec<usize> = summary
        .snapshots
        .iter()
        .map(|p| Snapshot::load(p).unwrap().n_evidence)
        .collect();
    assert!(counts.windows(2).all(|w| w[0] <= w[1]));
    assert!(counts[1..].windows(2).all(|w| w[0] < w[1]));

    let best = summary.optimum_parameters().unwrap();
    approx_eq(best.tf1, 10.5, 1e-12);
}

#[test]
fn twenty_one_rounds_reach_1150() {
    let dir = tempfile::tempdir().unwrap();
    let config = SearchConfig { n_iterations: 21, ..test_config(dir.path()) };
    let summary = SearchController::new(Scripted::new(&config), config).run().unwrap();
    assert_eq!(summary.n_evidence, 1150);
    assert!(SnapshotStore::new(dir.path()).exists(Stage::Refinement, 1150));
}

#[test]
fn initial_failures_cancel_and_advance_batch_index_once_each() {
    let dir = tempfile::tempdir().unwrap();
    let config = SearchConfig { n_iterations: 0, ..test_config(dir.path()) };
    let routine = Scripted::new(&config).failing_fit(150, 2);
    let mut controller = SearchController::new(routine, config);
    controller.run().unwrap();

    let routine = controller.into_routine();
    let collection: Vec<Event> = routine.events.iter().take_while(|e| **e != Event::Retune).cloned().collect();
    assert_eq!(
        collection,
        vec![
            Event::Fit(150),
            Event::Cancel,
            Event::Advance,
            Event::Fit(150),
            Event::Cancel,
            Event::Advance,
            Event::Fit(150),
        ]
    );
    // Each failure consumed one issued batch plus one explicit advance.
    assert_eq!(routine.next_batch_index, 150 + 2 * 2);
    assert_eq!(routine.pending, 0);
}

#[test]
fn refinement_failure_resets_and_retries_the_same_target() {
    let dir = tempfile::tempdir().unwrap();
    let config = SearchConfig { n_iterations: 4, ..test_config(dir.path()) };
    let routine = Scripted::new(&config).failing_fit(250, 1);
    let mut controller = SearchController::new(routine, config);
    let summary = controller.run().unwrap();
    assert_eq!(summary.n_evidence, 300);

    let routine = controller.into_routine();
    let at = routine.events.iter().position(|e| *e == Event::Fit(250)).unwrap();
    assert_eq!(&routine.events[at..at + 3], &[Event::Fit(250), Event::Reset, Event::Fit(250)]);
    assert!(!routine.events.contains(&Event::Advance));
    assert!(!routine.events.contains(&Event::Cancel));
    assert_eq!(routine.next_batch_index, 300);
}

#[test]
fn retries_are_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let config = SearchConfig { retry: RetryPolicy::immediate(3), ..test_config(dir.path()) };
    let routine = Scripted::new(&config).failing_fit(150, 10);
    let err = SearchController::new(routine, config).run().unwrap_err();
    match err {
        SearchError::RetriesExhausted { stage, attempts, last } => {
            assert_eq!(stage, "initial evidence");
            assert_eq!(attempts, 3);
            assert!(last.is_transient());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!SnapshotStore::new(dir.path()).exists(Stage::Initial, 150));
}

#[test]
fn retried_stage_keeps_its_first_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = SearchConfig { n_iterations: 3, ..test_config(dir.path()) };
    let routine = Scripted::new(&config).failing_retune(200, 2);
    let mut controller = SearchController::new(routine, config);
    let summary = controller.run().unwrap();

    assert_eq!(summary.snapshots.len(), 1 + 3);
    let routine = controller.into_routine();
    let fits_at_200 = routine.events.iter().filter(|e| **e == Event::Fit(200)).count();
    assert_eq!(fits_at_200, 3);
    assert_eq!(routine.events.iter().filter(|e| **e == Event::Reset).count(), 2);
}

#[test]
fn retune_schedule_alternates_regimes() {
    let dir = tempfile::tempdir().unwrap();
    let config = SearchConfig { n_iterations: 4, ..test_config(dir.path()) };
    let mut controller = SearchController::new(Scripted::new(&config), config.clone());
    controller.run().unwrap();
    let retunes = controller.into_routine().retunes;
    // Initial fit plus one per refinement round.
    assert_eq!(retunes.len(), 5);

    for spec in &retunes {
        assert_eq!(spec.noise.constraint, Constraint::Fixed);
        approx_eq(spec.noise.value, 1e-10, 1e-20);
    }

    // Initial fit and even rounds: positive lengthscales seeded at width / n.
    for (spec, n) in [(&retunes[0], 150.0), (&retunes[1], 150.0), (&retunes[3], 250.0)] {
        for (name, l) in ParameterName::ALL.iter().zip(&spec.lengthscales) {
            assert_eq!(l.constraint, Constraint::Positive);
            approx_eq(l.value, config.bounds.interval(*name).width() / n, 1e-12);
        }
    }

    // Odd rounds: per-quantity bounded lengthscales.
    let LengthscaleRegime::Tight { bounds } = LengthscaleRegime::tight_default() else {
        unreachable!()
    };
    for spec in [&retunes[2], &retunes[4]] {
        for (name, l) in ParameterName::ALL.iter().zip(&spec.lengthscales) {
            let (lo, hi) = bounds[name];
            assert_eq!(l.constraint, Constraint::Bounded { lo, hi });
            assert!(l.value >= lo && l.value <= hi);
        }
    }
}

/// Constant current of 1.0 on the same 0-25 ms grid as the observed trace.
struct ConstantCurrent;

impl SimulationBackend for ConstantCurrent {
    fn run(&self, _request: &SimulationRequest) -> Result<SimulationOutput, SimulationError> {
        let t = Array1::linspace(0.0, 25e-3, 101);
        Ok(SimulationOutput { t, i_p: Array1::ones(101).into_dyn() })
    }
}

#[test]
fn identical_constant_current_has_zero_discrepancy() {
    let mut observed = Array2::ones((2, 101));
    observed.row_mut(0).assign(&Array1::linspace(0.0, 25e-3, 101));
    let adapter = SimulatorAdapter::new(Arc::new(ConstantCurrent), SimulatorSettings::default());
    let priors = PriorSet::from_fn(|_| UniformPrior::new(0.0, 1.0));
    let model = build_model(adapter, &observed, TimeBase::window_25ms(101), priors);

    let p = SearchConfig::default().priors.sample(&mut rand::thread_rng());
    assert_eq!(model.evaluate_scalar(DISCREPANCY_NODE, &p).unwrap(), 0.0);
}
