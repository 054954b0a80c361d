// src/inference/mod.rs

//! Evidence collection: proposes parameter batches, runs the simulator on
//! them in parallel and keeps the GP surrogate of the log-discrepancy in step
//! with the growing evidence set.

pub mod acquisition;
pub mod neldermead;
pub mod optimum;

use self::acquisition::RandMaxVar;
use self::optimum::{find_optimum, DifferentialEvolution, Optimum};

use crate::config::SearchConfig;
use crate::error::{ConfigError, SearchError, SimulationError};
use crate::models::parameters::{ParameterBounds, ParameterName, ParameterVector, N_PARAMS};
use crate::models::ModelGraph;
use crate::snapshot::Snapshot;
use crate::surrogate::{GpRegression, KernelSpec};

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;

/// The operations the search controller drives.
///
/// `fit` blocks until the requested evidence count is reached or a batch
/// fails. A failed batch leaves its unfinished work pending; the caller
/// decides whether to cancel it (`cancel_pending`) or to rewind and redo it
/// (`reset`).
pub trait FittingRoutine {
    fn fit(&mut self, n_evidence: usize) -> Result<(), SearchError>;

    /// Drops pending work. Batch indices already issued stay consumed.
    fn cancel_pending(&mut self);

    /// Drops pending work and rewinds the batch index to the start of the
    /// aborted round.
    fn reset(&mut self);

    fn advance_batch_index(&mut self);

    fn next_batch_index(&self) -> u64;

    fn n_evidence(&self) -> usize;

    fn bounds(&self) -> &ParameterBounds;

    fn kernel_spec(&self) -> KernelSpec;

    /// Installs `spec` and optimises its free hyperparameters on all evidence.
    /// Returns the negative log marginal likelihood reached.
    fn retune(&mut self, spec: KernelSpec, max_iters: u64) -> Result<f64, SearchError>;

    fn snapshot(&self, label: &str) -> Snapshot;

    /// Minimum of the surrogate mean over the search box.
    fn optimum(&self, de: &DifferentialEvolution) -> Result<Optimum<N_PARAMS>, SearchError>;
}

/// Deterministic per-batch random stream.
fn batch_rng(seed: u64, batch_index: u64) -> Xoshiro256Plus {
    Xoshiro256Plus::seed_from_u64(seed ^ batch_index.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// BOLFI evidence collection over a [`ModelGraph`] target node.
pub struct Bolfi {
    model: ModelGraph,
    target: String,
    gp: GpRegression,
    evidence: Vec<[f64; N_PARAMS]>,
    targets: Vec<f64>,
    bounds: ParameterBounds,
    acquisition: RandMaxVar,
    n_initial_evidence: usize,
    update_interval: usize,
    update_opt_iters: u64,
    max_parallel_batches: usize,
    pool: rayon::ThreadPool,
    seed: u64,
    next_batch_index: u64,
    round_start: u64,
    /// Issued but unfinished batches.
    pending: Vec<(u64, [f64; N_PARAMS])>,
    /// Evidence count at the last hyperparameter optimisation.
    last_optimized: usize,
}

impl Bolfi {
    pub fn new(model: ModelGraph, target: &str, config: &SearchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        model
            .node_id(target)
            .map_err(|e| ConfigError::Invalid(format!("surrogate target: {e}")))?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_parallel_batches)
            .thread_name(|i| format!("bolfi-sim-{i}"))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("simulation pool: {e}")))?;
        Ok(Self {
            model,
            target: target.to_string(),
            gp: GpRegression::new(config.kernel.initial_spec()),
            evidence: Vec::new(),
            targets: Vec::new(),
            bounds: config.bounds,
            acquisition: config.acquisition,
            n_initial_evidence: config.n_initial_evidence,
            update_interval: config.update_interval,
            update_opt_iters: config.kernel.update_opt_iters,
            max_parallel_batches: config.max_parallel_batches,
            pool,
            seed: config.seed,
            next_batch_index: 0,
            round_start: 0,
            pending: Vec::new(),
            last_optimized: 0,
        })
    }

    /// Seeds the engine with the evidence and surrogate of a snapshot.
    pub fn with_initial_evidence(mut self, snapshot: &Snapshot) -> Result<Self, SearchError> {
        if snapshot.parameter_names != ParameterName::ALL {
            return Err(ConfigError::Invalid(format!(
                "snapshot `{}` has columns {:?}",
                snapshot.label, snapshot.parameter_names
            ))
            .into());
        }
        self.evidence = snapshot.evidence.clone();
        self.targets = snapshot.targets.clone();
        self.next_batch_index = snapshot.next_batch_index;
        self.round_start = snapshot.next_batch_index;
        self.gp = GpRegression::new(snapshot.kernel.clone());
        self.last_optimized = self.evidence.len();
        self.refit_surrogate()?;
        tracing::info!(label = %snapshot.label, n_evidence = self.evidence.len(), "resumed from snapshot");
        Ok(self)
    }

    pub fn surrogate(&self) -> &GpRegression {
        &self.gp
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn refit_surrogate(&mut self) -> Result<(), SearchError> {
        let x = self.evidence.iter().map(|p| p.to_vec()).collect();
        self.gp.set_data(x, self.targets.clone())?;
        Ok(())
    }

    /// Refits on all evidence; re-optimises hyperparameters once
    /// `update_interval` new points have arrived past the initial phase.
    fn update_surrogate(&mut self) -> Result<(), SearchError> {
        self.refit_surrogate()?;
        let n = self.evidence.len();
        if n >= self.n_initial_evidence && n - self.last_optimized >= self.update_interval {
            let nll = self.gp.optimize(self.update_opt_iters)?;
            self.last_optimized = n;
            tracing::debug!(n_evidence = n, nll, "surrogate hyperparameters updated");
        }
        Ok(())
    }

    /// Proposals for the given batch indices: prior draws while the evidence
    /// is below the initial count, acquisition samples afterwards.
    fn propose(&self, batches: &[u64]) -> Result<Vec<[f64; N_PARAMS]>, SearchError> {
        let n = self.evidence.len();
        let use_prior = |k: usize| n + k < self.n_initial_evidence || self.gp.n_data() == 0;
        let proposals: Result<Vec<_>, _> = self.pool.install(|| {
            batches
                .par_iter()
                .enumerate()
                .map(|(k, &b)| {
                    let mut rng = batch_rng(self.seed, b);
                    if use_prior(k) {
                        Ok(self.model.sample_prior(&mut rng).to_point())
                    } else {
                        self.acquisition.acquire(&self.gp, self.model.priors(), &self.bounds, &mut rng)
                    }
                })
                .collect()
        });
        Ok(proposals?)
    }

    fn simulate_pending(&self) -> Vec<Result<f64, SimulationError>> {
        self.pool.install(|| {
            self.pending
                .par_iter()
                .map(|(_, x)| self.model.evaluate_scalar(&self.target, &ParameterVector::from_point(x)))
                .collect()
        })
    }

    /// Runs one round of at most `max_parallel_batches` batches.
    fn collect_round(&mut self, n_evidence: usize) -> Result<(), SearchError> {
        if self.pending.is_empty() {
            self.round_start = self.next_batch_index;
            let k = (n_evidence - self.evidence.len()).min(self.max_parallel_batches);
            let batches: Vec<u64> = (0..k as u64).map(|i| self.next_batch_index + i).collect();
            let proposals = self.propose(&batches)?;
            self.next_batch_index += k as u64;
            self.pending = batches.into_iter().zip(proposals).collect();
        }

        let results = self.simulate_pending();
        let mut failed = Vec::new();
        let mut first_error = None;
        for ((batch, x), result) in std::mem::take(&mut self.pending).into_iter().zip(results) {
            match result {
                Ok(y) => {
                    self.evidence.push(x);
                    self.targets.push(y);
                }
                Err(e) => {
                    tracing::warn!(batch, error = %e, "simulation failed");
                    failed.push((batch, x));
                    first_error.get_or_insert(e);
                }
            }
        }
        self.pending = failed;

        self.update_surrogate()?;
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl FittingRoutine for Bolfi {
    fn fit(&mut self, n_evidence: usize) -> Result<(), SearchError> {
        while self.evidence.len() < n_evidence {
            self.collect_round(n_evidence)?;
            tracing::debug!(
                n_evidence = self.evidence.len(),
                target = n_evidence,
                next_batch_index = self.next_batch_index,
                "round complete"
            );
        }
        Ok(())
    }

    fn cancel_pending(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(n = self.pending.len(), "cancelling pending batches");
        }
        self.pending.clear();
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.next_batch_index = self.round_start;
    }

    fn advance_batch_index(&mut self) {
        self.next_batch_index += 1;
    }

    fn next_batch_index(&self) -> u64 {
        self.next_batch_index
    }

    fn n_evidence(&self) -> usize {
        self.evidence.len()
    }

    fn bounds(&self) -> &ParameterBounds {
        &self.bounds
    }

    fn kernel_spec(&self) -> KernelSpec {
        self.gp.spec().clone()
    }

    fn retune(&mut self, spec: KernelSpec, max_iters: u64) -> Result<f64, SearchError> {
        if let Err(e) = self.gp.set_spec(spec) {
            tracing::debug!(error = %e, "starting point of the re-tune is singular");
        }
        let nll = self.gp.optimize(max_iters)?;
        self.last_optimized = self.evidence.len();
        Ok(nll)
    }

    fn snapshot(&self, label: &str) -> Snapshot {
        Snapshot {
            label: label.to_string(),
            n_evidence: self.evidence.len(),
            next_batch_index: self.next_batch_index,
            parameter_names: ParameterName::ALL.to_vec(),
            evidence: self.evidence.clone(),
            targets: self.targets.clone(),
            kernel: self.gp.spec().clone(),
        }
    }

    fn optimum(&self, de: &DifferentialEvolution) -> Result<Optimum<N_PARAMS>, SearchError> {
        let gp = &self.gp;
        let opt = find_optimum::<N_PARAMS, { N_PARAMS + 1 }, _, _>(
            |x| gp.predict_mean(x),
            self.bounds.intervals(),
            de,
        )?;
        Ok(opt)
    }
}
