// src/search.rs

//! The search loop: initial evidence, initial surrogate fit, then rounds of
//! evidence extension and hyperparameter re-tuning under an alternating
//! lengthscale regime, with a checkpoint after every stage.

use crate::config::{LengthscaleRegime, SearchConfig};
use crate::error::{SearchError, SnapshotError};
use crate::inference::optimum::Optimum;
use crate::inference::FittingRoutine;
use crate::models::parameters::{ParameterVector, N_PARAMS};
use crate::snapshot::{SnapshotStore, Stage};
use crate::surrogate::KernelSpec;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use std::fmt;
use std::path::PathBuf;

/// Where the controller is in the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Uninitialized,
    CollectingInitialEvidence,
    InitialFit,
    Refining(usize),
    Done,
}

impl fmt::Display for SearchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchState::Uninitialized => f.write_str("uninitialized"),
            SearchState::CollectingInitialEvidence => f.write_str("collecting initial evidence"),
            SearchState::InitialFit => f.write_str("initial fit"),
            SearchState::Refining(i) => write!(f, "refining {i}"),
            SearchState::Done => f.write_str("done"),
        }
    }
}

/// Outcome of a completed search.
#[derive(Debug, Clone)]
pub struct SearchSummary {
    pub n_evidence: usize,
    /// Snapshot files written by this run, in stage order.
    pub snapshots: Vec<PathBuf>,
    pub kernel: KernelSpec,
    /// Minimum of the final surrogate mean, if it could be located.
    pub optimum: Option<Optimum<N_PARAMS>>,
}

impl SearchSummary {
    pub fn optimum_parameters(&self) -> Option<ParameterVector> {
        self.optimum.as_ref().map(|o| ParameterVector::from_point(&o.x))
    }
}

/// Drives a [`FittingRoutine`] through the search stages.
pub struct SearchController<R: FittingRoutine> {
    routine: R,
    config: SearchConfig,
    store: SnapshotStore,
    state: SearchState,
    rng: Xoshiro256Plus,
    snapshots: Vec<PathBuf>,
}

impl<R: FittingRoutine> SearchController<R> {
    pub fn new(routine: R, config: SearchConfig) -> Self {
        let store = SnapshotStore::new(&config.output_dir);
        let rng = Xoshiro256Plus::seed_from_u64(config.seed.wrapping_add(1));
        Self { routine, config, store, state: SearchState::Uninitialized, rng, snapshots: Vec::new() }
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn into_routine(self) -> R {
        self.routine
    }

    fn transition(&mut self, next: SearchState) {
        tracing::info!(from = %self.state, to = %next, n_evidence = self.routine.n_evidence(), "search state");
        self.state = next;
    }

    /// Runs `attempt` until it succeeds, calling `recover` on the routine after
    /// every transient failure and backing off between attempts.
    fn with_retry<T>(
        &mut self,
        stage: &str,
        mut attempt: impl FnMut(&mut Self) -> Result<T, SearchError>,
        recover: impl Fn(&mut R),
    ) -> Result<T, SearchError> {
        let mut failures = 0u32;
        loop {
            match attempt(self) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    tracing::warn!(stage, attempt = failures, error = %e, "stage failed, recovering");
                    recover(&mut self.routine);
                    if !self.config.retry.allows(failures) {
                        return Err(SearchError::RetriesExhausted {
                            stage: stage.to_string(),
                            attempts: failures,
                            last: Box::new(e),
                        });
                    }
                    let wait = self.config.retry.backoff(failures);
                    if !wait.is_zero() {
                        std::thread::sleep(wait);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes the stage snapshot unless an earlier attempt or run already did.
    fn checkpoint(&mut self, stage: Stage) -> Result<(), SearchError> {
        let n = self.routine.n_evidence();
        let snapshot = self.routine.snapshot(&stage.file_stem(n));
        match self.store.write(stage, &snapshot) {
            Ok(path) => {
                self.snapshots.push(path);
                Ok(())
            }
            Err(SnapshotError::AlreadyExists(path)) => {
                tracing::info!(path = %path.display(), "snapshot already present, keeping it");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fixes the noise, applies `regime` to the lengthscales, randomises the
    /// free hyperparameters and optimises them on the current evidence.
    fn retune(&mut self, regime: &LengthscaleRegime) -> Result<(), SearchError> {
        let kernel = &self.config.kernel;
        let mut spec = self
            .routine
            .kernel_spec()
            .with_fixed_noise(kernel.noise_variance)
            .with_lengthscale_constraints(&regime.constraints())
            .randomized(&mut self.rng);
        if regime.seeds_lengthscales() {
            let n = self.routine.n_evidence().max(1) as f64;
            let seeds: Vec<f64> = self.routine.bounds().intervals().iter().map(|iv| iv.width() / n).collect();
            spec = spec.with_lengthscales(&seeds);
        }
        let nll = self.routine.retune(spec, kernel.retune_opt_iters)?;
        tracing::info!(regime = ?regime, nll, "surrogate re-tuned");
        Ok(())
    }

    pub fn run(&mut self) -> Result<SearchSummary, SearchError> {
        self.transition(SearchState::CollectingInitialEvidence);
        let target = self.config.n_initial_evidence;
        self.with_retry(
            "initial evidence",
            |c| c.routine.fit(target),
            |r| {
                r.cancel_pending();
                r.advance_batch_index();
            },
        )?;
        self.checkpoint(Stage::Initial)?;

        self.transition(SearchState::InitialFit);
        self.with_retry("initial fit", |c| c.retune(&LengthscaleRegime::Free), |_| {})?;

        for i in 0..self.config.n_iterations {
            self.transition(SearchState::Refining(i));
            let target = self.config.refinement_target(i);
            let regime = self.config.regime(i).clone();
            self.with_retry(
                &format!("refinement {i}"),
                |c| {
                    c.routine.fit(target)?;
                    c.checkpoint(Stage::Refinement)?;
                    c.retune(&regime)
                },
                |r| r.reset(),
            )?;
        }

        self.transition(SearchState::Done);
        let optimum = match self.routine.optimum(&self.config.optimum) {
            Ok(o) => {
                tracing::info!(x = ?ParameterVector::from_point(&o.x), value = o.value, "surrogate optimum");
                Some(o)
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not locate the surrogate optimum");
                None
            }
        };

        Ok(SearchSummary {
            n_evidence: self.routine.n_evidence(),
            snapshots: self.snapshots.clone(),
            kernel: self.routine.kernel_spec(),
            optimum,
        })
    }
}
