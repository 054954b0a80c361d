// src/config.rs

//! Search configuration: bounds, priors, kernel form, schedule and retry policy.
//!
//! `SearchConfig::default()` is the experiment as it was run; a JSON file may
//! override any subset of fields.

use crate::error::ConfigError;
use crate::inference::acquisition::RandMaxVar;
use crate::inference::optimum::DifferentialEvolution;
use crate::models::parameters::{Interval, ParameterBounds, ParameterName, PriorSet, UniformPrior, N_PARAMS};
use crate::models::simulator::SimulatorSettings;
use crate::surrogate::{Constraint, KernelSpec};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Constraint regime applied to the lengthscales when the surrogate is re-tuned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LengthscaleRegime {
    /// Positive lengthscales, each seeded at bound width / evidence count.
    Free,
    /// Per-quantity bounded lengthscales, randomised without seeding.
    /// Quantities not listed stay positive.
    Tight { bounds: BTreeMap<ParameterName, (f64, f64)> },
}

impl LengthscaleRegime {
    /// Tight intervals used on odd refinement rounds.
    pub fn tight_default() -> Self {
        use ParameterName::*;
        let bounds = [
            (Tf1, (1e-3, 1.0)),
            (Tf2, (1e-3, 1.0)),
            (Alpha, (1e-3, 0.5)),
            (Beta, (1e-3, 0.5)),
            (LogWalltime, (1e-3, 0.1)),
            (NAr, (1e-3, 1.0)),
            (Tmin, (1e-6, 1e-3)),
        ]
        .into_iter()
        .collect();
        LengthscaleRegime::Tight { bounds }
    }

    pub fn constraints(&self) -> [Constraint; N_PARAMS] {
        match self {
            LengthscaleRegime::Free => [Constraint::Positive; N_PARAMS],
            LengthscaleRegime::Tight { bounds } => ParameterName::ALL.map(|name| match bounds.get(&name) {
                Some(&(lo, hi)) => Constraint::Bounded { lo, hi },
                None => Constraint::Positive,
            }),
        }
    }

    pub fn seeds_lengthscales(&self) -> bool {
        matches!(self, LengthscaleRegime::Free)
    }
}

/// Kernel form of the surrogate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Bounds of the rational-quadratic power.
    pub power_bounds: (f64, f64),
    /// Observation-noise variance, fixed before every re-tune.
    pub noise_variance: f64,
    /// Optimiser iterations for the periodic refits inside evidence collection.
    pub update_opt_iters: u64,
    /// Optimiser iterations for the controller's re-tune after each stage.
    pub retune_opt_iters: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { power_bounds: (1e-10, 0.03), noise_variance: 1e-10, update_opt_iters: 50, retune_opt_iters: 1000 }
    }
}

impl KernelConfig {
    pub fn initial_spec(&self) -> KernelSpec {
        KernelSpec::rational_quadratic(N_PARAMS, self.power_bounds)
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per stage including the first; 0 retries forever.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 10, initial_backoff_ms: 1_000, multiplier: 2.0, max_backoff_ms: 60_000 }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, initial_backoff_ms: 0, multiplier: 1.0, max_backoff_ms: 0 }
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let ms = (self.initial_backoff_ms as f64 * self.multiplier.powi(exp)).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub observed_path: PathBuf,
    pub output_dir: PathBuf,
    /// Program run once per simulation.
    pub simulator_program: PathBuf,
    pub simulator: SimulatorSettings,
    pub priors: PriorSet,
    /// Search box of the surrogate and the acquisition.
    pub bounds: ParameterBounds,
    pub kernel: KernelConfig,
    /// Cycled by refinement round index.
    pub schedule: Vec<LengthscaleRegime>,
    pub retry: RetryPolicy,
    pub n_initial_evidence: usize,
    pub evidence_step: usize,
    pub n_iterations: usize,
    /// Hyperparameters are re-optimised every this many new evidence points.
    pub update_interval: usize,
    pub max_parallel_batches: usize,
    pub acquisition: RandMaxVar,
    pub optimum: DifferentialEvolution,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        use ParameterName::*;
        let priors = PriorSet::from_fn(|name| match name {
            Tf1 | Tf2 => UniformPrior::new(1.0, 19.0),
            Tmin => UniformPrior::new(1e-3, 44e-3),
            NAr => UniformPrior::new(0.001, 100.0),
            LogWalltime => UniformPrior::new(0.0, 7.0),
            Alpha | Beta => UniformPrior::new(0.001, 10.0),
        });
        let bounds = ParameterBounds::from_fn(|name| match name {
            Tf1 | Tf2 => Interval::new(1.0, 20.0),
            Tmin => Interval::new(1e-3, 44e-3),
            NAr => Interval::new(0.001, 100.0),
            LogWalltime => Interval::new(0.0, 7.0),
            Alpha | Beta => Interval::new(0.001, 10.0),
        });
        Self {
            observed_path: PathBuf::from("../experimental_data/IP_out.npz"),
            output_dir: PathBuf::from("."),
            simulator_program: PathBuf::from("run_CQ_fluid_simulation"),
            simulator: SimulatorSettings::default(),
            priors,
            bounds,
            kernel: KernelConfig::default(),
            schedule: vec![LengthscaleRegime::Free, LengthscaleRegime::tight_default()],
            retry: RetryPolicy::default(),
            n_initial_evidence: 150,
            evidence_step: 50,
            n_iterations: 20,
            update_interval: 32,
            max_parallel_batches: 32,
            acquisition: RandMaxVar::default(),
            optimum: DifferentialEvolution::default(),
            seed: 0,
        }
    }
}

impl SearchConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.is_empty() {
            return Err(ConfigError::Invalid("lengthscale schedule is empty".into()));
        }
        if self.n_initial_evidence == 0 || self.max_parallel_batches == 0 || self.update_interval == 0 {
            return Err(ConfigError::Invalid(
                "n_initial_evidence, max_parallel_batches and update_interval must be positive".into(),
            ));
        }
        if let Some(iv) = self.bounds.intervals().iter().find(|iv| !(iv.width() > 0.0)) {
            return Err(ConfigError::Invalid(format!("empty bound interval {iv:?}")));
        }
        let (lo, hi) = self.kernel.power_bounds;
        if !(lo < hi) {
            return Err(ConfigError::Invalid(format!("power bounds ({lo}, {hi}) are empty")));
        }
        let de = &self.optimum;
        let (m_lo, m_hi) = de.mutation;
        if !(0.0 <= m_lo && m_lo < m_hi && m_hi.is_finite()) {
            return Err(ConfigError::Invalid(format!("mutation range ({m_lo}, {m_hi}) is empty")));
        }
        if !(0.0..=1.0).contains(&de.recombination) || de.popsize == 0 {
            return Err(ConfigError::Invalid(
                "recombination must lie in [0, 1] and popsize must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Evidence count the refinement round `i` extends to.
    pub fn refinement_target(&self, i: usize) -> usize {
        self.n_initial_evidence + self.evidence_step * i
    }

    pub fn regime(&self, i: usize) -> &LengthscaleRegime {
        &self.schedule[i % self.schedule.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_experiment() {
        let c = SearchConfig::default();
        assert_eq!(c.n_initial_evidence, 150);
        assert_eq!(c.refinement_target(0), 150);
        assert_eq!(c.refinement_target(19), 1100);
        assert_eq!(c.bounds.interval(ParameterName::Tf1), Interval::new(1.0, 20.0));
        let n_ar = c.priors.prior(ParameterName::NAr).support();
        assert_eq!(n_ar.lo, 0.001);
        assert!((n_ar.hi - 100.001).abs() < 1e-9);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn schedule_alternates_free_and_tight() {
        let c = SearchConfig::default();
        assert_eq!(c.regime(0), &LengthscaleRegime::Free);
        assert!(matches!(c.regime(1), LengthscaleRegime::Tight { .. }));
        assert_eq!(c.regime(2), &LengthscaleRegime::Free);

        let tight = c.regime(1).constraints();
        assert_eq!(tight[ParameterName::Tmin.dim()], Constraint::Bounded { lo: 1e-6, hi: 1e-3 });
        assert_eq!(tight[ParameterName::LogWalltime.dim()], Constraint::Bounded { lo: 1e-3, hi: 0.1 });
        assert!(!c.regime(1).seeds_lengthscales());
    }

    #[test]
    fn backoff_grows_and_saturates() {
        let p = RetryPolicy { max_attempts: 5, initial_backoff_ms: 100, multiplier: 2.0, max_backoff_ms: 350 };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert!(p.allows(4));
        assert!(!p.allows(5));
        assert!(RetryPolicy::immediate(0).allows(1_000));
    }

    #[test]
    fn partial_json_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("search.json");
        std::fs::write(
            &path,
            r#"{ "n_iterations": 21, "schedule": [{ "kind": "free" }], "retry": { "max_attempts": 3, "initial_backoff_ms": 0, "multiplier": 1.0, "max_backoff_ms": 0 } }"#,
        )
        .unwrap();
        let c = SearchConfig::from_json_file(&path).unwrap();
        assert_eq!(c.n_iterations, 21);
        assert_eq!(c.refinement_target(20), 1150);
        assert_eq!(c.schedule, vec![LengthscaleRegime::Free]);
        assert_eq!(c.retry.max_attempts, 3);
        assert_eq!(c.update_interval, 32);
    }

    #[test]
    fn empty_schedule_is_rejected() {
        let c = SearchConfig { schedule: vec![], ..Default::default() };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn degenerate_optimum_settings_are_rejected() {
        let empty_mutation = DifferentialEvolution { mutation: (0.8, 0.8), ..Default::default() };
        let c = SearchConfig { optimum: empty_mutation, ..Default::default() };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let reversed = DifferentialEvolution { mutation: (1.0, 0.5), ..Default::default() };
        let c = SearchConfig { optimum: reversed, ..Default::default() };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let c = SearchConfig { max_parallel_batches: 0, ..Default::default() };
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }
}
