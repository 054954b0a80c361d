// src/error.rs

//! Typed errors for simulation, surrogate fitting, persistence and the search loop.
//!
//! The search loop only distinguishes two classes: [`SearchError::Transient`]
//! failures are retried under the configured [`RetryPolicy`], everything else
//! aborts the search.
//!
//! [`RetryPolicy`]: crate::config::RetryPolicy

use std::path::PathBuf;
use thiserror::Error;

/// Failures of a single simulator invocation or of the model graph evaluating it.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("failed to launch simulator `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("simulator exited with {status}: {stderr}")]
    Process { status: String, stderr: String },

    #[error("failed to read simulator output {path}: {message}")]
    Output { path: PathBuf, message: String },

    #[error("simulated trace has mismatched lengths: {n_time} time points, {n_current} current values")]
    Shape { n_time: usize, n_current: usize },

    #[error("model graph has no node named `{0}`")]
    UnknownNode(String),

    #[error("node `{node}` received a {found} input where a {expected} was expected")]
    NodeInput {
        node: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Failures of the Gaussian-process surrogate.
#[derive(Debug, Error)]
pub enum SurrogateError {
    #[error("kernel matrix is not positive definite even with jitter {jitter:e}")]
    NotPositiveDefinite { jitter: f64 },

    #[error("surrogate has no training data")]
    NoData,

    #[error("hyperparameter optimisation failed: {0}")]
    Optimisation(String),

    #[error("kernel spec has {found} lengthscales, expected {expected}")]
    Dimension { expected: usize, found: usize },
}

/// Fatal configuration problems detected before the search starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("observed data file {path} is missing")]
    MissingObserved { path: PathBuf },

    #[error("failed to read observed data {path}: {message}")]
    ObservedFormat { path: PathBuf, message: String },

    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures while persisting or loading search snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {0} already exists and is never overwritten")]
    AlreadyExists(PathBuf),

    #[error("snapshot i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot encoding for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("evidence export to {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Errors surfaced to the search controller.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Simulation or fitting failure that the controller may retry.
    #[error("transient failure: {0}")]
    Transient(#[source] TransientCause),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("stage `{stage}` still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        last: Box<SearchError>,
    },
}

/// What went wrong in a retryable failure.
#[derive(Debug, Error)]
pub enum TransientCause {
    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Surrogate(#[from] SurrogateError),
}

impl SearchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SearchError::Transient(_))
    }
}

impl From<SimulationError> for SearchError {
    fn from(e: SimulationError) -> Self {
        SearchError::Transient(TransientCause::Simulation(e))
    }
}

impl From<SurrogateError> for SearchError {
    fn from(e: SurrogateError) -> Self {
        SearchError::Transient(TransientCause::Surrogate(e))
    }
}
