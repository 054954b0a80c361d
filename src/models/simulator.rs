// src/models/simulator.rs

//! Adapter around the external current-quench fluid simulation.
//!
//! The search works with a [`ParameterVector`]; the simulation takes named
//! physical inputs plus fixed auxiliary settings and writes a keyed `.npz`
//! container holding the time grid `t` and the plasma current `I_p`. The
//! adapter maps one onto the other and reshapes the result into a `2 x n`
//! array (row 0 time, row 1 current). Output is not validated beyond the two
//! rows having the same length.

use crate::error::SimulationError;
use crate::models::parameters::ParameterVector;

use ndarray::{Array1, Array2, ArrayD, IxDyn, OwnedRepr};
use ndarray_npy::NpzReader;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Fixed inputs shared by every simulator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorSettings {
    /// Number of runaway-electron seed particles.
    pub n_re: f64,
    /// Directory holding per-call scratch files.
    pub scratch_dir: PathBuf,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self { n_re: 1e10, scratch_dir: PathBuf::from("bolfi_7D_runs") }
    }
}

/// Named inputs of a single simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRequest {
    pub tf1: f64,
    pub tf2: f64,
    pub t_tf: f64,
    pub n_ar_frac: f64,
    pub walltime: f64,
    pub alpha: f64,
    pub beta: f64,
    pub n_re: f64,
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub init_out_file: PathBuf,
    pub cq_fluid_out_file: PathBuf,
}

impl SimulationRequest {
    /// Maps a search point onto the simulator's inputs. Scratch files are
    /// keyed by the `Tf1` value so concurrent runs do not share paths.
    pub fn new(p: &ParameterVector, settings: &SimulatorSettings) -> Self {
        let key = p.tf1.to_string();
        let dir = &settings.scratch_dir;
        Self {
            tf1: p.tf1,
            tf2: p.tf2,
            t_tf: p.tmin,
            n_ar_frac: p.n_ar,
            walltime: p.walltime(),
            alpha: p.alpha,
            beta: p.beta,
            n_re: settings.n_re,
            input_file: dir.join(format!("{key}in.npz")),
            output_file: dir.join(format!("{key}out.npz")),
            init_out_file: dir.join(format!("{key}init_out.npz")),
            cq_fluid_out_file: dir.join(format!("{key}CQ_fluid_out.npz")),
        }
    }

    /// Command-line form of the request, `--name value` pairs.
    pub fn to_args(&self) -> Vec<String> {
        let path = |p: &Path| p.display().to_string();
        vec![
            "--Tf1".into(), self.tf1.to_string(),
            "--Tf2".into(), self.tf2.to_string(),
            "--t_T_f".into(), self.t_tf.to_string(),
            "--nAr_frac".into(), self.n_ar_frac.to_string(),
            "--walltime".into(), self.walltime.to_string(),
            "--alpha".into(), self.alpha.to_string(),
            "--beta".into(), self.beta.to_string(),
            "--Nre".into(), self.n_re.to_string(),
            "--inputfilename".into(), path(&self.input_file),
            "--outputfilename".into(), path(&self.output_file),
            "--initoutfile".into(), path(&self.init_out_file),
            "--CQfluidoutfile".into(), path(&self.cq_fluid_out_file),
        ]
    }
}

/// Keyed simulation result: time grid and plasma current, as written by the solver.
#[derive(Debug, Clone)]
pub struct SimulationOutput {
    pub t: Array1<f64>,
    pub i_p: ArrayD<f64>,
}

/// Anything that can run the current-quench simulation.
pub trait SimulationBackend: Send + Sync {
    fn run(&self, request: &SimulationRequest) -> Result<SimulationOutput, SimulationError>;
}

/// Runs the simulation as a child process and reads its `.npz` output.
#[derive(Debug, Clone)]
pub struct ExternalProcess {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
}

impl ExternalProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), extra_args: Vec::new() }
    }
}

impl SimulationBackend for ExternalProcess {
    fn run(&self, request: &SimulationRequest) -> Result<SimulationOutput, SimulationError> {
        tracing::debug!(program = %self.program.display(), tf1 = request.tf1, "launching simulation");
        let output = Command::new(&self.program)
            .args(&self.extra_args)
            .args(request.to_args())
            .output()
            .map_err(|source| SimulationError::Launch {
                program: self.program.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(SimulationError::Process {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        read_simulation_output(&request.cq_fluid_out_file)
    }
}

fn read_entry(npz: &mut NpzReader<File>, key: &str) -> Result<ArrayD<f64>, String> {
    npz.by_name::<OwnedRepr<f64>, IxDyn>(&format!("{key}.npy"))
        .or_else(|_| npz.by_name::<OwnedRepr<f64>, IxDyn>(key))
        .map_err(|e| format!("entry `{key}`: {e}"))
}

/// Reads the `t` and `I_p` entries of a solver output container.
pub fn read_simulation_output(path: &Path) -> Result<SimulationOutput, SimulationError> {
    let fail = |message: String| SimulationError::Output { path: path.to_path_buf(), message };
    let file = File::open(path).map_err(|e| fail(e.to_string()))?;
    let mut npz = NpzReader::new(file).map_err(|e| fail(e.to_string()))?;
    let t = read_entry(&mut npz, "t").map_err(fail)?;
    let i_p = read_entry(&mut npz, "I_p").map_err(fail)?;
    Ok(SimulationOutput { t: t.iter().copied().collect(), i_p })
}

/// Maps parameter vectors onto simulator calls and reshapes their output.
#[derive(Clone)]
pub struct SimulatorAdapter {
    backend: Arc<dyn SimulationBackend>,
    settings: SimulatorSettings,
}

impl SimulatorAdapter {
    pub fn new(backend: Arc<dyn SimulationBackend>, settings: SimulatorSettings) -> Self {
        Self { backend, settings }
    }

    /// Runs one simulation and returns `[time; current]`.
    pub fn simulate(&self, p: &ParameterVector) -> Result<Array2<f64>, SimulationError> {
        let request = SimulationRequest::new(p, &self.settings);
        let out = self.backend.run(&request)?;
        // I_p may come back as (n, 1); squeeze to the time axis.
        let current: Vec<f64> = out.i_p.iter().copied().collect();
        if current.len() != out.t.len() {
            return Err(SimulationError::Shape { n_time: out.t.len(), n_current: current.len() });
        }
        let n = current.len();
        let mut trace = Array2::zeros((2, n));
        trace.row_mut(0).assign(&out.t);
        trace.row_mut(1).assign(&Array1::from(current));
        Ok(trace)
    }
}
