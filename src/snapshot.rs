// src/snapshot.rs

//! Checkpoints of the evidence set and surrogate configuration.
//!
//! One JSON file per stage, named by its evidence count, plus a CSV export
//! of the evidence table. Files are created once and never overwritten.

use crate::data::write_ndarray_to_csv;
use crate::error::SnapshotError;
use crate::models::parameters::{ParameterName, N_PARAMS};
use crate::surrogate::KernelSpec;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Column name of the surrogate target in evidence exports.
pub const TARGET_NAME: &str = "log_d";

/// Which checkpoint a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initial,
    Refinement,
}

impl Stage {
    pub fn file_stem(self, n_evidence: usize) -> String {
        match self {
            Stage::Initial => format!("BOLFI_7D_initial_{n_evidence}"),
            Stage::Refinement => format!("BOLFI_7D_at_{n_evidence}"),
        }
    }
}

/// Serialized search state, sufficient to resume evidence collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub label: String,
    pub n_evidence: usize,
    pub next_batch_index: u64,
    /// Column order of `evidence`.
    pub parameter_names: Vec<ParameterName>,
    pub evidence: Vec<[f64; N_PARAMS]>,
    pub targets: Vec<f64>,
    pub kernel: KernelSpec,
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let file = File::open(path).map_err(|source| SnapshotError::Io { path: path.to_path_buf(), source })?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|source| SnapshotError::Encode { path: path.to_path_buf(), source })
    }

    /// Evidence with the target appended as the last column.
    pub fn table(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.evidence.len(), N_PARAMS + 1), |(i, j)| {
            if j < N_PARAMS {
                self.evidence[i][j]
            } else {
                self.targets[i]
            }
        })
    }

    pub fn header(&self) -> Vec<String> {
        self.parameter_names
            .iter()
            .map(|n| n.as_str().to_string())
            .chain(std::iter::once(TARGET_NAME.to_string()))
            .collect()
    }
}

/// Directory of snapshot files.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, stage: Stage, n_evidence: usize) -> PathBuf {
        self.dir.join(format!("{}.json", stage.file_stem(n_evidence)))
    }

    pub fn exists(&self, stage: Stage, n_evidence: usize) -> bool {
        self.path_for(stage, n_evidence).exists()
    }

    /// Staging file the JSON is written to before it is published.
    fn partial_path(path: &Path) -> PathBuf {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        path.with_file_name(format!(".{name}.partial"))
    }

    /// Writes `snapshot` and its CSV export. Fails with
    /// [`SnapshotError::AlreadyExists`] if the JSON file is already present.
    ///
    /// The JSON is staged in a hidden partial file and hard-linked into place
    /// only once it and the CSV are complete, so a failed write never leaves
    /// a truncated snapshot under the final name.
    pub fn write(&self, stage: Stage, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(&self.dir).map_err(|source| SnapshotError::Io { path: self.dir.clone(), source })?;

        let path = self.path_for(stage, snapshot.n_evidence);
        if path.exists() {
            return Err(SnapshotError::AlreadyExists(path));
        }
        let partial = Self::partial_path(&path);
        let published = Self::stage_and_publish(snapshot, &path, &partial);
        if let Err(e) = fs::remove_file(&partial) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %partial.display(), error = %e, "could not remove partial snapshot");
            }
        }
        published?;

        tracing::info!(path = %path.display(), n_evidence = snapshot.n_evidence, "snapshot written");
        Ok(path)
    }

    fn stage_and_publish(snapshot: &Snapshot, path: &Path, partial: &Path) -> Result<(), SnapshotError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SnapshotError::Io { path, source }
        };
        let file = File::create(partial).map_err(io_err(partial))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, snapshot)
            .map_err(|source| SnapshotError::Encode { path: partial.to_path_buf(), source })?;
        writer.flush().map_err(io_err(partial))?;
        writer.get_ref().sync_all().map_err(io_err(partial))?;

        let csv_path = path.with_extension("csv");
        write_ndarray_to_csv(&snapshot.table(), Some(&snapshot.header()), &csv_path)
            .map_err(|source| SnapshotError::Csv { path: csv_path, source })?;

        fs::hard_link(partial, path).map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                SnapshotError::AlreadyExists(path.to_path_buf())
            } else {
                SnapshotError::Io { path: path.to_path_buf(), source: e }
            }
        })
    }
}
