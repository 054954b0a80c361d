// src/data.rs

//! Loading the observed plasma-current trace and exporting evidence tables.

use crate::error::ConfigError;

use ndarray::{Array2, Ix2, OwnedRepr};
use ndarray_npy::NpzReader;
use std::error::Error;
use std::fs::File;
use std::path::Path;

/// Dataset name of the observed trace inside its `.npz` container.
pub const OBSERVED_KEY: &str = "IP_data";

/// Loads a headerless CSV file into an `Array2<f64>`.
pub fn load_csv(path: &Path) -> Result<Array2<f64>, Box<dyn Error>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(path)?;
    let mut data = Vec::new();
    let mut n_cols = 0;
    for result in reader.records() {
        let record = result?;
        if n_cols == 0 {
            n_cols = record.len();
        }
        for field in record.iter() {
            data.push(field.trim().parse::<f64>()?);
        }
    }
    if n_cols == 0 {
        return Err("empty csv file".into());
    }
    let n_rows = data.len() / n_cols;
    Ok(Array2::from_shape_vec((n_rows, n_cols), data)?)
}

/// Writes a 2-D array to CSV, optionally preceded by a header row.
pub fn write_ndarray_to_csv(
    data: &Array2<f64>,
    header: Option<&[String]>,
    path: &Path,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    if let Some(h) = header {
        writer.write_record(h)?;
    }
    for row in data.rows() {
        writer.write_record(row.iter().map(|&val| val.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Loads the observed current trace as a `2 x n` array (row 0 time, row 1
/// current). Accepts an `.npz` container holding [`OBSERVED_KEY`] or a
/// two-column CSV, in either orientation.
///
/// A missing file is a fatal configuration error.
pub fn load_observed(path: &Path) -> Result<Array2<f64>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingObserved { path: path.to_path_buf() });
    }
    let fail = |message: String| ConfigError::ObservedFormat { path: path.to_path_buf(), message };

    let raw = if path.extension().is_some_and(|e| e == "csv") {
        load_csv(path).map_err(|e| fail(e.to_string()))?
    } else {
        let file = File::open(path).map_err(|e| fail(e.to_string()))?;
        let mut npz = NpzReader::new(file).map_err(|e| fail(e.to_string()))?;
        npz.by_name::<OwnedRepr<f64>, Ix2>(&format!("{OBSERVED_KEY}.npy"))
            .or_else(|_| npz.by_name::<OwnedRepr<f64>, Ix2>(OBSERVED_KEY))
            .map_err(|e| fail(format!("dataset `{OBSERVED_KEY}`: {e}")))?
    };

    let shape = raw.shape().to_vec();
    match shape.as_slice() {
        [2, _] => Ok(raw),
        [_, 2] => Ok(raw.reversed_axes().as_standard_layout().to_owned()),
        shape => Err(fail(format!("expected a 2 x n trace, found shape {shape:?}"))),
    }
}
