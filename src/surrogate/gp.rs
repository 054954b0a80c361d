// src/surrogate/gp.rs

//! Gaussian-process regression of the log-discrepancy.

use super::kernel::KernelSpec;
use super::optimization::optimize_hyperparameters;
use crate::error::SurrogateError;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{Array1, Array2};
use std::f64::consts::PI;

/// Standardisation applied to the targets before fitting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    pub mean: f64,
    pub std: f64,
}

impl Normalizer {
    fn fit(y: &[f64]) -> Self {
        if y.is_empty() {
            return Self { mean: 0.0, std: 1.0 };
        }
        let n = y.len() as f64;
        let mean = y.iter().sum::<f64>() / n;
        let var = y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = if var > 0.0 { var.sqrt() } else { 1.0 };
        Self { mean, std }
    }
}

/// Cholesky factor of the training covariance and the weights `K^-1 y`.
pub(crate) struct Factorization {
    chol: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
    pub(crate) neg_log_likelihood: f64,
}

/// Cholesky with escalating diagonal jitter, starting at 1e-6 of the mean
/// diagonal and growing tenfold for at most five attempts.
fn jittered_cholesky(k: DMatrix<f64>) -> Result<Cholesky<f64, Dyn>, SurrogateError> {
    if let Some(chol) = k.clone().cholesky() {
        return Ok(chol);
    }
    let n = k.nrows();
    let mut jitter = k.diagonal().mean().abs().max(f64::MIN_POSITIVE) * 1e-6;
    for _ in 0..5 {
        let mut kj = k.clone();
        for i in 0..n {
            kj[(i, i)] += jitter;
        }
        if let Some(chol) = kj.cholesky() {
            tracing::debug!(jitter, "kernel matrix needed jitter");
            return Ok(chol);
        }
        jitter *= 10.0;
    }
    Err(SurrogateError::NotPositiveDefinite { jitter })
}

/// Factorises the covariance of `x` under `spec` and evaluates the negative
/// log marginal likelihood of the (normalised) targets `y`.
pub(crate) fn factorize(
    spec: &KernelSpec,
    x: &[Vec<f64>],
    y: &DVector<f64>,
) -> Result<Factorization, SurrogateError> {
    let n = x.len();
    if n == 0 {
        return Err(SurrogateError::NoData);
    }
    let noise = spec.noise.value;
    let k = DMatrix::from_fn(n, n, |i, j| {
        spec.covariance(&x[i], &x[j]) + if i == j { noise } else { 0.0 }
    });
    let chol = jittered_cholesky(k)?;
    let alpha = chol.solve(y);
    let log_det_half: f64 = chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum();
    let neg_log_likelihood = 0.5 * y.dot(&alpha) + log_det_half + 0.5 * n as f64 * (2.0 * PI).ln();
    Ok(Factorization { chol, alpha, neg_log_likelihood })
}

/// GP surrogate with a rational-quadratic ARD kernel and normalised outputs.
pub struct GpRegression {
    spec: KernelSpec,
    x: Vec<Vec<f64>>,
    y: Vec<f64>,
    normalizer: Normalizer,
    fit: Option<Factorization>,
}

impl GpRegression {
    pub fn new(spec: KernelSpec) -> Self {
        Self { spec, x: Vec::new(), y: Vec::new(), normalizer: Normalizer::fit(&[]), fit: None }
    }

    pub fn spec(&self) -> &KernelSpec {
        &self.spec
    }

    pub fn n_data(&self) -> usize {
        self.x.len()
    }

    pub fn inputs(&self) -> Array2<f64> {
        let d = self.spec.n_dims();
        Array2::from_shape_fn((self.x.len(), d), |(i, j)| self.x[i][j])
    }

    pub fn targets(&self) -> Array1<f64> {
        Array1::from(self.y.clone())
    }

    fn normalized_targets(&self) -> DVector<f64> {
        let Normalizer { mean, std } = self.normalizer;
        DVector::from_iterator(self.y.len(), self.y.iter().map(|v| (v - mean) / std))
    }

    fn refactor(&mut self) -> Result<(), SurrogateError> {
        self.fit = None;
        if self.x.is_empty() {
            return Ok(());
        }
        self.fit = Some(factorize(&self.spec, &self.x, &self.normalized_targets())?);
        Ok(())
    }

    /// Replaces the training data and refactorises.
    pub fn set_data(&mut self, x: Vec<Vec<f64>>, y: Vec<f64>) -> Result<(), SurrogateError> {
        assert_eq!(x.len(), y.len(), "one target per input row");
        if let Some(row) = x.iter().find(|r| r.len() != self.spec.n_dims()) {
            return Err(SurrogateError::Dimension { expected: self.spec.n_dims(), found: row.len() });
        }
        self.normalizer = Normalizer::fit(&y);
        self.x = x;
        self.y = y;
        self.refactor()
    }

    /// Installs a new kernel spec and refactorises on the current data.
    pub fn set_spec(&mut self, spec: KernelSpec) -> Result<(), SurrogateError> {
        if spec.n_dims() != self.spec.n_dims() {
            return Err(SurrogateError::Dimension { expected: self.spec.n_dims(), found: spec.n_dims() });
        }
        self.spec = spec;
        self.refactor()
    }

    /// Negative log marginal likelihood of the current fit.
    pub fn neg_log_likelihood(&self) -> Option<f64> {
        self.fit.as_ref().map(|f| f.neg_log_likelihood)
    }

    /// Optimises the free hyperparameters on the current data.
    pub fn optimize(&mut self, max_iters: u64) -> Result<f64, SurrogateError> {
        if self.x.is_empty() {
            return Err(SurrogateError::NoData);
        }
        let y = self.normalized_targets();
        let (spec, nll) = optimize_hyperparameters(&self.spec, &self.x, &y, max_iters)?;
        self.spec = spec;
        self.refactor()?;
        Ok(nll)
    }

    fn cross_covariance(&self, xp: &[f64]) -> DVector<f64> {
        DVector::from_iterator(self.x.len(), self.x.iter().map(|xi| self.spec.covariance(xp, xi)))
    }

    /// Posterior mean and latent variance at `xp`, in target units.
    pub fn predict(&self, xp: &[f64]) -> Result<(f64, f64), SurrogateError> {
        let fit = self.fit.as_ref().ok_or(SurrogateError::NoData)?;
        let kstar = self.cross_covariance(xp);
        let mean = kstar.dot(&fit.alpha);
        let v = fit.chol.solve(&kstar);
        let var = (self.spec.covariance(xp, xp) - kstar.dot(&v)).max(0.0);
        let Normalizer { mean: mu, std } = self.normalizer;
        Ok((mean * std + mu, var * std * std))
    }

    /// Posterior mean only; skips the triangular solve the variance needs.
    pub fn predict_mean(&self, xp: &[f64]) -> Result<f64, SurrogateError> {
        let fit = self.fit.as_ref().ok_or(SurrogateError::NoData)?;
        let Normalizer { mean: mu, std } = self.normalizer;
        Ok(self.cross_covariance(xp).dot(&fit.alpha) * std + mu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tolerance: f64) {
        assert!((a - b).abs() < tolerance, "left: `{}`, right: `{}`", a, b);
    }

    fn spec_1d() -> KernelSpec {
        KernelSpec::rational_quadratic(1, (1e-10, 2.0))
            .with_fixed_noise(1e-10)
            .with_lengthscales(&[0.7])
    }

    fn training() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..8).map(|i| vec![i as f64 * 0.5]).collect();
        let y = x.iter().map(|r| (r[0]).sin() + 3.0).collect();
        (x, y)
    }

    #[test]
    fn normalizer_standardises_targets() {
        let n = Normalizer::fit(&[1.0, 3.0]);
        assert_eq!(n.mean, 2.0);
        assert_eq!(n.std, 1.0);
        assert_eq!(Normalizer::fit(&[4.0, 4.0]).std, 1.0);
    }

    #[test]
    fn noiseless_fit_interpolates_training_points() {
        let mut gp = GpRegression::new(spec_1d());
        let (x, y) = training();
        gp.set_data(x.clone(), y.clone()).unwrap();
        for (xi, yi) in x.iter().zip(&y) {
            let (m, v) = gp.predict(xi).unwrap();
            approx_eq(m, *yi, 1e-3);
            assert!(v < 1e-3);
        }
    }

    #[test]
    fn variance_grows_away_from_data() {
        let mut gp = GpRegression::new(spec_1d());
        let (x, y) = training();
        gp.set_data(x, y).unwrap();
        let (_, near) = gp.predict(&[1.25]).unwrap();
        let (_, far) = gp.predict(&[40.0]).unwrap();
        assert!(far > near);
    }

    #[test]
    fn duplicate_inputs_are_handled_with_jitter() {
        let mut gp = GpRegression::new(spec_1d().with_fixed_noise(0.0));
        gp.set_data(vec![vec![1.0], vec![1.0], vec![2.0]], vec![0.0, 0.0, 1.0]).unwrap();
        assert!(gp.neg_log_likelihood().unwrap().is_finite());
    }

    #[test]
    fn optimisation_does_not_worsen_likelihood() {
        let mut gp = GpRegression::new(spec_1d());
        let (x, y) = training();
        gp.set_data(x, y).unwrap();
        let before = gp.neg_log_likelihood().unwrap();
        let after = gp.optimize(200).unwrap();
        assert!(after <= before + 1e-9, "{after} > {before}");
        assert_eq!(gp.spec().noise.value, 1e-10);
    }

    #[test]
    fn predicting_without_data_is_an_error() {
        let gp = GpRegression::new(spec_1d());
        assert!(matches!(gp.predict(&[0.0]), Err(SurrogateError::NoData)));
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let mut gp = GpRegression::new(spec_1d());
        let err = gp.set_data(vec![vec![1.0, 2.0]], vec![0.0]).unwrap_err();
        assert!(matches!(err, SurrogateError::Dimension { expected: 1, found: 2 }));
    }

    #[test]
    fn mean_only_prediction_agrees_with_full_prediction() {
        let mut gp = GpRegression::new(spec_1d());
        let (x, y) = training();
        gp.set_data(x, y).unwrap();
        for xp in [0.1, 1.25, 3.9, 12.0] {
            let (m, _) = gp.predict(&[xp]).unwrap();
            approx_eq(gp.predict_mean(&[xp]).unwrap(), m, 1e-12);
        }
        let empty = GpRegression::new(spec_1d());
        assert!(matches!(empty.predict_mean(&[0.0]), Err(SurrogateError::NoData)));
    }
}
