// src/surrogate/optimization.rs

//! Kernel hyperparameter optimisation with `argmin`'s Nelder-Mead.

use super::gp::factorize;
use super::kernel::KernelSpec;
use crate::error::SurrogateError;

use argmin::core::{CostFunction, Error, Executor};
use argmin::solver::neldermead::NelderMead;
use nalgebra::DVector;

/// Negative log marginal likelihood as a function of the free,
/// unconstrained hyperparameter coordinates.
struct NegLogMarginalLikelihood<'a> {
    base: &'a KernelSpec,
    x: &'a [Vec<f64>],
    y: &'a DVector<f64>,
}

impl CostFunction for NegLogMarginalLikelihood<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> Result<Self::Output, Error> {
        let spec = self.base.with_free_params(p);
        let nll = match factorize(&spec, self.x, self.y) {
            Ok(f) if f.neg_log_likelihood.is_finite() => f.neg_log_likelihood,
            _ => f64::INFINITY,
        };
        Ok(nll)
    }
}

/// Creates an initial simplex around a single starting point.
fn make_simplex(initial_point: &[f64]) -> Vec<Vec<f64>> {
    let n = initial_point.len();
    let mut simplex = Vec::with_capacity(n + 1);
    simplex.push(initial_point.to_vec());
    for i in 0..n {
        let mut next_point = initial_point.to_vec();
        // Unconstrained coordinates sit near zero, so steps have a floor.
        let step = (next_point[i].abs() * 0.05).max(0.25);
        next_point[i] += step;
        simplex.push(next_point);
    }
    simplex
}

/// Minimises the negative log marginal likelihood over the free
/// hyperparameters of `spec`, returning the optimised spec and its cost.
pub(crate) fn optimize_hyperparameters(
    spec: &KernelSpec,
    x: &[Vec<f64>],
    y: &DVector<f64>,
    max_iters: u64,
) -> Result<(KernelSpec, f64), SurrogateError> {
    let cost = NegLogMarginalLikelihood { base: spec, x, y };
    let start = spec.free_params();
    if start.is_empty() || max_iters == 0 {
        let nll = cost.cost(&start).map_err(|e| SurrogateError::Optimisation(e.to_string()))?;
        return Ok((spec.clone(), nll));
    }

    let solver: NelderMead<Vec<f64>, f64> = NelderMead::new(make_simplex(&start))
        .with_sd_tolerance(1e-6)
        .map_err(|e| SurrogateError::Optimisation(e.to_string()))?;
    let res = Executor::new(cost, solver)
        .configure(|s| s.max_iters(max_iters))
        .run()
        .map_err(|e| SurrogateError::Optimisation(e.to_string()))?;

    let best_cost = res.state.best_cost;
    let best = res
        .state
        .best_param
        .ok_or_else(|| SurrogateError::Optimisation("solver returned no parameters".into()))?;
    if !best_cost.is_finite() {
        return Err(SurrogateError::Optimisation("no finite likelihood found".into()));
    }
    tracing::debug!(nll = best_cost, iters = res.state.iter, "hyperparameters optimised");
    Ok((spec.with_free_params(&best), best_cost))
}
