// src/surrogate/kernel.rs

//! Rational-quadratic ARD kernel and its constrained hyperparameters.
//!
//! Every hyperparameter lives in two spaces: its constrained value and an
//! unconstrained optimiser coordinate. `Positive` uses a softplus map,
//! `Bounded` a logistic map, and `Fixed` hyperparameters have no coordinate.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Constraint on one hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    Positive,
    Bounded { lo: f64, hi: f64 },
    Fixed,
}

/// Converts an unconstrained value to `[min, max]` with a logistic function.
fn logistic_transform(val: f64, min: f64, max: f64) -> f64 {
    let s = if val >= 0.0 {
        1.0 / (1.0 + (-val).exp())
    } else {
        let e = val.exp();
        e / (1.0 + e)
    };
    s * (max - min) + min
}

fn softplus(val: f64) -> f64 {
    if val > 30.0 {
        val
    } else {
        val.exp().ln_1p()
    }
}

/// Smallest value a `Positive` hyperparameter may take.
const MIN_POSITIVE: f64 = 1e-40;

impl Constraint {
    /// Unconstrained coordinate -> constrained value.
    pub fn forward(&self, u: f64) -> f64 {
        match *self {
            Constraint::Positive => softplus(u).max(MIN_POSITIVE),
            Constraint::Bounded { lo, hi } => logistic_transform(u, lo, hi).clamp(lo, hi),
            Constraint::Fixed => u,
        }
    }

    /// Constrained value -> unconstrained coordinate.
    pub fn inverse(&self, v: f64) -> f64 {
        match *self {
            Constraint::Positive => {
                let v = v.max(MIN_POSITIVE);
                if v > 30.0 {
                    v
                } else {
                    v.exp_m1().ln()
                }
            }
            Constraint::Bounded { lo, hi } => {
                let s = ((v - lo) / (hi - lo)).clamp(1e-12, 1.0 - 1e-12);
                (s / (1.0 - s)).ln()
            }
            Constraint::Fixed => v,
        }
    }

    /// Moves `v` inside the feasible set.
    pub fn project(&self, v: f64) -> f64 {
        match *self {
            Constraint::Positive => v.max(MIN_POSITIVE),
            Constraint::Bounded { lo, hi } => v.clamp(lo, hi),
            Constraint::Fixed => v,
        }
    }

    pub fn is_free(&self) -> bool {
        !matches!(self, Constraint::Fixed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameter {
    pub value: f64,
    pub constraint: Constraint,
}

impl Hyperparameter {
    pub fn new(value: f64, constraint: Constraint) -> Self {
        Self { value: constraint.project(value), constraint }
    }

    fn constrained(self, constraint: Constraint) -> Self {
        Self::new(self.value, constraint)
    }
}

/// Full kernel and likelihood configuration.
///
/// Values are replaced wholesale: every `with_*` method returns a new spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub variance: Hyperparameter,
    pub lengthscales: Vec<Hyperparameter>,
    /// Exponent `alpha` of the rational-quadratic kernel.
    pub power: Hyperparameter,
    /// Gaussian observation-noise variance.
    pub noise: Hyperparameter,
}

impl KernelSpec {
    /// ARD rational quadratic with positive lengthscales and a power bounded to `power`.
    pub fn rational_quadratic(n_dims: usize, power: (f64, f64)) -> Self {
        let (lo, hi) = power;
        Self {
            variance: Hyperparameter::new(1.0, Constraint::Positive),
            lengthscales: vec![Hyperparameter::new(1.0, Constraint::Positive); n_dims],
            power: Hyperparameter::new(1.0, Constraint::Bounded { lo, hi }),
            noise: Hyperparameter::new(1.0, Constraint::Positive),
        }
    }

    pub fn n_dims(&self) -> usize {
        self.lengthscales.len()
    }

    pub fn with_fixed_noise(&self, variance: f64) -> Self {
        Self { noise: Hyperparameter::new(variance, Constraint::Fixed), ..self.clone() }
    }

    /// Replaces the constraint of every lengthscale, keeping (projected) values.
    pub fn with_lengthscale_constraints(&self, constraints: &[Constraint]) -> Self {
        assert_eq!(constraints.len(), self.n_dims(), "one constraint per input dimension");
        let lengthscales = self
            .lengthscales
            .iter()
            .zip(constraints)
            .map(|(h, &c)| h.constrained(c))
            .collect();
        Self { lengthscales, ..self.clone() }
    }

    pub fn with_lengthscales(&self, values: &[f64]) -> Self {
        assert_eq!(values.len(), self.n_dims(), "one lengthscale per input dimension");
        let lengthscales = self
            .lengthscales
            .iter()
            .zip(values)
            .map(|(h, &v)| Hyperparameter::new(v, h.constraint))
            .collect();
        Self { lengthscales, ..self.clone() }
    }

    fn hyperparameters(&self) -> impl Iterator<Item = &Hyperparameter> {
        std::iter::once(&self.variance)
            .chain(self.lengthscales.iter())
            .chain(std::iter::once(&self.power))
            .chain(std::iter::once(&self.noise))
    }

    fn hyperparameters_mut(&mut self) -> impl Iterator<Item = &mut Hyperparameter> {
        std::iter::once(&mut self.variance)
            .chain(self.lengthscales.iter_mut())
            .chain(std::iter::once(&mut self.power))
            .chain(std::iter::once(&mut self.noise))
    }

    /// Unconstrained coordinates of the free hyperparameters.
    pub fn free_params(&self) -> Vec<f64> {
        self.hyperparameters()
            .filter(|h| h.constraint.is_free())
            .map(|h| h.constraint.inverse(h.value))
            .collect()
    }

    /// A spec whose free hyperparameters take the given unconstrained coordinates.
    pub fn with_free_params(&self, params: &[f64]) -> Self {
        let mut spec = self.clone();
        let mut it = params.iter();
        for h in spec.hyperparameters_mut().filter(|h| h.constraint.is_free()) {
            if let Some(&u) = it.next() {
                h.value = h.constraint.forward(u);
            }
        }
        spec
    }

    /// Redraws every free hyperparameter's unconstrained coordinate from N(0, 1).
    pub fn randomized<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        let draws: Vec<f64> = (0..self.free_params().len()).map(|_| rng.sample(StandardNormal)).collect();
        self.with_free_params(&draws)
    }

    /// `k(a, b) = s2 * (1 + r2 / 2)^(-alpha)`, `r2 = sum(((a - b) / l)^2)`.
    ///
    /// `alpha` only sets the tail decay; it does not rescale `r2`.
    pub fn covariance(&self, a: &[f64], b: &[f64]) -> f64 {
        let r2: f64 = a
            .iter()
            .zip(b)
            .zip(&self.lengthscales)
            .map(|((&x, &y), l)| {
                let d = (x - y) / l.value;
                d * d
            })
            .sum();
        let alpha = self.power.value;
        self.variance.value * (1.0 + r2 / 2.0).powf(-alpha)
    }
}
