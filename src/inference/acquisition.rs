// src/inference/acquisition.rs

//! RandMaxVar acquisition: a random draw from the unnormalised variance of the
//! approximate posterior, sampled with a random-walk Metropolis chain.

use crate::error::SurrogateError;
use crate::models::parameters::{ParameterBounds, PriorSet, N_PARAMS};
use crate::surrogate::GpRegression;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Error function, Abramowitz & Stegun 7.1.26 (|error| < 1.5e-7).
pub fn erf(x: f64) -> f64 {
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / 0.327_591_1_f64.mul_add(x, 1.0);
    let poly = 1.061_405_429_f64
        .mul_add(t, -1.453_152_027)
        .mul_add(t, 1.421_413_741)
        .mul_add(t, -0.284_496_736)
        .mul_add(t, 0.254_829_592);
    let y = (poly * t).mul_add(-(-x * x).exp(), 1.0);
    sign * y
}

pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Folds `x` back into `[lo, hi]` by mirroring at the edges.
fn reflect(mut x: f64, lo: f64, hi: f64) -> f64 {
    for _ in 0..8 {
        if x < lo {
            x = 2.0 * lo - x;
        } else if x > hi {
            x = 2.0 * hi - x;
        } else {
            return x;
        }
    }
    x.clamp(lo, hi)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandMaxVar {
    /// Retained chain length; the same number of steps is spent on warm-up.
    pub n_samples: usize,
    /// Proposal standard deviation as a fraction of each bound's width.
    pub proposal_scale: f64,
    /// Extra variance added to the surrogate's predictive variance.
    pub noise_var: f64,
}

impl Default for RandMaxVar {
    fn default() -> Self {
        Self { n_samples: 200, proposal_scale: 0.1, noise_var: 0.0 }
    }
}

impl RandMaxVar {
    /// Log of `prior(x) * p(1 - p)`, `p = Phi((eps - mu) / sqrt(v + noise))`.
    pub fn log_density(
        &self,
        gp: &GpRegression,
        priors: &PriorSet,
        eps: f64,
        x: &[f64; N_PARAMS],
    ) -> Result<f64, SurrogateError> {
        let prior = priors.density(x);
        if prior <= 0.0 {
            return Ok(f64::NEG_INFINITY);
        }
        let (mean, var) = gp.predict(x)?;
        let scale = (var + self.noise_var).sqrt().max(1e-300);
        let p = normal_cdf((eps - mean) / scale);
        Ok(prior.ln() + (p * (1.0 - p)).ln())
    }

    /// Runs the chain from the evidence point with the lowest target and
    /// returns one retained state chosen uniformly at random.
    pub fn acquire<R: Rng + ?Sized>(
        &self,
        gp: &GpRegression,
        priors: &PriorSet,
        bounds: &ParameterBounds,
        rng: &mut R,
    ) -> Result<[f64; N_PARAMS], SurrogateError> {
        let targets = gp.targets();
        let inputs = gp.inputs();
        let best = (0..targets.len())
            .min_by(|&a, &b| targets[a].total_cmp(&targets[b]))
            .ok_or(SurrogateError::NoData)?;
        let eps = targets[best];

        let mut current = [0.0; N_PARAMS];
        for (j, c) in current.iter_mut().enumerate() {
            *c = bounds.intervals()[j].clamp(inputs[[best, j]]);
        }
        let mut current_lp = self.log_density(gp, priors, eps, &current)?;

        let n = self.n_samples.max(1);
        let mut chain = Vec::with_capacity(n);
        let mut accepted = 0usize;
        for step in 0..2 * n {
            let mut proposal = current;
            for (j, x) in proposal.iter_mut().enumerate() {
                let iv = bounds.intervals()[j];
                let z: f64 = rng.sample(StandardNormal);
                *x = reflect(*x + z * self.proposal_scale * iv.width(), iv.lo, iv.hi);
            }
            let proposal_lp = self.log_density(gp, priors, eps, &proposal)?;
            let accept = if current_lp == f64::NEG_INFINITY {
                proposal_lp > f64::NEG_INFINITY
            } else {
                proposal_lp - current_lp >= rng.gen::<f64>().ln()
            };
            if accept {
                current = proposal;
                current_lp = proposal_lp;
                accepted += 1;
            }
            if step >= n {
                chain.push(current);
            }
        }
        tracing::trace!(accepted, steps = 2 * n, "metropolis chain finished");

        Ok(chain[rng.gen_range(0..chain.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parameters::{Interval, ParameterName, UniformPrior};
    use crate::surrogate::KernelSpec;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    fn unit_bounds() -> ParameterBounds {
        ParameterBounds::from_fn(|_| Interval::new(0.0, 1.0))
    }

    fn unit_priors() -> PriorSet {
        PriorSet::from_fn(|_| UniformPrior { loc: 0.0, scale: 1.0 })
    }

    fn fitted_gp() -> GpRegression {
        let spec = KernelSpec::rational_quadratic(N_PARAMS, (1e-10, 2.0))
            .with_fixed_noise(1e-6)
            .with_lengthscales(&[0.5; N_PARAMS]);
        let mut gp = GpRegression::new(spec);
        let mut rng = Xoshiro256Plus::seed_from_u64(3);
        let x: Vec<Vec<f64>> = (0..20).map(|_| (0..N_PARAMS).map(|_| rng.gen()).collect()).collect();
        let y = x.iter().map(|r| r.iter().map(|v| (v - 0.3).powi(2)).sum()).collect();
        gp.set_data(x, y).unwrap();
        gp
    }

    #[test]
    fn erf_matches_reference_values() {
        assert!(erf(0.0).abs() < 5e-7);
        assert!((erf(1.0) - 0.842_700_792_949_715).abs() < 5e-7);
        assert!((erf(-1.0) + 0.842_700_792_949_715).abs() < 5e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
    }

    #[test]
    fn reflection_stays_inside() {
        assert_eq!(reflect(1.2, 0.0, 1.0), 0.8);
        assert_eq!(reflect(-0.25, 0.0, 1.0), 0.25);
        assert_eq!(reflect(0.5, 0.0, 1.0), 0.5);
        let far = reflect(17.3, 0.0, 1.0);
        assert!((0.0..=1.0).contains(&far));
    }

    #[test]
    fn density_vanishes_outside_the_prior() {
        let gp = fitted_gp();
        let priors = PriorSet::from_fn(|name| match name {
            ParameterName::Tmin => UniformPrior { loc: 0.0, scale: 0.5 },
            _ => UniformPrior { loc: 0.0, scale: 1.0 },
        });
        let mut x = [0.2; N_PARAMS];
        x[ParameterName::Tmin.dim()] = 0.9;
        let lp = RandMaxVar::default().log_density(&gp, &priors, 0.0, &x).unwrap();
        assert_eq!(lp, f64::NEG_INFINITY);
    }

    #[test]
    fn proposals_lie_in_bounds_and_are_seeded() {
        let gp = fitted_gp();
        let acq = RandMaxVar { n_samples: 50, ..Default::default() };
        let draw = |seed| {
            let mut rng = Xoshiro256Plus::seed_from_u64(seed);
            acq.acquire(&gp, &unit_priors(), &unit_bounds(), &mut rng).unwrap()
        };
        let a = draw(11);
        assert!(unit_bounds().contains(&a));
        assert_eq!(a, draw(11));
    }

    #[test]
    fn empty_surrogate_cannot_acquire() {
        let gp = GpRegression::new(KernelSpec::rational_quadratic(N_PARAMS, (1e-10, 2.0)));
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let err = RandMaxVar::default().acquire(&gp, &unit_priors(), &unit_bounds(), &mut rng);
        assert!(matches!(err, Err(SurrogateError::NoData)));
    }
}
