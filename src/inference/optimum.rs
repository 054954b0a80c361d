// src/inference/optimum.rs

//! Global minimisation of the surrogate mean over the search box.
//!
//! The surrogate's own extraction is unreliable in seven dimensions, so the
//! optimum is found with seeded differential evolution (`best1bin`,
//! latin-hypercube initial population, deferred updating) followed by a
//! Nelder-Mead polish of the best member.

use super::neldermead::NelderMead;
use crate::models::parameters::Interval;

use egobox_doe::{Lhs, LhsKind, SamplingMethod};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Differential-evolution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialEvolution {
    /// Population size multiplier: the population holds `popsize * dims` members.
    pub popsize: usize,
    pub maxiter: usize,
    /// Dithering range of the mutation scale, redrawn every generation.
    pub mutation: (f64, f64),
    pub recombination: f64,
    /// Relative tolerance on the spread of population energies.
    pub tol: f64,
    pub seed: u64,
    pub polish: bool,
}

impl Default for DifferentialEvolution {
    fn default() -> Self {
        Self {
            popsize: 100,
            maxiter: 1000,
            mutation: (0.5, 1.0),
            recombination: 0.7,
            tol: 0.01,
            seed: 0,
            polish: true,
        }
    }
}

/// Location and value of the minimum found.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optimum<const D: usize> {
    pub x: [f64; D],
    pub value: f64,
    pub generations: usize,
}

fn to_box<const D: usize>(u: &[f64; D], bounds: &[Interval; D]) -> [f64; D] {
    let mut x = [0.0; D];
    for j in 0..D {
        x[j] = bounds[j].lo + u[j].clamp(0.0, 1.0) * bounds[j].width();
    }
    x
}

fn converged(energies: &[f64], tol: f64) -> bool {
    let n = energies.len() as f64;
    let mean = energies.iter().sum::<f64>() / n;
    let var = energies.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
    mean.is_finite() && var.sqrt() <= tol * mean.abs()
}

/// Minimises `f` over `bounds`. `P` must equal `D + 1` (polish simplex size).
pub fn find_optimum<const D: usize, const P: usize, F, E>(
    f: F,
    bounds: &[Interval; D],
    de: &DifferentialEvolution,
) -> Result<Optimum<D>, E>
where
    F: Fn(&[f64; D]) -> Result<f64, E> + Sync,
    E: Send,
{
    let npop = (de.popsize * D).max(5);
    let mut rng = Xoshiro256Plus::seed_from_u64(de.seed);

    let unit = Array2::from_shape_fn((D, 2), |(_, k)| k as f64);
    let lhs = Lhs::new(&unit)
        .with_rng(Xoshiro256Plus::seed_from_u64(de.seed))
        .kind(LhsKind::Classic)
        .sample(npop);
    let mut population: Vec<[f64; D]> = lhs
        .outer_iter()
        .map(|row| {
            let mut u = [0.0; D];
            for (j, v) in row.iter().enumerate() {
                u[j] = *v;
            }
            u
        })
        .collect();

    let energy = |u: &[f64; D]| f(&to_box(u, bounds)).map(|e| if e.is_nan() { f64::INFINITY } else { e });
    let mut energies: Vec<f64> = population.par_iter().map(energy).collect::<Result<_, E>>()?;
    let argmin = |e: &[f64]| (0..e.len()).min_by(|&a, &b| e[a].total_cmp(&e[b])).unwrap_or(0);
    let mut best = argmin(energies.as_slice());

    let mut generations = 0;
    for _ in 0..de.maxiter {
        generations += 1;
        let scale = rng.gen_range(de.mutation.0..de.mutation.1);
        let trials: Vec<[f64; D]> = (0..npop)
            .map(|i| {
                let (r0, r1) = loop {
                    let r0 = rng.gen_range(0..npop);
                    let r1 = rng.gen_range(0..npop);
                    if r0 != r1 && r0 != i && r1 != i {
                        break (r0, r1);
                    }
                };
                let fill = rng.gen_range(0..D);
                let mut trial = population[i];
                for j in 0..D {
                    if j == fill || rng.gen::<f64>() < de.recombination {
                        trial[j] = population[best][j] + scale * (population[r0][j] - population[r1][j]);
                    }
                    if !(0.0..=1.0).contains(&trial[j]) {
                        trial[j] = rng.gen();
                    }
                }
                trial
            })
            .collect();

        let trial_energies: Vec<f64> = trials.par_iter().map(energy).collect::<Result<_, E>>()?;
        for (i, (trial, e)) in trials.into_iter().zip(trial_energies).enumerate() {
            if e < energies[i] {
                population[i] = trial;
                energies[i] = e;
            }
        }
        best = argmin(energies.as_slice());

        if converged(&energies, de.tol) {
            break;
        }
    }

    let mut x = to_box(&population[best], bounds);
    let mut value = energies[best];

    if de.polish {
        let steps = [0.05; D];
        let mut nm = NelderMead::<D, P>::around(&population[best], &steps);
        let polished = nm.run(energy, 200 * D as u64, 1e-10)?;
        if polished.best_cost < value {
            x = to_box(&polished.best_param, bounds);
            value = polished.best_cost;
        }
    }

    Ok(Optimum { x, value, generations })
}
