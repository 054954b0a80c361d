// src/inference/neldermead.rs

//! A stack-allocated Nelder-Mead optimizer using const generics, used to
//! polish the differential-evolution optimum.

/// The result of an optimization run.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationResult<const DIMS: usize> {
    pub best_param: [f64; DIMS],
    pub best_cost: f64,
    pub iterations: u64,
}

/// A stack-allocated Nelder-Mead solver.
/// DIMS: The number of dimensions of the optimization problem.
/// POINTS: The number of vertices in the simplex (must be DIMS + 1).
pub struct NelderMead<const DIMS: usize, const POINTS: usize> {
    simplex: [[f64; DIMS]; POINTS],
    costs: [f64; POINTS],
    alpha: f64, // reflection
    gamma: f64, // expansion
    rho: f64,   // contraction
    sigma: f64, // shrink
}

impl<const DIMS: usize, const POINTS: usize> NelderMead<DIMS, POINTS> {
    /// Creates a new solver with a given initial simplex and the standard
    /// coefficients (reflection 1, expansion 2, contraction and shrink 0.5).
    /// Panics if POINTS is not equal to DIMS + 1.
    pub fn new(initial_simplex: [[f64; DIMS]; POINTS]) -> Self {
        assert_eq!(POINTS, DIMS + 1, "The number of simplex points must be DIMS + 1.");
        Self {
            simplex: initial_simplex,
            costs: [f64::INFINITY; POINTS],
            alpha: 1.0,
            gamma: 2.0,
            rho: 0.5,
            sigma: 0.5,
        }
    }

    /// Simplex around `x0` with each vertex stepping `steps[j]` along axis `j`.
    pub fn around(x0: &[f64; DIMS], steps: &[f64; DIMS]) -> Self {
        let mut simplex = [*x0; POINTS];
        for j in 0..DIMS {
            simplex[j + 1][j] += steps[j];
        }
        Self::new(simplex)
    }

    fn shrink<F, E>(&mut self, best_idx: usize, cost_fn: &F) -> Result<(), E>
    where
        F: Fn(&[f64; DIMS]) -> Result<f64, E>,
    {
        for i in 0..POINTS {
            if i != best_idx {
                for j in 0..DIMS {
                    self.simplex[i][j] = self.simplex[best_idx][j]
                        + self.sigma * (self.simplex[i][j] - self.simplex[best_idx][j]);
                }
                self.costs[i] = cost_fn(&self.simplex[i])?;
            }
        }
        Ok(())
    }

    /// Runs the optimization loop until the cost spread of the simplex drops
    /// below `tolerance` or `max_iters` is reached. Cost errors abort the run.
    pub fn run<F, E>(&mut self, cost_fn: F, max_iters: u64, tolerance: f64) -> Result<OptimizationResult<DIMS>, E>
    where
        F: Fn(&[f64; DIMS]) -> Result<f64, E>,
    {
        for i in 0..POINTS {
            self.costs[i] = cost_fn(&self.simplex[i])?;
        }

        let mut iterations = 0;
        for _ in 0..max_iters {
            let mut order: [(f64, usize); POINTS] = [(0.0, 0); POINTS];
            for (i, o) in order.iter_mut().enumerate() {
                *o = (self.costs[i], i);
            }
            order.sort_by(|a, b| a.0.total_cmp(&b.0));

            let best_idx = order[0].1;
            let second_worst_idx = order[POINTS - 2].1;
            let worst_idx = order[POINTS - 1].1;

            if (self.costs[worst_idx] - self.costs[best_idx]).abs() < tolerance {
                break;
            }
            iterations += 1;

            let mut centroid = [0.0; DIMS];
            for i in (0..POINTS).filter(|&i| i != worst_idx) {
                for j in 0..DIMS {
                    centroid[j] += self.simplex[i][j] / DIMS as f64;
                }
            }

            let along = |coef: f64, from: &[f64; DIMS]| {
                let mut p = [0.0; DIMS];
                for j in 0..DIMS {
                    p[j] = centroid[j] + coef * (from[j] - centroid[j]);
                }
                p
            };

            let reflected = along(-self.alpha, &self.simplex[worst_idx]);
            let reflected_cost = cost_fn(&reflected)?;

            if self.costs[best_idx] <= reflected_cost && reflected_cost < self.costs[second_worst_idx] {
                self.simplex[worst_idx] = reflected;
                self.costs[worst_idx] = reflected_cost;
            } else if reflected_cost < self.costs[best_idx] {
                let expanded = along(self.gamma, &reflected);
                let expanded_cost = cost_fn(&expanded)?;
                if expanded_cost < reflected_cost {
                    self.simplex[worst_idx] = expanded;
                    self.costs[worst_idx] = expanded_cost;
                } else {
                    self.simplex[worst_idx] = reflected;
                    self.costs[worst_idx] = reflected_cost;
                }
            } else if reflected_cost < self.costs[worst_idx] {
                // Outside contraction.
                let contracted = along(self.rho, &reflected);
                let contracted_cost = cost_fn(&contracted)?;
                if contracted_cost <= reflected_cost {
                    self.simplex[worst_idx] = contracted;
                    self.costs[worst_idx] = contracted_cost;
                } else {
                    self.shrink(best_idx, &cost_fn)?;
                }
            } else {
                let contracted = along(self.rho, &self.simplex[worst_idx]);
                let contracted_cost = cost_fn(&contracted)?;
                if contracted_cost < self.costs[worst_idx] {
                    self.simplex[worst_idx] = contracted;
                    self.costs[worst_idx] = contracted_cost;
                } else {
                    self.shrink(best_idx, &cost_fn)?;
                }
            }
        }

        let mut best_idx = 0;
        for i in 1..POINTS {
            if self.costs[i] < self.costs[best_idx] {
                best_idx = i;
            }
        }

        Ok(OptimizationResult {
            best_param: self.simplex[best_idx],
            best_cost: self.costs[best_idx],
            iterations,
        })
    }
}
