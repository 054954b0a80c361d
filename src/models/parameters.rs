// src/models/parameters.rs

//! The seven physical parameters searched over, their bounds and priors.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of searched parameters.
pub const N_PARAMS: usize = 7;

/// Names of the searched quantities.
///
/// The discriminant order is the order of the surrogate's input dimensions,
/// which is the case-sensitive sorted order of the names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParameterName {
    /// Initial electron temperature (eV).
    #[serde(rename = "Tf1")]
    Tf1,
    /// Final electron temperature (eV).
    #[serde(rename = "Tf2")]
    Tf2,
    /// Shape parameter of the RE seed Gamma distribution.
    #[serde(rename = "alpha")]
    Alpha,
    /// Scale parameter of the RE seed Gamma distribution.
    #[serde(rename = "beta")]
    Beta,
    /// Logarithm of the characteristic wall time (log(ms)).
    #[serde(rename = "log_walltime")]
    LogWalltime,
    /// Argon assimilation fraction (%).
    #[serde(rename = "nAr")]
    NAr,
    /// Time at which the final temperature is reached (s).
    #[serde(rename = "tmin")]
    Tmin,
}

impl ParameterName {
    /// All names in surrogate dimension order.
    pub const ALL: [ParameterName; N_PARAMS] = [
        ParameterName::Tf1,
        ParameterName::Tf2,
        ParameterName::Alpha,
        ParameterName::Beta,
        ParameterName::LogWalltime,
        ParameterName::NAr,
        ParameterName::Tmin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParameterName::Tf1 => "Tf1",
            ParameterName::Tf2 => "Tf2",
            ParameterName::Alpha => "alpha",
            ParameterName::Beta => "beta",
            ParameterName::LogWalltime => "log_walltime",
            ParameterName::NAr => "nAr",
            ParameterName::Tmin => "tmin",
        }
    }

    /// Index of this parameter's surrogate input dimension.
    pub fn dim(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ParameterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One point of the search space, consumed by a single simulator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    #[serde(rename = "Tf1")]
    pub tf1: f64,
    #[serde(rename = "Tf2")]
    pub tf2: f64,
    pub tmin: f64,
    #[serde(rename = "nAr")]
    pub n_ar: f64,
    pub log_walltime: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl ParameterVector {
    pub fn get(&self, name: ParameterName) -> f64 {
        match name {
            ParameterName::Tf1 => self.tf1,
            ParameterName::Tf2 => self.tf2,
            ParameterName::Alpha => self.alpha,
            ParameterName::Beta => self.beta,
            ParameterName::LogWalltime => self.log_walltime,
            ParameterName::NAr => self.n_ar,
            ParameterName::Tmin => self.tmin,
        }
    }

    /// Builds a vector from a point in surrogate dimension order.
    pub fn from_point(x: &[f64]) -> Self {
        assert_eq!(x.len(), N_PARAMS, "a parameter point has {} coordinates", N_PARAMS);
        Self {
            tf1: x[ParameterName::Tf1.dim()],
            tf2: x[ParameterName::Tf2.dim()],
            tmin: x[ParameterName::Tmin.dim()],
            n_ar: x[ParameterName::NAr.dim()],
            log_walltime: x[ParameterName::LogWalltime.dim()],
            alpha: x[ParameterName::Alpha.dim()],
            beta: x[ParameterName::Beta.dim()],
        }
    }

    /// The vector as a point in surrogate dimension order.
    pub fn to_point(&self) -> [f64; N_PARAMS] {
        ParameterName::ALL.map(|name| self.get(name))
    }

    /// Characteristic wall time recovered from its log-scale coordinate.
    pub fn walltime(&self) -> f64 {
        self.log_walltime.exp()
    }
}

/// A closed interval `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lo: f64,
    pub hi: f64,
}

impl Interval {
    pub const fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    pub fn width(&self) -> f64 {
        self.hi - self.lo
    }

    pub fn contains(&self, x: f64) -> bool {
        x >= self.lo && x <= self.hi
    }

    pub fn clamp(&self, x: f64) -> f64 {
        x.max(self.lo).min(self.hi)
    }
}

/// Per-dimension search bounds, indexed in surrogate dimension order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterBounds {
    intervals: [Interval; N_PARAMS],
}

impl ParameterBounds {
    pub fn from_fn(f: impl Fn(ParameterName) -> Interval) -> Self {
        Self { intervals: ParameterName::ALL.map(f) }
    }

    pub fn interval(&self, name: ParameterName) -> Interval {
        self.intervals[name.dim()]
    }

    pub fn intervals(&self) -> &[Interval; N_PARAMS] {
        &self.intervals
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        x.len() == N_PARAMS && self.intervals.iter().zip(x).all(|(iv, &v)| iv.contains(v))
    }
}

/// Uniform prior in scipy's `(loc, scale)` parameterisation: support `[loc, loc + scale]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniformPrior {
    pub loc: f64,
    pub scale: f64,
}

impl UniformPrior {
    pub const fn new(loc: f64, scale: f64) -> Self {
        Self { loc, scale }
    }

    pub fn support(&self) -> Interval {
        Interval::new(self.loc, self.loc + self.scale)
    }

    pub fn density(&self, x: f64) -> f64 {
        if self.support().contains(x) {
            1.0 / self.scale
        } else {
            0.0
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.loc + self.scale * rng.gen::<f64>()
    }
}

/// The seven independent uniform priors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorSet {
    priors: [UniformPrior; N_PARAMS],
}

impl PriorSet {
    pub fn from_fn(f: impl Fn(ParameterName) -> UniformPrior) -> Self {
        Self { priors: ParameterName::ALL.map(f) }
    }

    pub fn prior(&self, name: ParameterName) -> UniformPrior {
        self.priors[name.dim()]
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterVector {
        let mut x = [0.0; N_PARAMS];
        for (d, prior) in self.priors.iter().enumerate() {
            x[d] = prior.sample(rng);
        }
        ParameterVector::from_point(&x)
    }

    /// Joint prior density of a point in surrogate dimension order.
    pub fn density(&self, x: &[f64]) -> f64 {
        self.priors.iter().zip(x).map(|(p, &v)| p.density(v)).product()
    }
}
