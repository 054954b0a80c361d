// src/models/mod.rs

//! The inference model: priors, simulator, summary and discrepancy wired into
//! a small static dependency graph.

pub mod discrepancy;
pub mod parameters;
pub mod simulator;
pub mod summary;

use self::discrepancy::l1_distance;
use self::parameters::{ParameterName, ParameterVector, PriorSet, UniformPrior, N_PARAMS};
use self::simulator::SimulatorAdapter;
use self::summary::TimeBase;
use crate::error::SimulationError;

use ndarray::{Array1, Array2};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Names of the nodes created by [`build_model`].
pub const SIMULATOR_NODE: &str = "CQf";
pub const SUMMARY_NODE: &str = "IPsum";
pub const DISCREPANCY_NODE: &str = "d";
/// Log-discrepancy node attached by the search; the surrogate's target.
pub const LOG_DISCREPANCY_NODE: &str = "log_d";

/// `ln(d)`, with an exact match floored to the smallest positive normal.
pub fn log_discrepancy(d: f64) -> f64 {
    d.max(f64::MIN_POSITIVE).ln()
}

/// Scalar transform attached to a scalar node.
pub type ScalarOp = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

pub enum NodeKind {
    Prior { name: ParameterName, prior: UniformPrior },
    Simulator(SimulatorAdapter),
    Summary(TimeBase),
    /// Compares the parent summary against the summarised observed trace.
    Discrepancy { observed: Array1<f64> },
    Operation(ScalarOp),
}

impl NodeKind {
    fn label(&self) -> &'static str {
        match self {
            NodeKind::Prior { .. } => "prior",
            NodeKind::Simulator(_) => "simulator",
            NodeKind::Summary(_) => "summary",
            NodeKind::Discrepancy { .. } => "discrepancy",
            NodeKind::Operation(_) => "operation",
        }
    }
}

pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub parents: Vec<usize>,
}

/// Output of one node for one parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Scalar(f64),
    Trace(Array2<f64>),
    Vector(Array1<f64>),
}

impl NodeValue {
    fn label(&self) -> &'static str {
        match self {
            NodeValue::Scalar(_) => "scalar",
            NodeValue::Trace(_) => "trace",
            NodeValue::Vector(_) => "vector",
        }
    }
}

/// Directed acyclic graph of named nodes. Nodes can only reference earlier
/// nodes, so insertion order is a topological order.
pub struct ModelGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    priors: PriorSet,
}

impl fmt::Debug for ModelGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .nodes
            .iter()
            .map(|n| format!("{}:{}", n.name, n.kind.label()))
            .collect();
        f.debug_struct("ModelGraph").field("nodes", &names).finish()
    }
}

impl ModelGraph {
    fn new(priors: PriorSet) -> Self {
        Self { nodes: Vec::new(), index: HashMap::new(), priors }
    }

    fn push(&mut self, name: &str, kind: NodeKind, parents: Vec<usize>) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node { name: name.to_string(), kind, parents });
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn node_id(&self, name: &str) -> Result<usize, SimulationError> {
        self.index.get(name).copied().ok_or_else(|| SimulationError::UnknownNode(name.to_string()))
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    pub fn priors(&self) -> &PriorSet {
        &self.priors
    }

    pub fn sample_prior<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterVector {
        self.priors.sample(rng)
    }

    /// Attaches a scalar transform of an existing scalar node, e.g. `log_d = ln(d)`.
    pub fn add_operation(
        &mut self,
        name: &str,
        parent: &str,
        op: impl Fn(f64) -> f64 + Send + Sync + 'static,
    ) -> Result<(), SimulationError> {
        let parent = self.node_id(parent)?;
        self.push(name, NodeKind::Operation(Arc::new(op)), vec![parent]);
        Ok(())
    }

    /// Evaluates `target` for one parameter vector, computing only its ancestors.
    pub fn evaluate(&self, target: &str, p: &ParameterVector) -> Result<NodeValue, SimulationError> {
        let target = self.node_id(target)?;

        let mut needed = vec![false; self.nodes.len()];
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if !needed[id] {
                needed[id] = true;
                stack.extend(&self.nodes[id].parents);
            }
        }

        let mut values: Vec<Option<NodeValue>> = vec![None; self.nodes.len()];
        for id in (0..=target).filter(|&id| needed[id]) {
            let value = self.compute(id, p, &values)?;
            values[id] = Some(value);
        }
        values[target].take().ok_or_else(|| SimulationError::UnknownNode(self.nodes[target].name.clone()))
    }

    /// Convenience for scalar nodes.
    pub fn evaluate_scalar(&self, target: &str, p: &ParameterVector) -> Result<f64, SimulationError> {
        match self.evaluate(target, p)? {
            NodeValue::Scalar(v) => Ok(v),
            other => Err(SimulationError::NodeInput {
                node: target.to_string(),
                expected: "scalar",
                found: other.label(),
            }),
        }
    }

    fn compute(
        &self,
        id: usize,
        p: &ParameterVector,
        values: &[Option<NodeValue>],
    ) -> Result<NodeValue, SimulationError> {
        let node = &self.nodes[id];
        let input = |k: usize| values[node.parents[k]].as_ref();
        let mismatch = |expected: &'static str, found: Option<&NodeValue>| SimulationError::NodeInput {
            node: node.name.clone(),
            expected,
            found: found.map_or("missing", NodeValue::label),
        };

        match &node.kind {
            NodeKind::Prior { name, .. } => Ok(NodeValue::Scalar(p.get(*name))),
            NodeKind::Simulator(adapter) => {
                let mut x = [0.0; N_PARAMS];
                for (k, xd) in x.iter_mut().enumerate() {
                    match input(k) {
                        Some(NodeValue::Scalar(v)) => *xd = *v,
                        other => return Err(mismatch("scalar", other)),
                    }
                }
                adapter.simulate(&ParameterVector::from_point(&x)).map(NodeValue::Trace)
            }
            NodeKind::Summary(timebase) => match input(0) {
                Some(NodeValue::Trace(trace)) => Ok(NodeValue::Vector(timebase.summarize(trace.view()))),
                other => Err(mismatch("trace", other)),
            },
            NodeKind::Discrepancy { observed } => match input(0) {
                Some(NodeValue::Vector(summary)) => {
                    Ok(NodeValue::Scalar(l1_distance(summary.view(), observed.view())[0]))
                }
                other => Err(mismatch("vector", other)),
            },
            NodeKind::Operation(op) => match input(0) {
                Some(NodeValue::Scalar(v)) => Ok(NodeValue::Scalar(op(*v))),
                other => Err(mismatch("scalar", other)),
            },
        }
    }
}

/// Builds the model graph: seven uniform priors feeding the simulator, its
/// summary on `timebase`, and the L1 discrepancy against the summarised
/// `observed` trace (`2 x n`, row 0 time, row 1 current).
pub fn build_model(
    simulator: SimulatorAdapter,
    observed: &Array2<f64>,
    timebase: TimeBase,
    priors: PriorSet,
) -> ModelGraph {
    let mut m = ModelGraph::new(priors);

    let prior_ids: Vec<usize> = ParameterName::ALL
        .iter()
        .map(|&name| m.push(name.as_str(), NodeKind::Prior { name, prior: priors.prior(name) }, vec![]))
        .collect();

    let sim = m.push(SIMULATOR_NODE, NodeKind::Simulator(simulator), prior_ids);
    let sum = m.push(SUMMARY_NODE, NodeKind::Summary(timebase), vec![sim]);
    let observed_summary = timebase.summarize(observed.view());
    m.push(DISCREPANCY_NODE, NodeKind::Discrepancy { observed: observed_summary }, vec![sum]);

    tracing::debug!(graph = ?m, "model graph built");
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parameters::UniformPrior;
    use crate::models::simulator::{
        SimulationBackend, SimulationOutput, SimulationRequest, SimulatorSettings,
    };
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    /// Constant current over 0-25 ms, scaled by `Tf1`.
    struct Flat;

    impl SimulationBackend for Flat {
        fn run(&self, request: &SimulationRequest) -> Result<SimulationOutput, SimulationError> {
            let t = Array1::linspace(0.0, 25e-3, 26);
            let i_p = Array1::from_elem(26, request.tf1).into_dyn();
            Ok(SimulationOutput { t, i_p })
        }
    }

    fn observed_ones() -> Array2<f64> {
        let mut obs = Array2::ones((2, 26));
        obs.row_mut(0).assign(&Array1::linspace(0.0, 25e-3, 26));
        obs
    }

    fn graph() -> ModelGraph {
        let adapter = SimulatorAdapter::new(Arc::new(Flat), SimulatorSettings::default());
        let priors = PriorSet::from_fn(|_| UniformPrior::new(1.0, 19.0));
        build_model(adapter, &observed_ones(), TimeBase::window_25ms(26), priors)
    }

    fn point(tf1: f64) -> ParameterVector {
        let mut x = [2.0; N_PARAMS];
        x[ParameterName::Tf1.dim()] = tf1;
        ParameterVector::from_point(&x)
    }

    #[test]
    fn graph_wires_priors_simulator_summary_discrepancy() {
        let m = graph();
        let names: Vec<&str> = m.node_names().collect();
        assert_eq!(names.len(), N_PARAMS + 3);
        assert_eq!(&names[N_PARAMS..], &[SIMULATOR_NODE, SUMMARY_NODE, DISCREPANCY_NODE]);
        assert_eq!(m.node(SIMULATOR_NODE).unwrap().parents.len(), N_PARAMS);
    }

    #[test]
    fn matching_constant_current_gives_zero_discrepancy() {
        let m = graph();
        assert_eq!(m.evaluate_scalar(DISCREPANCY_NODE, &point(1.0)).unwrap(), 0.0);
    }

    #[test]
    fn discrepancy_sums_over_summary_grid() {
        let m = graph();
        let d = m.evaluate_scalar(DISCREPANCY_NODE, &point(3.0)).unwrap();
        assert!((d - 2.0 * 26.0).abs() < 1e-9);
    }

    #[test]
    fn operations_attach_to_existing_nodes() {
        let mut m = graph();
        m.add_operation(LOG_DISCREPANCY_NODE, DISCREPANCY_NODE, log_discrepancy).unwrap();
        let v = m.evaluate_scalar(LOG_DISCREPANCY_NODE, &point(3.0)).unwrap();
        assert!((v - 52.0f64.ln()).abs() < 1e-9);
        let exact = m.evaluate_scalar(LOG_DISCREPANCY_NODE, &point(1.0)).unwrap();
        assert!(exact.is_finite());
        assert!(matches!(
            m.add_operation("x", "missing", f64::ln),
            Err(SimulationError::UnknownNode(_))
        ));
    }

    #[test]
    fn evaluating_a_prior_skips_the_simulator() {
        let m = graph();
        let v = m.evaluate(ParameterName::Tf1.as_str(), &point(7.0)).unwrap();
        assert_eq!(v, NodeValue::Scalar(7.0));
    }

    #[test]
    fn summary_node_rejects_scalar_evaluation() {
        let m = graph();
        assert!(matches!(
            m.evaluate_scalar(SUMMARY_NODE, &point(1.0)),
            Err(SimulationError::NodeInput { expected: "scalar", found: "vector", .. })
        ));
    }

    #[test]
    fn prior_samples_lie_in_support() {
        let m = graph();
        let mut rng = Xoshiro256Plus::seed_from_u64(11);
        let x = m.sample_prior(&mut rng).to_point();
        assert!(m.priors().density(&x) > 0.0);
    }
}
