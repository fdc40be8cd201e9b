//! Layer graph: construction, relation analysis and the execution drivers.
//!
//! The graph is an arena of nodes whose `inputs` are indices of strictly
//! earlier nodes, so arena order *is* topological order: forward walks the
//! arena left to right, backward walks it in exact reverse. Relation analysis
//! (`set_relations`, run once at build time) derives consumer lists, decides
//! per edge whether gradient writes accumulate or overwrite, and marks the
//! elementwise layers whose backward may hand its gradient buffer to the
//! producer by a storage swap instead of a copy.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use tracing::debug;

use crate::error::GraphError;
use crate::format::{FormatPolicy, MemoryFormat};
use crate::layers::{
    ActivationKind, ActivationLayer, AvgPoolLayer, BatchNormLayer, ConvLayer, CostKind, CostLayer,
    DenseLayer, DropoutLayer, Filler, FusionLayer, FusionOp, GlobalAvgPoolLayer, InputLayer,
    LayerBase, LayerImpl, LayerKind, MaxPoolLayer,
};
use crate::optimizers::Optimizer;
use crate::utils::SimpleRng;

pub struct Node {
    pub base: LayerBase,
    pub op: LayerImpl,
}

pub struct Graph {
    nodes: Vec<Node>,
    batch_size: usize,
    policy: FormatPolicy,
    seed: u64,
    /// Tentative in-place eligibility from topology; descriptor initialization
    /// clears the flag on nodes whose boundary format differs.
    inplace_eligible: Vec<bool>,
    /// Whether the driver resets this node's gradient buffer during forward;
    /// false when the sole consumer is a cost layer, which overwrites it.
    zero_d1: Vec<bool>,
}

/// Incremental graph construction with name-based wiring.
///
/// Layer names are compared case-insensitively; inputs must name layers added
/// earlier, which is what guarantees the arena's topological order.
pub struct GraphBuilder {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    policy: FormatPolicy,
    seed: u64,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            policy: FormatPolicy::default(),
            seed: 0,
        }
    }

    pub fn with_policy(mut self, policy: FormatPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn resolve(&self, layer: &str, input: &str) -> Result<usize, GraphError> {
        self.index
            .get(&input.to_lowercase())
            .copied()
            .ok_or_else(|| GraphError::UnknownInput {
                layer: layer.to_string(),
                input: input.to_string(),
            })
    }

    fn push(
        &mut self,
        name: &str,
        kind: LayerKind,
        shape: (usize, usize, usize, usize),
        inputs: Vec<usize>,
        op: LayerImpl,
    ) -> Result<usize, GraphError> {
        let key = name.to_lowercase();
        if self.index.contains_key(&key) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }
        if inputs.len() != kind.input_arity() {
            return Err(GraphError::InputArity {
                layer: name.to_string(),
                expected: kind.input_arity(),
                got: inputs.len(),
            });
        }
        let (c, d, h, w) = shape;
        let at = self.nodes.len();
        debug!(layer = name, ?kind, index = at, "adding layer");
        self.nodes.push(Node {
            base: LayerBase::new(name, kind, c, d, h, w, inputs),
            op,
        });
        self.index.insert(key, at);
        Ok(at)
    }

    pub fn add_input(
        &mut self,
        name: &str,
        c: usize,
        d: usize,
        h: usize,
        w: usize,
    ) -> Result<usize, GraphError> {
        if c == 0 || d == 0 || h == 0 || w == 0 {
            return Err(GraphError::InvalidParameter {
                layer: name.to_string(),
                details: "input dimensions must be non-zero".into(),
            });
        }
        self.push(
            name,
            LayerKind::Input,
            (c, d, h, w),
            Vec::new(),
            LayerImpl::Input(InputLayer),
        )
    }

    pub fn add_convolution(
        &mut self,
        name: &str,
        input: &str,
        out_c: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<usize, GraphError> {
        if out_c == 0 || kernel == 0 || stride == 0 {
            return Err(GraphError::InvalidParameter {
                layer: name.to_string(),
                details: "channels, kernel and stride must be non-zero".into(),
            });
        }
        let prev = self.resolve(name, input)?;
        self.push(
            name,
            LayerKind::Convolution,
            (0, 1, 1, 1),
            vec![prev],
            LayerImpl::Convolution(ConvLayer::new(out_c, kernel, stride, padding)),
        )
    }

    pub fn add_dense(&mut self, name: &str, input: &str, units: usize) -> Result<usize, GraphError> {
        if units == 0 {
            return Err(GraphError::InvalidParameter {
                layer: name.to_string(),
                details: "units must be non-zero".into(),
            });
        }
        let prev = self.resolve(name, input)?;
        let seed = self.seed ^ (self.nodes.len() as u64).wrapping_mul(0x6c62_272e_07bb_0145);
        self.push(
            name,
            LayerKind::Dense,
            (0, 1, 1, 1),
            vec![prev],
            LayerImpl::Dense(DenseLayer::new(units, seed)),
        )
    }

    pub fn add_batchnorm_activation(
        &mut self,
        name: &str,
        input: &str,
        act: Option<ActivationKind>,
        dropout_rate: f32,
    ) -> Result<usize, GraphError> {
        if !(0.0..1.0).contains(&dropout_rate) {
            return Err(GraphError::InvalidParameter {
                layer: name.to_string(),
                details: format!("dropout rate {} outside [0, 1)", dropout_rate),
            });
        }
        let prev = self.resolve(name, input)?;
        let seed = self.seed ^ (self.nodes.len() as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        self.push(
            name,
            LayerKind::BatchNormActivation,
            (0, 1, 1, 1),
            vec![prev],
            LayerImpl::BatchNormActivation(BatchNormLayer::new(
                act,
                0.01,
                dropout_rate,
                0.9,
                1e-5,
                seed,
            )),
        )
    }

    pub fn add_activation(
        &mut self,
        name: &str,
        input: &str,
        kind: ActivationKind,
        alpha: f32,
    ) -> Result<usize, GraphError> {
        let prev = self.resolve(name, input)?;
        self.push(
            name,
            LayerKind::Activation,
            (0, 1, 1, 1),
            vec![prev],
            LayerImpl::Activation(ActivationLayer::new(kind, alpha)),
        )
    }

    pub fn add_dropout(&mut self, name: &str, input: &str, rate: f32) -> Result<usize, GraphError> {
        if !(0.0..1.0).contains(&rate) {
            return Err(GraphError::InvalidParameter {
                layer: name.to_string(),
                details: format!("dropout rate {} outside [0, 1)", rate),
            });
        }
        let prev = self.resolve(name, input)?;
        let seed = self.seed ^ (self.nodes.len() as u64).wrapping_mul(0x2545_f491_4f6c_dd1d);
        self.push(
            name,
            LayerKind::Dropout,
            (0, 1, 1, 1),
            vec![prev],
            LayerImpl::Dropout(DropoutLayer::new(rate, seed)),
        )
    }

    pub fn add_max_pooling(
        &mut self,
        name: &str,
        input: &str,
        kernel: usize,
        stride: usize,
    ) -> Result<usize, GraphError> {
        if kernel == 0 || stride == 0 {
            return Err(GraphError::InvalidParameter {
                layer: name.to_string(),
                details: "kernel and stride must be non-zero".into(),
            });
        }
        let prev = self.resolve(name, input)?;
        self.push(
            name,
            LayerKind::MaxPooling,
            (0, 1, 1, 1),
            vec![prev],
            LayerImpl::MaxPooling(MaxPoolLayer::new(kernel, stride)),
        )
    }

    pub fn add_avg_pooling(
        &mut self,
        name: &str,
        input: &str,
        kernel: usize,
        stride: usize,
    ) -> Result<usize, GraphError> {
        if kernel == 0 || stride == 0 {
            return Err(GraphError::InvalidParameter {
                layer: name.to_string(),
                details: "kernel and stride must be non-zero".into(),
            });
        }
        let prev = self.resolve(name, input)?;
        self.push(
            name,
            LayerKind::AvgPooling,
            (0, 1, 1, 1),
            vec![prev],
            LayerImpl::AvgPooling(AvgPoolLayer::new(kernel, stride)),
        )
    }

    pub fn add_global_avg_pooling(&mut self, name: &str, input: &str) -> Result<usize, GraphError> {
        let prev = self.resolve(name, input)?;
        self.push(
            name,
            LayerKind::GlobalAvgPooling,
            (0, 1, 1, 1),
            vec![prev],
            LayerImpl::GlobalAvgPooling(GlobalAvgPoolLayer::new()),
        )
    }

    pub fn add_fusion(
        &mut self,
        name: &str,
        op: FusionOp,
        input0: &str,
        input1: &str,
    ) -> Result<usize, GraphError> {
        let p0 = self.resolve(name, input0)?;
        let p1 = self.resolve(name, input1)?;
        if p0 == p1 {
            return Err(GraphError::InvalidParameter {
                layer: name.to_string(),
                details: "fusion inputs must be distinct layers".into(),
            });
        }
        let kind = match op {
            FusionOp::Add => LayerKind::Add,
            FusionOp::Average => LayerKind::Average,
            FusionOp::Substract => LayerKind::Substract,
        };
        self.push(
            name,
            kind,
            (0, 1, 1, 1),
            vec![p0, p1],
            LayerImpl::Fusion(FusionLayer::new(op)),
        )
    }

    pub fn add_cost(&mut self, name: &str, input: &str, kind: CostKind) -> Result<usize, GraphError> {
        let prev = self.resolve(name, input)?;
        self.push(
            name,
            LayerKind::Cost,
            (0, 1, 1, 1),
            vec![prev],
            LayerImpl::Cost(CostLayer::new(kind)),
        )
    }

    /// Finish construction: relation analysis, descriptor negotiation and
    /// buffer allocation for batch size 1.
    pub fn build(self) -> Result<Graph, GraphError> {
        if !self
            .nodes
            .iter()
            .any(|n| n.base.kind == LayerKind::Input)
        {
            return Err(GraphError::Definition("graph has no input layer".into()));
        }
        let mut graph = Graph {
            nodes: self.nodes,
            batch_size: 0,
            policy: self.policy,
            seed: self.seed,
            inplace_eligible: Vec::new(),
            zero_d1: Vec::new(),
        };
        graph.set_relations();
        graph.set_batch_size(1)?;
        let mut rng = SimpleRng::new(graph.seed ^ 0x5bf0_3635);
        for node in graph.nodes.iter_mut() {
            node.op.reset_weights(Filler::HeNormal, &mut rng);
        }
        debug!(layers = graph.nodes.len(), "graph built");
        Ok(graph)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Distinct mutable references to two arena entries.
fn pair_mut(nodes: &mut [Node], a: usize, b: usize) -> (&mut LayerBase, &mut LayerBase) {
    assert_ne!(a, b, "fusion inputs are distinct by construction");
    if a < b {
        let (lo, hi) = nodes.split_at_mut(b);
        (&mut lo[a].base, &mut hi[0].base)
    } else {
        let (lo, hi) = nodes.split_at_mut(a);
        (&mut hi[0].base, &mut lo[b].base)
    }
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn policy(&self) -> FormatPolicy {
        self.policy
    }

    /// Arena index for a (case-insensitive) layer name.
    pub fn find(&self, name: &str) -> Option<usize> {
        let lower = name.to_lowercase();
        self.nodes
            .iter()
            .position(|n| n.base.name.to_lowercase() == lower)
    }

    pub fn base(&self, index: usize) -> &LayerBase {
        &self.nodes[index].base
    }

    pub fn base_mut(&mut self, index: usize) -> &mut LayerBase {
        &mut self.nodes[index].base
    }

    pub fn op(&self, index: usize) -> &LayerImpl {
        &self.nodes[index].op
    }

    pub fn parameter_count(&self) -> usize {
        self.nodes.iter().map(|n| n.op.parameter_count()).sum()
    }

    /// Gradient-router pass: derive consumer lists and per-edge accumulation,
    /// and mark in-place backward eligibility. Run once at build time.
    fn set_relations(&mut self) {
        let len = self.nodes.len();
        for node in self.nodes.iter_mut() {
            node.base.outputs.clear();
        }
        for i in 0..len {
            let inputs = self.nodes[i].base.inputs.clone();
            for &p in &inputs {
                self.nodes[p].base.outputs.push(i);
            }
        }
        for i in 0..len {
            let inputs = self.nodes[i].base.inputs.clone();
            for (e, &p) in inputs.iter().enumerate() {
                let producer = &self.nodes[p].base;
                let shared = producer.outputs.len() >= 2 && producer.kind != LayerKind::Input;
                self.nodes[i].base.input_shared[e] = shared;
            }
        }

        self.inplace_eligible = (0..len)
            .map(|i| {
                let base = &self.nodes[i].base;
                if !matches!(base.kind, LayerKind::Activation | LayerKind::Dropout) {
                    return false;
                }
                let p = base.inputs[0];
                self.nodes[p].base.outputs.len() == 1
            })
            .collect();

        self.zero_d1 = (0..len)
            .map(|i| {
                let base = &self.nodes[i].base;
                if base.kind == LayerKind::Cost {
                    return false;
                }
                let sole_cost = base.outputs.len() == 1
                    && self.nodes[base.outputs[0]].base.kind == LayerKind::Cost;
                !sole_cost
            })
            .collect();
        debug!("relations resolved");
    }

    /// Re-run descriptor negotiation over the whole arena.
    fn init_descriptors(&mut self, batch: usize) -> Result<(), GraphError> {
        let len = self.nodes.len();
        // A producer whose consumer is a cost layer must emit plain data.
        let force_plain: Vec<bool> = (0..len)
            .map(|i| {
                self.nodes[i]
                    .base
                    .outputs
                    .iter()
                    .any(|&o| self.nodes[o].base.kind == LayerKind::Cost)
            })
            .collect();

        for i in 0..len {
            let (before, rest) = self.nodes.split_at_mut(i);
            let Node { base, op } = &mut rest[0];

            // The storage swap only works when both sides agree on layout.
            base.inplace_bwd = self.inplace_eligible[i]
                && !base.inputs.is_empty()
                && (!force_plain[i]
                    || before[base.inputs[0]].base.desc().format == MemoryFormat::Plain);

            let prevs: Vec<&LayerBase> = base.inputs.iter().map(|&p| &before[p].base).collect();
            op.init_descriptors(base, &prevs, batch, self.policy, force_plain[i])?;
            debug!(
                layer = %base.name,
                format = ?base.desc().format,
                c = base.c,
                h = base.h,
                w = base.w,
                "descriptors initialized"
            );
        }
        Ok(())
    }

    /// Resize every layer for `batch` samples. Must not be called while a
    /// pass is in flight.
    pub fn set_batch_size(&mut self, batch: usize) -> Result<(), GraphError> {
        if batch == 0 {
            return Err(GraphError::Definition("batch size must be non-zero".into()));
        }
        self.init_descriptors(batch)?;
        for node in self.nodes.iter_mut() {
            node.base.set_batch_size(batch);
        }
        self.batch_size = batch;
        Ok(())
    }

    /// Change the input layers' spatial resolution and re-derive every shape,
    /// descriptor and buffer downstream.
    pub fn set_resolution(&mut self, h: usize, w: usize) -> Result<(), GraphError> {
        if h == 0 || w == 0 {
            return Err(GraphError::Definition("resolution must be non-zero".into()));
        }
        let len = self.nodes.len();
        for node in self.nodes.iter_mut() {
            if node.base.kind == LayerKind::Input {
                let (c, d) = (node.base.c, node.base.d);
                node.base.set_shape(c, d, h, w);
            }
        }
        for i in 0..len {
            let (before, rest) = self.nodes.split_at_mut(i);
            let Node { base, op } = &mut rest[0];
            if base.kind == LayerKind::Input {
                continue;
            }
            let prevs: Vec<&LayerBase> = base.inputs.iter().map(|&p| &before[p].base).collect();
            op.update_resolution(base, &prevs);
        }
        let batch = self.batch_size.max(1);
        self.set_batch_size(batch)
    }

    /// Scatter one mini-batch of packed real-channel samples into the first
    /// input layer.
    pub fn set_input(&mut self, data: &[f32]) {
        let index = self
            .nodes
            .iter()
            .position(|n| n.base.kind == LayerKind::Input)
            .expect("graph has an input layer by construction");
        self.set_input_at(index, data);
    }

    pub fn set_input_at(&mut self, index: usize, data: &[f32]) {
        let batch = self.batch_size;
        let base = &mut self.nodes[index].base;
        assert_eq!(
            data.len(),
            batch * base.cdhw(),
            "input size mismatch for layer {}",
            base.name
        );
        let desc = *base.desc();
        let spatial = base.d * base.h * base.w;
        let channels = base.c;
        let out = base.neurons.as_mut_slice();
        for n in 0..batch {
            for c in 0..channels {
                let from = (n * channels + c) * spatial;
                let to = desc.offset(n, c, 0, 0, 0);
                out[to..to + spatial].copy_from_slice(&data[from..from + spatial]);
            }
        }
    }

    /// Hand packed targets to the first cost layer.
    pub fn set_targets(&mut self, data: &[f32]) {
        let batch = self.batch_size;
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.base.kind == LayerKind::Cost)
            .expect("graph has no cost layer");
        let Node { base, op } = node;
        match op {
            LayerImpl::Cost(cost) => cost.set_targets(data, base, batch),
            _ => unreachable!(),
        }
    }

    /// Batch-mean loss summed over all cost layers, from the last forward.
    pub fn loss(&self) -> f32 {
        self.nodes
            .iter()
            .filter_map(|n| match &n.op {
                LayerImpl::Cost(cost) => Some(cost.loss()),
                _ => None,
            })
            .sum()
    }

    /// Forward propagation in arena order. With `training` set, each layer's
    /// gradient buffer is also reset here, exactly once per step, before any
    /// consumer's backward can touch it.
    pub fn forward_prop(&mut self, training: bool) {
        let batch = self.batch_size;
        assert!(batch > 0, "set_batch_size before forward_prop");
        let len = self.nodes.len();
        for i in 0..len {
            let (before, rest) = self.nodes.split_at_mut(i);
            let Node { base, op } = &mut rest[0];
            if base.skip {
                continue;
            }
            let prevs: Vec<&LayerBase> = base.inputs.iter().map(|&p| &before[p].base).collect();
            op.forward(base, &prevs, batch, training);
            if training && self.zero_d1[i] {
                base.neurons_d1.fill(op.zero_gradient());
            }
        }
    }

    /// Backward propagation in exact reverse arena order.
    pub fn backward_prop(&mut self) {
        let batch = self.batch_size;
        let len = self.nodes.len();
        for i in (0..len).rev() {
            let (before, rest) = self.nodes.split_at_mut(i);
            let Node { base, op } = &mut rest[0];
            if base.skip || base.kind == LayerKind::Input {
                continue;
            }
            let inputs = base.inputs.clone();
            let mut prevs: Vec<&mut LayerBase> = match inputs.len() {
                0 => Vec::new(),
                1 => vec![&mut before[inputs[0]].base],
                2 => {
                    let (a, b) = pair_mut(before, inputs[0], inputs[1]);
                    vec![a, b]
                }
                n => unreachable!("no layer kind has arity {}", n),
            };
            op.backward(base, &mut prevs, batch);
            if base.inplace_bwd {
                // Hand the transformed gradient buffer to the producer.
                base.neurons_d1.swap_storage(&mut prevs[0].neurons_d1);
            }
        }
    }

    /// Apply one optimizer step to every weighted layer and clear gradients.
    ///
    /// Slot ids are derived from the arena index, two per layer, so per-tensor
    /// optimizer state stays stable across steps.
    pub fn update_weights(&mut self, opt: &mut dyn Optimizer) {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.op.apply_update(i * 2, opt);
        }
    }

    pub fn reset_weights(&mut self, filler: Filler) {
        let mut rng = SimpleRng::new(self.seed ^ 0x5bf0_3635);
        for node in self.nodes.iter_mut() {
            node.op.reset_weights(filler, &mut rng);
        }
    }

    /// Serialize every weighted layer's parameters in arena order.
    pub fn save(&self, writer: &mut dyn Write) -> io::Result<()> {
        for node in &self.nodes {
            node.op.save(writer)?;
        }
        Ok(())
    }

    pub fn load(&mut self, reader: &mut dyn Read) -> io::Result<()> {
        for node in self.nodes.iter_mut() {
            node.op.load(reader)?;
        }
        Ok(())
    }

    // Stochastic-depth plumbing.

    /// Arena indices of the fusion layers, in order.
    pub fn fusion_indices(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.base.kind.is_fusion())
            .map(|(i, _)| i)
            .collect()
    }

    /// Set one fusion input's survival state for the coming step.
    pub fn set_fusion_survival(&mut self, index: usize, input: usize, probability: f32, alive: bool) {
        match &mut self.nodes[index].op {
            LayerImpl::Fusion(fusion) => fusion.set_survival(input, probability, alive),
            _ => panic!("layer {} is not a fusion layer", index),
        }
    }

    /// Flag the branch feeding `fusion_index`'s second input as skipped,
    /// walking producers back until a shared, fusion or input layer.
    pub fn set_branch_skip(&mut self, fusion_index: usize, skip: bool) {
        let mut j = self.nodes[fusion_index].base.inputs[1];
        loop {
            let base = &self.nodes[j].base;
            if base.outputs.len() >= 2 || base.kind.is_fusion() || base.kind == LayerKind::Input {
                break;
            }
            self.nodes[j].base.skip = skip;
            let next = self.nodes[j].base.inputs.first().copied();
            match next {
                Some(p) => j = p,
                None => break,
            }
        }
    }

    /// Restore full depth everywhere (inference state).
    pub fn clear_survival(&mut self) {
        for node in self.nodes.iter_mut() {
            node.base.skip = false;
            if let LayerImpl::Fusion(fusion) = &mut node.op {
                fusion.clear_survival();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::VEC_WIDTH;

    fn residual_graph() -> Graph {
        let mut b = GraphBuilder::new().with_seed(11);
        b.add_input("data", 8, 1, 6, 6).unwrap();
        b.add_convolution("stem", "data", 8, 3, 1, 1).unwrap();
        b.add_activation("trunk", "stem", ActivationKind::Relu, 0.0)
            .unwrap();
        b.add_convolution("branch", "trunk", 8, 3, 1, 1).unwrap();
        b.add_fusion("join", FusionOp::Add, "trunk", "branch").unwrap();
        b.add_cost("cost", "join", CostKind::MeanSquaredError).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut b = GraphBuilder::new();
        b.add_input("data", 3, 1, 4, 4).unwrap();
        let err = b.add_activation("DATA", "data", ActivationKind::Relu, 0.0);
        assert!(matches!(err, Err(GraphError::DuplicateName(_))));
    }

    #[test]
    fn test_unknown_input_rejected() {
        let mut b = GraphBuilder::new();
        b.add_input("data", 3, 1, 4, 4).unwrap();
        let err = b.add_activation("act", "nope", ActivationKind::Relu, 0.0);
        assert!(matches!(err, Err(GraphError::UnknownInput { .. })));
    }

    #[test]
    fn test_graph_without_input_rejected() {
        let b = GraphBuilder::new();
        assert!(matches!(b.build(), Err(GraphError::Definition(_))));
    }

    #[test]
    fn test_shared_producer_marks_edges() {
        let g = residual_graph();
        let join = g.find("join").unwrap();
        // "trunk" feeds both the branch and the fusion layer.
        assert!(g.base(join).input_shared[0]);
        assert!(!g.base(join).input_shared[1]);
    }

    #[test]
    fn test_single_consumer_elementwise_is_inplace() {
        let mut b = GraphBuilder::new();
        b.add_input("data", 8, 1, 4, 4).unwrap();
        b.add_convolution("conv", "data", 8, 3, 1, 1).unwrap();
        b.add_activation("act", "conv", ActivationKind::Relu, 0.0).unwrap();
        b.add_convolution("head", "act", 8, 3, 1, 1).unwrap();
        b.add_cost("cost", "head", CostKind::MeanSquaredError).unwrap();
        let g = b.build().unwrap();
        let act = g.find("act").unwrap();
        assert!(g.base(act).inplace_bwd);
    }

    #[test]
    fn test_shared_producer_disables_inplace() {
        let g = residual_graph();
        // "trunk" has two consumers, so neither may swap buffers with it.
        let branch = g.find("branch").unwrap();
        assert!(!g.base(branch).inplace_bwd);
    }

    #[test]
    fn test_descriptor_negotiation_idempotent() {
        let mut g = residual_graph();
        g.set_batch_size(2).unwrap();
        let before: Vec<_> = (0..g.len())
            .map(|i| (*g.base(i).desc(), g.base(i).inplace_bwd))
            .collect();
        g.set_batch_size(2).unwrap();
        let after: Vec<_> = (0..g.len())
            .map(|i| (*g.base(i).desc(), g.base(i).inplace_bwd))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_buffers_sized_for_batch() {
        let mut g = residual_graph();
        g.set_batch_size(3).unwrap();
        for i in 0..g.len() {
            let base = g.base(i);
            assert_eq!(base.neurons.len(), 3 * base.padded_cdhw(), "{}", base.name);
            assert_eq!(base.padded_c % VEC_WIDTH, 0);
        }
    }

    #[test]
    fn test_forward_backward_runs() {
        let mut g = residual_graph();
        g.set_batch_size(2).unwrap();
        let input = vec![0.1f32; 2 * 8 * 6 * 6];
        let targets = vec![0.0f32; 2 * 8 * 6 * 6];
        g.set_input(&input);
        g.set_targets(&targets);
        g.forward_prop(true);
        g.backward_prop();
        assert!(g.loss().is_finite());
    }
}
