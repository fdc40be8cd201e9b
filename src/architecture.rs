//! JSON graph definitions.
//!
//! A definition is an object with an ordered `layers` list; each entry names
//! its kind, its producers and the kind-specific parameters. Layers must be
//! listed after their producers, mirroring the arena's topological order.
//!
//! ```json
//! {
//!   "seed": 7,
//!   "layers": [
//!     { "name": "data", "kind": "input", "channels": 8, "height": 32, "width": 32 },
//!     { "name": "conv1", "kind": "convolution", "inputs": ["data"],
//!       "channels": 16, "kernel": 3, "stride": 1, "padding": 1 },
//!     { "name": "bn1", "kind": "batchnorm_activation", "inputs": ["conv1"],
//!       "activation": "relu" },
//!     { "name": "cost", "kind": "cost", "inputs": ["bn1"], "cost": "cross_entropy" }
//!   ]
//! }
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::GraphError;
use crate::format::FormatPolicy;
use crate::graph::{Graph, GraphBuilder};
use crate::layers::{ActivationKind, CostKind, FusionOp};

#[derive(Debug, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub seed: u64,
    /// `"plain"` disables blocked layouts; anything else uses the default.
    #[serde(default)]
    pub format: Option<String>,
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub channels: Option<usize>,
    #[serde(default = "one")]
    pub depth: usize,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub kernel: Option<usize>,
    #[serde(default = "one")]
    pub stride: usize,
    #[serde(default)]
    pub padding: usize,
    #[serde(default)]
    pub units: Option<usize>,
    #[serde(default)]
    pub activation: Option<String>,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default)]
    pub cost: Option<String>,
}

fn one() -> usize {
    1
}

fn default_alpha() -> f32 {
    0.01
}

impl LayerConfig {
    fn sole_input(&self) -> Result<&str, GraphError> {
        match self.inputs.as_slice() {
            [single] => Ok(single),
            other => Err(GraphError::InputArity {
                layer: self.name.clone(),
                expected: 1,
                got: other.len(),
            }),
        }
    }

    fn require(&self, field: Option<usize>, what: &str) -> Result<usize, GraphError> {
        field.ok_or_else(|| GraphError::InvalidParameter {
            layer: self.name.clone(),
            details: format!("missing required field `{}`", what),
        })
    }

    fn parse_activation(&self) -> Result<Option<ActivationKind>, GraphError> {
        match &self.activation {
            None => Ok(None),
            Some(name) => ActivationKind::parse(name).map(Some).ok_or_else(|| {
                GraphError::InvalidParameter {
                    layer: self.name.clone(),
                    details: format!("unknown activation `{}`", name),
                }
            }),
        }
    }
}

/// Build a graph from a JSON definition string.
pub fn from_str(json: &str) -> Result<Graph, GraphError> {
    let config: GraphConfig = serde_json::from_str(json)?;
    build(config)
}

/// Build a graph from a JSON definition file.
pub fn from_file(path: impl AsRef<Path>) -> Result<Graph, GraphError> {
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    from_str(&text)
}

pub fn build(config: GraphConfig) -> Result<Graph, GraphError> {
    let policy = match config.format.as_deref() {
        Some("plain") => FormatPolicy::PlainOnly,
        _ => FormatPolicy::default(),
    };
    let mut builder = GraphBuilder::new().with_policy(policy).with_seed(config.seed);

    for layer in &config.layers {
        match layer.kind.as_str() {
            "input" => {
                if !layer.inputs.is_empty() {
                    return Err(GraphError::InputArity {
                        layer: layer.name.clone(),
                        expected: 0,
                        got: layer.inputs.len(),
                    });
                }
                let c = layer.require(layer.channels, "channels")?;
                let h = layer.require(layer.height, "height")?;
                let w = layer.require(layer.width, "width")?;
                builder.add_input(&layer.name, c, layer.depth, h, w)?;
            }
            "convolution" => {
                let c = layer.require(layer.channels, "channels")?;
                let k = layer.require(layer.kernel, "kernel")?;
                builder.add_convolution(
                    &layer.name,
                    layer.sole_input()?,
                    c,
                    k,
                    layer.stride,
                    layer.padding,
                )?;
            }
            "dense" => {
                let units = layer.require(layer.units, "units")?;
                builder.add_dense(&layer.name, layer.sole_input()?, units)?;
            }
            "batchnorm_activation" => {
                let act = layer.parse_activation()?;
                builder.add_batchnorm_activation(
                    &layer.name,
                    layer.sole_input()?,
                    act,
                    layer.dropout,
                )?;
            }
            "activation" => {
                let act = layer.parse_activation()?.ok_or_else(|| {
                    GraphError::InvalidParameter {
                        layer: layer.name.clone(),
                        details: "missing required field `activation`".into(),
                    }
                })?;
                builder.add_activation(&layer.name, layer.sole_input()?, act, layer.alpha)?;
            }
            "dropout" => {
                builder.add_dropout(&layer.name, layer.sole_input()?, layer.dropout)?;
            }
            "max_pooling" => {
                let k = layer.require(layer.kernel, "kernel")?;
                builder.add_max_pooling(&layer.name, layer.sole_input()?, k, layer.stride)?;
            }
            "avg_pooling" => {
                let k = layer.require(layer.kernel, "kernel")?;
                builder.add_avg_pooling(&layer.name, layer.sole_input()?, k, layer.stride)?;
            }
            "global_avg_pooling" => {
                builder.add_global_avg_pooling(&layer.name, layer.sole_input()?)?;
            }
            "add" | "average" | "substract" => {
                let op = match layer.kind.as_str() {
                    "add" => FusionOp::Add,
                    "average" => FusionOp::Average,
                    _ => FusionOp::Substract,
                };
                match layer.inputs.as_slice() {
                    [a, b] => builder.add_fusion(&layer.name, op, a, b)?,
                    other => {
                        return Err(GraphError::InputArity {
                            layer: layer.name.clone(),
                            expected: 2,
                            got: other.len(),
                        })
                    }
                };
            }
            "cost" => {
                let kind = match &layer.cost {
                    Some(name) => CostKind::parse(name).ok_or_else(|| {
                        GraphError::InvalidParameter {
                            layer: layer.name.clone(),
                            details: format!("unknown cost `{}`", name),
                        }
                    })?,
                    None => CostKind::MeanSquaredError,
                };
                builder.add_cost(&layer.name, layer.sole_input()?, kind)?;
            }
            other => {
                return Err(GraphError::Definition(format!(
                    "layer `{}` has unknown kind `{}`",
                    layer.name, other
                )))
            }
        }
    }
    builder.build()
}
