//! blocknet, a CPU neural-network training engine.
//!
//! A model is a directed graph of typed layers executed over mini-batches:
//! forward in topological (arena) order, backward in exact reverse. Layers
//! negotiate per-boundary memory layouts between a plain channel-major format
//! and a SIMD-friendly channel-blocked format, with explicit reorders where
//! adjacent layers disagree. Threading fans each layer out over the batch
//! dimension, sized by a work-partitioning heuristic. Residual connections
//! are expressed by fusion layers (Add/Average/Substract) which also carry
//! the stochastic-depth survival machinery.
//!
//! # Example
//!
//! ```
//! use blocknet::graph::GraphBuilder;
//! use blocknet::layers::{ActivationKind, CostKind};
//! use blocknet::optimizers::{Adam, Optimizer};
//!
//! let mut b = GraphBuilder::new().with_seed(7);
//! b.add_input("data", 4, 1, 8, 8)?;
//! b.add_convolution("conv", "data", 8, 3, 1, 1)?;
//! b.add_batchnorm_activation("bn", "conv", Some(ActivationKind::Relu), 0.0)?;
//! b.add_cost("cost", "bn", CostKind::MeanSquaredError)?;
//! let mut graph = b.build()?;
//!
//! graph.set_batch_size(2)?;
//! graph.set_input(&vec![0.5; 2 * 4 * 8 * 8]);
//! graph.set_targets(&vec![0.0; 2 * 8 * 8 * 8]);
//!
//! let mut opt = Adam::with_defaults(1e-3);
//! graph.forward_prop(true);
//! graph.backward_prop();
//! graph.update_weights(&mut opt);
//! assert!(graph.loss().is_finite());
//! # Ok::<(), blocknet::error::GraphError>(())
//! ```

// Provides the BLAS implementation the `cblas` bindings link against.
use blas_src as _;

pub mod architecture;
pub mod error;
pub mod format;
pub mod graph;
pub mod layers;
pub mod optimizers;
pub mod stodepth;
pub mod tensor;
pub mod threading;
pub mod utils;

pub use error::GraphError;
pub use format::{FormatPolicy, MemDesc, MemoryFormat, VEC_WIDTH};
pub use graph::{Graph, GraphBuilder};
pub use stodepth::StochasticDepth;
pub use tensor::TensorBuffer;
