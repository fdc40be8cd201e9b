//! Graph input layer.
//!
//! Owns the externally-filled activation buffer the rest of the graph reads
//! from. The data source (decoding, augmentation, batching) lives outside the
//! engine; per step the orchestrator copies one mini-batch into this layer's
//! `neurons` through [`crate::graph::Graph::set_input`].

use crate::error::GraphError;
use crate::format::{negotiate, FormatPolicy};

use super::LayerBase;

#[derive(Debug, Default)]
pub struct InputLayer;

impl InputLayer {
    pub fn init_descriptors(
        &mut self,
        base: &mut LayerBase,
        policy: FormatPolicy,
    ) -> Result<(), GraphError> {
        // The data source fills the buffer in plain layout; consumers that
        // want blocked data reorder at their own boundary.
        let _ = policy;
        let desc = negotiate(base.c, base.d, base.h, base.w, None, true, FormatPolicy::PlainOnly);
        base.dst_desc = Some(desc);
        base.diff_dst_desc = Some(desc);
        Ok(())
    }
}
