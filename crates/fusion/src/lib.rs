//! Cross-modal fusion of two aligned sequence streams.
//!
//! [`ModalityFusion`] combines two `(batch, seq, d_model)` streams through
//! multi-head cross-attention wrapped in residual/normalization blocks,
//! followed by a position-wise feed-forward refinement. Three directional
//! topologies are supported, fixed at construction: bidirectional (each
//! stream attends to the other, results concatenated along the feature
//! axis) and the two single-direction variants.
//!
//! The calling convention is context-first throughout: the key/value stream
//! comes before the query stream.

pub mod config;
pub mod cross;
pub mod fusion;
pub mod residual;

pub use config::{FusionConfig, FusionMode};
pub use cross::CrossModalAttention;
pub use fusion::ModalityFusion;
pub use residual::{FusionTransform, ResidualBlock};
