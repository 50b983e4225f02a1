//! Primitive building blocks for the cross-modal fusion stack.
//!
//! Everything here operates on tensors laid out `(batch, seq, hidden)` and
//! follows a shared [`dtypes::PrecisionPolicy`]: parameters may live in
//! reduced precision while matmuls and reductions promote to `f32`.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use activations::{Activation, ActivationKind};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{LayerNorm, NormConfig};
