//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The output tensor mirrors the
//! query's layout and dtype, and reductions accumulate in `f32` regardless
//! of the incoming dtype (`bf16`, `f16`, or `f32`).

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is shaped `[batch, n_heads, q_len, head_dim]`; `k` and `v` share
///   `[batch, n_heads, kv_len, head_dim]`.
/// * Attention is full: every query position attends to every key position,
///   with no causal or padding masking.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * Dropout on the attention weights is controlled via
///   [`Config::dropout_p`]; when unset the computation is deterministic.
pub trait Attention {
    /// Compute scaled dot-product attention of `q` over `k`/`v`.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
