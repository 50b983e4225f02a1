//! Numerically exact, portable attention kernel.
//!
//! Scores are computed as `q · k^T / sqrt(head_dim)` and normalised with a
//! max-subtracting softmax over the key axis, so the attention weights for
//! every (batch, head, query) row form a valid probability distribution even
//! for extreme logits. Reductions run in `f32`; the output is cast back to
//! the query's dtype.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, Config};

/// Reference scaled dot-product attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    /// Construct a reference attention kernel.
    pub fn new() -> Self {
        Self {
            first_call: OnceLock::new(),
        }
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dropout_p={:?} dtype={:?} device={:?}",
                config.dropout_p,
                q.dtype(),
                q.device().location()
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must reside on the same device".to_string(),
            });
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must share the same dtype".to_string(),
            });
        }

        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        if !q.is_contiguous() || !k.is_contiguous() || !v.is_contiguous() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must be contiguous in memory".to_string(),
            });
        }

        let (batch, heads, q_len, head_dim) =
            q.dims4().map_err(|_| AttentionError::InvalidShape {
                context: "q must have shape [batch, heads, seq_len, head_dim]".to_string(),
            })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "k must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
        let (vb, vh, vk, vd) = v.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "v must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
                ),
            });
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
                ),
            });
        }

        if let Some(dropout_p) = config.dropout_p {
            if !(0.0..1.0).contains(&dropout_p) {
                return Err(AttentionError::InvalidShape {
                    context: format!("dropout probability must be in [0, 1), got {dropout_p}"),
                });
            }
        }

        // Reductions in f32, independent of the storage dtype.
        let q_work = q.to_dtype(DType::F32)?;
        let k_work = k.to_dtype(DType::F32)?;
        let v_work = v.to_dtype(DType::F32)?;

        let merged = batch * heads;
        let q_view = q_work.reshape((merged, q_len, head_dim))?;
        let k_view = k_work.reshape((merged, k_len, head_dim))?;
        let k_t = k_view.transpose(1, 2)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q_view.matmul(&k_t)?.affine(scale, 0.0)?;

        let probs = softmax_last_dim(&scores)?;
        let probs = match config.dropout_p {
            Some(p) if p > 0.0 => dropout(&probs, p)?,
            _ => probs,
        };

        let v_view = v_work.reshape((merged, k_len, head_dim))?;
        let output = probs
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, head_dim))?;

        Ok(output.to_dtype(dtype)?)
    }
}
