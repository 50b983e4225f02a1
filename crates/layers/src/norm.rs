//! Layer normalization with unified shape and dtype handling.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Normalization happens
//! along the last axis while preserving the original layout: each position's
//! feature vector is shifted to zero mean and scaled to unit variance (with a
//! small epsilon), then passed through a learned elementwise scale and shift.
//! Statistics are promoted to [`PrecisionPolicy::reduction`] before casting
//! the output back.

use candle_core::{DType, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the conventional epsilon.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }
}

/// Standard LayerNorm with learnable affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs a LayerNorm from explicit scale and shift parameters.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_shape("norm.bias", &bias, &[config.hidden_size])?;
        checks::expect_dtype_in(
            "norm.weight",
            &weight,
            &[DType::F16, DType::BF16, DType::F32],
        )?;
        checks::expect_same_dtype("norm.weight", &weight, "norm.bias", &bias)?;
        checks::expect_contiguous("norm.weight", &weight)?;
        checks::expect_contiguous("norm.bias", &bias)?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Constructs a LayerNorm with identity parameters (scale 1, shift 0).
    pub fn with_identity_init(
        config: NormConfig,
        device: &candle_core::Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    /// Returns the configuration so callers can check shape compatibility.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Applies the normalisation to a `(batch, seq, hidden)` tensor.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let mut compute = policy.cast_for_reduction(hidden)?;

        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        compute = compute.broadcast_sub(&mean)?;

        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = compute.broadcast_div(&denom)?;

        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }

        let weight = self.weight.to_dtype(normalized.dtype())?;
        normalized = normalized.broadcast_mul(&weight)?;
        let bias = self.bias.to_dtype(normalized.dtype())?;
        normalized = normalized.broadcast_add(&bias)?;

        policy.cast_to_storage(&normalized)
    }
}
