//! Residual/normalization wrapping for the fusion transforms.
//!
//! A [`ResidualBlock`] owns one inner transform behind the
//! [`FusionTransform`] capability, one [`LayerNorm`] sized to the inner's
//! output width, and a normalization-placement flag fixed at construction:
//!
//! * post-norm (default): `out = LayerNorm(x + inner(x[, q]))`
//! * pre-norm: `out = x + LayerNorm(inner(x[, q]))`
//!
//! In the pre-norm ordering the residual addition uses the un-normalized
//! `x` and the norm applies to the inner output only, never to the sum.
//! When the inner transform changes the feature width (the bidirectional
//! trailing feed-forward maps `2 * d_model` down), a learned bias-free skip
//! projection keeps the residual path shape-compatible; the skip is the
//! identity whenever widths match.

use candle_core::{DType, Device, Error, Result, Tensor};

use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    mlp::FeedForward,
    norm::{LayerNorm, NormConfig},
};

use crate::cross::CrossModalAttention;

/// Capability shared by the transforms a residual block can wrap: apply to
/// a primary stream, optionally with a secondary query stream.
pub trait FusionTransform: Send + Sync {
    /// Feature width the transform consumes.
    fn input_dim(&self) -> usize;

    /// Feature width the transform produces.
    fn output_dim(&self) -> usize;

    /// Whether the transform needs the secondary query stream.
    fn requires_query(&self) -> bool;

    /// Applies the transform to `stream`, with `query` present if and only
    /// if [`FusionTransform::requires_query`] holds.
    fn forward(
        &self,
        stream: &Tensor,
        query: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor>;
}

impl FusionTransform for CrossModalAttention {
    fn input_dim(&self) -> usize {
        self.d_model()
    }

    fn output_dim(&self) -> usize {
        self.d_model()
    }

    fn requires_query(&self) -> bool {
        true
    }

    fn forward(
        &self,
        stream: &Tensor,
        query: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let query = query.ok_or_else(|| {
            Error::Msg("cross-attention transform requires a query stream".into())
        })?;
        CrossModalAttention::forward(self, stream, query, policy)
    }
}

impl FusionTransform for FeedForward {
    fn input_dim(&self) -> usize {
        self.config().input_dim
    }

    fn output_dim(&self) -> usize {
        self.config().output_dim
    }

    fn requires_query(&self) -> bool {
        false
    }

    fn forward(
        &self,
        stream: &Tensor,
        query: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        if query.is_some() {
            return Err(Error::Msg(
                "feed-forward transform does not accept a query stream".into(),
            ));
        }
        FeedForward::forward(self, stream, policy)
    }
}

/// Residual + normalization wrapper around a single inner transform.
pub struct ResidualBlock {
    inner: Box<dyn FusionTransform>,
    norm: LayerNorm,
    skip: Option<Linear>,
    prenorm: bool,
}

impl std::fmt::Debug for ResidualBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidualBlock")
            .field("input_dim", &self.inner.input_dim())
            .field("output_dim", &self.inner.output_dim())
            .field("prenorm", &self.prenorm)
            .field("projected_skip", &self.skip.is_some())
            .finish()
    }
}

impl ResidualBlock {
    /// Wraps `inner` with a norm sized to its output width. The skip
    /// projection is created only when the inner transform changes the
    /// feature width, a decision fixed here at construction.
    pub fn new(
        inner: Box<dyn FusionTransform>,
        prenorm: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let norm = LayerNorm::with_identity_init(
            NormConfig::new(inner.output_dim()),
            device,
            dtype,
        )?;
        let skip = if inner.input_dim() != inner.output_dim() {
            let mut config = LinearConfig::new(inner.input_dim(), inner.output_dim());
            config.bias = false;
            Some(Linear::with_init(
                config,
                &LinearInit::XavierUniform,
                device,
                dtype,
            )?)
        } else {
            None
        };
        Ok(Self {
            inner,
            norm,
            skip,
            prenorm,
        })
    }

    /// Feature width of the block's output.
    pub fn output_dim(&self) -> usize {
        self.inner.output_dim()
    }

    /// Runs the wrapped transform and applies the residual/norm ordering.
    ///
    /// `x` is both the inner transform's primary stream (the attention
    /// context when the inner is attention) and the residual path; `query`
    /// must be present if and only if the inner transform requires it.
    pub fn forward(
        &self,
        x: &Tensor,
        query: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        if query.is_some() != self.inner.requires_query() {
            return Err(Error::Msg(if self.inner.requires_query() {
                "residual block wraps attention and requires a query stream".into()
            } else {
                "residual block wraps a feed-forward transform and accepts no query stream".into()
            }));
        }

        let branch = self.inner.forward(x, query, policy)?;
        let residual = match &self.skip {
            Some(projection) => projection.forward(x, policy)?,
            None => x.clone(),
        };
        checks::expect_shape("residual.branch", &branch, residual.dims())?;

        let branch = policy.cast_for_matmul(&branch)?;
        let residual = policy.cast_for_matmul(&residual)?;
        if self.prenorm {
            let normed = self.norm.forward(&branch, policy)?;
            let combined = residual.add(&policy.cast_for_matmul(&normed)?)?;
            policy.cast_to_storage(&combined)
        } else {
            let sum = policy.cast_to_storage(&residual.add(&branch)?)?;
            self.norm.forward(&sum, policy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::ops;
    use layers::mlp::FeedForwardConfig;

    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    fn identity_norm_reference(input: &Tensor, hidden: usize) -> Result<Tensor> {
        let device = input.device();
        let weight = Tensor::ones((hidden,), DType::F32, device)?;
        let bias = Tensor::zeros((hidden,), DType::F32, device)?;
        ops::layer_norm(input, &weight, &bias, 1e-5)
    }

    #[test]
    fn postnorm_matches_formula_exactly() -> Result<()> {
        let device = Device::Cpu;
        let ff = FeedForward::with_init(
            FeedForwardConfig::new(8, 16, 8),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let reference_ff = ff.clone();
        let block = ResidualBlock::new(Box::new(ff), false, &device, DType::F32)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let out = block.forward(&x, None, &policy())?;

        let branch = reference_ff.forward(&x, &policy())?;
        let expected = identity_norm_reference(&x.add(&branch)?, 8)?;
        let diff = out.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5, "post-norm deviates by {diff}");
        Ok(())
    }

    #[test]
    fn prenorm_matches_formula_exactly() -> Result<()> {
        let device = Device::Cpu;
        let ff = FeedForward::with_init(
            FeedForwardConfig::new(8, 16, 8),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let reference_ff = ff.clone();
        let block = ResidualBlock::new(Box::new(ff), true, &device, DType::F32)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let out = block.forward(&x, None, &policy())?;

        // Residual adds the un-normalized x; the norm applies to the inner
        // output only.
        let branch = reference_ff.forward(&x, &policy())?;
        let expected = x.add(&identity_norm_reference(&branch, 8)?)?;
        let diff = out.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5, "pre-norm deviates by {diff}");
        Ok(())
    }

    #[test]
    fn orderings_disagree_numerically() -> Result<()> {
        let device = Device::Cpu;
        let build = |prenorm| -> Result<(ResidualBlock, FeedForward)> {
            let ff = FeedForward::with_init(
                FeedForwardConfig::new(4, 8, 4),
                &LinearInit::XavierUniform,
                &device,
                DType::F32,
            )?;
            let clone = ff.clone();
            Ok((
                ResidualBlock::new(Box::new(ff), prenorm, &device, DType::F32)?,
                clone,
            ))
        };
        let (post_block, post_ff) = build(false)?;
        let x = Tensor::randn(0f32, 1.0, (1, 2, 4), &device)?;

        // Rebuild a pre-norm block around identical weights.
        let pre_block = ResidualBlock::new(Box::new(post_ff), true, &device, DType::F32)?;
        let post = post_block.forward(&x, None, &policy())?;
        let pre = pre_block.forward(&x, None, &policy())?;
        let diff = post.sub(&pre)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff > 1e-4);
        Ok(())
    }

    #[test]
    fn attention_inner_requires_query() -> Result<()> {
        let device = Device::Cpu;
        let attn = CrossModalAttention::new(8, 2, None, &device, DType::F32)?;
        let block = ResidualBlock::new(Box::new(attn), false, &device, DType::F32)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        assert!(block.forward(&x, None, &policy()).is_err());
        let q = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        let out = block.forward(&x, Some(&q), &policy())?;
        assert_eq!(out.dims(), &[1, 4, 8]);
        Ok(())
    }

    #[test]
    fn feed_forward_inner_rejects_query() -> Result<()> {
        let device = Device::Cpu;
        let ff = FeedForward::with_init(
            FeedForwardConfig::new(8, 16, 8),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let block = ResidualBlock::new(Box::new(ff), false, &device, DType::F32)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        let q = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        assert!(block.forward(&x, Some(&q), &policy()).is_err());
        Ok(())
    }

    #[test]
    fn width_changing_inner_gets_projected_skip() -> Result<()> {
        let device = Device::Cpu;
        let ff = FeedForward::with_init(
            FeedForwardConfig::new(16, 32, 8),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let block = ResidualBlock::new(Box::new(ff), false, &device, DType::F32)?;
        assert_eq!(block.output_dim(), 8);
        let x = Tensor::randn(0f32, 1.0, (2, 4, 16), &device)?;
        let out = block.forward(&x, None, &policy())?;
        assert_eq!(out.dims(), &[2, 4, 8]);
        Ok(())
    }
}
