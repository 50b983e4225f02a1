//! Multi-head cross-modal attention module.
//!
//! One stream supplies keys and values (the *context*), the other supplies
//! queries. The context passes through a single fused projection of width
//! `2 * d_model` that is narrowed into K and V; the query has its own
//! projection. Heads are split off the feature axis, scored by the exact
//! kernel, merged back, and passed through a final output projection.

use candle_core::{bail, DType, Device, Error, Result, Tensor};

use attention::{Attention, Config as AttentionConfig, ExactAttention};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Cross-attention from a query stream over a key/value stream.
#[derive(Debug)]
pub struct CrossModalAttention {
    d_model: usize,
    heads: usize,
    head_dim: usize,
    q_proj: Linear,
    kv_proj: Linear,
    out_proj: Linear,
    kernel: ExactAttention,
    kernel_config: AttentionConfig,
}

impl CrossModalAttention {
    /// Builds the module with freshly initialised projections on `device`.
    ///
    /// `d_model % num_heads == 0` is assumed to have been checked by the
    /// caller's configuration validation; it is re-checked here so the
    /// module stands on its own.
    pub fn new(
        d_model: usize,
        num_heads: usize,
        dropout_p: Option<f32>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(Error::Msg(format!(
                "d_model ({d_model}) must be divisible by num_heads ({num_heads})"
            )));
        }

        let q_proj = Linear::with_init(
            LinearConfig::new(d_model, d_model),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;

        let mut kv_config = LinearConfig::new(d_model, d_model);
        kv_config.fused_projections = 2;
        let kv_proj = Linear::with_init(kv_config, &LinearInit::XavierUniform, device, dtype)?;

        let out_proj = Linear::with_init(
            LinearConfig::new(d_model, d_model),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;

        Ok(Self {
            d_model,
            heads: num_heads,
            head_dim: d_model / num_heads,
            q_proj,
            kv_proj,
            out_proj,
            kernel: ExactAttention::new(),
            kernel_config: AttentionConfig {
                dropout_p,
            },
        })
    }

    /// Shared feature width of both streams.
    pub fn d_model(&self) -> usize {
        self.d_model
    }

    fn expand_to_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let [batch, seq, _] = match tensor.dims() {
            [b, s, h] => [*b, *s, *h],
            dims => bail!("attention input expected [batch, seq, hidden] got {dims:?}"),
        };
        let reshaped = tensor.reshape((batch, seq, self.heads, self.head_dim))?;
        reshaped.permute((0, 2, 1, 3))?.contiguous()
    }

    fn merge_from_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let dims = tensor.dims();
        if dims.len() != 4 {
            bail!("attention output expected [batch, heads, seq, head_dim] got {dims:?}");
        }
        let batch = dims[0];
        let seq = dims[2];
        let permuted = tensor.permute((0, 2, 1, 3))?.contiguous()?;
        permuted.reshape((batch, seq, self.d_model))
    }

    /// Computes cross-attention of `query` over `context`.
    ///
    /// Both arguments are `(batch, seq, d_model)`; they must share batch
    /// size and device. The output is `(batch, query_seq, d_model)`.
    pub fn forward(
        &self,
        context: &Tensor,
        query: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("cross_attention.context", context, self.d_model)?;
        checks::expect_batch_seq_hidden("cross_attention.query", query, self.d_model)?;
        checks::expect_same_device(
            "cross_attention.context",
            context,
            "cross_attention.query",
            query,
        )?;
        let context_batch = context.dims()[0];
        let query_batch = query.dims()[0];
        if context_batch != query_batch {
            return Err(Error::Msg(format!(
                "cross_attention: context batch {context_batch} does not match query batch {query_batch}"
            )));
        }

        let q = self.q_proj.forward(query, policy)?;
        let kv = self.kv_proj.forward(context, policy)?;
        let k = kv.narrow(2, 0, self.d_model)?;
        let v = kv.narrow(2, self.d_model, self.d_model)?;

        let q_heads = self.expand_to_heads(&q)?;
        let k_heads = self.expand_to_heads(&k)?;
        let v_heads = self.expand_to_heads(&v)?;

        let attended = self
            .kernel
            .attend(&q_heads, &k_heads, &v_heads, &self.kernel_config)
            .map_err(|e| Error::Msg(e.to_string()))?;
        let merged = self.merge_from_heads(&attended)?;
        self.out_proj.forward(&merged, policy)
    }
}
