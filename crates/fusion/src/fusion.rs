//! Modality-aware fusion of two aligned streams.
//!
//! The directional topology is resolved once at construction into a
//! pre-built call graph; `fuse` never re-examines the mode beyond selecting
//! the wiring it was built with. Placement moves are explicit and ordered:
//! each stream is first relocated to its assigned placement, and a query is
//! relocated to its attention block's home device before the pass runs.
//! Transfers never alter values.

use candle_core::{Device, Error, Result, Tensor, D};

use layers::{
    dtypes::PrecisionPolicy,
    linear::LinearInit,
    mlp::{FeedForward, FeedForwardConfig},
};

use crate::{
    config::{FusionConfig, FusionMode},
    cross::CrossModalAttention,
    residual::ResidualBlock,
};

/// Pre-built call graph for one directional topology.
enum Wiring {
    Bidirectional {
        x2y: ResidualBlock,
        y2x: ResidualBlock,
    },
    XToY {
        cross: ResidualBlock,
    },
    YToX {
        cross: ResidualBlock,
    },
}

/// Fuses two `(batch, seq, d_model)` modality streams into one output.
pub struct ModalityFusion {
    config: FusionConfig,
    policy: PrecisionPolicy,
    wiring: Wiring,
    ffn: ResidualBlock,
}

impl std::fmt::Debug for ModalityFusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModalityFusion")
            .field("d_model", &self.config.d_model)
            .field("num_heads", &self.config.num_heads)
            .field("mode", &self.config.mode)
            .field("prenorm", &self.config.prenorm)
            .finish()
    }
}

impl ModalityFusion {
    /// Validates `config` and assembles the mode-specific call graph.
    ///
    /// Attention blocks live on their context stream's placement: x2y on
    /// `placements[0]`, y2x on `placements[1]`. The trailing feed-forward
    /// block follows the stream it consumes.
    pub fn new(config: FusionConfig) -> Result<Self> {
        config.validate()?;
        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);

        let build_cross = |device: &Device| -> Result<ResidualBlock> {
            let attention = CrossModalAttention::new(
                config.d_model,
                config.num_heads,
                config.attn_dropout_p,
                device,
                config.dtype,
            )?;
            ResidualBlock::new(Box::new(attention), config.prenorm, device, config.dtype)
        };

        let wiring = match config.mode {
            FusionMode::Bidirectional => Wiring::Bidirectional {
                x2y: build_cross(&config.placements[0])?,
                y2x: build_cross(&config.placements[1])?,
            },
            FusionMode::XToY => Wiring::XToY {
                cross: build_cross(&config.placements[0])?,
            },
            FusionMode::YToX => Wiring::YToX {
                cross: build_cross(&config.placements[1])?,
            },
        };

        let ffn_device = match config.mode {
            FusionMode::YToX => config.placements[1].clone(),
            _ => config.placements[0].clone(),
        };
        let ffn_config = FeedForwardConfig::new(
            config.feed_forward_input_dim(),
            config.feed_forward_hidden_dim(),
            config.feed_forward_output_dim(),
        );
        let ffn = ResidualBlock::new(
            Box::new(FeedForward::with_init(
                ffn_config,
                &LinearInit::XavierUniform,
                &ffn_device,
                config.dtype,
            )?),
            config.prenorm,
            &ffn_device,
            config.dtype,
        )?;

        log::debug!(
            "fusion init mode={:?} d_model={} heads={} prenorm={} ff={}x{}->{}",
            config.mode,
            config.d_model,
            config.num_heads,
            config.prenorm,
            config.feed_forward_input_dim(),
            config.feed_forward_hidden_dim(),
            config.feed_forward_output_dim()
        );

        Ok(Self {
            config,
            policy,
            wiring,
            ffn,
        })
    }

    /// The configuration the block was built from.
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Feature width entering the trailing feed-forward block:
    /// `num_modalities * d_model` after the bidirectional concatenation,
    /// `d_model` in the single-direction modes.
    pub fn fused_width(&self) -> usize {
        self.config.feed_forward_input_dim()
    }

    fn validate_inputs(&self, x: &Tensor, y: &Tensor) -> Result<()> {
        let d_model = self.config.d_model;
        let x_dims = x.dims();
        let y_dims = y.dims();
        let (xb, xt, xd) = match x_dims {
            [b, t, d] => (*b, *t, *d),
            dims => {
                return Err(Error::Msg(format!(
                    "fuse: x expected (batch, seq, {d_model}), got {dims:?}"
                )))
            }
        };
        let (yb, yt, yd) = match y_dims {
            [b, t, d] => (*b, *t, *d),
            dims => {
                return Err(Error::Msg(format!(
                    "fuse: y expected (batch, seq, {d_model}), got {dims:?}"
                )))
            }
        };
        if xd != d_model || yd != d_model {
            return Err(Error::Msg(format!(
                "fuse: expected feature width {d_model}, got x={xd} y={yd}"
            )));
        }
        if xb != yb {
            return Err(Error::Msg(format!(
                "fuse: batch sizes differ, x={xb} y={yb}"
            )));
        }
        // The residual path adds the context stream to a query-length
        // attention output, so the fused streams must be aligned.
        if xt != yt {
            return Err(Error::Msg(format!(
                "fuse: streams must share a sequence length, x={xt} y={yt}"
            )));
        }
        Ok(())
    }

    /// Fuses the two streams per the constructed topology.
    ///
    /// Output shape is `(batch, seq, output_dim)` where `output_dim` is the
    /// trailing feed-forward block's configured output width (`d_model` by
    /// default).
    pub fn fuse(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        self.validate_inputs(x, y)?;

        let x = x.to_device(&self.config.placements[0])?;
        let y = y.to_device(&self.config.placements[1])?;

        let fused = match &self.wiring {
            Wiring::Bidirectional { x2y, y2x } => {
                let y_query = y.to_device(&self.config.placements[0])?;
                let x_to_y = x2y.forward(&x, Some(&y_query), &self.policy)?;

                let x_query = x.to_device(&self.config.placements[1])?;
                let y_to_x = y2x.forward(&y, Some(&x_query), &self.policy)?;

                let y_to_x = y_to_x.to_device(&self.config.placements[0])?;
                Tensor::cat(&[&x_to_y, &y_to_x], D::Minus1)?
            }
            Wiring::XToY { cross } => {
                let y_query = y.to_device(&self.config.placements[0])?;
                cross.forward(&x, Some(&y_query), &self.policy)?
            }
            Wiring::YToX { cross } => {
                let x_query = x.to_device(&self.config.placements[1])?;
                cross.forward(&y, Some(&x_query), &self.policy)?
            }
        };

        self.ffn.forward(&fused, None, &self.policy)
    }
}
