//! Construction-time configuration for the fusion block.

use candle_core::{DType, Device, Error, Result};

/// Directional topology of the fusion block.
///
/// The direction names follow the information flow: in [`FusionMode::XToY`]
/// the `x` stream is read into `y` (query = y, context = x), and vice versa
/// for [`FusionMode::YToX`]. The mode is fixed at construction; there are no
/// runtime transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMode {
    /// Each stream attends to the other; the two results are concatenated
    /// along the feature axis, doubling the width ahead of the feed-forward
    /// block.
    Bidirectional,
    /// Single pass with query = y, context = x.
    XToY,
    /// Single pass with query = x, context = y.
    YToX,
}

/// High-level configuration for assembling a [`ModalityFusion`] block.
///
/// [`ModalityFusion`]: crate::ModalityFusion
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Shared feature width of both incoming streams.
    pub d_model: usize,
    /// Number of parallel attention heads; must divide `d_model`.
    pub num_heads: usize,
    /// Number of fused modalities. The block combines exactly two streams;
    /// the value also sizes the default feed-forward hidden width.
    pub num_modalities: usize,
    /// Feed-forward hidden width. Defaults to
    /// `2 * num_modalities * d_model` (the conventional `4 * d_model`).
    pub d_ff: Option<usize>,
    /// Output width of the trailing feed-forward block. Defaults to
    /// `d_model`.
    pub output_dim: Option<usize>,
    /// Directional topology.
    pub mode: FusionMode,
    /// Pre-norm residual blocks when `true`; post-norm (the default)
    /// otherwise.
    pub prenorm: bool,
    /// Placement assignment for the `x` and `y` streams respectively.
    pub placements: [Device; 2],
    /// Parameter storage dtype.
    pub dtype: DType,
    /// Dropout on attention weights; `None` keeps the block deterministic.
    pub attn_dropout_p: Option<f32>,
}

impl FusionConfig {
    /// Creates a configuration with post-norm residuals, CPU placements, and
    /// derived feed-forward widths.
    pub fn new(d_model: usize, num_heads: usize, mode: FusionMode) -> Self {
        Self {
            d_model,
            num_heads,
            num_modalities: 2,
            d_ff: None,
            output_dim: None,
            mode,
            prenorm: false,
            placements: [Device::Cpu, Device::Cpu],
            dtype: DType::F32,
            attn_dropout_p: None,
        }
    }

    /// Width of each attention head.
    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads
    }

    /// Hidden width of the trailing feed-forward block.
    pub fn feed_forward_hidden_dim(&self) -> usize {
        self.d_ff
            .unwrap_or(2 * self.num_modalities * self.d_model)
    }

    /// Output width of the trailing feed-forward block.
    pub fn feed_forward_output_dim(&self) -> usize {
        self.output_dim.unwrap_or(self.d_model)
    }

    /// Input width of the trailing feed-forward block, decided by the mode:
    /// the bidirectional concatenation carries `num_modalities * d_model`
    /// features, the single-direction modes carry `d_model`.
    pub fn feed_forward_input_dim(&self) -> usize {
        match self.mode {
            FusionMode::Bidirectional => self.num_modalities * self.d_model,
            FusionMode::XToY | FusionMode::YToX => self.d_model,
        }
    }

    /// Validate structural invariants. Any violation is a configuration
    /// error: construction must not complete.
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 {
            return Err(Error::Msg("d_model must be greater than zero".into()));
        }
        if self.num_heads == 0 {
            return Err(Error::Msg("num_heads must be greater than zero".into()));
        }
        if self.d_model % self.num_heads != 0 {
            return Err(Error::Msg(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model, self.num_heads
            )));
        }
        if self.num_modalities != 2 {
            return Err(Error::Msg(format!(
                "num_modalities must be 2 (the block fuses exactly two streams), got {}",
                self.num_modalities
            )));
        }
        if self.feed_forward_hidden_dim() == 0 {
            return Err(Error::Msg(
                "feed-forward hidden width must be greater than zero".into(),
            ));
        }
        if self.feed_forward_output_dim() == 0 {
            return Err(Error::Msg(
                "feed-forward output width must be greater than zero".into(),
            ));
        }
        if let Some(p) = self.attn_dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("attn_dropout_p must be in [0, 1)".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_widths_derive_from_d_model() {
        let config = FusionConfig::new(8, 2, FusionMode::Bidirectional);
        assert_eq!(config.head_dim(), 4);
        assert_eq!(config.feed_forward_hidden_dim(), 32);
        assert_eq!(config.feed_forward_output_dim(), 8);
        assert_eq!(config.feed_forward_input_dim(), 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn single_direction_keeps_d_model_input() {
        let config = FusionConfig::new(8, 2, FusionMode::XToY);
        assert_eq!(config.feed_forward_input_dim(), 8);
    }

    #[test]
    fn indivisible_heads_are_rejected() {
        let config = FusionConfig::new(10, 3, FusionMode::Bidirectional);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let mut config = FusionConfig::new(0, 1, FusionMode::XToY);
        assert!(config.validate().is_err());
        config.d_model = 8;
        config.num_heads = 0;
        assert!(config.validate().is_err());
        config.num_heads = 2;
        config.d_ff = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn modality_count_is_fixed_at_two() {
        let mut config = FusionConfig::new(8, 2, FusionMode::Bidirectional);
        config.num_modalities = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn dropout_range_is_checked() {
        let mut config = FusionConfig::new(8, 2, FusionMode::YToX);
        config.attn_dropout_p = Some(1.0);
        assert!(config.validate().is_err());
        config.attn_dropout_p = Some(0.1);
        assert!(config.validate().is_ok());
    }
}
