//! Position-wise feed-forward blocks built on top of projections and
//! activations.
//!
//! The MLP operates on hidden states shaped `(batch, seq, input_dim)` and
//! returns `(batch, seq, output_dim)`. The first projection expands to
//! `hidden_dim`, an activation applies elementwise, then the second
//! projection contracts to the output width. Input and output widths are
//! independent so a fusion block can feed a concatenated `2 * d_model`
//! stream in and take `d_model` back out. No cross-position interaction
//! takes place.

use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    activations::{self, Activation, ActivationKind},
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration shared by feed-forward networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Incoming feature width.
    pub input_dim: usize,
    /// Width of the activation space.
    pub hidden_dim: usize,
    /// Outgoing feature width.
    pub output_dim: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
}

impl FeedForwardConfig {
    /// Creates a standard two-projection configuration.
    pub fn new(input_dim: usize, hidden_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            hidden_dim,
            output_dim,
            activation: ActivationKind::Gelu,
        }
    }
}

/// Two-layer position-wise MLP: `fc2(act(fc1(x)))`.
#[derive(Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    fc1: Linear,
    fc2: Linear,
    activation: Arc<dyn Activation>,
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("config", &self.config)
            .finish()
    }
}

impl FeedForward {
    /// Constructs a feed-forward block from pre-existing projections.
    pub fn new(config: FeedForwardConfig, fc1: Linear, fc2: Linear) -> Result<Self> {
        let activation = activations::builtin(config.activation);
        Ok(Self {
            config,
            fc1,
            fc2,
            activation,
        })
    }

    /// Builds a feed-forward block with freshly initialised projections.
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let fc1 = Linear::with_init(
            LinearConfig::new(config.input_dim, config.hidden_dim),
            init,
            device,
            dtype,
        )?;
        let fc2 = Linear::with_init(
            LinearConfig::new(config.hidden_dim, config.output_dim),
            init,
            device,
            dtype,
        )?;
        Self::new(config, fc1, fc2)
    }

    /// Configuration metadata used during block assembly.
    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Performs the forward pass through the MLP.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expanded = self.fc1.forward(hidden, policy)?;
        let activated = self.activation.forward(&expanded, policy)?;
        self.fc2.forward(&activated, policy)
    }
}
