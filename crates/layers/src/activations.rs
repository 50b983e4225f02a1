//! Activation catalogue for the feed-forward stack.
//!
//! Activations consume tensors shaped `(batch, seq, hidden)` and return
//! tensors with identical layout. Each implementation promotes inputs to the
//! compute dtype requested by [`PrecisionPolicy`] before evaluating the
//! non-linearity, then casts the result back to the storage dtype.
//!
//! GELU uses the erf-based formula `0.5 * x * (1 + erf(x / sqrt(2)))`.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Identity function, useful for debugging or wiring custom stacks.
    Identity,
    /// GELU, the smooth non-linearity used between the two feed-forward
    /// projections.
    Gelu,
}

/// Common interface shared by elementwise activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection when wiring blocks.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Built-in activation backed by Candle kernels.
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self.kind {
            ActivationKind::Identity => policy.cast_to_storage(input),
            ActivationKind::Gelu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.gelu_erf()?)
            }
        }
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let activation = builtin(ActivationKind::Gelu);
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = activation.forward(&input, &policy)?.to_dtype(DType::F32)?;

        let reference = {
            let scaled = input.affine(1.0 / SQRT_2, 0.0)?;
            let term = scaled.erf()?;
            let one = Tensor::ones_like(&term)?;
            let inner = (one + term)?;
            input.affine(0.5, 0.0)?.broadcast_mul(&inner)?
        };

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn identity_leaves_values_untouched() -> Result<()> {
        let device = Device::Cpu;
        let activation = builtin(ActivationKind::Identity);
        let input = Tensor::from_slice(&[1.0f32, -4.0, 0.25], (3,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = activation.forward(&input, &policy)?;
        let diff = output.sub(&input)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(activation.kind(), ActivationKind::Identity);
        assert!(diff < 1e-7);
        Ok(())
    }
}
