//! Attention kernels for the cross-modal fusion block.
//!
//! The [`core`] module defines the backend-agnostic trait, configuration,
//! and error taxonomy; [`reference`] hosts the numerically exact
//! implementation used on every backend.

pub mod core;
pub mod reference;

pub use crate::core::{Attention, AttentionError, Config};
pub use crate::reference::ExactAttention;
