//! Error types for the effect composer.
//!
//! Every public [`Composer`](crate::Composer) operation returns
//! [`Result`], whose error side is [`ComposerError`]. The variants follow the
//! lifecycle of a frame: descriptors are rejected up front
//! ([`Configuration`](ComposerError::Configuration)), programs can be
//! rejected when compiled ([`Compile`](ComposerError::Compile)), and
//! allocations can fail right before drawing
//! ([`Resource`](ComposerError::Resource)).

use crate::effect::EffectId;
use crate::synth::SynthesisError;

/// Errors surfaced by the composer.
#[derive(Debug, thiserror::Error)]
pub enum ComposerError {
    /// An effect descriptor is malformed or contradicts itself or the
    /// effects already registered. The composer state is unchanged.
    #[error("effect '{effect}' rejected: {reason}")]
    Configuration { effect: EffectId, reason: String },

    /// Shader synthesis failed in a way that has no fallback.
    #[error("shader synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    /// The renderer (or WGSL validation) rejected a compiled program.
    ///
    /// The affected pass is left out of the frame; everything else still draws.
    #[error("pass '{pass}' failed to compile: {message}")]
    Compile { pass: String, message: String },

    /// A render target could not be allocated, or the frame input is missing
    /// a buffer the current plan reads.
    #[error("resource error: {0}")]
    Resource(String),

    /// A draw or submit failed while the frame was being recorded.
    #[error("draw failed: {0}")]
    Draw(String),

    /// No effect with this id is registered.
    #[error("unknown effect '{0}'")]
    UnknownEffect(EffectId),

    /// The composer was disposed and can no longer be used.
    #[error("composer has been disposed")]
    Disposed,
}

impl ComposerError {
    pub(crate) fn configuration(effect: &EffectId, reason: impl Into<String>) -> Self {
        ComposerError::Configuration {
            effect: effect.clone(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ComposerError>;
