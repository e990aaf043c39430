//! Effect descriptors: the unit of composability.
//!
//! An [`EffectDescriptor`] is plain data. It carries a WGSL fragment, the
//! inputs that fragment reads, how its output is blended, and the flags
//! that restrict merging. The composer never looks past this record, so any
//! effect (blur, grading, fog, antialiasing) plugs in the same way.
//!
//! # Fragment contract
//!
//! The fragment must declare
//!
//! ```wgsl
//! fn apply(color: vec4f, uv: vec2f) -> vec4f { ... }
//! ```
//!
//! and may use the following inside it:
//!
//! | Symbol | Requires |
//! |--------|----------|
//! | `frame.resolution`, `frame.time`, `frame.delta_time` | - |
//! | `params.<name>` | a uniform declared with [`EffectDescriptor::with_uniform`] |
//! | `read_input(uv) -> vec4f` | [`MergeConstraints::CONVOLUTION`] (prepasses need nothing) |
//! | `read_depth(uv) -> f32` | [`Capabilities::DEPTH`] |
//! | `read_velocity(uv) -> vec2f` | [`Capabilities::VELOCITY`] |
//! | `read_custom(uv) -> vec4f` | [`Capabilities::CUSTOM_RENDER_TARGET`] |
//!
//! # Example
//!
//! ```
//! use hoplite_fx::{BlendFunction, EffectDescriptor};
//!
//! let vignette = EffectDescriptor::new(
//!     "vignette",
//!     r#"
//!     fn apply(color: vec4f, uv: vec2f) -> vec4f {
//!         let d = distance(uv, vec2f(0.5));
//!         return vec4f(color.rgb * (1.0 - d * params.strength), color.a);
//!     }
//!     "#,
//! )
//! .with_uniform("strength", 0.8)
//! .with_blend(BlendFunction::Normal);
//! ```

mod blend;
mod capabilities;

pub use blend::BlendFunction;
pub use capabilities::{Capabilities, MergeConstraints, UniformKind, UniformValue};

use std::fmt;
use std::sync::Arc;

use crate::config::ShaderLimits;
use crate::error::{ComposerError, Result};
use crate::synth::namespace;

/// Stable identity of a registered effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectId(Arc<str>);

impl EffectId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EffectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EffectId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&EffectId> for EffectId {
    fn from(value: &EffectId) -> Self {
        value.clone()
    }
}

/// An offscreen target owned by one effect.
///
/// Before the pass containing the owning effect runs, a prepass renders
/// `prepass_code` into this target, reading the same input the pass reads.
/// The fragment then samples the result with `read_custom(uv)`.
///
/// `prepass_code` must declare `fn prepass(uv: vec2f) -> vec4f`.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomTarget {
    /// Resolution relative to the viewport, in `(0, 1]`.
    pub scale: f32,
    pub prepass_code: String,
}

impl CustomTarget {
    pub fn new(prepass_code: impl Into<String>) -> Self {
        Self {
            scale: 1.0,
            prepass_code: prepass_code.into(),
        }
    }

    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Target size for a given viewport, never smaller than one texel.
    pub fn size_for(&self, width: u32, height: u32) -> (u32, u32) {
        let scaled = |v: u32| ((v as f32 * self.scale).round() as u32).max(1);
        (scaled(width), scaled(height))
    }
}

/// Declarative description of one post-processing effect.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectDescriptor {
    pub id: EffectId,
    pub enabled: bool,
    pub blend_function: BlendFunction,
    pub opacity: f32,
    pub fragment_code: String,
    pub required_inputs: Capabilities,
    pub provides: Capabilities,
    pub merge_constraints: MergeConstraints,
    pub uniforms: Vec<(String, UniformValue)>,
    pub custom_target: Option<CustomTarget>,
}

impl EffectDescriptor {
    /// Create an enabled, fully opaque, normally blended effect.
    pub fn new(id: impl Into<EffectId>, fragment_code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            blend_function: BlendFunction::Normal,
            opacity: 1.0,
            fragment_code: fragment_code.into(),
            required_inputs: Capabilities::COLOR,
            provides: Capabilities::empty(),
            merge_constraints: MergeConstraints::empty(),
            uniforms: Vec::new(),
            custom_target: None,
        }
    }

    pub fn with_blend(mut self, blend: BlendFunction) -> Self {
        self.blend_function = blend;
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    pub fn requires(mut self, inputs: Capabilities) -> Self {
        self.required_inputs |= inputs;
        self
    }

    pub fn providing(mut self, outputs: Capabilities) -> Self {
        self.provides |= outputs;
        self
    }

    pub fn constrained(mut self, constraints: MergeConstraints) -> Self {
        self.merge_constraints |= constraints;
        self
    }

    pub fn with_uniform(mut self, name: impl Into<String>, value: impl Into<UniformValue>) -> Self {
        self.uniforms.push((name.into(), value.into()));
        self
    }

    /// Attach an effect-owned target. Also adds
    /// [`Capabilities::CUSTOM_RENDER_TARGET`] to the required inputs.
    pub fn with_custom_target(mut self, target: CustomTarget) -> Self {
        self.custom_target = Some(target);
        self.required_inputs |= Capabilities::CUSTOM_RENDER_TARGET;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }

    /// Whether the effect emits any code at all. A `Skip` effect that provides
    /// nothing is carried through the plan as a no-op stage.
    pub fn is_noop(&self) -> bool {
        self.blend_function == BlendFunction::Skip && self.provides.is_empty()
    }

    /// Sampled textures this effect adds to a pass, excluding the shared input.
    pub(crate) fn extra_textures(&self) -> Capabilities {
        self.required_inputs
            & (Capabilities::DEPTH | Capabilities::VELOCITY | Capabilities::CUSTOM_RENDER_TARGET)
    }

    /// Uniform slots this effect occupies: opacity plus one per uniform.
    pub fn uniform_slots(&self) -> usize {
        1 + self.uniforms.len()
    }

    /// Checks the descriptor on its own: flags, values and the namespace pass
    /// over its fragment code.
    pub(crate) fn validate(&self, limits: &ShaderLimits) -> Result<()> {
        let reject = |reason: String| Err(ComposerError::configuration(&self.id, reason));

        if self.id.as_str().is_empty() {
            return reject("effect id is empty".into());
        }
        if !self.opacity.is_finite() || !(0.0..=1.0).contains(&self.opacity) {
            return reject(format!("opacity {} is outside [0, 1]", self.opacity));
        }
        if self.merge_constraints.contains(MergeConstraints::PINNED) {
            return reject("pinned both first and last".into());
        }
        if !(self.provides - Capabilities::VELOCITY).is_empty() {
            return reject(format!(
                "only VELOCITY can be provided, got {:?}",
                self.provides
            ));
        }
        if self.provides.intersects(self.required_inputs) {
            return reject("reads the same buffer it provides".into());
        }

        let wants_custom = self
            .required_inputs
            .contains(Capabilities::CUSTOM_RENDER_TARGET);
        match (&self.custom_target, wants_custom) {
            (Some(_), false) | (None, true) => {
                return reject(
                    "CUSTOM_RENDER_TARGET input and custom_target must be declared together".into(),
                );
            }
            (Some(target), true) => {
                if !target.scale.is_finite() || target.scale <= 0.0 || target.scale > 1.0 {
                    return reject(format!("custom target scale {} is outside (0, 1]", target.scale));
                }
            }
            (None, false) => {}
        }

        for (i, (name, value)) in self.uniforms.iter().enumerate() {
            if !namespace::is_identifier(name) {
                return reject(format!("uniform name '{name}' is not a WGSL identifier"));
            }
            if self.uniforms[..i].iter().any(|(n, _)| n == name) {
                return reject(format!("uniform '{name}' declared twice"));
            }
            if !value.is_finite() {
                return reject(format!("uniform '{name}' is not finite"));
            }
        }

        let textures = 1 + self.extra_textures().bits().count_ones();
        if textures > limits.max_textures {
            return reject(format!(
                "needs {textures} textures, limit is {}",
                limits.max_textures
            ));
        }
        if self.uniform_slots() > limits.max_uniform_slots as usize {
            return reject(format!(
                "needs {} uniform slots, limit is {}",
                self.uniform_slots(),
                limits.max_uniform_slots
            ));
        }

        namespace::check_fragment(self).map_err(|e| ComposerError::configuration(&self.id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPLY: &str = "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color; }";

    fn limits() -> ShaderLimits {
        ShaderLimits::default()
    }

    #[test]
    fn defaults_are_mergeable() {
        let effect = EffectDescriptor::new("tint", APPLY);
        assert!(effect.enabled);
        assert_eq!(effect.opacity, 1.0);
        assert!(effect.merge_constraints.is_empty());
        assert!(effect.validate(&limits()).is_ok());
    }

    #[test]
    fn rejects_out_of_range_opacity() {
        let effect = EffectDescriptor::new("tint", APPLY).with_opacity(1.5);
        assert!(matches!(
            effect.validate(&limits()),
            Err(ComposerError::Configuration { .. })
        ));
    }

    #[test]
    fn rejects_double_pin() {
        let effect = EffectDescriptor::new("tint", APPLY)
            .constrained(MergeConstraints::PIN_FIRST | MergeConstraints::PIN_LAST);
        assert!(effect.validate(&limits()).is_err());
    }

    #[test]
    fn rejects_custom_input_without_target() {
        let effect =
            EffectDescriptor::new("bloom", APPLY).requires(Capabilities::CUSTOM_RENDER_TARGET);
        assert!(effect.validate(&limits()).is_err());
    }

    #[test]
    fn rejects_providing_depth() {
        let effect = EffectDescriptor::new("depth_writer", APPLY)
            .with_blend(BlendFunction::Skip)
            .providing(Capabilities::DEPTH);
        assert!(effect.validate(&limits()).is_err());
    }

    #[test]
    fn rejects_duplicate_uniform() {
        let effect = EffectDescriptor::new("tint", APPLY)
            .with_uniform("amount", 1.0)
            .with_uniform("amount", 2.0);
        assert!(effect.validate(&limits()).is_err());
    }

    #[test]
    fn input_sampling_requires_convolution() {
        let sharpen = EffectDescriptor::new(
            "sharpen",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return 2.0 * color - read_input(uv); }",
        );
        assert!(matches!(
            sharpen.validate(&limits()),
            Err(ComposerError::Configuration { .. })
        ));
        let sharpen = sharpen.constrained(MergeConstraints::CONVOLUTION);
        assert!(sharpen.validate(&limits()).is_ok());
    }

    #[test]
    fn prepass_may_sample_input_freely() {
        let bloom = EffectDescriptor::new(
            "bloom",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color + read_custom(uv); }",
        )
        .with_custom_target(CustomTarget::new(
            "fn prepass(uv: vec2f) -> vec4f { return read_input(uv) * 0.5; }",
        ));
        assert!(bloom.validate(&limits()).is_ok());
    }

    #[test]
    fn custom_target_size_never_collapses() {
        let target = CustomTarget::new("").scale(0.5);
        assert_eq!(target.size_for(1280, 720), (640, 360));
        assert_eq!(target.size_for(1, 1), (1, 1));
    }
}
