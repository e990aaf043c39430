//! Composer configuration.

use crate::target_pool::TargetFormat;

/// Per-program limits the planner and synthesizer must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderLimits {
    /// Sampled textures per program, including the pass input.
    pub max_textures: u32,
    /// `vec4f` slots in the per-group parameter buffer.
    pub max_uniform_slots: u32,
    /// Upper bound on naga expressions across all functions of a program.
    /// Only enforced when shader validation is enabled.
    pub max_expressions: usize,
}

impl Default for ShaderLimits {
    fn default() -> Self {
        Self {
            max_textures: 16,
            max_uniform_slots: 1024,
            max_expressions: 16 * 1024,
        }
    }
}

impl ShaderLimits {
    /// Derive texture and uniform limits from a device's limits.
    pub fn from_wgpu(limits: &wgpu::Limits) -> Self {
        Self {
            max_textures: limits.max_sampled_textures_per_shader_stage,
            max_uniform_slots: limits.max_uniform_buffer_binding_size / 16,
            ..Self::default()
        }
    }
}

/// Configuration for a [`Composer`](crate::Composer).
///
/// # Example
/// ```
/// use hoplite_fx::{ComposerConfig, TargetFormat};
///
/// let config = ComposerConfig::new()
///     .label("Main Composer")
///     .size(1280, 720)
///     .intermediate_format(TargetFormat::Rgba8Unorm)
///     .max_textures(8);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ComposerConfig {
    /// Prefix for render target and program labels.
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// Format of ping-pong, custom and provided targets.
    pub intermediate_format: TargetFormat,
    /// Parse and validate synthesized WGSL with naga before handing it to
    /// the renderer. Required for expression limits.
    pub validate_shaders: bool,
    pub limits: ShaderLimits,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            label: "Composer".to_string(),
            width: 800,
            height: 600,
            intermediate_format: TargetFormat::Rgba16Float,
            validate_shaders: true,
            limits: ShaderLimits::default(),
        }
    }
}

impl ComposerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn intermediate_format(mut self, format: TargetFormat) -> Self {
        self.intermediate_format = format;
        self
    }

    pub fn validate_shaders(mut self, validate: bool) -> Self {
        self.validate_shaders = validate;
        self
    }

    pub fn limits(mut self, limits: ShaderLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn max_textures(mut self, max: u32) -> Self {
        self.limits.max_textures = max;
        self
    }

    pub fn max_uniform_slots(mut self, max: u32) -> Self {
        self.limits.max_uniform_slots = max;
        self
    }

    pub fn max_expressions(mut self, max: usize) -> Self {
        self.limits.max_expressions = max;
        self
    }
}
