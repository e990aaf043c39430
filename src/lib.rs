//! # Hoplite FX
//!
//! **A post-processing composer that turns an effect chain into the fewest
//! full-screen passes it can.**
//!
//! Describe each effect as a WGSL fragment plus a few flags. The composer
//! merges adjacent compatible effects into one synthesized shader, threads a
//! single running color through them, and ping-pongs between two offscreen
//! targets only where a pass boundary is unavoidable.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hoplite_fx::*;
//!
//! fn main() -> Result<()> {
//!     let gpu = GpuContext::headless().map_err(|e| ComposerError::Resource(e.to_string()))?;
//!     let mut composer = Composer::new(
//!         WgpuRenderer::new(&gpu),
//!         ComposerConfig::new()
//!             .size(1280, 720)
//!             .limits(gpu.shader_limits()),
//!     );
//!
//!     composer.add_effect(
//!         EffectDescriptor::new(
//!             "tint",
//!             "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color * vec4f(params.tint, 1.0); }",
//!         )
//!         .with_uniform("tint", [1.0, 0.9, 0.8]),
//!     )?;
//!     composer.add_effect(
//!         EffectDescriptor::new(
//!             "grain",
//!             "fn apply(color: vec4f, uv: vec2f) -> vec4f {
//!                 let n = fract(sin(dot(uv, vec2f(12.9898, 78.233)) + frame.time) * 43758.5453);
//!                 return vec4f(color.rgb + (n - 0.5) * 0.04, color.a);
//!             }",
//!         )
//!         .with_blend(BlendFunction::Add)
//!         .with_opacity(0.5),
//!     )?;
//!
//!     // Both effects share one program: a single draw per frame.
//!     # let (scene, screen): (WgpuView, WgpuView) = unimplemented!();
//!     composer.render(1.0 / 60.0, &FrameInput::new(&scene, &screen))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Philosophy
//!
//! - **Effects are data** - An [`EffectDescriptor`] is a plain record. The
//!   planner only ever looks at its capability and constraint flags.
//! - **Merge by default** - Adjacent effects share a program unless a flag or
//!   a shader limit says otherwise.
//! - **Nothing hidden** - Targets live in an explicitly owned pool, resizes
//!   are applied between frames, and every failure is a [`ComposerError`].
//! - **Bring your own backend** - The [`Renderer`] trait is the only seam to
//!   the GPU. [`WgpuRenderer`] draws with wgpu, [`SoftwareRenderer`] runs the
//!   same plans on the CPU.

pub mod composer;
pub mod config;
pub mod effect;
pub mod error;
mod gpu;
pub mod planner;
pub mod renderer;
pub mod scheduler;
pub mod synth;
pub mod target_pool;

pub use composer::{CompileFailure, Composer, FrameStats};
pub use config::{ComposerConfig, ShaderLimits};
pub use effect::{
    BlendFunction, Capabilities, CustomTarget, EffectDescriptor, EffectId, MergeConstraints,
    UniformKind, UniformValue,
};
pub use error::{ComposerError, Result};
pub use gpu::GpuContext;
pub use planner::{Group, GroupKind, MergePlanner};
pub use renderer::{
    FrameInput, FrameUniforms, Renderer, RendererError, SoftwareRenderer, WgpuProgram,
    WgpuRenderer, WgpuTarget, WgpuView,
};
pub use scheduler::{Pass, PassKind, PassScheduler, Schedule, TargetRef};
pub use synth::{CompiledProgram, ShaderSynthesizer, SynthesisError};
pub use target_pool::{RenderTargetPool, TargetFormat};

// Re-export glam vector types used by the software renderer
pub use glam::{Vec2, Vec4};
