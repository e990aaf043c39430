//! The renderer seam.
//!
//! The composer never talks to a graphics API directly. It hands compiled
//! programs and target bindings to a [`Renderer`], which executes full-screen
//! draws and reports failures. Two implementations ship with the crate:
//!
//! - [`WgpuRenderer`]: records passes into one wgpu command encoder per frame.
//! - [`SoftwareRenderer`]: evaluates programs on the CPU from their stage
//!   metadata. Used for tests and headless tooling.

pub mod software;
mod wgpu_backend;

pub use software::SoftwareRenderer;
pub use wgpu_backend::{WgpuProgram, WgpuRenderer, WgpuTarget, WgpuView};

use crate::synth::CompiledProgram;
use crate::target_pool::TargetDescriptor;

/// Failures reported by a renderer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RendererError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("shader compilation failed: {0}")]
    Compile(String),

    #[error("draw failed: {0}")]
    Draw(String),

    #[error("device error: {0}")]
    Device(String),
}

/// Per-draw uniforms at binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameUniforms {
    pub resolution: [f32; 2],
    pub time: f32,
    pub delta_time: f32,
}

/// A texture handed to a draw, either pool-owned or supplied by the caller.
pub enum Binding<'a, R: Renderer + ?Sized> {
    Target(&'a R::Target),
    External(&'a R::View),
}

impl<R: Renderer + ?Sized> Clone for Binding<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: Renderer + ?Sized> Copy for Binding<'_, R> {}

/// A sampled texture at a binding slot.
pub struct BoundTexture<'a, R: Renderer + ?Sized> {
    pub binding: u32,
    pub texture: Binding<'a, R>,
}

/// One full-screen draw.
pub struct Draw<'a, R: Renderer + ?Sized> {
    pub label: &'a str,
    pub program: &'a R::Program,
    pub compiled: &'a CompiledProgram,
    pub frame: FrameUniforms,
    /// One `vec4f` per parameter slot of `compiled`.
    pub params: &'a [[f32; 4]],
    pub textures: Vec<BoundTexture<'a, R>>,
    pub output: Binding<'a, R>,
    /// Side outputs in `@location(1..)` order.
    pub side_outputs: Vec<Binding<'a, R>>,
}

/// Scene buffers and the visible output for one frame.
///
/// The composer never allocates these; they belong to whoever rendered the
/// scene.
pub struct FrameInput<'a, V> {
    pub color: &'a V,
    pub depth: Option<&'a V>,
    pub velocity: Option<&'a V>,
    pub output: &'a V,
}

impl<'a, V> FrameInput<'a, V> {
    pub fn new(color: &'a V, output: &'a V) -> Self {
        Self {
            color,
            depth: None,
            velocity: None,
            output,
        }
    }

    pub fn with_depth(mut self, depth: &'a V) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_velocity(mut self, velocity: &'a V) -> Self {
        self.velocity = Some(velocity);
        self
    }
}

/// Executes full-screen draws for the composer.
///
/// All methods are called from the thread that owns the composer. Within a
/// frame the call order is `begin_frame`, any number of `draw`s, then
/// `end_frame`.
pub trait Renderer {
    /// A render target owned by the composer's pool.
    type Target;
    /// A texture supplied by the caller (scene buffers, the screen).
    type View;
    /// A compiled program.
    type Program;

    fn create_target(&mut self, descriptor: &TargetDescriptor) -> Result<Self::Target, RendererError>;

    fn release_target(&mut self, target: Self::Target);

    fn compile(&mut self, program: &CompiledProgram) -> Result<Self::Program, RendererError>;

    fn release_program(&mut self, program: Self::Program);

    fn begin_frame(&mut self) -> Result<(), RendererError>;

    fn draw(&mut self, draw: &Draw<'_, Self>) -> Result<(), RendererError>;

    fn end_frame(&mut self) -> Result<(), RendererError>;
}
