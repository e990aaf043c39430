//! CPU renderer that evaluates programs from their stage metadata.
//!
//! WGSL is never executed here. Instead every effect registers a kernel, a
//! Rust closure mirroring its `apply` (or `prepass`) function, and the
//! renderer walks a program's stages the same way the synthesized `fs` does:
//! one running color, blended after every stage with
//! [`BlendFunction::apply`](crate::BlendFunction::apply).
//!
//! Sampling is nearest-texel and targets store `f32` texels regardless of
//! their declared format.
//!
//! ```
//! use glam::Vec4;
//! use hoplite_fx::renderer::software::{Image, ImageHandle, SoftwareRenderer};
//!
//! let mut renderer = SoftwareRenderer::new();
//! renderer.register_kernel("invert", |k| (Vec4::ONE - k.color).with_w(k.color.w));
//!
//! let scene = ImageHandle::new(Image::filled(4, 4, Vec4::new(0.25, 0.5, 0.75, 1.0)));
//! assert_eq!(scene.size(), (4, 4));
//! ```

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use glam::{Vec2, Vec4};

use super::{Binding, Draw, FrameUniforms, Renderer, RendererError};
use crate::effect::EffectId;
use crate::synth::{CompiledProgram, ProgramRole, StageOutput, TextureSource};
use crate::target_pool::TargetDescriptor;

/// A CPU image of linear RGBA texels, row-major from the top-left.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Vec4>,
}

impl Image {
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, Vec4::ZERO)
    }

    pub fn filled(width: u32, height: u32, color: Vec4) -> Self {
        Self {
            width,
            height,
            pixels: vec![color; (width * height) as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> Vec4) -> Self {
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Vec4 {
        self.pixels[(y * self.width + x) as usize]
    }

    /// Nearest-texel sample with clamp-to-edge addressing.
    pub fn sample(&self, uv: Vec2) -> Vec4 {
        if self.pixels.is_empty() {
            return Vec4::ZERO;
        }
        let texel =
            |v: f32, size: u32| ((v * size as f32).floor() as i64).clamp(0, size as i64 - 1) as u32;
        self.pixel(texel(uv.x, self.width), texel(uv.y, self.height))
    }
}

/// UV of the center of pixel `(x, y)`, matching `pos.xy / frame.resolution`
/// in the synthesized fragment stage.
fn texel_center(x: u32, y: u32, width: u32, height: u32) -> Vec2 {
    Vec2::new(
        (x as f32 + 0.5) / width as f32,
        (y as f32 + 0.5) / height as f32,
    )
}

/// Shared, mutable image. Used for both pool targets and caller-supplied
/// views.
#[derive(Debug, Clone)]
pub struct ImageHandle(Rc<RefCell<Image>>);

impl ImageHandle {
    pub fn new(image: Image) -> Self {
        Self(Rc::new(RefCell::new(image)))
    }

    pub fn borrow(&self) -> Ref<'_, Image> {
        self.0.borrow()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Image {
        self.0.borrow().clone()
    }

    pub fn size(&self) -> (u32, u32) {
        let image = self.0.borrow();
        (image.width, image.height)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Vec4 {
        self.0.borrow().pixel(x, y)
    }

    pub fn ptr_eq(&self, other: &ImageHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Arguments passed to a kernel for one texel.
#[derive(Clone, Copy)]
pub struct KernelInput<'a> {
    /// Running color entering the stage. For prepasses, the input texel.
    pub color: Vec4,
    pub uv: Vec2,
    pub frame: FrameUniforms,
    /// The effect's uniforms in declaration order.
    pub params: &'a [Vec4],
    input: &'a Image,
    depth: Option<&'a Image>,
    velocity: Option<&'a Image>,
    custom: Option<&'a Image>,
}

impl KernelInput<'_> {
    pub fn param(&self, index: usize) -> Vec4 {
        self.params.get(index).copied().unwrap_or(Vec4::ZERO)
    }

    pub fn read_input(&self, uv: Vec2) -> Vec4 {
        self.input.sample(uv)
    }

    pub fn read_depth(&self, uv: Vec2) -> f32 {
        self.depth.map_or(0.0, |d| d.sample(uv).x)
    }

    pub fn read_velocity(&self, uv: Vec2) -> Vec2 {
        self.velocity.map_or(Vec2::ZERO, |v| v.sample(uv).truncate().truncate())
    }

    pub fn read_custom(&self, uv: Vec2) -> Vec4 {
        self.custom.map_or(Vec4::ZERO, |c| c.sample(uv))
    }
}

type Kernel = Box<dyn Fn(&KernelInput<'_>) -> Vec4>;

/// A pool target: an image plus the bytes it counts against the budget.
#[derive(Debug)]
pub struct SoftwareTarget {
    pub image: ImageHandle,
    bytes: u64,
}

#[derive(Debug)]
pub struct SoftwareProgram {
    pub label: String,
}

/// What a draw did, for inspection in tests.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub label: String,
    pub role: ProgramRole,
    pub members: Vec<EffectId>,
    pub frame: FrameUniforms,
}

#[derive(Default)]
pub struct SoftwareRenderer {
    kernels: HashMap<EffectId, Kernel>,
    prepass_kernels: HashMap<EffectId, Kernel>,
    memory_budget: Option<u64>,
    allocated: u64,
    live_targets: usize,
    live_programs: usize,
    compiles: usize,
    frame_open: bool,
    draws: Vec<DrawRecord>,
}

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail target allocations once `bytes` are in use.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    pub fn set_memory_budget(&mut self, bytes: Option<u64>) {
        self.memory_budget = bytes;
    }

    pub fn register_kernel(
        &mut self,
        effect: impl Into<EffectId>,
        kernel: impl Fn(&KernelInput<'_>) -> Vec4 + 'static,
    ) {
        self.kernels.insert(effect.into(), Box::new(kernel));
    }

    pub fn register_prepass_kernel(
        &mut self,
        effect: impl Into<EffectId>,
        kernel: impl Fn(&KernelInput<'_>) -> Vec4 + 'static,
    ) {
        self.prepass_kernels.insert(effect.into(), Box::new(kernel));
    }

    pub fn live_targets(&self) -> usize {
        self.live_targets
    }

    pub fn live_programs(&self) -> usize {
        self.live_programs
    }

    /// Programs compiled since creation.
    pub fn compiles(&self) -> usize {
        self.compiles
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    /// Draws of the most recent frame, in submission order.
    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    fn image<'a>(binding: &'a Binding<'_, Self>) -> &'a ImageHandle {
        match binding {
            Binding::Target(target) => &target.image,
            Binding::External(view) => view,
        }
    }

    fn missing_kernel(effect: &EffectId, what: &str) -> String {
        format!("no {what} kernel registered for effect '{effect}'")
    }
}

impl Renderer for SoftwareRenderer {
    type Target = SoftwareTarget;
    type View = ImageHandle;
    type Program = SoftwareProgram;

    fn create_target(&mut self, descriptor: &TargetDescriptor) -> Result<SoftwareTarget, RendererError> {
        let bytes = descriptor.byte_size();
        if let Some(budget) = self.memory_budget {
            if self.allocated + bytes > budget {
                return Err(RendererError::OutOfMemory(format!(
                    "{} needs {bytes} bytes, {} of {budget} in use",
                    descriptor.label, self.allocated
                )));
            }
        }
        self.allocated += bytes;
        self.live_targets += 1;
        Ok(SoftwareTarget {
            image: ImageHandle::new(Image::new(descriptor.width, descriptor.height)),
            bytes,
        })
    }

    fn release_target(&mut self, target: SoftwareTarget) {
        self.allocated = self.allocated.saturating_sub(target.bytes);
        self.live_targets = self.live_targets.saturating_sub(1);
    }

    fn compile(&mut self, program: &CompiledProgram) -> Result<SoftwareProgram, RendererError> {
        match &program.role {
            ProgramRole::Prepass(effect) if !self.prepass_kernels.contains_key(effect) => {
                return Err(RendererError::Compile(Self::missing_kernel(effect, "prepass")));
            }
            ProgramRole::Main => {
                let missing = program
                    .stages
                    .iter()
                    .filter(|s| s.output != StageOutput::Nothing)
                    .find(|s| !self.kernels.contains_key(&s.effect));
                if let Some(stage) = missing {
                    return Err(RendererError::Compile(Self::missing_kernel(&stage.effect, "effect")));
                }
            }
            _ => {}
        }
        self.compiles += 1;
        self.live_programs += 1;
        Ok(SoftwareProgram {
            label: program.label.clone(),
        })
    }

    fn release_program(&mut self, _program: SoftwareProgram) {
        self.live_programs = self.live_programs.saturating_sub(1);
    }

    fn begin_frame(&mut self) -> Result<(), RendererError> {
        if self.frame_open {
            return Err(RendererError::Draw("frame already open".into()));
        }
        self.frame_open = true;
        self.draws.clear();
        Ok(())
    }

    fn draw(&mut self, draw: &Draw<'_, Self>) -> Result<(), RendererError> {
        if !self.frame_open {
            return Err(RendererError::Draw(format!("{}: no open frame", draw.label)));
        }
        let program = draw.compiled;

        // snapshot inputs so the output can be borrowed mutably
        let mut sampled: HashMap<u32, Image> = HashMap::new();
        for texture in &draw.textures {
            sampled.insert(texture.binding, Self::image(&texture.texture).snapshot());
        }
        let bound = |source: TextureSource| {
            program
                .texture(&source)
                .and_then(|slot| sampled.get(&slot.binding))
        };
        let input = bound(TextureSource::Input)
            .ok_or_else(|| RendererError::Draw(format!("{}: input not bound", draw.label)))?;
        let depth = bound(TextureSource::Depth);
        let velocity = bound(TextureSource::Velocity);

        let params: Vec<Vec4> = draw.params.iter().map(|p| Vec4::from_array(*p)).collect();
        let slot = |i: usize| params.get(i).copied().unwrap_or(Vec4::ZERO);
        let stage_params = |slots: &[usize]| -> Vec<Vec4> { slots.iter().map(|&i| slot(i)).collect() };

        let output = Self::image(&draw.output);
        let (width, height) = output.size();
        let mut color_out = Vec::with_capacity((width * height) as usize);
        let mut side_out: Vec<Vec<Vec4>> = vec![Vec::new(); program.side_outputs.len()];

        for y in 0..height {
            for x in 0..width {
                let uv = texel_center(x, y, width, height);
                let mut color = input.sample(uv);
                let base = KernelInput {
                    color,
                    uv,
                    frame: draw.frame,
                    params: &[],
                    input,
                    depth,
                    velocity,
                    custom: None,
                };

                match &program.role {
                    ProgramRole::Passthrough => {}
                    ProgramRole::Prepass(effect) => {
                        let kernel = self.prepass_kernels.get(effect).ok_or_else(|| {
                            RendererError::Draw(Self::missing_kernel(effect, "prepass"))
                        })?;
                        let uniforms = program
                            .stages
                            .first()
                            .map(|s| stage_params(&s.uniform_slots))
                            .unwrap_or_default();
                        color = kernel(&KernelInput {
                            params: &uniforms,
                            ..base
                        });
                    }
                    ProgramRole::Main => {
                        for stage in &program.stages {
                            if stage.output == StageOutput::Nothing {
                                continue;
                            }
                            let kernel = self.kernels.get(&stage.effect).ok_or_else(|| {
                                RendererError::Draw(Self::missing_kernel(&stage.effect, "effect"))
                            })?;
                            let uniforms = stage_params(&stage.uniform_slots);
                            let result = kernel(&KernelInput {
                                color,
                                params: &uniforms,
                                custom: stage.custom_binding.and_then(|b| sampled.get(&b)),
                                ..base
                            });

                            match stage.output {
                                StageOutput::Color => {
                                    color = stage.blend.apply(color, result, slot(stage.opacity_slot).x);
                                }
                                StageOutput::Side(cap) => {
                                    if let Some(i) = program.side_outputs.iter().position(|c| *c == cap) {
                                        side_out[i].push(result);
                                    }
                                }
                                StageOutput::Nothing => {}
                            }
                        }
                    }
                }
                color_out.push(color);
            }
        }

        output.0.borrow_mut().pixels = color_out;
        for (binding, pixels) in draw.side_outputs.iter().zip(side_out) {
            let target = Self::image(binding);
            let mut image = target.0.borrow_mut();
            if pixels.len() == image.pixels.len() {
                image.pixels = pixels;
            } else {
                return Err(RendererError::Draw(format!(
                    "{}: side output size does not match the pass output",
                    draw.label
                )));
            }
        }

        self.draws.push(DrawRecord {
            label: draw.label.to_string(),
            role: program.role.clone(),
            members: program.members().cloned().collect(),
            frame: draw.frame,
        });
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), RendererError> {
        if !self.frame_open {
            return Err(RendererError::Draw("no open frame".into()));
        }
        self.frame_open = false;
        Ok(())
    }
}
