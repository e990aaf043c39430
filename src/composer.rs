//! The composer: owns the effect list, the plan and the target pool, and
//! drives one frame at a time against a [`Renderer`].
//!
//! Structural changes (adding, removing, enabling, reordering, changing a
//! blend function) only mark the plan dirty. The next [`Composer::render`]
//! rebuilds it synchronously before drawing:
//!
//! ```text
//! effects ─▶ MergePlanner ─▶ ShaderSynthesizer ─▶ Renderer::compile ─▶ PassScheduler
//! ```
//!
//! Opacity and uniform values are read at the start of every frame and
//! never cause a replan.

use crate::config::ComposerConfig;
use crate::effect::{BlendFunction, EffectDescriptor, EffectId, MergeConstraints, UniformValue};
use crate::error::{ComposerError, Result};
use crate::planner::MergePlanner;
use crate::renderer::{Binding, BoundTexture, Draw, FrameInput, FrameUniforms, Renderer};
use crate::scheduler::{Pass, PassKind, PassScheduler, PassSource, Schedule, TargetRef};
use crate::synth::{CompiledProgram, ParamSource, ShaderSynthesizer, SynthesisError};
use crate::target_pool::{PoolKey, RenderTargetPool};

/// What one call to [`Composer::render`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Full-screen draws, prepasses included.
    pub draw_calls: usize,
    pub passes: usize,
    /// Whether the plan was rebuilt this frame.
    pub replanned: bool,
    pub programs_compiled: usize,
}

/// A pass left out of the schedule because its program was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    pub pass: String,
    pub message: String,
}

impl From<&CompileFailure> for ComposerError {
    fn from(failure: &CompileFailure) -> Self {
        ComposerError::Compile {
            pass: failure.pass.clone(),
            message: failure.message.clone(),
        }
    }
}

struct ProgramEntry<P> {
    compiled: CompiledProgram,
    program: P,
}

/// Orchestrates planning, synthesis and per-frame execution of effects.
///
/// # Example
///
/// ```
/// use glam::Vec4;
/// use hoplite_fx::renderer::software::{Image, ImageHandle, SoftwareRenderer};
/// use hoplite_fx::{Composer, ComposerConfig, EffectDescriptor, FrameInput};
///
/// let mut renderer = SoftwareRenderer::new();
/// renderer.register_kernel("darken", |k| k.color * 0.5);
///
/// let mut composer = Composer::new(renderer, ComposerConfig::new().size(4, 4));
/// composer.add_effect(EffectDescriptor::new(
///     "darken",
///     "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color * 0.5; }",
/// ))?;
///
/// let scene = ImageHandle::new(Image::filled(4, 4, Vec4::ONE));
/// let screen = ImageHandle::new(Image::new(4, 4));
/// let stats = composer.render(0.016, &FrameInput::new(&scene, &screen))?;
///
/// assert_eq!(stats.draw_calls, 1);
/// assert_eq!(screen.pixel(0, 0), Vec4::splat(0.5));
/// # Ok::<(), hoplite_fx::ComposerError>(())
/// ```
pub struct Composer<R: Renderer> {
    config: ComposerConfig,
    renderer: R,
    effects: Vec<EffectDescriptor>,
    pool: RenderTargetPool<R::Target>,
    programs: Vec<ProgramEntry<R::Program>>,
    schedule: Schedule,
    compile_failures: Vec<CompileFailure>,
    /// Compile error from the last replan, held until a frame is drawn.
    unreported: Option<ComposerError>,
    elapsed: f32,
    dirty: bool,
    disposed: bool,
}

impl<R: Renderer> Composer<R> {
    pub fn new(renderer: R, config: ComposerConfig) -> Self {
        let pool = RenderTargetPool::new(
            config.label.clone(),
            config.width,
            config.height,
            config.intermediate_format,
        );
        Self {
            config,
            renderer,
            effects: Vec::new(),
            pool,
            programs: Vec::new(),
            schedule: Schedule::default(),
            compile_failures: Vec::new(),
            unreported: None,
            elapsed: 0.0,
            dirty: true,
            disposed: false,
        }
    }

    fn ensure_live(&self, operation: &str) -> Result<()> {
        if self.disposed {
            tracing::error!("{}: {operation} called after dispose", self.config.label);
            return Err(ComposerError::Disposed);
        }
        Ok(())
    }

    fn position(&self, id: &EffectId) -> Result<usize> {
        self.effects
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| ComposerError::UnknownEffect(id.clone()))
    }

    fn effect_mut(&mut self, id: &EffectId) -> Result<&mut EffectDescriptor> {
        let index = self.position(id)?;
        Ok(&mut self.effects[index])
    }

    /// Checks a new descriptor on its own and against the registered ones.
    fn check_new(&self, desc: &EffectDescriptor) -> Result<()> {
        desc.validate(&self.config.limits)?;

        if self.effects.iter().any(|e| e.id == desc.id) {
            return Err(ComposerError::configuration(&desc.id, "id already registered"));
        }
        for pin in [MergeConstraints::PIN_FIRST, MergeConstraints::PIN_LAST] {
            if !desc.merge_constraints.contains(pin) {
                continue;
            }
            if let Some(other) = self
                .effects
                .iter()
                .find(|e| e.merge_constraints.contains(pin))
            {
                return Err(ComposerError::configuration(
                    &desc.id,
                    format!("'{}' is already pinned {pin:?}", other.id),
                ));
            }
        }

        if self.config.validate_shaders {
            let synth = ShaderSynthesizer::new(&self.config);
            let reject = |e: SynthesisError| ComposerError::configuration(&desc.id, e.to_string());
            synth.synthesize_group(&[desc], false).map_err(reject)?;
            if desc.custom_target.is_some() {
                synth.synthesize_prepass(desc).map_err(reject)?;
            }
        }
        Ok(())
    }

    /// Register an effect at the end of the declared order.
    pub fn add_effect(&mut self, desc: EffectDescriptor) -> Result<EffectId> {
        let index = self.effects.len();
        self.insert_effect(index, desc)
    }

    /// Register an effect at `index` in the declared order. Indices past the
    /// end append.
    pub fn insert_effect(&mut self, index: usize, desc: EffectDescriptor) -> Result<EffectId> {
        self.ensure_live("insert_effect")?;
        self.check_new(&desc)?;

        let id = desc.id.clone();
        let index = index.min(self.effects.len());
        tracing::debug!("{}: adding effect '{id}' at {index}", self.config.label);
        self.effects.insert(index, desc);
        self.dirty = true;
        Ok(id)
    }

    /// Unregister an effect, releasing its custom target.
    pub fn remove_effect(&mut self, id: impl Into<EffectId>) -> Result<EffectDescriptor> {
        self.ensure_live("remove_effect")?;
        let id = id.into();
        let index = self.position(&id)?;

        let removed = self.effects.remove(index);
        self.pool
            .release(&mut self.renderer, &PoolKey::Custom(id.clone()));
        tracing::debug!("{}: removed effect '{id}'", self.config.label);
        self.dirty = true;
        Ok(removed)
    }

    pub fn set_effect_enabled(&mut self, id: impl Into<EffectId>, enabled: bool) -> Result<()> {
        self.ensure_live("set_effect_enabled")?;
        let effect = self.effect_mut(&id.into())?;
        if effect.enabled != enabled {
            effect.enabled = enabled;
            self.dirty = true;
        }
        Ok(())
    }

    /// Takes effect on the next frame without a replan.
    pub fn set_opacity(&mut self, id: impl Into<EffectId>, opacity: f32) -> Result<()> {
        self.ensure_live("set_opacity")?;
        let effect = self.effect_mut(&id.into())?;
        if !opacity.is_finite() || !(0.0..=1.0).contains(&opacity) {
            return Err(ComposerError::configuration(
                &effect.id,
                format!("opacity {opacity} is outside [0, 1]"),
            ));
        }
        effect.opacity = opacity;
        Ok(())
    }

    /// Update a declared uniform. The value must keep the declared kind.
    pub fn set_uniform(
        &mut self,
        id: impl Into<EffectId>,
        name: &str,
        value: impl Into<UniformValue>,
    ) -> Result<()> {
        self.ensure_live("set_uniform")?;
        let value = value.into();
        let effect = self.effect_mut(&id.into())?;
        let effect_id = effect.id.clone();

        let slot = effect
            .uniforms
            .iter_mut()
            .find_map(|(n, v)| (n.as_str() == name).then_some(v))
            .ok_or_else(|| {
                ComposerError::configuration(&effect_id, format!("no uniform named '{name}'"))
            })?;
        if slot.kind() != value.kind() {
            return Err(ComposerError::configuration(
                &effect_id,
                format!(
                    "uniform '{name}' is {:?}, got {:?}",
                    slot.kind(),
                    value.kind()
                ),
            ));
        }
        if !value.is_finite() {
            return Err(ComposerError::configuration(
                &effect_id,
                format!("uniform '{name}' is not finite"),
            ));
        }
        *slot = value;
        Ok(())
    }

    pub fn set_blend_function(
        &mut self,
        id: impl Into<EffectId>,
        blend: BlendFunction,
    ) -> Result<()> {
        self.ensure_live("set_blend_function")?;
        let effect = self.effect_mut(&id.into())?;
        if effect.blend_function != blend {
            effect.blend_function = blend;
            self.dirty = true;
        }
        Ok(())
    }

    /// Move an effect to `index` in the declared order.
    pub fn move_effect(&mut self, id: impl Into<EffectId>, index: usize) -> Result<()> {
        self.ensure_live("move_effect")?;
        let from = self.position(&id.into())?;
        let to = index.min(self.effects.len() - 1);
        if from != to {
            let effect = self.effects.remove(from);
            self.effects.insert(to, effect);
            self.dirty = true;
        }
        Ok(())
    }

    /// Record a new viewport size. Targets are reallocated on the next
    /// frame, never mid-frame.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.ensure_live("resize")?;
        self.pool.request_resize(width, height);
        Ok(())
    }

    /// Execute one frame.
    ///
    /// Replans first if the effect set changed. When a program fails to
    /// compile, its pass is left out, every other pass still draws, and the
    /// [`ComposerError::Compile`] is returned once, from the first frame
    /// after the replan that draws.
    pub fn render(&mut self, delta_time: f32, input: &FrameInput<'_, R::View>) -> Result<FrameStats> {
        self.ensure_live("render")?;

        let mut stats = FrameStats::default();
        if self.dirty {
            let failures = self.replan()?;
            stats.replanned = true;
            stats.programs_compiled = self.programs.len();
            self.unreported = failures.first().map(ComposerError::from);
        }

        self.pool.apply_pending_resize();
        if self.schedule.reads_scene_depth && input.depth.is_none() {
            return Err(ComposerError::Resource(
                "an effect reads depth but the frame has no depth buffer".into(),
            ));
        }
        if self.schedule.reads_scene_velocity && input.velocity.is_none() {
            return Err(ComposerError::Resource(
                "an effect reads velocity but the frame has no velocity buffer".into(),
            ));
        }
        self.ensure_targets()?;

        self.elapsed += delta_time;
        self.renderer
            .begin_frame()
            .map_err(|e| ComposerError::Draw(e.to_string()))?;
        let drawn = self.draw_frame(input, delta_time);
        let ended = self.renderer.end_frame();
        stats.draw_calls = drawn?;
        ended.map_err(|e| ComposerError::Draw(e.to_string()))?;
        stats.passes = self.schedule.passes.len();

        match self.unreported.take() {
            Some(error) => Err(error),
            None => Ok(stats),
        }
    }

    /// Release every target and program. Every later call fails with
    /// [`ComposerError::Disposed`].
    pub fn dispose(&mut self) -> Result<()> {
        self.ensure_live("dispose")?;

        for entry in self.programs.drain(..) {
            self.renderer.release_program(entry.program);
        }
        self.pool.release_all(&mut self.renderer);
        self.schedule = Schedule::default();
        self.unreported = None;
        self.disposed = true;
        tracing::debug!("{}: disposed", self.config.label);
        Ok(())
    }

    /// Rebuild the plan: plan, synthesize, compile, schedule.
    fn replan(&mut self) -> Result<Vec<CompileFailure>> {
        let enabled: Vec<&EffectDescriptor> = self.effects.iter().filter(|e| e.enabled).collect();
        let ordered: Vec<&EffectDescriptor> = MergePlanner::order(&enabled)
            .into_iter()
            .map(|i| enabled[i])
            .collect();
        let groups = MergePlanner::new(self.config.limits).plan(&ordered);
        let synth = ShaderSynthesizer::new(&self.config);

        let mut failures = Vec::new();
        let mut synthesized = Vec::new();
        for group in &groups {
            let members: Vec<&EffectDescriptor> =
                group.members.iter().map(|&i| ordered[i]).collect();
            match synth.synthesize(&members, group.kind) {
                Ok(passes) => synthesized.extend(passes),
                Err(SynthesisError::Invalid(message)) => {
                    let pass = members
                        .iter()
                        .map(|m| m.id.as_str())
                        .collect::<Vec<_>>()
                        .join("+");
                    tracing::warn!("{}: dropping pass [{pass}]: invalid WGSL", self.config.label);
                    failures.push(CompileFailure { pass, message });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut programs = Vec::new();
        let mut layout: Vec<(PassKind, usize, Vec<usize>)> = Vec::new();
        for pass in synthesized {
            let mut compiled = Vec::with_capacity(1 + pass.prepasses.len());
            let mut failure = None;
            for program in std::iter::once(pass.program).chain(pass.prepasses) {
                match self.renderer.compile(&program) {
                    Ok(handle) => compiled.push(ProgramEntry {
                        compiled: program,
                        program: handle,
                    }),
                    Err(e) => {
                        failure = Some(CompileFailure {
                            pass: program.label.clone(),
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }

            if let Some(failure) = failure {
                tracing::warn!(
                    "{}: dropping pass {}: {}",
                    self.config.label,
                    failure.pass,
                    failure.message
                );
                for entry in compiled {
                    self.renderer.release_program(entry.program);
                }
                failures.push(failure);
                continue;
            }

            let main = programs.len();
            let prepasses = (main + 1..main + compiled.len()).collect();
            programs.extend(compiled);
            layout.push((pass.kind.into(), main, prepasses));
        }

        if layout.is_empty() {
            let passthrough = synth.passthrough()?;
            match self.renderer.compile(&passthrough) {
                Ok(program) => {
                    layout.push((PassKind::Passthrough, programs.len(), Vec::new()));
                    programs.push(ProgramEntry {
                        compiled: passthrough,
                        program,
                    });
                }
                Err(e) => failures.push(CompileFailure {
                    pass: passthrough.label.clone(),
                    message: e.to_string(),
                }),
            }
        }

        let schedule = {
            let prepass_refs: Vec<Vec<(usize, &CompiledProgram)>> = layout
                .iter()
                .map(|(_, _, prepasses)| {
                    prepasses
                        .iter()
                        .map(|&i| (i, &programs[i].compiled))
                        .collect()
                })
                .collect();
            let sources: Vec<PassSource<'_>> = layout
                .iter()
                .zip(&prepass_refs)
                .map(|((kind, main, _), prepasses)| PassSource {
                    kind: *kind,
                    program: *main,
                    compiled: &programs[*main].compiled,
                    prepasses,
                })
                .collect();
            PassScheduler::schedule(&sources)
        };

        for entry in std::mem::replace(&mut self.programs, programs) {
            self.renderer.release_program(entry.program);
        }
        self.schedule = schedule;

        // custom targets of effects that no longer draw
        let needed = &self.schedule.targets;
        self.pool.retain(&mut self.renderer, |key| {
            !matches!(key, PoolKey::Custom(_)) || needed.contains(key)
        });

        tracing::debug!(
            "{}: replanned {} effects into {} passes ({} failed)",
            self.config.label,
            ordered.len(),
            self.schedule.passes.len(),
            failures.len()
        );
        self.dirty = false;
        self.compile_failures = failures.clone();
        Ok(failures)
    }

    fn ensure_targets(&mut self) -> Result<()> {
        for key in &self.schedule.targets {
            let scale = match key {
                PoolKey::Custom(id) => self
                    .effects
                    .iter()
                    .find(|e| &e.id == id)
                    .and_then(|e| e.custom_target.as_ref())
                    .map_or(1.0, |t| t.scale),
                _ => 1.0,
            };
            let descriptor = self.pool.descriptor_for(key, scale);
            self.pool
                .ensure(&mut self.renderer, key.clone(), descriptor)
                .map_err(|e| ComposerError::Resource(e.to_string()))?;
        }
        Ok(())
    }

    fn draw_frame(&mut self, input: &FrameInput<'_, R::View>, delta_time: f32) -> Result<usize> {
        let frame = FrameContext::<R> {
            pool: &self.pool,
            input,
            effects: &self.effects,
            elapsed: self.elapsed,
            delta_time,
        };
        let viewport = self.pool.size();
        let mut draws = 0;

        for pass in &self.schedule.passes {
            for prepass in &pass.prepasses {
                let size = self
                    .pool
                    .descriptor(&PoolKey::Custom(prepass.effect.clone()))
                    .map_or(viewport, |d| (d.width, d.height));
                frame.draw(
                    &mut self.renderer,
                    &self.programs[prepass.program],
                    &prepass.textures,
                    &prepass.output,
                    &[],
                    size,
                )?;
                draws += 1;
            }
            frame.draw(
                &mut self.renderer,
                &self.programs[pass.program],
                &pass.textures,
                &pass.output,
                &pass.side_outputs,
                viewport,
            )?;
            draws += 1;
        }
        Ok(draws)
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Registered effects in declared order.
    pub fn effects(&self) -> &[EffectDescriptor] {
        &self.effects
    }

    pub fn effect(&self, id: impl Into<EffectId>) -> Option<&EffectDescriptor> {
        let id = id.into();
        self.effects.iter().find(|e| e.id == id)
    }

    /// Passes of the current plan. Stale while [`is_dirty`](Self::is_dirty).
    pub fn passes(&self) -> &[Pass] {
        &self.schedule.passes
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Program metadata referenced by [`Pass::program`].
    pub fn program(&self, index: usize) -> Option<&CompiledProgram> {
        self.programs.get(index).map(|e| &e.compiled)
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    /// Targets currently held by the pool.
    pub fn pool_targets(&self) -> usize {
        self.pool.live_targets()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Passes dropped by the last replan.
    pub fn compile_failures(&self) -> &[CompileFailure] {
        &self.compile_failures
    }
}

/// Per-frame state shared by every draw.
struct FrameContext<'a, R: Renderer> {
    pool: &'a RenderTargetPool<R::Target>,
    input: &'a FrameInput<'a, R::View>,
    effects: &'a [EffectDescriptor],
    elapsed: f32,
    delta_time: f32,
}

impl<'a, R: Renderer> FrameContext<'a, R> {
    fn resolve(&self, target: &TargetRef) -> Result<Binding<'a, R>> {
        let missing = |what: &str| ComposerError::Resource(format!("{what} is not available"));
        match target {
            TargetRef::SceneColor => Ok(Binding::External(self.input.color)),
            TargetRef::SceneDepth => self
                .input
                .depth
                .map(Binding::External)
                .ok_or_else(|| missing("scene depth")),
            TargetRef::SceneVelocity => self
                .input
                .velocity
                .map(Binding::External)
                .ok_or_else(|| missing("scene velocity")),
            TargetRef::Screen => Ok(Binding::External(self.input.output)),
            other => other
                .pool_key()
                .and_then(|key| self.pool.get(&key))
                .map(Binding::Target)
                .ok_or_else(|| missing(&format!("{other:?}"))),
        }
    }

    /// Current parameter slots of `program`.
    fn params(&self, program: &CompiledProgram) -> Vec<[f32; 4]> {
        let find = |id: &EffectId| self.effects.iter().find(|e| &e.id == id);
        program
            .params
            .iter()
            .map(|param| match param {
                ParamSource::Opacity(id) => find(id).map_or([0.0; 4], |e| [e.opacity, 0.0, 0.0, 0.0]),
                ParamSource::Uniform(id, name) => find(id)
                    .and_then(|e| e.uniform(name))
                    .map_or([0.0; 4], |v| v.to_slot()),
            })
            .collect()
    }

    fn draw(
        &self,
        renderer: &mut R,
        entry: &ProgramEntry<R::Program>,
        textures: &[(u32, TargetRef)],
        output: &TargetRef,
        side_outputs: &[TargetRef],
        (width, height): (u32, u32),
    ) -> Result<()> {
        let compiled = &entry.compiled;
        let (time, delta_time) = if compiled.time_varying {
            (self.elapsed, self.delta_time)
        } else {
            (0.0, 0.0)
        };

        let textures = textures
            .iter()
            .map(|(binding, target)| {
                Ok(BoundTexture {
                    binding: *binding,
                    texture: self.resolve(target)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let side_outputs = side_outputs
            .iter()
            .map(|t| self.resolve(t))
            .collect::<Result<Vec<_>>>()?;
        let params = self.params(compiled);

        renderer
            .draw(&Draw {
                label: &compiled.label,
                program: &entry.program,
                compiled,
                frame: FrameUniforms {
                    resolution: [width as f32, height as f32],
                    time,
                    delta_time,
                },
                params: &params,
                textures,
                output: self.resolve(output)?,
                side_outputs,
            })
            .map_err(|e| ComposerError::Draw(format!("{}: {e}", compiled.label)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::software::{Image, ImageHandle, SoftwareRenderer};
    use glam::Vec4;

    const IDENTITY: &str = "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color; }";

    fn composer() -> Composer<SoftwareRenderer> {
        let mut renderer = SoftwareRenderer::new();
        for id in ["a", "b", "c", "d"] {
            renderer.register_kernel(id, |k| k.color);
        }
        Composer::new(renderer, ComposerConfig::new().size(4, 4))
    }

    fn frame() -> (ImageHandle, ImageHandle) {
        (
            ImageHandle::new(Image::filled(4, 4, Vec4::new(0.2, 0.4, 0.6, 1.0))),
            ImageHandle::new(Image::new(4, 4)),
        )
    }

    #[test]
    fn add_marks_dirty_and_render_replans_once() {
        let mut composer = composer();
        composer.add_effect(EffectDescriptor::new("a", IDENTITY)).unwrap();
        assert!(composer.is_dirty());

        let (scene, screen) = frame();
        let input = FrameInput::new(&scene, &screen);
        let first = composer.render(0.016, &input).unwrap();
        let second = composer.render(0.016, &input).unwrap();
        assert!(first.replanned);
        assert!(!second.replanned);
        assert_eq!(composer.renderer().compiles(), 1);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut composer = composer();
        composer.add_effect(EffectDescriptor::new("a", IDENTITY)).unwrap();
        let err = composer
            .add_effect(EffectDescriptor::new("a", IDENTITY))
            .unwrap_err();
        assert!(matches!(err, ComposerError::Configuration { .. }));
        assert_eq!(composer.effects().len(), 1);
    }

    #[test]
    fn second_pin_first_is_rejected() {
        let mut composer = composer();
        let pinned = |id| EffectDescriptor::new(id, IDENTITY).constrained(MergeConstraints::PIN_FIRST);
        composer.add_effect(pinned("a")).unwrap();
        assert!(composer.add_effect(pinned("b")).is_err());
    }

    #[test]
    fn opacity_change_does_not_replan() {
        let mut composer = composer();
        composer.add_effect(EffectDescriptor::new("a", IDENTITY)).unwrap();
        let (scene, screen) = frame();
        let input = FrameInput::new(&scene, &screen);
        composer.render(0.016, &input).unwrap();

        composer.set_opacity("a", 0.25).unwrap();
        assert!(!composer.is_dirty());
        assert!(composer.set_opacity("a", 2.0).is_err());
        assert!(matches!(
            composer.set_opacity("missing", 0.5),
            Err(ComposerError::UnknownEffect(_))
        ));
    }

    #[test]
    fn uniform_kind_must_match() {
        let mut composer = composer();
        composer
            .add_effect(
                EffectDescriptor::new(
                    "a",
                    "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color * params.gain; }",
                )
                .with_uniform("gain", 1.0),
            )
            .unwrap();
        composer.set_uniform("a", "gain", 0.5).unwrap();
        assert!(composer.set_uniform("a", "gain", [1.0, 2.0]).is_err());
        assert!(composer.set_uniform("a", "missing", 1.0).is_err());
        assert_eq!(
            composer.effect("a").and_then(|e| e.uniform("gain")),
            Some(&UniformValue::Float(0.5))
        );
    }

    #[test]
    fn move_effect_reorders() {
        let mut composer = composer();
        for id in ["a", "b", "c"] {
            composer.add_effect(EffectDescriptor::new(id, IDENTITY)).unwrap();
        }
        composer.move_effect("c", 0).unwrap();
        let order: Vec<_> = composer.effects().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        assert!(composer.is_dirty());
    }

    #[test]
    fn empty_composer_copies_scene() {
        let mut composer = composer();
        let (scene, screen) = frame();
        let stats = composer.render(0.016, &FrameInput::new(&scene, &screen)).unwrap();
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(composer.passes()[0].kind, PassKind::Passthrough);
        assert_eq!(screen.snapshot(), scene.snapshot());
    }

    #[test]
    fn static_programs_see_zero_time() {
        let mut composer = composer();
        composer.add_effect(EffectDescriptor::new("a", IDENTITY)).unwrap();
        let (scene, screen) = frame();
        composer.render(0.5, &FrameInput::new(&scene, &screen)).unwrap();
        let record = &composer.renderer().draws()[0];
        assert_eq!(record.frame.time, 0.0);
        assert_eq!(record.frame.resolution, [4.0, 4.0]);
    }

    #[test]
    fn compile_error_outlives_a_frame_that_never_drew() {
        use crate::effect::Capabilities;

        let mut renderer = SoftwareRenderer::new();
        renderer.register_kernel("fog", |k| k.color * (1.0 - k.read_depth(k.uv)));
        let mut composer = Composer::new(renderer, ComposerConfig::new().size(4, 4));
        composer
            .add_effect(
                EffectDescriptor::new(
                    "fog",
                    "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color * (1.0 - read_depth(uv)); }",
                )
                .requires(Capabilities::DEPTH),
            )
            .unwrap();
        // no kernel for "broken", so its program is refused
        composer
            .add_effect(
                EffectDescriptor::new("broken", IDENTITY).constrained(MergeConstraints::ISOLATE),
            )
            .unwrap();

        let (scene, screen) = frame();
        assert!(matches!(
            composer.render(0.016, &FrameInput::new(&scene, &screen)),
            Err(ComposerError::Resource(_))
        ));

        let depth = ImageHandle::new(Image::filled(4, 4, Vec4::ZERO));
        let input = FrameInput::new(&scene, &screen).with_depth(&depth);
        match composer.render(0.016, &input) {
            Err(ComposerError::Compile { pass, .. }) => assert!(pass.contains("broken"), "{pass}"),
            other => panic!("expected the held compile error, got {other:?}"),
        }
        assert_eq!(composer.renderer().draws().len(), 1);
        composer.render(0.016, &input).unwrap();
    }
}
