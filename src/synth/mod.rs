//! Shader synthesis: turning a group of effects into one WGSL program.
//!
//! Every program shares one layout so the renderer can build its bind group
//! from metadata alone:
//!
//! ```text
//! @group(0) @binding(0)  frame          FrameUniforms { resolution, time, delta_time }
//! @group(0) @binding(1)  group_params   GroupParams { slots: array<vec4f, N> }
//! @group(0) @binding(2)  input_sampler  sampler
//! @group(0) @binding(3)  input_texture  texture_2d<f32>
//! @group(0) @binding(4+) depth_texture, velocity_texture, custom_texture_i (only when used)
//! ```
//!
//! Inside `fs`, one running `color` flows through every stage, and each
//! stage is blended right after its `apply` call:
//!
//! ```text
//! color = blend_screen(color, e1_apply(color, uv), group_params.slots[2].x);
//! ```
//!
//! Blending per stage (instead of once at the end) makes a merged program
//! produce exactly what the same effects would produce as separate passes.

pub mod namespace;
mod validate;

pub use namespace::NamespaceTable;
pub use validate::{ProgramStats, validate_wgsl};

use std::collections::HashSet;

use crate::config::ComposerConfig;
use crate::effect::{BlendFunction, Capabilities, EffectDescriptor, EffectId};
use crate::planner::GroupKind;
use namespace::{RenameContext, Usage};

/// Errors raised while synthesizing a program.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisError {
    /// The program does not fit a platform limit. Recovered by isolating
    /// the offending effect.
    #[error("{what} limit exceeded: {actual} > {limit}")]
    LimitExceeded {
        what: &'static str,
        actual: usize,
        limit: usize,
    },

    /// The namespace pass rejected an effect's code.
    #[error("effect '{effect}': {message}")]
    Namespace { effect: EffectId, message: String },

    /// Two emitted declarations share a name.
    #[error("symbol '{0}' emitted twice")]
    SymbolCollision(String),

    /// naga rejected the generated module.
    #[error("generated WGSL is invalid:\n{0}")]
    Invalid(String),
}

/// Where a sampled texture comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureSource {
    Input,
    Depth,
    Velocity,
    Custom(EffectId),
}

/// One sampled texture binding of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSlot {
    pub binding: u32,
    pub source: TextureSource,
}

/// What one `vec4f` parameter slot holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSource {
    Opacity(EffectId),
    Uniform(EffectId, String),
}

/// Where a stage's result goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutput {
    /// Blended into the running color.
    Color,
    /// Written to a side output; the running color is untouched.
    Side(Capabilities),
    /// Skipped entirely.
    Nothing,
}

/// Per-effect metadata of a program.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub effect: EffectId,
    pub blend: BlendFunction,
    pub opacity_slot: usize,
    /// Parameter slots of the effect's uniforms, in declaration order.
    pub uniform_slots: Vec<usize>,
    pub output: StageOutput,
    /// Binding of the effect's custom target, if it reads one.
    pub custom_binding: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramRole {
    /// Effect stages threaded through a running color.
    Main,
    /// Renders one effect's custom target.
    Prepass(EffectId),
    /// Copies the input unchanged.
    Passthrough,
}

/// A synthesized WGSL program and the metadata needed to bind and run it.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub label: String,
    pub role: ProgramRole,
    pub source: String,
    pub stages: Vec<Stage>,
    pub textures: Vec<TextureSlot>,
    pub params: Vec<ParamSource>,
    /// Side outputs, bound at `@location(1)` onwards in this order.
    pub side_outputs: Vec<Capabilities>,
    /// Whether any stage reads `frame.time` or `frame.delta_time`.
    pub time_varying: bool,
    pub stats: ProgramStats,
    pub namespaces: Vec<NamespaceTable>,
}

impl CompiledProgram {
    pub fn members(&self) -> impl Iterator<Item = &EffectId> {
        self.stages.iter().map(|s| &s.effect)
    }

    pub fn texture(&self, source: &TextureSource) -> Option<&TextureSlot> {
        self.textures.iter().find(|t| &t.source == source)
    }
}

/// A group turned into a program, plus the prepasses its members need.
#[derive(Debug, Clone)]
pub struct SynthesizedPass {
    pub kind: GroupKind,
    pub members: Vec<EffectId>,
    pub program: CompiledProgram,
    pub prepasses: Vec<CompiledProgram>,
}

const FIRST_TEXTURE_BINDING: u32 = 3;

const VERTEX_STAGE: &str = "@vertex
fn vs(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4f {
    let corner = vec2f(f32((vertex_index << 1u) & 2u), f32(vertex_index & 2u));
    return vec4f(corner * 2.0 - 1.0, 0.0, 1.0);
}
";

/// Names every synthesized module may declare.
const SYNTH_SYMBOLS: &[&str] = &[
    "FrameUniforms",
    "GroupParams",
    "FragmentOutput",
    "frame",
    "group_params",
    "input_sampler",
    "input_texture",
    "depth_texture",
    "velocity_texture",
    "read_input",
    "read_depth",
    "read_velocity",
    "vs",
    "fs",
];

/// Builds the WGSL text shared by every program shape.
struct ModuleWriter {
    out: String,
}

impl ModuleWriter {
    fn new(title: &str) -> Self {
        Self {
            out: format!("// {}\n\n", title.escape_debug()),
        }
    }

    fn header(&mut self, param_slots: usize, textures: &[TextureSlot]) {
        self.out.push_str(&format!(
            "struct FrameUniforms {{\n    resolution: vec2f,\n    time: f32,\n    delta_time: f32,\n}}\n\n\
             struct GroupParams {{\n    slots: array<vec4f, {}>,\n}}\n\n\
             @group(0) @binding(0) var<uniform> frame: FrameUniforms;\n\
             @group(0) @binding(1) var<uniform> group_params: GroupParams;\n\
             @group(0) @binding(2) var input_sampler: sampler;\n",
            param_slots.max(1)
        ));
        for slot in textures {
            let decl = match &slot.source {
                TextureSource::Input => "input_texture: texture_2d<f32>".to_string(),
                TextureSource::Depth => "depth_texture: texture_depth_2d".to_string(),
                TextureSource::Velocity => "velocity_texture: texture_2d<f32>".to_string(),
                TextureSource::Custom(_) => {
                    format!("custom_texture_{}: texture_2d<f32>", slot.binding)
                }
            };
            self.out
                .push_str(&format!("@group(0) @binding({}) var {decl};\n", slot.binding));
        }
        self.out.push('\n');

        self.out.push_str(
            "fn read_input(uv: vec2f) -> vec4f {\n    \
             return textureSampleLevel(input_texture, input_sampler, uv, 0.0);\n}\n\n",
        );
        if textures.iter().any(|t| t.source == TextureSource::Depth) {
            self.out.push_str(
                "fn read_depth(uv: vec2f) -> f32 {\n    \
                 let size = vec2f(textureDimensions(depth_texture));\n    \
                 let texel = vec2i(clamp(uv * size, vec2f(0.0), size - vec2f(1.0)));\n    \
                 return textureLoad(depth_texture, texel, 0);\n}\n\n",
            );
        }
        if textures.iter().any(|t| t.source == TextureSource::Velocity) {
            self.out.push_str(
                "fn read_velocity(uv: vec2f) -> vec2f {\n    \
                 return textureSampleLevel(velocity_texture, input_sampler, uv, 0.0).xy;\n}\n\n",
            );
        }
    }

    fn custom_accessor(&mut self, prefix: &str, binding: u32) {
        self.out.push_str(&format!(
            "fn {prefix}read_custom(uv: vec2f) -> vec4f {{\n    \
             return textureSampleLevel(custom_texture_{binding}, input_sampler, uv, 0.0);\n}}\n\n"
        ));
    }

    fn fragment(&mut self, id: &EffectId, code: &str) {
        self.out
            .push_str(&format!("// effect: {}\n", id.as_str().escape_debug()));
        self.out.push_str(code.trim());
        self.out.push_str("\n\n");
    }

    fn output_struct(&mut self, side_outputs: &[Capabilities]) {
        self.out
            .push_str("struct FragmentOutput {\n    @location(0) color: vec4f,\n");
        for (i, cap) in side_outputs.iter().enumerate() {
            self.out.push_str(&format!(
                "    @location({}) {}: vec4f,\n",
                i + 1,
                side_output_field(*cap)
            ));
        }
        self.out.push_str("}\n\n");
        self.out.push_str(VERTEX_STAGE);
        self.out.push('\n');
    }

    fn fragment_stage(&mut self, body: &str) {
        self.out.push_str(
            "@fragment\nfn fs(@builtin(position) pos: vec4f) -> FragmentOutput {\n    \
             let uv = pos.xy / frame.resolution;\n    \
             var frag: FragmentOutput;\n",
        );
        self.out.push_str(body);
        self.out.push_str("    return frag;\n}\n");
    }

    fn finish(self) -> String {
        self.out
    }
}

fn side_output_field(cap: Capabilities) -> &'static str {
    if cap == Capabilities::VELOCITY {
        "velocity"
    } else {
        "side"
    }
}

fn texture_slots(
    members: &[&EffectDescriptor],
    include_custom: bool,
) -> (Vec<TextureSlot>, Vec<Option<u32>>) {
    let mut slots = vec![TextureSlot {
        binding: FIRST_TEXTURE_BINDING,
        source: TextureSource::Input,
    }];
    let mut next = FIRST_TEXTURE_BINDING + 1;
    let mut push = |slots: &mut Vec<TextureSlot>, source| {
        slots.push(TextureSlot {
            binding: next,
            source,
        });
        next += 1;
        next - 1
    };

    if members
        .iter()
        .any(|m| m.required_inputs.contains(Capabilities::DEPTH))
    {
        push(&mut slots, TextureSource::Depth);
    }
    if members
        .iter()
        .any(|m| m.required_inputs.contains(Capabilities::VELOCITY))
    {
        push(&mut slots, TextureSource::Velocity);
    }

    let custom = members
        .iter()
        .map(|m| match (&m.custom_target, include_custom) {
            (Some(_), true) => Some(push(&mut slots, TextureSource::Custom(m.id.clone()))),
            _ => None,
        })
        .collect();

    (slots, custom)
}

/// Synthesizes programs for planned groups.
pub struct ShaderSynthesizer<'a> {
    config: &'a ComposerConfig,
}

impl<'a> ShaderSynthesizer<'a> {
    pub fn new(config: &'a ComposerConfig) -> Self {
        Self { config }
    }

    /// Synthesize one planned group.
    ///
    /// Usually yields a single pass. When the group overflows a limit, the
    /// group is rebuilt from growing prefixes: each prefix that fits becomes
    /// a pass, and the effect that made it overflow is isolated.
    pub fn synthesize(
        &self,
        group: &[&EffectDescriptor],
        kind: GroupKind,
    ) -> Result<Vec<SynthesizedPass>, SynthesisError> {
        match self.build_pass(group, kind, true) {
            Ok(pass) => return Ok(vec![pass]),
            Err(SynthesisError::LimitExceeded { what, actual, limit }) if group.len() > 1 => {
                tracing::warn!(
                    "Group [{}] exceeds the {what} limit ({actual} > {limit}), isolating the offending effect",
                    join_ids(group)
                );
            }
            Err(SynthesisError::LimitExceeded { what, actual, limit }) => {
                tracing::warn!(
                    "Effect '{}' alone exceeds the {what} limit ({actual} > {limit}), emitting it anyway",
                    group[0].id
                );
                return Ok(vec![self.build_pass(group, GroupKind::Isolated, false)?]);
            }
            Err(e) => return Err(e),
        }

        let mut passes = Vec::new();
        let mut start = 0;
        while start < group.len() {
            let mut fitted = None;
            let mut end = start;
            while end < group.len() {
                match self.build_pass(&group[start..=end], kind, true) {
                    Ok(pass) => {
                        fitted = Some(pass);
                        end += 1;
                    }
                    Err(SynthesisError::LimitExceeded { .. }) => break,
                    Err(e) => return Err(e),
                }
            }

            if let Some(pass) = fitted {
                passes.push(pass);
            }
            if end < group.len() {
                let offender = group[end];
                tracing::warn!("Isolating effect '{}' into its own pass", offender.id);
                passes.push(self.build_pass(&[offender], GroupKind::Isolated, false)?);
                end += 1;
            }
            start = end;
        }
        Ok(passes)
    }

    fn build_pass(
        &self,
        members: &[&EffectDescriptor],
        kind: GroupKind,
        enforce_limits: bool,
    ) -> Result<SynthesizedPass, SynthesisError> {
        let program = self.synthesize_group(members, enforce_limits)?;
        let prepasses = members
            .iter()
            .filter(|m| m.custom_target.is_some())
            .map(|m| self.synthesize_prepass(m))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SynthesizedPass {
            kind,
            members: members.iter().map(|m| m.id.clone()).collect(),
            program,
            prepasses,
        })
    }

    /// Merge `members` into one main program.
    pub fn synthesize_group(
        &self,
        members: &[&EffectDescriptor],
        enforce_limits: bool,
    ) -> Result<CompiledProgram, SynthesisError> {
        let limits = &self.config.limits;
        let (textures, custom_bindings) = texture_slots(members, true);
        if enforce_limits && textures.len() > limits.max_textures as usize {
            return Err(SynthesisError::LimitExceeded {
                what: "texture",
                actual: textures.len(),
                limit: limits.max_textures as usize,
            });
        }

        let mut params = Vec::new();
        let mut stages = Vec::with_capacity(members.len());
        let mut namespaces = Vec::with_capacity(members.len());
        let mut fragments = Vec::new();
        let mut usage = Usage::default();
        let mut body = String::from("    var color = read_input(uv);\n");
        let mut blends = Vec::new();
        let mut side_outputs = Vec::new();

        for (i, (member, custom_binding)) in members.iter().zip(&custom_bindings).enumerate() {
            let prefix = format!("e{i}_");
            let opacity_slot = params.len();
            params.push(ParamSource::Opacity(member.id.clone()));
            let first_uniform_slot = params.len();
            for (name, _) in &member.uniforms {
                params.push(ParamSource::Uniform(member.id.clone(), name.clone()));
            }

            let output = if member.provides.contains(Capabilities::VELOCITY) {
                StageOutput::Side(Capabilities::VELOCITY)
            } else if member.blend_function == BlendFunction::Skip {
                StageOutput::Nothing
            } else {
                StageOutput::Color
            };

            stages.push(Stage {
                effect: member.id.clone(),
                blend: member.blend_function,
                opacity_slot,
                uniform_slots: (first_uniform_slot..params.len()).collect(),
                output,
                custom_binding: *custom_binding,
            });

            if output == StageOutput::Nothing {
                body.push_str(&format!("    // {}: skipped\n", member.id.as_str().escape_debug()));
                namespaces.push(NamespaceTable {
                    prefix,
                    ..NamespaceTable::default()
                });
                continue;
            }

            let namespaced = namespace::rename(
                &member.fragment_code,
                &RenameContext {
                    prefix: &prefix,
                    entry: "apply",
                    uniforms: &member.uniforms,
                    first_uniform_slot,
                    has_custom: custom_binding.is_some(),
                },
            )
            .map_err(|message| SynthesisError::Namespace {
                effect: member.id.clone(),
                message,
            })?;
            usage.time |= namespaced.usage.time;

            let call = format!("{}(color, uv)", namespaced.entry("apply"));
            body.push_str(&format!("    // {}\n", member.id.as_str().escape_debug()));
            match output {
                StageOutput::Side(cap) => {
                    if side_outputs.contains(&cap) {
                        return Err(SynthesisError::SymbolCollision(
                            side_output_field(cap).to_string(),
                        ));
                    }
                    side_outputs.push(cap);
                    body.push_str(&format!("    frag.{} = {call};\n", side_output_field(cap)));
                }
                _ => {
                    if !blends.contains(&member.blend_function) {
                        blends.push(member.blend_function);
                    }
                    body.push_str(&format!(
                        "    color = {}(color, {call}, group_params.slots[{opacity_slot}].x);\n",
                        member.blend_function.wgsl_fn_name()
                    ));
                }
            }

            fragments.push((member.id.clone(), prefix, *custom_binding, namespaced.code));
            namespaces.push(namespaced.table);
        }
        body.push_str("    frag.color = color;\n");

        if enforce_limits && params.len() > limits.max_uniform_slots as usize {
            return Err(SynthesisError::LimitExceeded {
                what: "uniform slot",
                actual: params.len(),
                limit: limits.max_uniform_slots as usize,
            });
        }

        let title = format!("{} Pass [{}]", self.config.label, join_ids(members));
        let mut writer = ModuleWriter::new(&title);
        writer.header(params.len(), &textures);
        for blend in &blends {
            writer.out.push_str(&blend.wgsl_helper());
            writer.out.push('\n');
        }
        let mut emitted: Vec<String> = blends.iter().map(|b| b.wgsl_fn_name()).collect();
        for (id, prefix, custom_binding, code) in &fragments {
            if let Some(binding) = custom_binding {
                writer.custom_accessor(prefix, *binding);
                emitted.push(format!("{prefix}read_custom"));
                emitted.push(format!("custom_texture_{binding}"));
            }
            writer.fragment(id, code);
        }
        writer.output_struct(&side_outputs);
        writer.fragment_stage(&body);

        check_collisions(&namespaces, emitted)?;

        let mut program = CompiledProgram {
            label: title,
            role: ProgramRole::Main,
            source: writer.finish(),
            stages,
            textures,
            params,
            side_outputs,
            time_varying: usage.time,
            stats: ProgramStats::default(),
            namespaces,
        };
        self.measure(&mut program, enforce_limits)?;
        Ok(program)
    }

    /// Program that renders `effect`'s custom target.
    pub fn synthesize_prepass(
        &self,
        effect: &EffectDescriptor,
    ) -> Result<CompiledProgram, SynthesisError> {
        let namespace_err = |message| SynthesisError::Namespace {
            effect: effect.id.clone(),
            message,
        };
        let target = effect
            .custom_target
            .as_ref()
            .ok_or_else(|| namespace_err("no custom target to render".to_string()))?;

        let (textures, _) = texture_slots(&[effect], false);
        let mut params = vec![ParamSource::Opacity(effect.id.clone())];
        params.extend(
            effect
                .uniforms
                .iter()
                .map(|(name, _)| ParamSource::Uniform(effect.id.clone(), name.clone())),
        );

        let namespaced = namespace::rename(
            &target.prepass_code,
            &RenameContext {
                prefix: "e0_",
                entry: "prepass",
                uniforms: &effect.uniforms,
                first_uniform_slot: 1,
                has_custom: false,
            },
        )
        .map_err(namespace_err)?;

        let title = format!("{} Prepass [{}]", self.config.label, effect.id);
        let mut writer = ModuleWriter::new(&title);
        writer.header(params.len(), &textures);
        writer.fragment(&effect.id, &namespaced.code);
        writer.output_struct(&[]);
        writer.fragment_stage(&format!(
            "    frag.color = {}(uv);\n",
            namespaced.entry("prepass")
        ));

        check_collisions(std::slice::from_ref(&namespaced.table), Vec::new())?;

        let mut program = CompiledProgram {
            label: title,
            role: ProgramRole::Prepass(effect.id.clone()),
            source: writer.finish(),
            stages: vec![Stage {
                effect: effect.id.clone(),
                blend: BlendFunction::Normal,
                opacity_slot: 0,
                uniform_slots: (1..params.len()).collect(),
                output: StageOutput::Color,
                custom_binding: None,
            }],
            textures,
            params,
            side_outputs: Vec::new(),
            time_varying: namespaced.usage.time,
            stats: ProgramStats::default(),
            namespaces: vec![namespaced.table],
        };
        self.measure(&mut program, false)?;
        Ok(program)
    }

    /// Program that copies its input to its output.
    pub fn passthrough(&self) -> Result<CompiledProgram, SynthesisError> {
        let textures = vec![TextureSlot {
            binding: FIRST_TEXTURE_BINDING,
            source: TextureSource::Input,
        }];
        let title = format!("{} Passthrough", self.config.label);
        let mut writer = ModuleWriter::new(&title);
        writer.header(1, &textures);
        writer.output_struct(&[]);
        writer.fragment_stage("    frag.color = read_input(uv);\n");

        let mut program = CompiledProgram {
            label: title,
            role: ProgramRole::Passthrough,
            source: writer.finish(),
            stages: Vec::new(),
            textures,
            params: Vec::new(),
            side_outputs: Vec::new(),
            time_varying: false,
            stats: ProgramStats::default(),
            namespaces: Vec::new(),
        };
        self.measure(&mut program, false)?;
        Ok(program)
    }

    /// Fill in stats, validating with naga when enabled.
    fn measure(
        &self,
        program: &mut CompiledProgram,
        enforce_limits: bool,
    ) -> Result<(), SynthesisError> {
        if !self.config.validate_shaders {
            program.stats = ProgramStats {
                textures: program.textures.len() as u32,
                samplers: 1,
                expressions: None,
            };
            return Ok(());
        }

        program.stats = validate_wgsl(&program.source).map_err(SynthesisError::Invalid)?;
        let limit = self.config.limits.max_expressions;
        match program.stats.expressions {
            Some(actual) if enforce_limits && actual > limit => {
                Err(SynthesisError::LimitExceeded {
                    what: "expression",
                    actual,
                    limit,
                })
            }
            _ => Ok(()),
        }
    }
}

fn check_collisions(
    namespaces: &[NamespaceTable],
    synthesized: Vec<String>,
) -> Result<(), SynthesisError> {
    let mut seen: HashSet<String> = SYNTH_SYMBOLS.iter().map(|s| s.to_string()).collect();
    let effect_symbols = namespaces
        .iter()
        .flat_map(|t| t.emitted().map(str::to_string));
    for symbol in synthesized.into_iter().chain(effect_symbols) {
        if !seen.insert(symbol.clone()) {
            return Err(SynthesisError::SymbolCollision(symbol));
        }
    }
    Ok(())
}

fn join_ids(members: &[&EffectDescriptor]) -> String {
    members
        .iter()
        .map(|m| m.id.as_str())
        .collect::<Vec<_>>()
        .join("+")
}
