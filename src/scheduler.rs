//! Pass scheduling: wiring compiled programs to targets.
//!
//! Passes alternate between the two ping-pong targets, and the last pass
//! writes straight to the visible output:
//!
//! ```text
//! Pass 0: Scene → Target A
//! Pass 1: Target A → Target B
//! Pass 2: Target B → Screen
//! ```
//!
//! A single pass reads the scene and writes the screen without touching
//! the pool.

use crate::effect::{Capabilities, EffectId};
use crate::planner::GroupKind;
use crate::synth::{CompiledProgram, ProgramRole, TextureSource};
use crate::target_pool::{PingPongSlot, PoolKey};

/// A buffer a pass reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetRef {
    SceneColor,
    SceneDepth,
    SceneVelocity,
    PingPong(PingPongSlot),
    /// The visible output supplied with the frame.
    Screen,
    Custom(EffectId),
    /// Side output written by an earlier pass.
    Provided(Capabilities),
}

impl TargetRef {
    /// Pool role backing this reference, if the pool owns it.
    pub fn pool_key(&self) -> Option<PoolKey> {
        match self {
            TargetRef::PingPong(slot) => Some(PoolKey::PingPong(*slot)),
            TargetRef::Custom(id) => Some(PoolKey::Custom(id.clone())),
            TargetRef::Provided(cap) => Some(PoolKey::Provided(*cap)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    Merged,
    Isolated,
    Passthrough,
}

impl From<GroupKind> for PassKind {
    fn from(kind: GroupKind) -> Self {
        match kind {
            GroupKind::Merged => PassKind::Merged,
            GroupKind::Isolated => PassKind::Isolated,
        }
    }
}

/// Renders one effect's custom target before its pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepass {
    pub effect: EffectId,
    pub program: usize,
    pub textures: Vec<(u32, TargetRef)>,
    pub output: TargetRef,
}

/// One full-screen draw of the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    pub kind: PassKind,
    pub label: String,
    pub members: Vec<EffectId>,
    /// Index of the main program.
    pub program: usize,
    pub input: TargetRef,
    pub output: TargetRef,
    /// Binding slot to buffer, including the input.
    pub textures: Vec<(u32, TargetRef)>,
    /// Side outputs, in `@location(1..)` order.
    pub side_outputs: Vec<TargetRef>,
    pub prepasses: Vec<Prepass>,
}

/// A compiled pass waiting for targets.
#[derive(Debug, Clone, Copy)]
pub struct PassSource<'a> {
    pub kind: PassKind,
    pub program: usize,
    pub compiled: &'a CompiledProgram,
    /// Program index and metadata of each prepass.
    pub prepasses: &'a [(usize, &'a CompiledProgram)],
}

/// Ordered passes of a frame and the buffers they touch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    pub passes: Vec<Pass>,
    /// Pool roles the passes need, each listed once.
    pub targets: Vec<PoolKey>,
    pub reads_scene_depth: bool,
    pub reads_scene_velocity: bool,
}

impl Schedule {
    pub fn draw_count(&self) -> usize {
        self.passes.iter().map(|p| 1 + p.prepasses.len()).sum()
    }

    fn touch(&mut self, target: &TargetRef) {
        match target {
            TargetRef::SceneDepth => self.reads_scene_depth = true,
            TargetRef::SceneVelocity => self.reads_scene_velocity = true,
            _ => {}
        }
        if let Some(key) = target.pool_key() {
            if !self.targets.contains(&key) {
                self.targets.push(key);
            }
        }
    }
}

pub struct PassScheduler;

impl PassScheduler {
    /// Order `sources` into a frame, alternating ping-pong targets.
    pub fn schedule(sources: &[PassSource<'_>]) -> Schedule {
        let mut schedule = Schedule::default();
        let mut input = TargetRef::SceneColor;
        let mut velocity = TargetRef::SceneVelocity;
        let mut slot = PingPongSlot::A;

        for (i, source) in sources.iter().enumerate() {
            let output = if i + 1 == sources.len() {
                TargetRef::Screen
            } else {
                TargetRef::PingPong(slot)
            };

            let bind = |program: &CompiledProgram| -> Vec<(u32, TargetRef)> {
                program
                    .textures
                    .iter()
                    .map(|t| {
                        let target = match &t.source {
                            TextureSource::Input => input.clone(),
                            TextureSource::Depth => TargetRef::SceneDepth,
                            TextureSource::Velocity => velocity.clone(),
                            TextureSource::Custom(id) => TargetRef::Custom(id.clone()),
                        };
                        (t.binding, target)
                    })
                    .collect()
            };

            let prepasses: Vec<Prepass> = source
                .prepasses
                .iter()
                .filter_map(|(program, compiled)| match &compiled.role {
                    ProgramRole::Prepass(effect) => Some(Prepass {
                        effect: effect.clone(),
                        program: *program,
                        textures: bind(compiled),
                        output: TargetRef::Custom(effect.clone()),
                    }),
                    _ => None,
                })
                .collect();

            let pass = Pass {
                kind: source.kind,
                label: source.compiled.label.clone(),
                members: source.compiled.members().cloned().collect(),
                program: source.program,
                input: input.clone(),
                output: output.clone(),
                textures: bind(source.compiled),
                side_outputs: source
                    .compiled
                    .side_outputs
                    .iter()
                    .map(|cap| TargetRef::Provided(*cap))
                    .collect(),
                prepasses,
            };

            for prepass in &pass.prepasses {
                prepass.textures.iter().for_each(|(_, t)| schedule.touch(t));
                schedule.touch(&prepass.output);
            }
            pass.textures.iter().for_each(|(_, t)| schedule.touch(t));
            pass.side_outputs.iter().for_each(|t| schedule.touch(t));
            schedule.touch(&pass.output);

            if source.compiled.side_outputs.contains(&Capabilities::VELOCITY) {
                velocity = TargetRef::Provided(Capabilities::VELOCITY);
            }
            if let TargetRef::PingPong(written) = output {
                slot = written.other();
            }
            input = output;
            schedule.passes.push(pass);
        }

        tracing::debug!(
            "Scheduled {} passes ({} draws)",
            schedule.passes.len(),
            schedule.draw_count()
        );
        schedule
    }
}
