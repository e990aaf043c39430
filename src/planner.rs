//! Merge planning: partitioning the enabled effect sequence into groups.
//!
//! Grouping is greedy and only ever joins neighbours, so the relative order
//! of effects survives planning. Pinned effects are moved to the ends of
//! the sequence first.

use crate::config::ShaderLimits;
use crate::effect::{Capabilities, EffectDescriptor, MergeConstraints};

/// How a group is turned into a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// One or more effects sharing a program.
    Merged,
    /// A single effect that may not share its program.
    Isolated,
}

/// A run of adjacent effects rendered by one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub kind: GroupKind,
    /// Indices into the planner input.
    pub members: Vec<usize>,
}

/// Resource tally of an open group.
#[derive(Debug, Default, Clone, Copy)]
struct Footprint {
    depth: bool,
    velocity_read: bool,
    velocity_provided: bool,
    custom: u32,
    uniform_slots: usize,
}

impl Footprint {
    fn of(effect: &EffectDescriptor) -> Self {
        let mut footprint = Self::default();
        footprint.add(effect);
        footprint
    }

    fn add(&mut self, effect: &EffectDescriptor) {
        self.depth |= effect.required_inputs.contains(Capabilities::DEPTH);
        self.velocity_read |= effect.required_inputs.contains(Capabilities::VELOCITY);
        self.velocity_provided |= effect.provides.contains(Capabilities::VELOCITY);
        self.custom += u32::from(effect.custom_target.is_some());
        self.uniform_slots += effect.uniform_slots();
    }

    fn textures(&self) -> u32 {
        1 + u32::from(self.depth) + u32::from(self.velocity_read) + self.custom
    }
}

/// Greedy, adjacent-only partitioner.
#[derive(Debug, Clone, Copy)]
pub struct MergePlanner {
    limits: ShaderLimits,
}

impl MergePlanner {
    pub fn new(limits: ShaderLimits) -> Self {
        Self { limits }
    }

    /// Order `effects` with pins applied. Returns indices into `effects`.
    pub fn order(effects: &[&EffectDescriptor]) -> Vec<usize> {
        let pinned = |flag: MergeConstraints| {
            move |&i: &usize| effects[i].merge_constraints.contains(flag)
        };
        let all = 0..effects.len();
        let first = all.clone().filter(pinned(MergeConstraints::PIN_FIRST));
        let middle = all.clone().filter(|&i| {
            !effects[i]
                .merge_constraints
                .intersects(MergeConstraints::PINNED)
        });
        let last = all.filter(pinned(MergeConstraints::PIN_LAST));
        first.chain(middle).chain(last).collect()
    }

    /// Partition the enabled effects, already in pin order, into groups.
    pub fn plan(&self, effects: &[&EffectDescriptor]) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        let mut open: Option<(Group, Footprint)> = None;

        for (index, effect) in effects.iter().enumerate() {
            if effect.merge_constraints.forces_isolation() {
                groups.extend(open.take().map(|(g, _)| g));
                groups.push(Group {
                    kind: GroupKind::Isolated,
                    members: vec![index],
                });
                continue;
            }

            if let Some((group, footprint)) = open.as_mut() {
                if self.can_join(footprint, effect) {
                    group.members.push(index);
                    footprint.add(effect);
                    continue;
                }
            }

            groups.extend(open.take().map(|(g, _)| g));
            open = Some((
                Group {
                    kind: GroupKind::Merged,
                    members: vec![index],
                },
                Footprint::of(effect),
            ));
        }

        groups.extend(open.map(|(g, _)| g));
        tracing::debug!(
            "Planned {} effects into {} groups",
            effects.len(),
            groups.len()
        );
        groups
    }

    fn can_join(&self, footprint: &Footprint, effect: &EffectDescriptor) -> bool {
        // convolutions sample the input at other texels, and a custom
        // target's prepass reads the pass input, so both need the color
        // of every earlier effect materialized and can only start a group
        if effect.merge_constraints.contains(MergeConstraints::CONVOLUTION)
            || effect.custom_target.is_some()
        {
            return false;
        }

        let reads_velocity = effect.required_inputs.contains(Capabilities::VELOCITY);
        let provides_velocity = effect.provides.contains(Capabilities::VELOCITY);
        if reads_velocity && footprint.velocity_provided {
            return false;
        }
        if provides_velocity && (footprint.velocity_read || footprint.velocity_provided) {
            return false;
        }

        let mut joined = *footprint;
        joined.add(effect);
        joined.textures() <= self.limits.max_textures
            && joined.uniform_slots <= self.limits.max_uniform_slots as usize
    }
}
