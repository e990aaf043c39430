//! Capability and constraint flags carried by every effect descriptor.
//!
//! The planner and synthesizer only ever dispatch on these flags; they never
//! inspect what kind of effect they are dealing with.

use bitflags::bitflags;

bitflags! {
    /// Buffers an effect reads (or, for `provides`, writes).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        /// The running color. Always available, implied for every effect.
        const COLOR = 1 << 0;
        /// Scene depth, sampled through `read_depth(uv)`.
        const DEPTH = 1 << 1;
        /// Screen-space velocity, sampled through `read_velocity(uv)`.
        const VELOCITY = 1 << 2;
        /// An effect-owned offscreen target, sampled through `read_custom(uv)`.
        const CUSTOM_RENDER_TARGET = 1 << 3;
    }
}

bitflags! {
    /// Flags that restrict how an effect may be merged with its neighbours.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MergeConstraints: u8 {
        /// Always runs in a pass of its own.
        const ISOLATE = 1 << 0;
        /// Samples neighbouring texels of the pass input, so it can only be
        /// the first effect of a merged group.
        const CONVOLUTION = 1 << 1;
        /// Runs before every other effect, in a pass of its own.
        const PIN_FIRST = 1 << 2;
        /// Runs after every other effect, in a pass of its own.
        const PIN_LAST = 1 << 3;
    }
}

impl MergeConstraints {
    /// Either ordering pin.
    pub const PINNED: Self = Self::PIN_FIRST.union(Self::PIN_LAST);

    /// Whether an effect carrying these constraints can never share a program.
    pub fn forces_isolation(self) -> bool {
        self.intersects(Self::ISOLATE | Self::PINNED)
    }
}

/// WGSL shape of an effect uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformKind {
    Float,
    Vec2,
    Vec3,
    Vec4,
}

impl UniformKind {
    /// Swizzle applied to the `vec4f` slot that stores a uniform of this kind.
    pub fn swizzle(self) -> &'static str {
        match self {
            UniformKind::Float => ".x",
            UniformKind::Vec2 => ".xy",
            UniformKind::Vec3 => ".xyz",
            UniformKind::Vec4 => "",
        }
    }
}

/// A custom uniform value. Every value occupies one `vec4f` slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
}

impl UniformValue {
    pub fn kind(&self) -> UniformKind {
        match self {
            UniformValue::Float(_) => UniformKind::Float,
            UniformValue::Vec2(_) => UniformKind::Vec2,
            UniformValue::Vec3(_) => UniformKind::Vec3,
            UniformValue::Vec4(_) => UniformKind::Vec4,
        }
    }

    /// Packs the value into a zero-padded `vec4f` slot.
    pub fn to_slot(&self) -> [f32; 4] {
        match *self {
            UniformValue::Float(x) => [x, 0.0, 0.0, 0.0],
            UniformValue::Vec2([x, y]) => [x, y, 0.0, 0.0],
            UniformValue::Vec3([x, y, z]) => [x, y, z, 0.0],
            UniformValue::Vec4(v) => v,
        }
    }

    pub(crate) fn is_finite(&self) -> bool {
        self.to_slot().iter().all(|c| c.is_finite())
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::Float(value)
    }
}

impl From<[f32; 2]> for UniformValue {
    fn from(value: [f32; 2]) -> Self {
        UniformValue::Vec2(value)
    }
}

impl From<[f32; 3]> for UniformValue {
    fn from(value: [f32; 3]) -> Self {
        UniformValue::Vec3(value)
    }
}

impl From<[f32; 4]> for UniformValue {
    fn from(value: [f32; 4]) -> Self {
        UniformValue::Vec4(value)
    }
}
