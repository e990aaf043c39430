//! Blend functions applied after each effect stage.
//!
//! Each mode exists twice: as a WGSL helper emitted into synthesized programs
//! and as a CPU reference used by the software renderer. Both compute
//!
//! ```text
//! mix(dst, vec4(f(dst.rgb, src.rgb), src.a), opacity)
//! ```
//!
//! where `dst` is the running color and `src` is the effect output.

use glam::{Vec3, Vec4};

/// How an effect's output combines with the color it received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendFunction {
    /// The effect produces no visible output.
    Skip,
    #[default]
    Normal,
    Add,
    Subtract,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    Difference,
    Average,
}

impl BlendFunction {
    pub const ALL: [BlendFunction; 11] = [
        BlendFunction::Skip,
        BlendFunction::Normal,
        BlendFunction::Add,
        BlendFunction::Subtract,
        BlendFunction::Multiply,
        BlendFunction::Screen,
        BlendFunction::Overlay,
        BlendFunction::Darken,
        BlendFunction::Lighten,
        BlendFunction::Difference,
        BlendFunction::Average,
    ];

    /// Lower-case name, used to build WGSL helper names.
    pub fn name(self) -> &'static str {
        match self {
            BlendFunction::Skip => "skip",
            BlendFunction::Normal => "normal",
            BlendFunction::Add => "add",
            BlendFunction::Subtract => "subtract",
            BlendFunction::Multiply => "multiply",
            BlendFunction::Screen => "screen",
            BlendFunction::Overlay => "overlay",
            BlendFunction::Darken => "darken",
            BlendFunction::Lighten => "lighten",
            BlendFunction::Difference => "difference",
            BlendFunction::Average => "average",
        }
    }

    /// Name of the emitted WGSL helper, e.g. `blend_screen`.
    pub fn wgsl_fn_name(self) -> String {
        format!("blend_{}", self.name())
    }

    /// WGSL expression of `f(d, s)` over `vec3f` operands `d` and `s`.
    fn wgsl_rgb(self) -> &'static str {
        match self {
            BlendFunction::Skip => "d",
            BlendFunction::Normal => "s",
            BlendFunction::Add => "d + s",
            BlendFunction::Subtract => "d - s",
            BlendFunction::Multiply => "d * s",
            BlendFunction::Screen => "1.0 - (1.0 - d) * (1.0 - s)",
            BlendFunction::Overlay => {
                "select(1.0 - 2.0 * (1.0 - d) * (1.0 - s), 2.0 * d * s, d < vec3f(0.5))"
            }
            BlendFunction::Darken => "min(d, s)",
            BlendFunction::Lighten => "max(d, s)",
            BlendFunction::Difference => "abs(d - s)",
            BlendFunction::Average => "(d + s) * 0.5",
        }
    }

    /// Complete WGSL helper `fn blend_<name>(dst, src, opacity) -> vec4f`.
    pub fn wgsl_helper(self) -> String {
        format!(
            "fn {name}(dst: vec4f, src: vec4f, opacity: f32) -> vec4f {{\n    \
             let d = dst.rgb;\n    \
             let s = src.rgb;\n    \
             return mix(dst, vec4f({rgb}, src.a), opacity);\n\
             }}\n",
            name = self.wgsl_fn_name(),
            rgb = self.wgsl_rgb(),
        )
    }

    /// CPU reference of the WGSL helper.
    pub fn apply(self, dst: Vec4, src: Vec4, opacity: f32) -> Vec4 {
        if self == BlendFunction::Skip {
            return dst;
        }
        let d = dst.truncate();
        let s = src.truncate();
        let rgb = match self {
            BlendFunction::Skip => d,
            BlendFunction::Normal => s,
            BlendFunction::Add => d + s,
            BlendFunction::Subtract => d - s,
            BlendFunction::Multiply => d * s,
            BlendFunction::Screen => Vec3::ONE - (Vec3::ONE - d) * (Vec3::ONE - s),
            BlendFunction::Overlay => Vec3::select(
                d.cmplt(Vec3::splat(0.5)),
                2.0 * d * s,
                Vec3::ONE - 2.0 * (Vec3::ONE - d) * (Vec3::ONE - s),
            ),
            BlendFunction::Darken => d.min(s),
            BlendFunction::Lighten => d.max(s),
            BlendFunction::Difference => (d - s).abs(),
            BlendFunction::Average => (d + s) * 0.5,
        };
        dst.lerp(rgb.extend(src.w), opacity)
    }
}
