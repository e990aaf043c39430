//! End-to-end composer behaviour against the software renderer.

use hoplite_fx::renderer::software::{Image, ImageHandle, SoftwareRenderer};
use hoplite_fx::{
    BlendFunction, Capabilities, Composer, ComposerConfig, ComposerError, CustomTarget,
    EffectDescriptor, FrameInput, MergeConstraints, PassKind, TargetRef, Vec2, Vec4,
};

const SIZE: u32 = 4;
const IDENTITY: &str = "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color; }";

fn scene() -> ImageHandle {
    ImageHandle::new(Image::from_fn(SIZE, SIZE, |x, y| {
        Vec4::new(x as f32 / 4.0, y as f32 / 4.0, 0.5, 1.0)
    }))
}

fn screen(size: u32) -> ImageHandle {
    ImageHandle::new(Image::new(size, size))
}

fn composer(renderer: SoftwareRenderer) -> Composer<SoftwareRenderer> {
    Composer::new(renderer, ComposerConfig::new().size(SIZE, SIZE))
}

fn identity_renderer(ids: &[&str]) -> SoftwareRenderer {
    let mut renderer = SoftwareRenderer::new();
    for id in ids {
        renderer.register_kernel(*id, |k| k.color);
    }
    renderer
}

fn pass_members(composer: &Composer<SoftwareRenderer>) -> Vec<Vec<String>> {
    composer
        .passes()
        .iter()
        .map(|p| p.members.iter().map(|m| m.to_string()).collect())
        .collect()
}

/// A grading chain with a spread of blend modes, opacities and uniforms.
fn grading_chain(constraints: MergeConstraints) -> (SoftwareRenderer, Vec<EffectDescriptor>) {
    let mut renderer = SoftwareRenderer::new();
    renderer.register_kernel("gain", |k| k.color * k.param(0).x);
    renderer.register_kernel("tint", |k| (k.param(0).truncate() * k.color.truncate()).extend(k.color.w));
    renderer.register_kernel("invert", |k| (Vec4::ONE - k.color).with_w(k.color.w));
    renderer.register_kernel("lift", |k| k.color + Vec4::new(0.1, 0.05, 0.0, 0.0));

    let effects = vec![
        EffectDescriptor::new(
            "gain",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color * params.amount; }",
        )
        .with_uniform("amount", 1.5)
        .constrained(constraints),
        EffectDescriptor::new(
            "tint",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return vec4f(params.tint.rgb * color.rgb, color.a); }",
        )
        .with_uniform("tint", [0.9, 0.8, 1.0, 0.0])
        .with_blend(BlendFunction::Multiply)
        .with_opacity(0.7)
        .constrained(constraints),
        EffectDescriptor::new(
            "invert",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return vec4f(1.0 - color.rgb, color.a); }",
        )
        .with_blend(BlendFunction::Screen)
        .with_opacity(0.4)
        .constrained(constraints),
        EffectDescriptor::new(
            "lift",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color + vec4f(0.1, 0.05, 0.0, 0.0); }",
        )
        .with_blend(BlendFunction::Overlay)
        .constrained(constraints),
    ];
    (renderer, effects)
}

#[test]
fn isolated_effect_splits_chain_into_three_draws() {
    let mut composer = composer(identity_renderer(&["a", "b", "c", "d"]));
    composer.add_effect(EffectDescriptor::new("a", IDENTITY)).unwrap();
    composer.add_effect(EffectDescriptor::new("b", IDENTITY)).unwrap();
    composer
        .add_effect(EffectDescriptor::new("c", IDENTITY).constrained(MergeConstraints::ISOLATE))
        .unwrap();
    composer.add_effect(EffectDescriptor::new("d", IDENTITY)).unwrap();

    let (scene, screen) = (scene(), screen(SIZE));
    let stats = composer
        .render(0.016, &FrameInput::new(&scene, &screen))
        .unwrap();

    assert_eq!(stats.draw_calls, 3);
    assert_eq!(
        pass_members(&composer),
        vec![vec!["a", "b"], vec!["c"], vec!["d"]]
    );
    let kinds: Vec<_> = composer.passes().iter().map(|p| p.kind).collect();
    assert_eq!(kinds, vec![PassKind::Merged, PassKind::Isolated, PassKind::Merged]);
    assert_eq!(composer.passes()[2].output, TargetRef::Screen);
    assert_eq!(screen.snapshot(), scene.snapshot());
}

#[test]
fn merged_output_matches_isolated_output() {
    let (merged_renderer, merged_effects) = grading_chain(MergeConstraints::empty());
    let (isolated_renderer, isolated_effects) = grading_chain(MergeConstraints::ISOLATE);

    let mut merged = composer(merged_renderer);
    for effect in merged_effects {
        merged.add_effect(effect).unwrap();
    }
    let mut isolated = composer(isolated_renderer);
    for effect in isolated_effects {
        isolated.add_effect(effect).unwrap();
    }

    let scene = scene();
    let (merged_screen, isolated_screen) = (screen(SIZE), screen(SIZE));
    let merged_stats = merged
        .render(0.016, &FrameInput::new(&scene, &merged_screen))
        .unwrap();
    let isolated_stats = isolated
        .render(0.016, &FrameInput::new(&scene, &isolated_screen))
        .unwrap();

    assert_eq!(merged_stats.draw_calls, 1);
    assert_eq!(isolated_stats.draw_calls, 4);

    let a = merged_screen.snapshot();
    let b = isolated_screen.snapshot();
    for (pa, pb) in a.pixels.iter().zip(&b.pixels) {
        assert!(pa.abs_diff_eq(*pb, 1e-6), "{pa} != {pb}");
    }
    assert_ne!(a, scene.snapshot());
}

/// Renders `effects` over a flat grey scene, returning draw calls and a pixel.
fn render_grey(renderer: SoftwareRenderer, effects: Vec<EffectDescriptor>) -> (usize, Vec4) {
    let mut composer = composer(renderer);
    for effect in effects {
        composer.add_effect(effect).unwrap();
    }
    let scene = ImageHandle::new(Image::filled(SIZE, SIZE, Vec4::new(0.2, 0.2, 0.2, 1.0)));
    let screen = screen(SIZE);
    let stats = composer
        .render(0.016, &FrameInput::new(&scene, &screen))
        .unwrap();
    (stats.draw_calls, screen.pixel(1, 2))
}

fn invert_effect(constraints: MergeConstraints) -> EffectDescriptor {
    EffectDescriptor::new(
        "invert",
        "fn apply(color: vec4f, uv: vec2f) -> vec4f { return vec4f(1.0 - color.rgb, color.a); }",
    )
    .constrained(constraints)
}

fn invert_kernel(renderer: &mut SoftwareRenderer) {
    renderer.register_kernel("invert", |k| (Vec4::ONE - k.color).with_w(k.color.w));
}

#[test]
fn input_sampling_sees_earlier_effects() {
    let renderer = || {
        let mut renderer = SoftwareRenderer::new();
        invert_kernel(&mut renderer);
        renderer.register_kernel("echo", |k| k.read_input(k.uv));
        renderer
    };
    let echo = |constraints: MergeConstraints| {
        EffectDescriptor::new(
            "echo",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return read_input(uv); }",
        )
        .constrained(MergeConstraints::CONVOLUTION | constraints)
    };

    let merged = render_grey(
        renderer(),
        vec![invert_effect(MergeConstraints::empty()), echo(MergeConstraints::empty())],
    );
    let isolated = render_grey(
        renderer(),
        vec![invert_effect(MergeConstraints::ISOLATE), echo(MergeConstraints::ISOLATE)],
    );
    assert_eq!((merged.0, isolated.0), (2, 2));
    assert!(merged.1.abs_diff_eq(Vec4::new(0.8, 0.8, 0.8, 1.0), 1e-6), "{}", merged.1);
    assert!(merged.1.abs_diff_eq(isolated.1, 1e-6));

    // without CONVOLUTION the fragment is refused up front
    let mut composer = composer(renderer());
    assert!(matches!(
        composer.add_effect(EffectDescriptor::new(
            "echo",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return read_input(uv); }",
        )),
        Err(ComposerError::Configuration { .. })
    ));
}

#[test]
fn custom_target_prepass_sees_earlier_effects() {
    let renderer = || {
        let mut renderer = SoftwareRenderer::new();
        invert_kernel(&mut renderer);
        renderer.register_kernel("glow", |k| k.read_custom(k.uv));
        renderer.register_prepass_kernel("glow", |k| k.read_input(k.uv));
        renderer
    };
    let glow = |constraints: MergeConstraints| {
        EffectDescriptor::new(
            "glow",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return read_custom(uv); }",
        )
        .with_custom_target(CustomTarget::new(
            "fn prepass(uv: vec2f) -> vec4f { return read_input(uv); }",
        ))
        .constrained(constraints)
    };

    let merged = render_grey(
        renderer(),
        vec![invert_effect(MergeConstraints::empty()), glow(MergeConstraints::empty())],
    );
    let isolated = render_grey(
        renderer(),
        vec![invert_effect(MergeConstraints::ISOLATE), glow(MergeConstraints::ISOLATE)],
    );
    // two passes plus the prepass
    assert_eq!((merged.0, isolated.0), (3, 3));
    assert!(merged.1.abs_diff_eq(Vec4::new(0.8, 0.8, 0.8, 1.0), 1e-6), "{}", merged.1);
    assert!(merged.1.abs_diff_eq(isolated.1, 1e-6));
}

#[test]
fn dispose_releases_everything_and_blocks_rendering() {
    let mut composer = composer(identity_renderer(&["a", "b"]));
    composer
        .add_effect(EffectDescriptor::new("a", IDENTITY).constrained(MergeConstraints::ISOLATE))
        .unwrap();
    composer.add_effect(EffectDescriptor::new("b", IDENTITY)).unwrap();

    let (scene, screen) = (scene(), screen(SIZE));
    let input = FrameInput::new(&scene, &screen);
    composer.render(0.016, &input).unwrap();
    assert!(composer.renderer().live_targets() > 0);

    composer.dispose().unwrap();
    assert!(composer.is_disposed());
    assert_eq!(composer.renderer().live_targets(), 0);
    assert_eq!(composer.renderer().live_programs(), 0);

    let draws = composer.renderer().draws().len();
    assert!(matches!(
        composer.render(0.016, &input),
        Err(ComposerError::Disposed)
    ));
    assert!(matches!(
        composer.add_effect(EffectDescriptor::new("c", IDENTITY)),
        Err(ComposerError::Disposed)
    ));
    assert!(matches!(composer.dispose(), Err(ComposerError::Disposed)));
    assert_eq!(composer.renderer().draws().len(), draws);
}

#[test]
fn opacity_and_uniform_updates_apply_without_replanning() {
    let mut renderer = SoftwareRenderer::new();
    renderer.register_kernel("gain", |k| k.color * k.param(0).x);
    let mut composer = composer(renderer);
    composer
        .add_effect(
            EffectDescriptor::new(
                "gain",
                "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color * params.amount; }",
            )
            .with_uniform("amount", 0.5),
        )
        .unwrap();

    let scene = ImageHandle::new(Image::filled(SIZE, SIZE, Vec4::ONE));
    let screen = screen(SIZE);
    let input = FrameInput::new(&scene, &screen);
    assert!(composer.render(0.016, &input).unwrap().replanned);
    assert_eq!(screen.pixel(0, 0), Vec4::splat(0.5));

    composer.set_uniform("gain", "amount", 0.25).unwrap();
    let stats = composer.render(0.016, &input).unwrap();
    assert!(!stats.replanned);
    assert_eq!(screen.pixel(1, 1), Vec4::splat(0.25));

    composer.set_opacity("gain", 0.0).unwrap();
    let stats = composer.render(0.016, &input).unwrap();
    assert!(!stats.replanned);
    assert_eq!(screen.pixel(2, 2), Vec4::ONE);
    assert_eq!(composer.renderer().compiles(), 1);
}

#[test]
fn resize_is_applied_on_the_next_frame() {
    let mut composer = composer(identity_renderer(&["a", "b"]));
    composer
        .add_effect(EffectDescriptor::new("a", IDENTITY).constrained(MergeConstraints::ISOLATE))
        .unwrap();
    composer.add_effect(EffectDescriptor::new("b", IDENTITY)).unwrap();

    let scene = scene();
    let small = screen(SIZE);
    composer
        .render(0.016, &FrameInput::new(&scene, &small))
        .unwrap();
    let before = composer.renderer().allocated_bytes();

    composer.resize(8, 8).unwrap();
    // nothing is reallocated until the next frame
    assert_eq!(composer.renderer().allocated_bytes(), before);
    composer.resize(0, 8).unwrap();

    let big_scene = ImageHandle::new(Image::filled(8, 8, Vec4::ONE));
    let big = screen(8);
    let stats = composer
        .render(0.016, &FrameInput::new(&big_scene, &big))
        .unwrap();
    assert!(!stats.replanned);
    assert_eq!(composer.renderer().allocated_bytes(), before * 4);
    for record in composer.renderer().draws() {
        assert_eq!(record.frame.resolution, [8.0, 8.0]);
    }
    assert_eq!(big.pixel(7, 7), Vec4::ONE);
}

#[test]
fn disabling_and_reenabling_keeps_declared_order() {
    let mut composer = composer(identity_renderer(&["a", "b", "c"]));
    for id in ["a", "b", "c"] {
        composer
            .add_effect(EffectDescriptor::new(id, IDENTITY).constrained(MergeConstraints::ISOLATE))
            .unwrap();
    }
    let (scene, screen) = (scene(), screen(SIZE));
    let input = FrameInput::new(&scene, &screen);

    composer.set_effect_enabled("b", false).unwrap();
    composer.render(0.016, &input).unwrap();
    assert_eq!(pass_members(&composer), vec![vec!["a"], vec!["c"]]);

    composer.set_effect_enabled("b", true).unwrap();
    let stats = composer.render(0.016, &input).unwrap();
    assert!(stats.replanned);
    assert_eq!(pass_members(&composer), vec![vec!["a"], vec!["b"], vec!["c"]]);
}

#[test]
fn failed_compile_drops_only_that_pass() {
    // "b" has no kernel, so the software renderer refuses its program
    let mut composer = composer(identity_renderer(&["a", "c"]));
    composer.add_effect(EffectDescriptor::new("a", IDENTITY)).unwrap();
    composer
        .add_effect(EffectDescriptor::new("b", IDENTITY).constrained(MergeConstraints::ISOLATE))
        .unwrap();
    composer.add_effect(EffectDescriptor::new("c", IDENTITY)).unwrap();

    let (scene, screen) = (scene(), screen(SIZE));
    let input = FrameInput::new(&scene, &screen);
    match composer.render(0.016, &input) {
        Err(ComposerError::Compile { pass, .. }) => assert!(pass.contains("[b]"), "{pass}"),
        other => panic!("expected a compile error, got {other:?}"),
    }
    assert_eq!(composer.renderer().draws().len(), 2);
    assert_eq!(pass_members(&composer), vec![vec!["a"], vec!["c"]]);
    assert_eq!(composer.compile_failures().len(), 1);
    assert_eq!(screen.snapshot(), scene.snapshot());

    // reported once, the next frame draws what is left
    composer.render(0.016, &input).unwrap();

    composer
        .renderer_mut()
        .register_kernel("b", |k| k.color);
    composer.set_effect_enabled("b", false).unwrap();
    composer.set_effect_enabled("b", true).unwrap();
    composer.render(0.016, &input).unwrap();
    assert_eq!(pass_members(&composer), vec![vec!["a"], vec!["b"], vec!["c"]]);
    assert!(composer.compile_failures().is_empty());
}

#[test]
fn allocation_failure_is_a_resource_error() {
    let renderer = identity_renderer(&["a", "b"]).with_memory_budget(16);
    let mut composer = composer(renderer);
    composer
        .add_effect(EffectDescriptor::new("a", IDENTITY).constrained(MergeConstraints::ISOLATE))
        .unwrap();
    composer.add_effect(EffectDescriptor::new("b", IDENTITY)).unwrap();

    let (scene, screen) = (scene(), screen(SIZE));
    assert!(matches!(
        composer.render(0.016, &FrameInput::new(&scene, &screen)),
        Err(ComposerError::Resource(_))
    ));
    assert!(composer.renderer().draws().is_empty());
}

#[test]
fn removing_an_effect_releases_its_custom_target() {
    let mut renderer = SoftwareRenderer::new();
    renderer.register_kernel("bloom", |k| k.color + k.read_custom(k.uv));
    renderer.register_prepass_kernel("bloom", |k| k.read_input(k.uv) * 0.5);
    let mut composer = composer(renderer);
    composer
        .add_effect(
            EffectDescriptor::new(
                "bloom",
                "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color + read_custom(uv); }",
            )
            .with_blend(BlendFunction::Normal)
            .with_custom_target(CustomTarget::new(
                "fn prepass(uv: vec2f) -> vec4f { return read_input(uv) * 0.5; }",
            )),
        )
        .unwrap();

    let scene = ImageHandle::new(Image::filled(SIZE, SIZE, Vec4::splat(0.4)));
    let screen = screen(SIZE);
    let stats = composer
        .render(0.016, &FrameInput::new(&scene, &screen))
        .unwrap();
    assert_eq!(stats.draw_calls, 2);
    assert_eq!(composer.renderer().live_targets(), 1);
    assert!(screen.pixel(0, 0).abs_diff_eq(Vec4::splat(0.6), 1e-6));

    composer.remove_effect("bloom").unwrap();
    assert_eq!(composer.renderer().live_targets(), 0);
    assert!(matches!(
        composer.remove_effect("bloom"),
        Err(ComposerError::UnknownEffect(_))
    ));
}

#[test]
fn velocity_provider_feeds_later_consumer() {
    let mut renderer = SoftwareRenderer::new();
    renderer.register_kernel("motion", |_| Vec4::new(0.25, -0.5, 0.0, 0.0));
    renderer.register_kernel("show_velocity", |k| {
        let v: Vec2 = k.read_velocity(k.uv);
        Vec4::new(v.x, v.y, 0.0, 1.0)
    });
    let mut composer = composer(renderer);
    composer
        .add_effect(
            EffectDescriptor::new(
                "motion",
                "fn apply(color: vec4f, uv: vec2f) -> vec4f { return vec4f(0.25, -0.5, 0.0, 0.0); }",
            )
            .with_blend(BlendFunction::Skip)
            .providing(Capabilities::VELOCITY),
        )
        .unwrap();
    composer
        .add_effect(
            EffectDescriptor::new(
                "show_velocity",
                "fn apply(color: vec4f, uv: vec2f) -> vec4f { return vec4f(read_velocity(uv), 0.0, 1.0); }",
            )
            .requires(Capabilities::VELOCITY),
        )
        .unwrap();

    // no scene velocity: the provider supplies it
    let (scene, screen) = (scene(), screen(SIZE));
    let stats = composer
        .render(0.016, &FrameInput::new(&scene, &screen))
        .unwrap();

    assert_eq!(stats.passes, 2);
    assert_eq!(
        composer.passes()[0].side_outputs,
        vec![TargetRef::Provided(Capabilities::VELOCITY)]
    );
    assert_eq!(screen.pixel(3, 1), Vec4::new(0.25, -0.5, 0.0, 1.0));
}

#[test]
fn missing_depth_buffer_is_a_resource_error() {
    let mut renderer = SoftwareRenderer::new();
    renderer.register_kernel("fog", |k| k.color * (1.0 - k.read_depth(k.uv)));
    let mut composer = composer(renderer);
    composer
        .add_effect(
            EffectDescriptor::new(
                "fog",
                "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color * (1.0 - read_depth(uv)); }",
            )
            .requires(Capabilities::DEPTH),
        )
        .unwrap();

    let (scene, screen) = (scene(), screen(SIZE));
    assert!(matches!(
        composer.render(0.016, &FrameInput::new(&scene, &screen)),
        Err(ComposerError::Resource(_))
    ));
    assert!(composer.renderer().draws().is_empty());

    let depth = ImageHandle::new(Image::filled(SIZE, SIZE, Vec4::splat(0.25)));
    let color = ImageHandle::new(Image::filled(SIZE, SIZE, Vec4::ONE));
    composer
        .render(0.016, &FrameInput::new(&color, &screen).with_depth(&depth))
        .unwrap();
    assert_eq!(screen.pixel(0, 0), Vec4::splat(0.75));
}

#[test]
fn time_reaches_only_time_varying_programs() {
    let mut renderer = identity_renderer(&["still"]);
    renderer.register_kernel("pulse", |k| k.color * k.frame.time);
    let mut composer = composer(renderer);
    composer
        .add_effect(EffectDescriptor::new("still", IDENTITY).constrained(MergeConstraints::ISOLATE))
        .unwrap();
    composer
        .add_effect(EffectDescriptor::new(
            "pulse",
            "fn apply(color: vec4f, uv: vec2f) -> vec4f { return color * frame.time; }",
        ))
        .unwrap();

    let (scene, screen) = (scene(), screen(SIZE));
    let input = FrameInput::new(&scene, &screen);
    composer.render(0.25, &input).unwrap();
    composer.render(0.25, &input).unwrap();

    let draws = composer.renderer().draws();
    let last = &draws[draws.len() - 2..];
    assert_eq!(last[0].frame.time, 0.0);
    assert_eq!(last[1].frame.time, 0.5);
    assert_eq!(last[1].frame.delta_time, 0.25);
}

#[test]
fn unknown_effects_are_reported() {
    let mut composer = composer(SoftwareRenderer::new());
    assert!(matches!(
        composer.set_effect_enabled("ghost", false),
        Err(ComposerError::UnknownEffect(id)) if id.as_str() == "ghost"
    ));
    assert!(composer.move_effect("ghost", 0).is_err());
    assert!(composer.set_blend_function("ghost", BlendFunction::Add).is_err());
}
