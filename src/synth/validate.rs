//! WGSL validation and program statistics using naga.

/// Resource and size figures for one synthesized program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramStats {
    /// Sampled textures bound by the program.
    pub textures: u32,
    pub samplers: u32,
    /// Expressions across all functions and entry points. `None` when the
    /// program was not validated.
    pub expressions: Option<usize>,
}

/// Parse and validate WGSL, returning the statistics naga can see.
///
/// Errors carry naga's diagnostic rendered against the source.
pub fn validate_wgsl(source: &str) -> Result<ProgramStats, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::default(),
    )
    .validate(&module)
    .map_err(|e| e.emit_to_string(source))?;

    let mut stats = ProgramStats::default();
    for (_, var) in module.global_variables.iter() {
        match module.types[var.ty].inner {
            naga::TypeInner::Image { .. } => stats.textures += 1,
            naga::TypeInner::Sampler { .. } => stats.samplers += 1,
            _ => {}
        }
    }

    let functions: usize = module
        .functions
        .iter()
        .map(|(_, f)| f.expressions.len())
        .sum();
    let entry_points: usize = module
        .entry_points
        .iter()
        .map(|ep| ep.function.expressions.len())
        .sum();
    stats.expressions = Some(functions + entry_points);

    Ok(stats)
}
