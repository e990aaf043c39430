//! Symbol renaming for effect fragments.
//!
//! Fragments are concatenated into one WGSL module, so every top-level
//! symbol an effect declares is moved into a private namespace (`e{i}_`).
//! The pass works on a small WGSL tokenizer rather than on text patterns,
//! so member accesses (`v.apply`), struct field names and attribute names
//! are never touched.
//!
//! Besides renaming, the pass resolves the few symbols the synthesizer
//! provides: `params.<name>` becomes a swizzled parameter slot and
//! `read_custom` becomes the effect's own accessor. It also records which
//! shared inputs the fragment actually uses.

use std::collections::BTreeMap;

use crate::effect::{EffectDescriptor, UniformValue};

/// Names the synthesizer declares itself. Effects may reference some of them
/// but must not declare any of them.
pub const RESERVED: &[&str] = &[
    "frame",
    "params",
    "group_params",
    "FrameUniforms",
    "GroupParams",
    "FragmentOutput",
    "input_texture",
    "input_sampler",
    "depth_texture",
    "velocity_texture",
    "read_input",
    "read_depth",
    "read_velocity",
    "read_custom",
    "vs",
    "fs",
];

/// Prefixes reserved for synthesized declarations.
const RESERVED_PREFIXES: &[&str] = &["blend_", "custom_texture_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Ident,
    Number,
    Punct,
    Trivia,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
}

impl Token<'_> {
    fn is_punct(&self, p: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == p
    }

    fn is_ident(&self) -> bool {
        self.kind == TokenKind::Ident
    }
}

fn tokenize(src: &str) -> Result<Vec<Token<'_>>, String> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let c = bytes[i];
        let kind = if c.is_ascii_whitespace() {
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            TokenKind::Trivia
        } else if bytes[i..].starts_with(b"//") {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            TokenKind::Trivia
        } else if bytes[i..].starts_with(b"/*") {
            // block comments nest in WGSL
            let mut depth = 0usize;
            loop {
                if i >= bytes.len() {
                    return Err("unterminated block comment".into());
                }
                if bytes[i..].starts_with(b"/*") {
                    depth += 1;
                    i += 2;
                } else if bytes[i..].starts_with(b"*/") {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            TokenKind::Trivia
        } else if c == b'_' || c.is_ascii_alphabetic() {
            while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            TokenKind::Ident
        } else if c.is_ascii_digit() {
            while i < bytes.len()
                && (bytes[i] == b'_' || bytes[i] == b'.' || bytes[i].is_ascii_alphanumeric())
            {
                i += 1;
            }
            TokenKind::Number
        } else if !c.is_ascii() {
            return Err(format!("non-ASCII character at byte {start}"));
        } else {
            i += 1;
            TokenKind::Punct
        };
        tokens.push(Token {
            kind,
            text: &src[start..i],
        });
    }

    Ok(tokens)
}

/// Whether `s` is a plain ASCII WGSL identifier.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    s != "_" && !s.starts_with("__") && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// `e<digits>_...`, the shape of a renamed symbol.
fn has_namespace_prefix(ident: &str) -> bool {
    let Some(rest) = ident.strip_prefix('e') else {
        return false;
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && rest.as_bytes().get(digits) == Some(&b'_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Fn,
    Struct,
    Alias,
    Const,
    Override,
    Var,
}

/// Mapping from an effect's own symbols to their namespaced names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceTable {
    pub prefix: String,
    /// Original name -> (renamed symbol, declaration kind).
    pub symbols: BTreeMap<String, (String, DeclKind)>,
}

impl NamespaceTable {
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.symbols.get(name).map(|(renamed, _)| renamed.as_str())
    }

    /// Every symbol this fragment contributes to the merged module.
    pub fn emitted(&self) -> impl Iterator<Item = &str> {
        self.symbols.values().map(|(renamed, _)| renamed.as_str())
    }
}

/// Shared inputs a fragment references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input: bool,
    pub depth: bool,
    pub velocity: bool,
    pub time: bool,
}

/// Output of the namespace pass over one fragment.
#[derive(Debug, Clone)]
pub struct Namespaced {
    pub code: String,
    pub table: NamespaceTable,
    pub usage: Usage,
}

impl Namespaced {
    /// Namespaced name of the fragment's entry point.
    pub fn entry(&self, name: &str) -> String {
        format!("{}{}", self.table.prefix, name)
    }
}

/// Inputs to [`rename`].
pub struct RenameContext<'a> {
    pub prefix: &'a str,
    /// Function the fragment must declare (`apply` or `prepass`).
    pub entry: &'a str,
    pub uniforms: &'a [(String, UniformValue)],
    /// Parameter slot of the first uniform.
    pub first_uniform_slot: usize,
    /// Whether `read_custom` resolves for this fragment.
    pub has_custom: bool,
}

fn next_sig(tokens: &[Token<'_>], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|&i| tokens[i].kind != TokenKind::Trivia)
}

fn prev_sig(tokens: &[Token<'_>], before: usize) -> Option<usize> {
    (0..before).rev().find(|&i| tokens[i].kind != TokenKind::Trivia)
}

/// Collects top-level declarations and marks struct field-name tokens.
fn collect_declarations(
    tokens: &[Token<'_>],
) -> Result<(BTreeMap<String, DeclKind>, Vec<bool>), String> {
    let mut decls = BTreeMap::new();
    let mut is_field = vec![false; tokens.len()];
    let mut depth = 0usize;
    let mut pending_struct = false;
    let mut in_struct = false;

    let mut i = 0;
    while let Some(at) = next_sig(tokens, i) {
        let token = tokens[at];
        i = at + 1;

        if token.is_punct("@") {
            if let Some(attr) = next_sig(tokens, i) {
                if matches!(tokens[attr].text, "group" | "binding") {
                    return Err(format!(
                        "declares a resource binding (@{}); use required inputs instead",
                        tokens[attr].text
                    ));
                }
            }
            continue;
        }
        if token.is_punct("{") {
            if depth == 0 && pending_struct {
                in_struct = true;
                pending_struct = false;
            }
            depth += 1;
            continue;
        }
        if token.is_punct("}") {
            depth = depth.checked_sub(1).ok_or("unbalanced '}'")?;
            if depth == 0 {
                in_struct = false;
            }
            continue;
        }

        if in_struct && depth == 1 && token.is_ident() {
            if let Some(next) = next_sig(tokens, i) {
                if tokens[next].is_punct(":") {
                    is_field[at] = true;
                }
            }
            continue;
        }

        if depth != 0 || !token.is_ident() {
            continue;
        }

        let kind = match token.text {
            "fn" => DeclKind::Fn,
            "struct" => DeclKind::Struct,
            "alias" => DeclKind::Alias,
            "const" => DeclKind::Const,
            "override" => DeclKind::Override,
            "var" => DeclKind::Var,
            _ => continue,
        };

        let mut name_at = next_sig(tokens, i).ok_or("declaration without a name")?;
        if kind == DeclKind::Var && tokens[name_at].is_punct("<") {
            // skip the address-space template
            let close = (name_at..tokens.len())
                .find(|&j| tokens[j].is_punct(">"))
                .ok_or("unterminated var template")?;
            name_at = next_sig(tokens, close + 1).ok_or("declaration without a name")?;
        }
        let name = tokens[name_at];
        if !name.is_ident() {
            return Err(format!("expected a name after '{}'", token.text));
        }
        if decls.insert(name.text.to_string(), kind).is_some() {
            return Err(format!("'{}' declared twice", name.text));
        }
        if kind == DeclKind::Struct {
            pending_struct = true;
        }
        i = name_at + 1;
    }

    if depth != 0 {
        return Err("unbalanced '{'".into());
    }
    Ok((decls, is_field))
}

/// Runs the namespace pass over one fragment.
pub fn rename(source: &str, ctx: &RenameContext<'_>) -> Result<Namespaced, String> {
    let tokens = tokenize(source)?;
    let (decls, is_field) = collect_declarations(&tokens)?;

    for name in decls.keys() {
        if RESERVED.contains(&name.as_str())
            || RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
        {
            return Err(format!("declares reserved symbol '{name}'"));
        }
    }
    match decls.get(ctx.entry) {
        Some(DeclKind::Fn) => {}
        Some(_) => return Err(format!("'{}' must be a function", ctx.entry)),
        None => return Err(format!("missing entry point 'fn {}'", ctx.entry)),
    }

    let table = NamespaceTable {
        prefix: ctx.prefix.to_string(),
        symbols: decls
            .into_iter()
            .map(|(name, kind)| {
                let renamed = format!("{}{}", ctx.prefix, name);
                (name, (renamed, kind))
            })
            .collect(),
    };

    let mut usage = Usage::default();
    let mut code = String::with_capacity(source.len() + 64);
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i];
        if !token.is_ident() || is_field[i] {
            code.push_str(token.text);
            i += 1;
            continue;
        }

        let prev = prev_sig(&tokens, i).map(|p| tokens[p]);
        if prev.is_some_and(|p| p.is_punct(".") || p.is_punct("@")) {
            code.push_str(token.text);
            i += 1;
            continue;
        }

        if has_namespace_prefix(token.text) {
            return Err(format!(
                "identifier '{}' uses a reserved namespace prefix",
                token.text
            ));
        }

        let member = next_sig(&tokens, i + 1)
            .filter(|&dot| tokens[dot].is_punct("."))
            .and_then(|dot| next_sig(&tokens, dot + 1))
            .filter(|&m| tokens[m].is_ident());

        match token.text {
            "params" => {
                let m = member.ok_or("'params' must be accessed as params.<name>")?;
                let name = tokens[m].text;
                let (offset, (_, value)) = ctx
                    .uniforms
                    .iter()
                    .enumerate()
                    .find(|(_, (n, _))| n == name)
                    .ok_or_else(|| format!("unknown uniform 'params.{name}'"))?;
                code.push_str(&format!(
                    "group_params.slots[{}]{}",
                    ctx.first_uniform_slot + offset,
                    value.kind().swizzle()
                ));
                i = m + 1;
                continue;
            }
            "frame" => {
                if member.is_some_and(|m| matches!(tokens[m].text, "time" | "delta_time")) {
                    usage.time = true;
                }
                code.push_str(token.text);
            }
            "read_custom" => {
                if !ctx.has_custom {
                    return Err("uses read_custom without a custom render target".into());
                }
                code.push_str(ctx.prefix);
                code.push_str(token.text);
            }
            name => {
                match name {
                    "read_input" => usage.input = true,
                    "read_depth" => usage.depth = true,
                    "read_velocity" => usage.velocity = true,
                    _ => {}
                }
                match table.resolve(name) {
                    Some(renamed) => code.push_str(renamed),
                    None => code.push_str(name),
                }
            }
        }
        i += 1;
    }

    Ok(Namespaced { code, table, usage })
}

/// Runs the namespace pass over a descriptor's fragment (and prepass) in
/// isolation, checking that every shared input it uses is declared.
///
/// Inside a merged pass `read_input` samples the pass input, not the running
/// color, so a fragment that calls it must be a `CONVOLUTION` and start its
/// own pass. Prepasses always read the pass input and are exempt.
pub fn check_fragment(desc: &EffectDescriptor) -> Result<(), String> {
    use crate::effect::{Capabilities, MergeConstraints};

    let check_usage = |usage: &Usage, what: &str| -> Result<(), String> {
        if usage.depth && !desc.required_inputs.contains(Capabilities::DEPTH) {
            return Err(format!("{what} reads depth without requiring DEPTH"));
        }
        if usage.velocity && !desc.required_inputs.contains(Capabilities::VELOCITY) {
            return Err(format!("{what} reads velocity without requiring VELOCITY"));
        }
        Ok(())
    };

    let apply = rename(
        &desc.fragment_code,
        &RenameContext {
            prefix: "e0_",
            entry: "apply",
            uniforms: &desc.uniforms,
            first_uniform_slot: 1,
            has_custom: desc.custom_target.is_some(),
        },
    )?;
    check_usage(&apply.usage, "fragment")?;
    if apply.usage.input && !desc.merge_constraints.contains(MergeConstraints::CONVOLUTION) {
        return Err("fragment reads the pass input without declaring CONVOLUTION".into());
    }

    if let Some(target) = &desc.custom_target {
        let prepass = rename(
            &target.prepass_code,
            &RenameContext {
                prefix: "e0_",
                entry: "prepass",
                uniforms: &desc.uniforms,
                first_uniform_slot: 1,
                has_custom: false,
            },
        )
        .map_err(|e| format!("prepass: {e}"))?;
        check_usage(&prepass.usage, "prepass")?;
    }

    Ok(())
}
