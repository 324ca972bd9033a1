//! Input sanitizer.
//!
//! Whatever text comes in, what goes out imports the renderer runtime,
//! declares exactly one scene with one `construct` entry point, and performs
//! at least one renderer-visible action inside it. Repairs are applied in
//! place where the input has a usable scene; otherwise the input is replaced
//! with a template. The sanitizer never fails.

pub mod template;

use serde::Serialize;
use tracing::{debug, info};

use crate::scan::{self, ScannedLine};

pub const RUNTIME_MODULE: &str = "manim";
pub const RUNTIME_IMPORT: &str = "from manim import *";
pub const ENTRY_METHOD: &str = "construct";
pub const ACTION_CALLS: &[&str] = &["self.play(", "self.wait(", "self.add("];

const DEFAULT_ACTIONS: &[&str] = &[
    "placeholder_title = Text(\"Animation\", font_size=36)",
    "placeholder_title.move_to(ORIGIN)",
    "self.play(Write(placeholder_title))",
    "self.wait(1)",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sanitized {
    pub source: String,
    /// Name of the scene class the renderer should instantiate.
    pub scene: String,
    pub outcome: SanitizeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SanitizeOutcome {
    Untouched,
    Repaired(Vec<Repair>),
    Substituted(SubstitutionReason),
}

impl SanitizeOutcome {
    pub fn is_substituted(&self) -> bool {
        matches!(self, SanitizeOutcome::Substituted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Repair {
    DroppedExtraScenes(usize),
    DroppedExtraEntryPoints(usize),
    SplitOneLineEntryPoint,
    InjectedDefaultActions,
    AddedRuntimeImport,
    AddedMainGuard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstitutionReason {
    EmptyInput,
    NoSceneClass,
    NoEntryPoint,
}

/// A scene class and the `construct` methods declared directly in its body.
/// Line indices are zero-based; `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneDecl {
    pub name: String,
    pub line: usize,
    pub end: usize,
    pub entry_points: Vec<EntryPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub line: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Structure {
    pub has_runtime: bool,
    /// `from manim import *`, which the injected default actions rely on.
    pub has_star_import: bool,
    pub has_main_guard: bool,
    pub scenes: Vec<SceneDecl>,
    lines: Vec<ScannedLine>,
}

impl Structure {
    pub fn inspect(source: &str) -> Self {
        let lines = scan::scan(source).lines;
        let mut structure = Structure::default();

        let mut idx = 0usize;
        while idx < lines.len() {
            let line = &lines[idx];
            if !line.is_logical_start() {
                idx += 1;
                continue;
            }
            let (code, end) = scan::logical_code(&lines, idx);
            let trimmed = code.trim();
            if is_runtime_import(trimmed) {
                structure.has_runtime = true;
                structure.has_star_import |= is_star_import(trimmed);
            }
            if line.indent == 0 && trimmed.starts_with("if __name__") {
                structure.has_main_guard = true;
            }
            if line.first_word() == "class"
                && let Some(name) = scene_class_name(trimmed)
            {
                let block_end = scan::block_end(&lines, idx);
                structure.scenes.push(SceneDecl {
                    name,
                    line: idx,
                    end: block_end,
                    entry_points: entry_points(&lines, idx, block_end),
                });
                idx = block_end.max(end);
                continue;
            }
            idx = end;
        }

        structure.lines = lines;
        structure
    }

    /// The scene that will be rendered: the first one with an entry point.
    pub fn primary(&self) -> Option<&SceneDecl> {
        self.scenes.iter().find(|s| !s.entry_points.is_empty())
    }

    pub fn has_action(&self, entry: EntryPoint) -> bool {
        self.lines[entry.line..entry.end]
            .iter()
            .any(|line| ACTION_CALLS.iter().any(|call| line.code.contains(call)))
    }

    /// Whether `source` already satisfies the sanitizer's output contract.
    pub fn is_renderable(&self) -> bool {
        self.has_runtime
            && self.scenes.len() == 1
            && self.scenes[0].entry_points.len() == 1
            && self.has_action(self.scenes[0].entry_points[0])
    }
}

pub fn sanitize(raw: &str) -> Sanitized {
    if raw.trim().is_empty() {
        return substitute(raw, SubstitutionReason::EmptyInput);
    }

    let structure = Structure::inspect(raw);
    if structure.scenes.is_empty() {
        return substitute(raw, SubstitutionReason::NoSceneClass);
    }
    if structure.primary().is_none() {
        return substitute(raw, SubstitutionReason::NoEntryPoint);
    }

    let mut repairs = Vec::new();
    let mut source = drop_extra_entry_points(raw, &structure, &mut repairs);
    source = ensure_actions(source, &mut repairs);
    source = ensure_runtime_import(source, &mut repairs);
    let (source, scene) = ensure_main_guard(source, &mut repairs);

    let outcome = if repairs.is_empty() {
        SanitizeOutcome::Untouched
    } else {
        info!(repairs = ?repairs, scene = %scene, "Repaired scene source");
        SanitizeOutcome::Repaired(repairs)
    };

    Sanitized {
        source,
        scene,
        outcome,
    }
}

fn substitute(raw: &str, reason: SubstitutionReason) -> Sanitized {
    let extracted = template::extract_text(raw);
    info!(
        reason = ?reason,
        extracted = extracted.as_deref().unwrap_or(""),
        "Scene source unusable, substituting template"
    );
    let rendered = template::render(extracted.as_deref());
    Sanitized {
        source: rendered.source,
        scene: rendered.scene,
        outcome: SanitizeOutcome::Substituted(reason),
    }
}

fn drop_extra_entry_points(raw: &str, structure: &Structure, repairs: &mut Vec<Repair>) -> String {
    let lines: Vec<&str> = structure.lines.iter().map(|l| l.raw.as_str()).collect();
    let mut keep = vec![true; lines.len()];
    let mut primary_seen = false;
    let mut dropped_scenes = 0usize;
    let mut dropped_entries = 0usize;

    for scene in &structure.scenes {
        if !primary_seen && !scene.entry_points.is_empty() {
            primary_seen = true;
            for extra in scene.entry_points.iter().skip(1) {
                keep[extra.line..extra.end].fill(false);
                dropped_entries += 1;
            }
        } else {
            keep[scene.line..scene.end].fill(false);
            dropped_scenes += 1;
        }
    }

    if dropped_scenes == 0 && dropped_entries == 0 {
        return raw.to_string();
    }
    if dropped_scenes > 0 {
        repairs.push(Repair::DroppedExtraScenes(dropped_scenes));
    }
    if dropped_entries > 0 {
        repairs.push(Repair::DroppedExtraEntryPoints(dropped_entries));
    }
    debug!(dropped_scenes, dropped_entries, "Dropped duplicate scene declarations");

    lines
        .iter()
        .zip(keep)
        .filter_map(|(line, keep)| keep.then_some(*line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn ensure_actions(source: String, repairs: &mut Vec<Repair>) -> String {
    let structure = Structure::inspect(&source);
    let Some(entry) = structure.primary().map(|s| s.entry_points[0]) else {
        return source;
    };
    if structure.has_action(entry) {
        return source;
    }

    let mut lines: Vec<String> = structure.lines.iter().map(|l| l.raw.clone()).collect();
    let (header_code, header_end) = scan::logical_code(&structure.lines, entry.line);
    let def_prefix = leading_whitespace(&lines[entry.line]).to_string();

    let body_prefix = if has_inline_body(&header_code) && header_end == entry.line + 1 {
        // `def construct(self): pass` - move the inline body onto its own line.
        let header = lines[entry.line].clone();
        let split_at = header
            .find(')')
            .and_then(|close| header[close..].find(':').map(|colon| close + colon + 1));
        match split_at {
            Some(pos) => {
                let body_prefix = format!("{def_prefix}    ");
                lines[entry.line] = header[..pos].trim_end().to_string();
                lines.insert(
                    entry.line + 1,
                    format!("{body_prefix}{}", header[pos..].trim()),
                );
                repairs.push(Repair::SplitOneLineEntryPoint);
                body_prefix
            }
            None => format!("{def_prefix}    "),
        }
    } else {
        structure.lines[header_end..entry.end]
            .iter()
            .find(|line| line.is_logical_start())
            .map(|line| leading_whitespace(&line.raw).to_string())
            .unwrap_or_else(|| format!("{def_prefix}    "))
    };

    let insert_at = header_end.min(lines.len());
    for (offset, action) in DEFAULT_ACTIONS.iter().enumerate() {
        lines.insert(insert_at + offset, format!("{body_prefix}{action}"));
    }
    repairs.push(Repair::InjectedDefaultActions);
    lines.join("\n")
}

fn ensure_runtime_import(source: String, repairs: &mut Vec<Repair>) -> String {
    let structure = Structure::inspect(&source);
    let needs_star = repairs.contains(&Repair::InjectedDefaultActions);
    if structure.has_runtime && (structure.has_star_import || !needs_star) {
        return source;
    }
    repairs.push(Repair::AddedRuntimeImport);
    format!("{RUNTIME_IMPORT}\n\n{source}")
}

fn ensure_main_guard(mut source: String, repairs: &mut Vec<Repair>) -> (String, String) {
    let structure = Structure::inspect(&source);
    let scene = structure
        .primary()
        .map(|s| s.name.clone())
        .unwrap_or_default();
    if !structure.has_main_guard {
        if !source.ends_with('\n') {
            source.push('\n');
        }
        source.push_str(&format!(
            "\n\nif __name__ == '__main__':\n    {scene}().render()\n"
        ));
        repairs.push(Repair::AddedMainGuard);
    }
    (source, scene)
}

fn is_runtime_import(code: &str) -> bool {
    if let Some(rest) = code.strip_prefix("from ") {
        let module = scan::first_word(rest);
        let after = &rest.trim_start()[module.len()..];
        return module == RUNTIME_MODULE && (after.starts_with(' ') || after.starts_with('.'));
    }
    if let Some(rest) = code.strip_prefix("import ") {
        return rest
            .split(',')
            .any(|item| scan::first_word(item) == RUNTIME_MODULE);
    }
    false
}

fn is_star_import(code: &str) -> bool {
    code.split_whitespace().collect::<Vec<_>>() == ["from", RUNTIME_MODULE, "import", "*"]
}

/// Name of the class declared by `class Name(Bases):` when any base is a
/// renderer scene type.
fn scene_class_name(code: &str) -> Option<String> {
    let rest = code.strip_prefix("class")?.trim_start();
    let name = scan::first_word(rest);
    if name.is_empty() {
        return None;
    }
    let after = &rest[name.len()..];
    let open = after.find('(')?;
    let close = after.rfind(')')?;
    if close <= open {
        return None;
    }
    let is_scene = after[open + 1..close].split(',').any(|base| {
        let base = base.trim();
        let last = base.rsplit('.').next().unwrap_or(base).trim();
        last.ends_with("Scene")
    });
    is_scene.then(|| name.to_string())
}

fn entry_points(lines: &[ScannedLine], class_line: usize, class_end: usize) -> Vec<EntryPoint> {
    let (_, body_start) = scan::logical_code(lines, class_line);
    let Some(body_indent) = lines[body_start..class_end]
        .iter()
        .find(|line| line.is_logical_start())
        .map(|line| line.indent)
    else {
        return Vec::new();
    };

    let mut found = Vec::new();
    let mut idx = body_start;
    while idx < class_end {
        let line = &lines[idx];
        if line.is_logical_start() && line.indent == body_indent && is_entry_def(&line.code) {
            let end = scan::block_end(lines, idx).min(class_end);
            found.push(EntryPoint { line: idx, end });
            idx = end.max(idx + 1);
            continue;
        }
        idx += 1;
    }
    found
}

fn is_entry_def(code: &str) -> bool {
    let Some(rest) = code.trim_start().strip_prefix("def") else {
        return false;
    };
    if !rest.starts_with(char::is_whitespace) {
        return false;
    }
    let rest = rest.trim_start();
    rest.strip_prefix(ENTRY_METHOD)
        .is_some_and(|after| after.trim_start().starts_with('('))
}

fn has_inline_body(header_code: &str) -> bool {
    let Some(close) = header_code.rfind(')') else {
        return false;
    };
    header_code[close..]
        .split_once(':')
        .is_some_and(|(_, body)| !body.trim().is_empty())
}

fn leading_whitespace(raw: &str) -> &str {
    let end = raw
        .find(|c: char| c != ' ' && c != '\t')
        .unwrap_or(raw.len());
    &raw[..end]
}
