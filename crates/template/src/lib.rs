//! Persona template reference extraction.
//!
//! A persona template embeds prompt modules as `@name` and module-local
//! variables as `${name}`.  This crate turns template text into an ordered
//! reference list plus warnings; it never rewrites the text itself.
//! Substitution strategy (recursion, cycle breaking, stage splitting) lives
//! in the pipeline layer.
//!
//! Escape rule: a backslash immediately before `@` suppresses the reference.
//! `\@name` survives resolution untouched and is collapsed to the literal
//! `@name` by [`unescape`] once all resolution passes are done.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ── Warnings ─────────────────────────────────────────────────────────────────

/// Non-fatal problem classes surfaced during parsing and resolution.
///
/// These mirror the degrade-and-continue policy of the whole engine: user
/// mistakes never abort a turn, they leave text verbatim and show up here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Undefined/inactive module, undefined variable, or a malformed `@` run.
    InvalidReference,
    /// A module reference was already on the resolution stack.
    Cycle,
    /// Resolution exceeded the maximum nesting depth.
    RecursionLimit,
    /// A module script failed to compile, raised, or timed out.
    ScriptError,
    /// An AI plugin call was made past the reflection-depth limit.
    ReflectionLimit,
    /// An LLM call inside a script failed and a fallback string was used.
    ProviderError,
    /// A top-level script variable could not be represented as JSON.
    NonSerializableVariable,
}

/// A single warning with a human-readable detail message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

// ── References ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Module,
    Variable,
}

/// One `@module` or `${var}` occurrence, with its byte span in the template.
///
/// Spans always cover the full source run (`@name` / `${name}`) so callers
/// can splice replacements with plain range substitution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub name: String,
    pub start: usize,
    pub end: usize,
}

/// Result of [`parse`]: references in textual order plus parse-time warnings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub references: Vec<Reference>,
    pub warnings: Vec<Warning>,
}

impl ParseOutcome {
    /// Names of all module references, deduplicated, in first-occurrence order.
    pub fn module_names(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for reference in &self.references {
            if reference.kind == ReferenceKind::Module && !seen.contains(&reference.name) {
                seen.push(reference.name.clone());
            }
        }
        seen
    }
}

// ── Patterns ─────────────────────────────────────────────────────────────────

// The optional leading backslash stands in for the look-behind `(?<!\\)` of
// the reference grammar — the `regex` crate has no look-around, so escapes
// are detected by capturing the backslash into the match instead.
static MODULE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\?@([a-z][a-z0-9_]*)").expect("module reference pattern"));

static INVALID_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\?@([A-Z0-9_][A-Za-z0-9_]*)").expect("invalid reference pattern"));

static VARIABLE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([a-z_][a-z0-9_]*)\}").expect("variable reference pattern"));

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Extract every module and variable reference from `template`.
///
/// - `@name` where `name` matches `[a-z][a-z0-9_]*` is a module reference.
/// - `\@name` is an escape: no reference, no warning.
/// - `@Name` / `@1name` / `@_name` look like references but violate the
///   module-name grammar; they are left for the caller verbatim and reported
///   as [`WarningKind::InvalidReference`].
/// - `${name}` where `name` matches `[a-z_][a-z0-9_]*` is a variable
///   reference.
///
/// References come back in textual order; duplicates are preserved.
pub fn parse(template: &str) -> ParseOutcome {
    let mut references = Vec::new();
    let mut warnings = Vec::new();

    for caps in MODULE_REF.captures_iter(template) {
        let whole = caps.get(0).expect("match");
        if template[whole.range()].starts_with('\\') {
            continue;
        }
        let name = caps.get(1).expect("name group").as_str();
        references.push(Reference {
            kind: ReferenceKind::Module,
            name: name.to_string(),
            start: whole.start(),
            end: whole.end(),
        });
    }

    for caps in INVALID_REF.captures_iter(template) {
        let whole = caps.get(0).expect("match");
        if template[whole.range()].starts_with('\\') {
            continue;
        }
        let name = caps.get(1).expect("name group").as_str();
        warnings.push(Warning::new(
            WarningKind::InvalidReference,
            format!("`@{name}` is not a valid module reference (names match [a-z][a-z0-9_]*); left verbatim"),
        ));
    }

    for caps in VARIABLE_REF.captures_iter(template) {
        let whole = caps.get(0).expect("match");
        let name = caps.get(1).expect("name group").as_str();
        references.push(Reference {
            kind: ReferenceKind::Variable,
            name: name.to_string(),
            start: whole.start(),
            end: whole.end(),
        });
    }

    references.sort_by_key(|reference| reference.start);
    ParseOutcome { references, warnings }
}

/// Collapse `\@` escapes to literal `@`.
///
/// Called exactly once, after the final resolution pass, so that escaped
/// references survive every intermediate substitution round untouched.
pub fn unescape(text: &str) -> String {
    text.replace("\\@", "@")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn module_refs(outcome: &ParseOutcome) -> Vec<(&str, usize, usize)> {
        outcome
            .references
            .iter()
            .filter(|r| r.kind == ReferenceKind::Module)
            .map(|r| (r.name.as_str(), r.start, r.end))
            .collect()
    }

    #[test]
    fn extracts_module_reference_with_span() {
        let outcome = parse("You are @greeting.");
        assert_eq!(module_refs(&outcome), vec![("greeting", 8, 17)]);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn escaped_reference_is_not_extracted() {
        let outcome = parse(r"literal \@name and @greeting");
        assert_eq!(module_refs(&outcome), vec![("greeting", 19, 28)]);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn invalid_looking_references_warn_and_are_skipped() {
        let outcome = parse("@Upper @1digit @_under @ok");
        assert_eq!(module_refs(&outcome), vec![("ok", 23, 26)]);
        let kinds: Vec<_> = outcome.warnings.iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![
                WarningKind::InvalidReference,
                WarningKind::InvalidReference,
                WarningKind::InvalidReference
            ]
        );
    }

    #[test]
    fn escaped_invalid_reference_is_silent() {
        let outcome = parse(r"\@Upper");
        assert!(outcome.references.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn reference_stops_at_first_invalid_char() {
        // The grammar is maximal-munch over [a-z0-9_]; an uppercase letter
        // terminates the name rather than invalidating the reference.
        let outcome = parse("@fooBar");
        assert_eq!(module_refs(&outcome), vec![("foo", 0, 4)]);
    }

    #[test]
    fn variables_and_modules_interleave_in_textual_order() {
        let outcome = parse("a ${x} b @mod c ${y_2}");
        let names: Vec<_> = outcome
            .references
            .iter()
            .map(|r| (r.kind, r.name.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![
                (ReferenceKind::Variable, "x"),
                (ReferenceKind::Module, "mod"),
                (ReferenceKind::Variable, "y_2"),
            ]
        );
    }

    #[test]
    fn duplicate_references_are_preserved() {
        let outcome = parse("@a @a @a");
        assert_eq!(module_refs(&outcome).len(), 3);
        assert_eq!(outcome.module_names(), vec!["a".to_string()]);
    }

    #[test]
    fn email_like_text_parses_as_reference() {
        // `user@example.com` contains a syntactically valid reference; the
        // resolver will report it as missing and leave it verbatim.
        let outcome = parse("mail me at user@example.com");
        assert_eq!(module_refs(&outcome), vec![("example", 15, 23)]);
    }

    #[test]
    fn unescape_collapses_escapes_only() {
        assert_eq!(unescape(r"literal \@name and @x"), "literal @name and @x");
        assert_eq!(unescape("no escapes"), "no escapes");
    }

    #[test]
    fn span_substitution_is_identity_when_refs_resolve_to_themselves() {
        // Reassembly property: replacing every reference span with its own
        // source text reproduces the template byte for byte.
        let template = "x @a y ${b} z @c";
        let outcome = parse(template);
        let mut rebuilt = String::new();
        let mut cursor = 0;
        for reference in &outcome.references {
            rebuilt.push_str(&template[cursor..reference.start]);
            rebuilt.push_str(&template[reference.start..reference.end]);
            cursor = reference.end;
        }
        rebuilt.push_str(&template[cursor..]);
        assert_eq!(rebuilt, template);
    }
}
