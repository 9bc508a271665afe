//! Static analysis of module scripts.
//!
//! Decides, without executing anything, whether a script invokes an
//! AI-calling plugin (`ctx.generate` / `ctx.reflect`), and whether it parses
//! under the sandbox grammar.  Runs when a module is stored and again on
//! engine startup, so it must be total: any input, however broken, yields a
//! normal [`Analysis`].
//!
//! Detection scans the source with comments and string literals blanked
//! out, so `// ctx.generate(...)` and `"ctx.reflect(...)"` don't count.
//! Aliasing (`let c = ctx; c.generate(...)`) is invisible to the scan; the
//! pipeline closes that hole by running modules analyzed as non-AI without
//! an LLM bridge, which turns a smuggled call into the fallback string.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::plugins::PluginRegistry;
use crate::sandbox::base_engine;

/// What the analyzer learned about one script.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub requires_ai: bool,
    /// Every `ctx.<name>(` occurrence, including names of unknown plugins.
    pub detected_plugins: BTreeSet<String>,
    pub syntax_ok: bool,
    pub errors: Vec<String>,
}

static CTX_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bctx\s*\.\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("ctx call pattern")
});

pub struct Analyzer {
    registry: std::sync::Arc<PluginRegistry>,
}

impl Analyzer {
    pub fn new(registry: std::sync::Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn analyze(&self, script: &str) -> Analysis {
        let mut analysis = Analysis::default();

        let stripped = strip_noise(script);
        for caps in CTX_CALL.captures_iter(&stripped) {
            let name = caps.get(1).expect("name group").as_str();
            analysis.detected_plugins.insert(name.to_string());
        }

        let ai_names = self.registry.ai_plugin_names();
        analysis.requires_ai = analysis
            .detected_plugins
            .iter()
            .any(|name| ai_names.contains(name.as_str()));

        match base_engine(&self.registry).compile(script) {
            Ok(_) => analysis.syntax_ok = true,
            Err(err) => {
                analysis.syntax_ok = false;
                analysis.errors.push(err.to_string());
            }
        }

        analysis
    }
}

/// Blank out comments and string/char literals, preserving length-ish
/// structure with spaces so token boundaries survive.
fn strip_noise(script: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Normal,
        LineComment,
        BlockComment(u32),
        Str,
        Char,
    }

    let mut out = String::with_capacity(script.len());
    let mut state = State::Normal;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    state = State::BlockComment(1);
                }
                '"' => {
                    out.push(' ');
                    state = State::Str;
                }
                '\'' => {
                    out.push(' ');
                    state = State::Char;
                }
                _ => out.push(c),
            },
            State::LineComment => {
                if c == '\n' {
                    out.push('\n');
                    state = State::Normal;
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment(depth) => {
                // Rhai block comments nest.
                if c == '/' && chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str("  ");
                    state = State::BlockComment(depth + 1);
                } else if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    state = if depth > 1 { State::BlockComment(depth - 1) } else { State::Normal };
                } else {
                    out.push(if c == '\n' { '\n' } else { ' ' });
                }
            }
            State::Str => match c {
                '\\' => {
                    chars.next();
                    out.push_str("  ");
                }
                '"' => {
                    out.push(' ');
                    state = State::Normal;
                }
                _ => out.push(' '),
            },
            State::Char => match c {
                '\\' => {
                    chars.next();
                    out.push_str("  ");
                }
                '\'' => {
                    out.push(' ');
                    state = State::Normal;
                }
                _ => out.push(' '),
            },
        }
    }

    out
}

// ── Tests ────────────────────────────────────────────────────────────────────
