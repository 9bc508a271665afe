//! Plugin registry and the built-in plugin families.
//!
//! Plugins are the only surface a script can touch: named callables invoked
//! as `ctx.name(...)`.  The registry is assembled once at startup and handed
//! around immutably; [`PluginRegistry::install`] binds every callable onto a
//! rhai engine with [`ScriptCtx`] as the hidden receiver argument.

use std::collections::BTreeSet;

use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Timelike};
use rand::seq::SliceRandom;
use rhai::{Array, Dynamic, Engine, Map};

use promptstage_modules::{Message, MessageRole};
use promptstage_template::WarningKind;

use crate::context::{AiCallSpec, ScriptCtx};

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginFamily {
    Ai,
    Conversation,
    Time,
    Memory,
    Utility,
}

/// Static description of one plugin, used by the analyzer and for
/// documentation surfaces.
#[derive(Debug, Clone, Copy)]
pub struct PluginMeta {
    pub name: &'static str,
    pub family: PluginFamily,
    pub signature: &'static str,
    /// True when calling this plugin makes the enclosing module an AI module.
    pub requires_ai: bool,
}

struct Plugin {
    meta: PluginMeta,
    install: fn(&mut Engine),
}

/// Name → callable table, write-once at startup.
pub struct PluginRegistry {
    plugins: Vec<Plugin>,
}

impl PluginRegistry {
    /// The built-in plugin set every engine ships.
    pub fn builtin() -> Self {
        let mut plugins = Vec::new();
        let mut add = |name, family, signature, requires_ai, install| {
            plugins.push(Plugin { meta: PluginMeta { name, family, signature, requires_ai }, install });
        };

        add("generate", PluginFamily::Ai,
            "generate(instructions, input?, role?|options?)", true, install_generate as fn(&mut Engine));
        add("reflect", PluginFamily::Ai,
            "reflect(instructions, input?, role?)", true, install_reflect);

        add("get_message_count", PluginFamily::Conversation,
            "get_message_count()", false, install_message_count);
        add("get_recent_messages", PluginFamily::Conversation,
            "get_recent_messages(n)", false, install_recent_messages);
        add("get_message_range", PluginFamily::Conversation,
            "get_message_range(start, end)", false, install_message_range);
        add("get_persona_info", PluginFamily::Conversation,
            "get_persona_info()", false, install_persona_info);
        add("get_conversation_summary", PluginFamily::Conversation,
            "get_conversation_summary()", false, install_conversation_summary);

        add("get_current_time", PluginFamily::Time,
            "get_current_time(fmt?)", false, install_current_time);
        add("get_relative_time", PluginFamily::Time,
            "get_relative_time()", false, install_relative_time);
        add("get_day_of_week", PluginFamily::Time,
            "get_day_of_week()", false, install_day_of_week);
        add("is_business_hours", PluginFamily::Time,
            "is_business_hours()", false, install_business_hours);

        add("get_variable", PluginFamily::Memory,
            "get_variable(name, default?)", false, install_get_variable);
        add("set_variable", PluginFamily::Memory,
            "set_variable(name, value)", false, install_set_variable);
        add("log", PluginFamily::Memory,
            "log(text)", false, install_log);

        add("to_json", PluginFamily::Utility,
            "to_json(value)", false, install_to_json);
        add("from_json", PluginFamily::Utility,
            "from_json(text)", false, install_from_json);
        add("join", PluginFamily::Utility,
            "join(items, separator)", false, install_join);
        add("word_count", PluginFamily::Utility,
            "word_count(text)", false, install_word_count);
        add("random_choice", PluginFamily::Utility,
            "random_choice(items)", false, install_random_choice);

        Self { plugins }
    }

    /// Add a host-supplied plugin.  Only possible while the registry is
    /// still exclusively owned — once shared behind an `Arc` it is
    /// effectively frozen, which is the point: read-only after startup.
    pub fn register(&mut self, meta: PluginMeta, install: fn(&mut Engine)) {
        self.plugins.push(Plugin { meta, install });
    }

    /// Bind the `Ctx` type and every plugin onto `engine`.
    pub fn install(&self, engine: &mut Engine) {
        engine.register_type_with_name::<ScriptCtx>("Ctx");
        for plugin in &self.plugins {
            (plugin.install)(engine);
        }
    }

    pub fn get(&self, name: &str) -> Option<&PluginMeta> {
        self.plugins.iter().map(|p| &p.meta).find(|m| m.name == name)
    }

    pub fn all(&self) -> impl Iterator<Item = &PluginMeta> {
        self.plugins.iter().map(|p| &p.meta)
    }

    /// Names whose invocation marks a module as requiring AI inference.
    pub fn ai_plugin_names(&self) -> BTreeSet<&'static str> {
        self.plugins
            .iter()
            .filter(|p| p.meta.requires_ai)
            .map(|p| p.meta.name)
            .collect()
    }
}

// ── AI plugins ───────────────────────────────────────────────────────────────

fn spec_from_options(instructions: &str, options: &Map, reflect: bool) -> AiCallSpec {
    let string_opt = |key: &str| {
        options
            .get(key)
            .and_then(|value| value.clone().into_string().ok())
    };
    AiCallSpec {
        instructions: instructions.to_string(),
        input: string_opt("input"),
        role: string_opt("role"),
        temperature: options.get("temperature").and_then(|value| {
            value
                .as_float()
                .ok()
                .or_else(|| value.as_int().ok().map(|i| i as f64))
        }),
        max_tokens: options
            .get("max_tokens")
            .and_then(|value| value.as_int().ok())
            .map(|i| i.max(0) as u64),
        system_prompt: String::new(),
        reflect,
    }
}

fn install_generate(engine: &mut Engine) {
    engine.register_fn("generate", |ctx: &mut ScriptCtx, instructions: &str| -> String {
        ctx.ai_call(AiCallSpec {
            instructions: instructions.to_string(),
            ..Default::default()
        })
    });
    engine.register_fn(
        "generate",
        |ctx: &mut ScriptCtx, instructions: &str, input: &str| -> String {
            ctx.ai_call(AiCallSpec {
                instructions: instructions.to_string(),
                input: Some(input.to_string()),
                ..Default::default()
            })
        },
    );
    engine.register_fn(
        "generate",
        |ctx: &mut ScriptCtx, instructions: &str, input: &str, role: &str| -> String {
            ctx.ai_call(AiCallSpec {
                instructions: instructions.to_string(),
                input: Some(input.to_string()),
                role: Some(role.to_string()),
                ..Default::default()
            })
        },
    );
    engine.register_fn(
        "generate",
        |ctx: &mut ScriptCtx, instructions: &str, options: Map| -> String {
            ctx.ai_call(spec_from_options(instructions, &options, false))
        },
    );
}

fn install_reflect(engine: &mut Engine) {
    engine.register_fn("reflect", |ctx: &mut ScriptCtx, instructions: &str| -> String {
        ctx.ai_call(AiCallSpec {
            instructions: instructions.to_string(),
            reflect: true,
            ..Default::default()
        })
    });
    engine.register_fn(
        "reflect",
        |ctx: &mut ScriptCtx, instructions: &str, input: &str| -> String {
            ctx.ai_call(AiCallSpec {
                instructions: instructions.to_string(),
                input: Some(input.to_string()),
                reflect: true,
                ..Default::default()
            })
        },
    );
    engine.register_fn(
        "reflect",
        |ctx: &mut ScriptCtx, instructions: &str, input: &str, role: &str| -> String {
            ctx.ai_call(AiCallSpec {
                instructions: instructions.to_string(),
                input: Some(input.to_string()),
                role: Some(role.to_string()),
                reflect: true,
                ..Default::default()
            })
        },
    );
}

// ── Conversation plugins ─────────────────────────────────────────────────────

fn message_to_map(message: &Message) -> Dynamic {
    let mut map = Map::new();
    let role = match message.role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    };
    map.insert("role".into(), Dynamic::from(role));
    map.insert("content".into(), Dynamic::from(message.content.clone()));
    Dynamic::from_map(map)
}

fn install_message_count(engine: &mut Engine) {
    engine.register_fn("get_message_count", |ctx: &mut ScriptCtx| -> i64 {
        ctx.message_count() as i64
    });
}

fn install_recent_messages(engine: &mut Engine) {
    engine.register_fn("get_recent_messages", |ctx: &mut ScriptCtx, n: i64| -> Array {
        ctx.recent_messages(n.max(0) as usize)
            .iter()
            .map(message_to_map)
            .collect()
    });
}

fn install_message_range(engine: &mut Engine) {
    engine.register_fn(
        "get_message_range",
        |ctx: &mut ScriptCtx, start: i64, end: i64| -> Array {
            ctx.message_range(start.max(0) as usize, end.max(0) as usize)
                .iter()
                .map(message_to_map)
                .collect()
        },
    );
}

fn install_persona_info(engine: &mut Engine) {
    engine.register_fn("get_persona_info", |ctx: &mut ScriptCtx| -> Map {
        let mut map = Map::new();
        map.insert("name".into(), Dynamic::from(ctx.persona_info().name.clone()));
        map.insert(
            "description".into(),
            Dynamic::from(ctx.persona_info().description.clone()),
        );
        map
    });
}

fn install_conversation_summary(engine: &mut Engine) {
    engine.register_fn("get_conversation_summary", |ctx: &mut ScriptCtx| -> String {
        ctx.conversation_summary().to_string()
    });
}

// ── Time plugins ─────────────────────────────────────────────────────────────

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_time(ctx: &ScriptCtx, fmt: &str) -> String {
    // Pre-parse so a bad user format degrades to RFC 3339 instead of
    // panicking inside `Display`.
    let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return ctx.now().to_rfc3339();
    }
    ctx.now().format_with_items(items.into_iter()).to_string()
}

fn install_current_time(engine: &mut Engine) {
    engine.register_fn("get_current_time", |ctx: &mut ScriptCtx| -> String {
        format_time(ctx, DEFAULT_TIME_FORMAT)
    });
    engine.register_fn("get_current_time", |ctx: &mut ScriptCtx, fmt: &str| -> String {
        format_time(ctx, fmt)
    });
}

fn install_relative_time(engine: &mut Engine) {
    engine.register_fn("get_relative_time", |ctx: &mut ScriptCtx| -> String {
        let Some(last) = ctx.recent_messages(1).last().cloned() else {
            return "no prior activity".to_string();
        };
        let elapsed = ctx.now().signed_duration_since(last.created_at);
        let seconds = elapsed.num_seconds().max(0);
        match seconds {
            0..=9 => "just now".to_string(),
            10..=59 => format!("{seconds}s ago"),
            60..=3599 => format!("{}m ago", seconds / 60),
            3600..=86_399 => format!("{}h ago", seconds / 3600),
            _ => format!("{}d ago", seconds / 86_400),
        }
    });
}

fn install_day_of_week(engine: &mut Engine) {
    engine.register_fn("get_day_of_week", |ctx: &mut ScriptCtx| -> String {
        ctx.now().format("%A").to_string()
    });
}

fn install_business_hours(engine: &mut Engine) {
    engine.register_fn("is_business_hours", |ctx: &mut ScriptCtx| -> bool {
        let now = ctx.now();
        let weekday = now.weekday().number_from_monday();
        weekday <= 5 && (9..17).contains(&now.hour())
    });
}

// ── Memory plugins ───────────────────────────────────────────────────────────

fn json_to_dynamic(value: serde_json::Value) -> Option<Dynamic> {
    rhai::serde::to_dynamic(value).ok()
}

fn install_get_variable(engine: &mut Engine) {
    engine.register_fn("get_variable", |ctx: &mut ScriptCtx, name: &str| -> Dynamic {
        ctx.get_variable(name)
            .and_then(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn(
        "get_variable",
        |ctx: &mut ScriptCtx, name: &str, default: Dynamic| -> Dynamic {
            ctx.get_variable(name)
                .and_then(json_to_dynamic)
                .unwrap_or(default)
        },
    );
}

fn install_set_variable(engine: &mut Engine) {
    engine.register_fn("set_variable", |ctx: &mut ScriptCtx, name: &str, value: Dynamic| {
        match serde_json::to_value(&value) {
            Ok(json) => ctx.set_variable(name, json),
            Err(err) => ctx.warn(
                WarningKind::NonSerializableVariable,
                format!("set_variable(`{name}`) skipped: {err}"),
            ),
        }
    });
}

fn install_log(engine: &mut Engine) {
    engine.register_fn("log", |ctx: &mut ScriptCtx, line: &str| {
        ctx.log(line);
    });
}

// ── Utility plugins ──────────────────────────────────────────────────────────

fn install_to_json(engine: &mut Engine) {
    engine.register_fn("to_json", |_ctx: &mut ScriptCtx, value: Dynamic| -> String {
        serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string())
    });
}

fn install_from_json(engine: &mut Engine) {
    engine.register_fn("from_json", |ctx: &mut ScriptCtx, text: &str| -> Dynamic {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => json_to_dynamic(value).unwrap_or(Dynamic::UNIT),
            Err(err) => {
                ctx.log(format!("from_json: invalid JSON ({err})"));
                Dynamic::UNIT
            }
        }
    });
}

fn install_join(engine: &mut Engine) {
    engine.register_fn("join", |_ctx: &mut ScriptCtx, items: Array, separator: &str| -> String {
        items
            .iter()
            .map(|item| item.to_string())
            .collect::<Vec<_>>()
            .join(separator)
    });
}

fn install_word_count(engine: &mut Engine) {
    engine.register_fn("word_count", |_ctx: &mut ScriptCtx, text: &str| -> i64 {
        text.split_whitespace().count() as i64
    });
}

fn install_random_choice(engine: &mut Engine) {
    engine.register_fn("random_choice", |_ctx: &mut ScriptCtx, items: Array| -> Dynamic {
        items
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or(Dynamic::UNIT)
    });
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rhai::Scope;
    use uuid::Uuid;

    use crate::context::{Clock, CtxSeed, PersonaInfo};
    use promptstage_modules::Variables;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::Arc;

    fn engine_and_ctx(clock: Clock) -> (Engine, ScriptCtx) {
        let mut engine = Engine::new();
        PluginRegistry::builtin().install(&mut engine);
        let ctx = ScriptCtx::new(CtxSeed {
            conversation_id: Uuid::new_v4(),
            persona: PersonaInfo { name: "Sage".into(), description: "calm".into() },
            messages: Vec::new(),
            message_count: 7,
            conversation_summary: "a short chat".into(),
            variables: Variables::new(),
            system_prompt: String::new(),
            reflection_depth: Arc::new(AtomicU32::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            ai: None,
            clock,
        });
        (engine, ctx)
    }

    fn eval<T: Clone + Send + Sync + 'static>(engine: &Engine, ctx: &ScriptCtx, script: &str) -> T {
        let mut scope = Scope::new();
        scope.push("ctx", ctx.clone());
        engine.eval_with_scope::<T>(&mut scope, script).expect("eval")
    }

    #[test]
    fn registry_knows_its_ai_plugins() {
        let registry = PluginRegistry::builtin();
        let ai: Vec<_> = registry.ai_plugin_names().into_iter().collect();
        assert_eq!(ai, vec!["generate", "reflect"]);
        assert!(registry.get("get_current_time").is_some());
        assert!(registry.get("no_such_plugin").is_none());
    }

    #[test]
    fn host_plugins_can_be_added_before_freeze() {
        fn install_shout(engine: &mut Engine) {
            engine.register_fn("shout", |_ctx: &mut ScriptCtx, text: &str| -> String {
                text.to_uppercase()
            });
        }

        let mut registry = PluginRegistry::builtin();
        registry.register(
            PluginMeta {
                name: "shout",
                family: PluginFamily::Utility,
                signature: "shout(text)",
                requires_ai: false,
            },
            install_shout,
        );

        let mut engine = Engine::new();
        registry.install(&mut engine);
        let ctx = ScriptCtx::detached(Uuid::new_v4());
        let mut scope = Scope::new();
        scope.push("ctx", ctx);
        let out: String = engine
            .eval_with_scope(&mut scope, r#"ctx.shout("hey")"#)
            .unwrap();
        assert_eq!(out, "HEY");
    }

    #[test]
    fn frozen_clock_time_plugins() {
        let at = Utc.with_ymd_and_hms(2024, 6, 5, 14, 30, 0).unwrap();
        let (engine, ctx) = engine_and_ctx(Clock::Fixed(at));

        let time: String = eval(&engine, &ctx, r#"ctx.get_current_time("%H:%M")"#);
        assert_eq!(time, "14:30");

        let day: String = eval(&engine, &ctx, "ctx.get_day_of_week()");
        assert_eq!(day, "Wednesday");

        let busy: bool = eval(&engine, &ctx, "ctx.is_business_hours()");
        assert!(busy);
    }

    #[test]
    fn bad_time_format_degrades_to_rfc3339() {
        let at = Utc.with_ymd_and_hms(2024, 6, 5, 14, 30, 0).unwrap();
        let (engine, ctx) = engine_and_ctx(Clock::Fixed(at));
        let time: String = eval(&engine, &ctx, r#"ctx.get_current_time("%Q")"#);
        assert!(time.starts_with("2024-06-05T14:30:00"));
    }

    #[test]
    fn variables_round_trip_through_plugins() {
        let (engine, ctx) = engine_and_ctx(Clock::System);
        let n: i64 = eval(
            &engine,
            &ctx,
            r#"
                let n = ctx.get_variable("n", 0) + 1;
                ctx.set_variable("n", n);
                n
            "#,
        );
        assert_eq!(n, 1);
        assert_eq!(ctx.variables_snapshot()["n"], serde_json::json!(1));
    }

    #[test]
    fn conversation_plugins_read_the_snapshot() {
        let (engine, ctx) = engine_and_ctx(Clock::System);
        let count: i64 = eval(&engine, &ctx, "ctx.get_message_count()");
        assert_eq!(count, 7);

        let name: String = eval(&engine, &ctx, r#"ctx.get_persona_info()["name"]"#);
        assert_eq!(name, "Sage");

        let summary: String = eval(&engine, &ctx, "ctx.get_conversation_summary()");
        assert_eq!(summary, "a short chat");
    }

    #[test]
    fn utility_plugins() {
        let (engine, ctx) = engine_and_ctx(Clock::System);
        let joined: String = eval(&engine, &ctx, r#"ctx.join(["a", "b", "c"], "-")"#);
        assert_eq!(joined, "a-b-c");

        let words: i64 = eval(&engine, &ctx, r#"ctx.word_count("one two  three")"#);
        assert_eq!(words, 3);

        let json: String = eval(&engine, &ctx, r#"ctx.to_json(#{"k": 1})"#);
        assert_eq!(json, r#"{"k":1}"#);

        let back: i64 = eval(&engine, &ctx, r#"ctx.from_json("{\"k\": 5}")["k"]"#);
        assert_eq!(back, 5);

        let pick: String = eval(&engine, &ctx, r#"ctx.random_choice(["only"])"#);
        assert_eq!(pick, "only");
    }

    #[test]
    fn ai_plugin_without_bridge_falls_back() {
        let (engine, ctx) = engine_and_ctx(Clock::System);
        let out: String = eval(&engine, &ctx, r#"ctx.generate("say hi")"#);
        assert_eq!(out, crate::context::AI_FALLBACK);
    }
}
