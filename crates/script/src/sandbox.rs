//! Restricted compilation and execution of module scripts.
//!
//! Restriction posture: rhai already has no file, network, or process
//! surface; on top of that the sandbox disables `import`/`eval`, caps
//! operations, call depth, and value sizes, and installs a progress hook
//! that enforces both the wall-clock deadline and the session's
//! cancellation probe between operations.  Failures never escape: every
//! outcome — compile error, runtime error, timeout, cancellation — comes
//! back as a normal [`ExecOutcome`] with `success=false`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use tracing::debug;

use promptstage_config::ScriptConfig;
use promptstage_modules::Variables;
use promptstage_template::{Warning, WarningKind};

use crate::context::ScriptCtx;
use crate::plugins::PluginRegistry;

const TOKEN_TIMEOUT: &str = "timeout";
const TOKEN_CANCELLED: &str = "cancelled";

/// Result of one sandboxed script run.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub success: bool,
    /// `ctx.set_variable` results merged with harvested top-level locals
    /// (locals win on name collision).
    pub variables: Variables,
    pub error: Option<String>,
    pub cancelled: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Lines captured from `ctx.log(...)`.
    pub log: Vec<String>,
    pub warnings: Vec<Warning>,
}

/// Shared grammar for the analyzer and the executor: plugins installed,
/// dynamic evaluation surfaces disabled.
pub(crate) fn base_engine(registry: &PluginRegistry) -> Engine {
    let mut engine = Engine::new();
    registry.install(&mut engine);
    engine.disable_symbol("import");
    engine.disable_symbol("eval");
    engine
}

/// Restricted script executor.  One instance serves all executions; each run
/// builds a fresh engine so per-run state (deadline, probe) never leaks.
pub struct Sandbox {
    limits: ScriptConfig,
    registry: Arc<PluginRegistry>,
}

impl Sandbox {
    pub fn new(limits: ScriptConfig, registry: Arc<PluginRegistry>) -> Self {
        Self { limits, registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Syntax-check `script` under the sandbox grammar without running it.
    pub fn compile_check(&self, script: &str) -> Result<(), String> {
        base_engine(&self.registry)
            .compile(script)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    /// Execute with the configured default timeout.
    pub fn execute(&self, script: &str, ctx: &ScriptCtx) -> ExecOutcome {
        self.execute_with_timeout(script, ctx, Duration::from_secs(self.limits.timeout_secs))
    }

    /// Execute with an explicit wall-clock budget (admin override).
    pub fn execute_with_timeout(
        &self,
        script: &str,
        ctx: &ScriptCtx,
        timeout: Duration,
    ) -> ExecOutcome {
        let started = Instant::now();

        // Cancellation observed at script entry; the progress hook covers
        // the rest of the run.
        if ctx.is_cancelled() {
            return ExecOutcome {
                success: false,
                cancelled: true,
                error: Some("cancelled before execution".to_string()),
                ..Default::default()
            };
        }

        let mut engine = base_engine(&self.registry);
        engine.set_max_operations(self.limits.max_operations);
        engine.set_max_call_levels(self.limits.max_call_levels);
        engine.set_max_string_size(self.limits.max_string_size);
        engine.set_max_array_size(self.limits.max_array_size);
        engine.set_max_map_size(self.limits.max_map_size);

        let deadline = started + timeout;
        let probe = ctx.cancel_probe();
        engine.on_progress(move |_ops| {
            if probe.load(std::sync::atomic::Ordering::SeqCst) {
                return Some(Dynamic::from(TOKEN_CANCELLED));
            }
            if Instant::now() > deadline {
                return Some(Dynamic::from(TOKEN_TIMEOUT));
            }
            None
        });

        let ast = match engine.compile(script) {
            Ok(ast) => ast,
            Err(err) => {
                return self.finish(ctx, started, false, Some(format!("compile error: {err}")), false, false, Variables::new());
            }
        };

        let mut scope = Scope::new();
        scope.push("ctx", ctx.clone());

        let run = engine.run_ast_with_scope(&mut scope, &ast);

        match run {
            Ok(()) => {
                let variables = self.harvest(ctx, &scope);
                self.finish(ctx, started, true, None, false, false, variables)
            }
            Err(err) => {
                let (cancelled, timed_out) = match err.as_ref() {
                    EvalAltResult::ErrorTerminated(token, _) => {
                        let token = token.to_string();
                        (token == TOKEN_CANCELLED, token == TOKEN_TIMEOUT)
                    }
                    _ => (false, false),
                };
                let message = if timed_out {
                    format!("script exceeded its {}s budget", timeout.as_secs_f64())
                } else if cancelled {
                    "cancelled mid-script".to_string()
                } else {
                    format!("runtime error: {err}")
                };
                self.finish(ctx, started, false, Some(message), cancelled, timed_out, Variables::new())
            }
        }
    }

    /// Merge `ctx.set_variable` results with every JSON-representable
    /// top-level local left in the scope after the run.
    fn harvest(&self, ctx: &ScriptCtx, scope: &Scope<'_>) -> Variables {
        let mut variables = ctx.variables_snapshot();
        for (name, _is_constant, value) in scope.iter() {
            if name == "ctx" || value.is_unit() {
                continue;
            }
            match serde_json::to_value(&value) {
                Ok(json) => {
                    variables.insert(name.to_string(), json);
                }
                Err(_) => ctx.warn(
                    WarningKind::NonSerializableVariable,
                    format!("variable `{name}` is not JSON-representable; skipped"),
                ),
            }
        }
        variables
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        ctx: &ScriptCtx,
        started: Instant,
        success: bool,
        error: Option<String>,
        cancelled: bool,
        timed_out: bool,
        variables: Variables,
    ) -> ExecOutcome {
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(success, cancelled, timed_out, duration_ms, "script execution finished");
        ExecOutcome {
            success,
            variables,
            error,
            cancelled,
            timed_out,
            duration_ms,
            log: ctx.drain_logs(),
            warnings: ctx.drain_warnings(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use promptstage_config::ScriptConfig;
    use uuid::Uuid;

    fn sandbox() -> Sandbox {
        Sandbox::new(ScriptConfig::default(), Arc::new(PluginRegistry::builtin()))
    }

    fn ctx() -> ScriptCtx {
        ScriptCtx::detached(Uuid::new_v4())
    }

    #[test]
    fn harvests_top_level_locals() {
        let outcome = sandbox().execute(
            r#"
                let n = 41 + 1;
                let s = "hello";
                let items = [1, 2, 3];
                let nested = #{"k": true};
            "#,
            &ctx(),
        );
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.variables["n"], serde_json::json!(42));
        assert_eq!(outcome.variables["s"], serde_json::json!("hello"));
        assert_eq!(outcome.variables["items"], serde_json::json!([1, 2, 3]));
        assert_eq!(outcome.variables["nested"], serde_json::json!({"k": true}));
        assert!(!outcome.variables.contains_key("ctx"));
    }

    #[test]
    fn set_variable_loses_to_top_level_local_of_same_name() {
        let outcome = sandbox().execute(
            r#"
                ctx.set_variable("x", 1);
                let x = 2;
            "#,
            &ctx(),
        );
        assert!(outcome.success);
        assert_eq!(outcome.variables["x"], serde_json::json!(2));
    }

    #[test]
    fn seeded_variables_feed_get_variable() {
        let ctx = ctx();
        ctx.set_variable("n", serde_json::json!(1));
        let outcome = sandbox().execute(
            r#"
                let n = ctx.get_variable("n", 0) + 1;
                ctx.set_variable("n", n);
            "#,
            &ctx,
        );
        assert!(outcome.success);
        assert_eq!(outcome.variables["n"], serde_json::json!(2));
    }

    #[test]
    fn non_serializable_local_is_skipped_with_warning() {
        let outcome = sandbox().execute(
            r#"
                let keep = 1;
                let f = |x| x + 1;
            "#,
            &ctx(),
        );
        assert!(outcome.success);
        assert_eq!(outcome.variables["keep"], serde_json::json!(1));
        assert!(!outcome.variables.contains_key("f"));
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::NonSerializableVariable));
    }

    #[test]
    fn compile_error_is_contained() {
        let outcome = sandbox().execute("let = ;", &ctx());
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap_or("").contains("compile error"));
        assert!(!outcome.cancelled);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn runtime_error_is_contained() {
        let outcome = sandbox().execute(r#"throw "boom";"#, &ctx());
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap_or("").contains("boom"));
    }

    #[test]
    fn import_is_not_part_of_the_grammar() {
        let outcome = sandbox().execute(r#"import "fs" as fs;"#, &ctx());
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap_or("").contains("compile error"));
    }

    #[test]
    fn infinite_loop_times_out() {
        let outcome = sandbox().execute_with_timeout(
            "loop { }",
            &ctx(),
            Duration::from_millis(50),
        );
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(!outcome.cancelled);
    }

    #[test]
    fn pre_raised_cancellation_skips_execution() {
        let ctx = ctx();
        ctx.cancel_probe().store(true, Ordering::SeqCst);
        let outcome = sandbox().execute("let x = 1;", &ctx);
        assert!(!outcome.success);
        assert!(outcome.cancelled);
        assert!(outcome.variables.is_empty());
    }

    #[test]
    fn mid_script_cancellation_terminates_the_loop() {
        let ctx = ctx();
        let probe = ctx.cancel_probe();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            probe.store(true, Ordering::SeqCst);
        });

        let outcome = sandbox().execute("loop { }", &ctx);
        handle.join().unwrap();

        assert!(!outcome.success);
        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn logs_are_captured_in_order() {
        let outcome = sandbox().execute(
            r#"
                ctx.log("first");
                ctx.log("second");
            "#,
            &ctx(),
        );
        assert_eq!(outcome.log, vec!["first", "second"]);
    }
}
