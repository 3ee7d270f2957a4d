//! Script cells run in an interpreter process.
//!
//! The environment crosses the process boundary as JSON files in the run's
//! isolated workspace. The generated wrapper loads `vars_in_<n>.json`, runs the
//! cell body, and writes `{ "variables": ..., "dropped": [...] }` to
//! `vars_out_<n>.json` when the body completes without throwing.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::cell::Cell;
use crate::context::{ActiveHandle, ProcessKillHandle, RunContext};
use crate::env::VariableEnvironment;
use crate::error::{Error, Result};
use crate::result::RunResult;
use crate::source::DataSourceResolver;
use crate::workspace::ScriptFiles;

use super::{CellOutcome, CellRunner};

/// Environment variable naming the interpreter binary.
pub const INTERPRETER_ENV_VAR: &str = "CELLFLOW_SCRIPT_INTERPRETER";

const DEFAULT_INTERPRETER: &str = "node";
const SCRIPT_EXTENSION: &str = "js";
const INTERRUPTED_MESSAGE: &str = "Script execution was interrupted";

static STACK_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" +at +[a-zA-Z0-9()/. :_\[\]-]+").unwrap());
static BANNER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Node\.js v[0-9.:-]+").unwrap());
static NEWLINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n+").unwrap());

/// Locate the script interpreter.
///
/// Lookup order:
/// 1. `explicit`, when given (must exist)
/// 2. the `CELLFLOW_SCRIPT_INTERPRETER` environment variable
/// 3. `node` on the system `PATH`
pub fn find_interpreter(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Interpreter(format!(
            "configured interpreter {} does not exist",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var(INTERPRETER_ENV_VAR) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "{} points to missing file {}, falling back to PATH",
            INTERPRETER_ENV_VAR,
            path.display()
        );
    }

    which::which(DEFAULT_INTERPRETER).map_err(|_| {
        Error::Interpreter(format!(
            "'{}' not found on PATH. Install Node.js or set {}",
            DEFAULT_INTERPRETER, INTERPRETER_ENV_VAR
        ))
    })
}

/// Strip interpreter noise from a script's stderr.
///
/// Removes `<script>:<line>` location lines together with the indentation
/// that follows them, `at ...` stack frames and the `Node.js vX.Y.Z` banner,
/// then normalizes line endings and collapses blank lines.
pub fn sanitize_stderr(stderr: &str, script_file_name: &str) -> String {
    let mut text = stderr.to_string();

    if !script_file_name.is_empty() {
        let pattern = format!(r".*{}:[0-9]+\r?\n *", regex::escape(script_file_name));
        match Regex::new(&pattern) {
            Ok(location) => text = location.replace_all(&text, "").into_owned(),
            Err(e) => tracing::debug!("Skipping location cleanup: {}", e),
        }
    }

    let text = STACK_FRAME_RE.replace_all(&text, "");
    let text = BANNER_RE.replace_all(&text, "");
    let text = text.replace("\r\n", "\n");
    let text = NEWLINES_RE.replace_all(&text, "\n");
    text.trim().to_string()
}

/// Settings for [`ScriptRunner`].
#[derive(Debug, Clone, Default)]
pub struct ScriptRunnerConfig {
    /// Interpreter binary; discovered with [`find_interpreter`] when `None`.
    pub interpreter: Option<PathBuf>,
}

/// Runs script cells in a fresh interpreter process per cell.
#[derive(Clone, Default)]
pub struct ScriptRunner {
    config: ScriptRunnerConfig,
    resolver: Option<Arc<dyn DataSourceResolver>>,
}

/// Shape of the file the wrapper writes back.
#[derive(Debug, Deserialize)]
struct ScriptOutput {
    variables: Map<String, Value>,
    #[serde(default)]
    dropped: Vec<String>,
}

enum Exit {
    Finished(ExitStatus),
    Killed,
}

impl ScriptRunner {
    pub fn new(config: ScriptRunnerConfig) -> Self {
        Self {
            config,
            resolver: None,
        }
    }

    /// Expose the resolver's connection settings to scripts through
    /// `getConnectionSettingByName`.
    pub fn with_resolver(mut self, resolver: Arc<dyn DataSourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    fn connection_settings(&self) -> Vec<Value> {
        self.resolver
            .as_ref()
            .map(|resolver| resolver.connection_settings())
            .unwrap_or_default()
    }

    /// Generate the wrapper program for `cell`.
    ///
    /// The body runs inside its own async function, so a top-level `return`
    /// still reaches the variable write-back.
    pub fn wrap_script(cell: &Cell, files: &ScriptFiles, connections: &[Value]) -> Result<String> {
        let input = serde_json::to_string(&files.input.to_string_lossy())?;
        let output = serde_json::to_string(&files.output.to_string_lossy())?;
        let connections = serde_json::to_string(connections)?;

        Ok(format!(
            r#"const __fs = require('fs');
const env = JSON.parse(__fs.readFileSync({input}, 'utf8'));
const variables = {{
  get: (key) => env[key],
  set: (key, value) => {{ env[key] = value; }},
  has: (key) => Object.prototype.hasOwnProperty.call(env, key),
  delete: (key) => delete env[key],
  each: (fn) => Object.keys(env).forEach((key) => fn(key, env[key])),
}};
const _skipSql = (b) => {{ env._skipSql = b === true; }};
const getConnectionSettingByName = (name) => {{
  const settings = {connections};
  const found = settings.find((it) => it.name === name);
  if (found) {{
    return found;
  }}
  const names = settings.map((it) => it.name).join(',');
  throw new Error('Missing connection ' + name + '. Available here [' + names + '].');
}};
const __saveVariables = () => {{
  const out = {{}};
  const dropped = [];
  for (const key of Object.keys(env)) {{
    try {{
      const encoded = JSON.stringify(env[key]);
      if (encoded === undefined) {{
        dropped.push(key);
      }} else {{
        out[key] = JSON.parse(encoded);
      }}
    }} catch (_) {{
      dropped.push(key);
    }}
  }}
  __fs.writeFileSync({output}, JSON.stringify({{ variables: out, dropped }}));
}};
(async () => {{
  try {{
    await (async () => {{
{body}
    }})();
  }} catch (e) {{
    console.error(e);
    return;
  }}
  __saveVariables();
}})();
"#,
            input = input,
            output = output,
            connections = connections,
            body = cell.text,
        ))
    }

    async fn execute(&self, cell: &Cell, ctx: &RunContext<'_>) -> Result<CellOutcome> {
        let interpreter = match find_interpreter(self.config.interpreter.as_deref()) {
            Ok(path) => path,
            Err(e) => return Ok(CellOutcome::unchanged(RunResult::error(e.to_string()))),
        };

        if ctx.is_interrupted() {
            return Ok(CellOutcome::unchanged(RunResult::error(INTERRUPTED_MESSAGE)));
        }

        let files = ctx.workspace.next_script_files(SCRIPT_EXTENSION);
        ctx.env.write_to(&files.input)?;
        let script = Self::wrap_script(cell, &files, &self.connection_settings())?;
        tokio::fs::write(&files.script, script).await?;

        tracing::debug!(
            "Running script cell {} with {} ({})",
            cell.index,
            interpreter.display(),
            files.script.display()
        );

        let mut child = Command::new(&interpreter)
            .arg(&files.script)
            .current_dir(ctx.workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Process(format!(
                    "Failed to spawn interpreter '{}': {}",
                    interpreter.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("Failed to get script stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Process("Failed to get script stderr".to_string()))?;
        let stdout_task = tokio::spawn(read_pipe(stdout));
        let stderr_task = tokio::spawn(read_pipe(stderr));

        let kill = ProcessKillHandle::new();
        let exit = {
            let _active = ctx.active.register(ActiveHandle::Process(kill.clone()));
            if ctx.is_interrupted() {
                kill.kill();
            }
            tokio::select! {
                status = child.wait() => Exit::Finished(
                    status.map_err(|e| Error::Process(format!("Failed to wait on script: {}", e)))?,
                ),
                _ = kill.killed() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill script process: {}", e);
                    }
                    Exit::Killed
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let raw_stderr = stderr_task.await.unwrap_or_default();
        let script_name = files
            .script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stderr = sanitize_stderr(&raw_stderr, &script_name);

        let status = match exit {
            Exit::Killed => {
                tracing::info!("Script cell {} was interrupted", cell.index);
                let message = if stderr.is_empty() {
                    INTERRUPTED_MESSAGE.to_string()
                } else {
                    stderr
                };
                return Ok(CellOutcome::unchanged(RunResult {
                    stdout,
                    ..RunResult::error(message)
                }));
            }
            Exit::Finished(status) => status,
        };

        let mut result = if !status.success() {
            let message = if stderr.is_empty() {
                format!("Script exited with {}", status)
            } else {
                stderr
            };
            RunResult::error(message)
        } else if !stderr.is_empty() {
            RunResult::error(stderr)
        } else {
            RunResult::executed("")
        };
        result.stdout = stdout;

        if !status.success() || !files.output.exists() {
            return Ok(CellOutcome::unchanged(result));
        }

        match read_output(&files.output).await {
            Ok(output) => {
                if !output.dropped.is_empty() {
                    tracing::warn!(
                        "Script cell {} dropped non-serializable variables: {}",
                        cell.index,
                        output.dropped.join(", ")
                    );
                    for key in &output.dropped {
                        result
                            .warnings
                            .push(format!("Variable '{}' is not JSON-serializable and was dropped", key));
                    }
                }
                Ok(CellOutcome::with_env(
                    result,
                    VariableEnvironment::from_map(output.variables),
                ))
            }
            Err(e) => {
                tracing::error!("Script cell {} wrote unreadable variables: {}", cell.index, e);
                let message = format!("Failed to read variables written by script: {}", e);
                let stderr = if result.stderr.is_empty() {
                    message
                } else {
                    format!("{}\n{}", result.stderr, message)
                };
                Ok(CellOutcome::unchanged(RunResult {
                    stdout: result.stdout,
                    ..RunResult::error(stderr)
                }))
            }
        }
    }
}

#[async_trait]
impl CellRunner for ScriptRunner {
    async fn run(&self, cell: &Cell, ctx: &RunContext<'_>) -> Result<CellOutcome> {
        self.execute(cell, ctx).await
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        tracing::debug!("Error reading script output: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn read_output(path: &Path) -> Result<ScriptOutput> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AbortHandle, ActiveSlot, RunMode};
    use crate::result::RunStatus;
    use crate::workspace::IsolatedWorkspace;
    use serde_json::json;
    use std::time::Duration;

    fn node() -> Option<PathBuf> {
        let found = which::which(DEFAULT_INTERPRETER).ok();
        if found.is_none() {
            eprintln!("node not found on PATH, skipping");
        }
        found
    }

    async fn run_script(
        interpreter: PathBuf,
        text: &str,
        env: &VariableEnvironment,
    ) -> CellOutcome {
        run_with(ScriptRunner::new(ScriptRunnerConfig {
            interpreter: Some(interpreter),
        }), text, env)
        .await
    }

    async fn run_with(runner: ScriptRunner, text: &str, env: &VariableEnvironment) -> CellOutcome {
        let workspace = IsolatedWorkspace::create("cellflow-test-").unwrap();
        let active = ActiveSlot::new();
        let abort = AbortHandle::new();
        let ctx = RunContext {
            env,
            mode: RunMode::Query,
            workspace: &workspace,
            active: &active,
            abort: &abort,
        };
        runner.run(&Cell::script(0, text), &ctx).await.unwrap()
    }

    #[test]
    fn test_sanitize_strips_location_and_frames() {
        let raw = "/tmp/cellflow-abc/script_3.js:14\n    foo();\n    ^\r\n\r\n\
                   ReferenceError: foo is not defined\n    at /tmp/cellflow-abc/script_3.js:14:5\n    \
                   at Object.<anonymous> (/tmp/cellflow-abc/script_3.js:20:3)\n\nNode.js v20.11.1\n";
        let cleaned = sanitize_stderr(raw, "script_3.js");

        assert!(!cleaned.contains("script_3.js:14"));
        assert!(!cleaned.contains("Node.js v20"));
        assert!(!cleaned.contains("\r"));
        assert!(!cleaned.contains("\n\n"));
        assert!(cleaned.contains("ReferenceError: foo is not defined"));
    }

    #[test]
    fn test_sanitize_keeps_plain_messages() {
        assert_eq!(sanitize_stderr("boom\n", "script_1.js"), "boom");
        assert_eq!(sanitize_stderr("", "script_1.js"), "");
    }

    #[test]
    fn test_wrapper_embeds_body_and_paths() {
        let workspace = IsolatedWorkspace::create("cellflow-test-").unwrap();
        let files = workspace.next_script_files("js");
        let cell = Cell::script(0, "variables.set('x', 1);");

        let connections = vec![json!({"name": "db"})];
        let script = ScriptRunner::wrap_script(&cell, &files, &connections).unwrap();
        assert!(script.contains("variables.set('x', 1);"));
        assert!(script.contains("vars_in_1.json"));
        assert!(script.contains("vars_out_1.json"));
        assert!(script.contains("const _skipSql"));
        assert!(script.contains(r#"const settings = [{"name":"db"}];"#));

        // The body gets its own function scope ahead of the write-back.
        let body = script.find("variables.set('x', 1);").unwrap();
        let inner = script.find("await (async () => {").unwrap();
        let save = script.rfind("__saveVariables();").unwrap();
        assert!(inner < body && body < save);
    }

    #[test]
    fn test_explicit_interpreter_must_exist() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("no-such-node");
        assert!(matches!(
            find_interpreter(Some(&missing)),
            Err(Error::Interpreter(_))
        ));

        let present = dir.path().join("node");
        std::fs::write(&present, "").unwrap();
        assert_eq!(find_interpreter(Some(&present)).unwrap(), present);
    }

    #[tokio::test]
    async fn test_script_updates_environment() {
        let Some(node) = node() else { return };
        let mut env = VariableEnvironment::new();
        env.insert("a", json!(2));

        let outcome = run_script(
            node,
            "variables.set('b', variables.get('a') * 21);\nconsole.log('hi');",
            &env,
        )
        .await;

        assert_eq!(outcome.result.status, RunStatus::Executed);
        assert_eq!(outcome.result.stdout.trim(), "hi");
        let updated = outcome.env.unwrap();
        assert_eq!(updated.get("a"), Some(&json!(2)));
        assert_eq!(updated.get("b"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_script_skip_sql_helper() {
        let Some(node) = node() else { return };
        let outcome = run_script(node, "_skipSql(true);", &VariableEnvironment::new()).await;
        assert!(outcome.env.unwrap().skip_sql());
    }

    #[tokio::test]
    async fn test_thrown_error_keeps_environment() {
        let Some(node) = node() else { return };
        let mut env = VariableEnvironment::new();
        env.insert("a", json!(1));

        let outcome = run_script(
            node,
            "variables.set('a', 99);\nthrow new Error('bad input');",
            &env,
        )
        .await;

        assert_eq!(outcome.result.status, RunStatus::Error);
        assert!(outcome.result.stderr.contains("bad input"));
        assert!(outcome.env.is_none());
    }

    #[tokio::test]
    async fn test_non_serializable_values_are_reported() {
        let Some(node) = node() else { return };
        let outcome = run_script(
            node,
            "variables.set('f', () => 1);\nvariables.set('ok', 'yes');",
            &VariableEnvironment::new(),
        )
        .await;

        assert_eq!(outcome.result.status, RunStatus::Executed);
        assert_eq!(outcome.result.warnings.len(), 1);
        assert!(outcome.result.warnings[0].contains("'f'"));
        let updated = outcome.env.unwrap();
        assert!(!updated.contains_key("f"));
        assert_eq!(updated.get("ok"), Some(&json!("yes")));
    }

    #[tokio::test]
    async fn test_kill_interrupts_script() {
        let Some(node) = node() else { return };
        let workspace = IsolatedWorkspace::create("cellflow-test-").unwrap();
        let active = ActiveSlot::new();
        let abort = AbortHandle::new();
        let env = VariableEnvironment::new();
        let ctx = RunContext {
            env: &env,
            mode: RunMode::Query,
            workspace: &workspace,
            active: &active,
            abort: &abort,
        };
        let runner = ScriptRunner::new(ScriptRunnerConfig {
            interpreter: Some(node),
        });
        let cell = Cell::script(0, "await new Promise((r) => setTimeout(r, 30000));");

        let killer = async {
            loop {
                if let Some(handle) = active.current() {
                    handle.terminate().await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let (outcome, _) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(runner.run(&cell, &ctx), killer)
        })
        .await
        .expect("killed script should return promptly");

        let outcome = outcome.unwrap();
        assert_eq!(outcome.result.status, RunStatus::Error);
        assert!(outcome.env.is_none());
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_run_does_not_spawn() {
        let workspace = IsolatedWorkspace::create("cellflow-test-").unwrap();
        let active = ActiveSlot::new();
        let abort = AbortHandle::new();
        abort.abort();
        let env = VariableEnvironment::new();
        let ctx = RunContext {
            env: &env,
            mode: RunMode::Query,
            workspace: &workspace,
            active: &active,
            abort: &abort,
        };
        let runner = ScriptRunner::new(ScriptRunnerConfig {
            interpreter: Some(PathBuf::from("/bin/sh")),
        });

        let outcome = runner
            .run(&Cell::script(0, "variables.set('x', 1);"), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.result.status, RunStatus::Error);
        assert_eq!(outcome.result.stderr, INTERRUPTED_MESSAGE);
        assert!(outcome.env.is_none());
        assert!(!workspace.path().join("script_1.js").exists());
    }

    #[tokio::test]
    async fn test_early_return_keeps_variables() {
        let Some(node) = node() else { return };
        let outcome = run_script(
            node,
            "variables.set('z', 5);\nif (variables.get('z')) { return; }\nvariables.set('after', true);",
            &VariableEnvironment::new(),
        )
        .await;

        assert_eq!(outcome.result.status, RunStatus::Executed);
        let updated = outcome.env.unwrap();
        assert_eq!(updated.get("z"), Some(&json!(5)));
        assert!(!updated.contains_key("after"));
    }

    #[tokio::test]
    async fn test_noop_script_preserves_mixed_environment() {
        let Some(node) = node() else { return };
        let mut env = VariableEnvironment::new();
        env.insert("nothing", json!(null));
        env.insert("flag", json!(false));
        env.insert("count", json!(-7));
        env.insert("ratio", json!(0.25));
        env.insert("name", json!("caf\u{e9} \"quoted\""));
        env.insert("list", json!([1, "two", null, [3.5]]));
        env.insert("nested", json!({"a": {"b": [true, {}]}, "empty": []}));

        let outcome = run_script(node, "", &env).await;

        assert_eq!(outcome.result.status, RunStatus::Executed);
        assert_eq!(outcome.env.unwrap(), env);
    }

    #[tokio::test]
    async fn test_connection_settings_lookup() {
        let Some(node) = node() else { return };

        struct Names;
        impl DataSourceResolver for Names {
            fn resolve(&self, _name: &str) -> Option<Arc<dyn crate::source::Driver>> {
                None
            }
            fn names(&self) -> Vec<String> {
                vec!["main".to_string(), "replica".to_string()]
            }
        }

        let runner = ScriptRunner::new(ScriptRunnerConfig {
            interpreter: Some(node),
        })
        .with_resolver(Arc::new(Names));
        let found = run_with(
            runner.clone(),
            "variables.set('conn', getConnectionSettingByName('replica').name);",
            &VariableEnvironment::new(),
        )
        .await;
        assert_eq!(found.result.status, RunStatus::Executed);
        assert_eq!(found.env.unwrap().get("conn"), Some(&json!("replica")));

        let missing = run_with(
            runner,
            "getConnectionSettingByName('nope');",
            &VariableEnvironment::new(),
        )
        .await;
        assert_eq!(missing.result.status, RunStatus::Error);
        assert!(missing
            .result
            .stderr
            .contains("Missing connection nope. Available here [main,replica]."));
    }
}
