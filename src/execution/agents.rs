//! Agents
//!
//! Agents perform the actual work behind a workflow step. Each step names
//! an [`AgentKind`]; the [`AgentRegistry`] maps kinds to implementations.
//!
//! Built-in agents:
//! - [`CommandAgent`]: runs a shell command through bash
//! - [`StaticAgent`]: returns the step's declared `result` params
//! - [`FnAgent`]: wraps an async closure

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::safety::OperationCategory;
use crate::workflow::{AgentKind, OperationSpec};

/// What an agent returns: output values keyed by name.
pub type AgentResult = Result<HashMap<String, Value>, Box<dyn Error + Send + Sync>>;

/// Input for one attempt of a step.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub step_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub params: Value,
    /// Snapshot of the shared context when the step became ready
    pub context: HashMap<String, Value>,
}

impl AgentInvocation {
    pub fn new(step_id: impl Into<String>, params: Value) -> Self {
        Self {
            step_id: step_id.into(),
            attempt: 1,
            params,
            context: HashMap::new(),
        }
    }

    /// String parameter by name.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }
}

/// Executes workflow steps.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Risk-bearing operation an invocation with these params performs.
    fn operation(&self, _params: &Value) -> Option<OperationSpec> {
        None
    }

    async fn execute(&self, invocation: AgentInvocation) -> AgentResult;
}

/// Agent implementations by kind.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentKind, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a [`CommandAgent`] for command execution and a
    /// [`StaticAgent`] for every other kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in AgentKind::ALL {
            match kind {
                AgentKind::CommandExecution => registry.register(kind, CommandAgent::new()),
                _ => registry.register(kind, StaticAgent),
            }
        }
        registry
    }

    /// Registers an agent, replacing any previous one for the kind.
    pub fn register<A: Agent + 'static>(&mut self, kind: AgentKind, agent: A) {
        debug!("Registered agent for '{}'", kind);
        self.agents.insert(kind, Arc::new(agent));
    }

    pub fn with_agent<A: Agent + 'static>(mut self, kind: AgentKind, agent: A) -> Self {
        self.register(kind, agent);
        self
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn Agent>> {
        self.agents.get(&kind).cloned()
    }

    pub fn contains(&self, kind: AgentKind) -> bool {
        self.agents.contains_key(&kind)
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.agents.keys().map(AgentKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("AgentRegistry").field("kinds", &kinds).finish()
    }
}

type AgentFn = dyn Fn(AgentInvocation) -> BoxFuture<'static, AgentResult> + Send + Sync;

/// Agent backed by an async closure.
///
/// # Example
///
/// ```
/// use dbflow::execution::FnAgent;
/// use serde_json::json;
/// use std::collections::HashMap;
///
/// let agent = FnAgent::new(|inv| async move {
///     let mut out = HashMap::new();
///     out.insert("echo".to_string(), json!(inv.step_id));
///     Ok(out)
/// });
/// # let _ = agent;
/// ```
pub struct FnAgent {
    func: Box<AgentFn>,
    operation: Option<OperationSpec>,
}

impl FnAgent {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(AgentInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AgentResult> + Send + 'static,
    {
        Self {
            func: Box::new(move |invocation| func(invocation).boxed()),
            operation: None,
        }
    }

    /// Declares the operation every invocation performs.
    pub fn with_operation(mut self, category: OperationCategory, statement: impl Into<String>) -> Self {
        self.operation = Some(OperationSpec {
            category,
            statement: statement.into(),
        });
        self
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn operation(&self, _params: &Value) -> Option<OperationSpec> {
        self.operation.clone()
    }

    async fn execute(&self, invocation: AgentInvocation) -> AgentResult {
        (self.func)(invocation).await
    }
}

/// Returns `params.result` as its output, optionally after `params.delay_ms`.
///
/// An object result becomes one output per field; anything else is
/// returned under the `result` key. `params.error` makes every attempt fail
/// with that message.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAgent;

#[async_trait]
impl Agent for StaticAgent {
    async fn execute(&self, invocation: AgentInvocation) -> AgentResult {
        if let Some(ms) = invocation.params.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        if let Some(message) = invocation.param_str("error") {
            return Err(message.to_string().into());
        }

        let outputs = match invocation.params.get("result") {
            Some(Value::Object(fields)) => fields.clone().into_iter().collect(),
            Some(value) => HashMap::from([("result".to_string(), value.clone())]),
            None => HashMap::new(),
        };
        Ok(outputs)
    }
}

/// Runs `params.command` with `bash -c`.
///
/// Outputs `stdout` (trimmed) and `exit_code`. A non-zero exit status is
/// an error carrying the exit code and stderr. Commands are gated as
/// `SYSTEM_COMMAND`, or `FILE_DELETE` when they invoke `rm`.
#[derive(Debug, Clone, Default)]
pub struct CommandAgent {
    working_dir: Option<PathBuf>,
}

impl CommandAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the working directory for commands without their own `cwd`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Whether a shell command invokes `rm`.
fn deletes_files(command: &str) -> bool {
    command
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '(' | ')'))
        .any(|word| word == "rm")
}

#[async_trait]
impl Agent for CommandAgent {
    fn operation(&self, params: &Value) -> Option<OperationSpec> {
        let command = params.get("command").and_then(Value::as_str)?;
        let category = if deletes_files(command) {
            OperationCategory::FileDelete
        } else {
            OperationCategory::SystemCommand
        };
        Some(OperationSpec {
            category,
            statement: command.to_string(),
        })
    }

    async fn execute(&self, invocation: AgentInvocation) -> AgentResult {
        let command = invocation
            .param_str("command")
            .ok_or_else(|| format!("Step '{}' has no 'command' parameter", invocation.step_id))?;

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command).kill_on_drop(true);

        let cwd = invocation
            .param_str("cwd")
            .map(PathBuf::from)
            .or_else(|| self.working_dir.clone());
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }

        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if output.status.success() {
            debug!("Step '{}' command succeeded", invocation.step_id);
            if !stdout.trim().is_empty() {
                debug!("Step '{}' output:\n{}", invocation.step_id, stdout);
            }

            Ok(HashMap::from([
                ("stdout".to_string(), json!(stdout.trim())),
                ("exit_code".to_string(), json!(0)),
            ]))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "Step '{}' command failed with exit code: {:?}",
                invocation.step_id,
                output.status.code()
            );
            if !stderr.trim().is_empty() {
                error!("stderr:\n{}", stderr);
            }

            Err(format!(
                "command exited with {}: {}",
                output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr.trim()
            )
            .into())
        }
    }
}
