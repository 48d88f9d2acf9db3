//! Tool executor framework and built-in tools.
//!
//! # Architecture
//!
//! - [`Tool`] - the capability trait: a name, an ordered parameter schema,
//!   and an async execute
//! - [`ToolRegistry`] - write-once name-to-tool map; [`ToolRegistry::execute`]
//!   validates arguments, races a timeout, and converts every failure into a
//!   structured [`ToolOutcome`] rather than letting errors escape
//! - [`PathSandbox`] - filesystem boundary shared by the built-in tools
//! - [`AgentContext`] - per-session mutable state handed to each tool
//!
//! Tools run one at a time within a turn; the registry map is immutable once
//! the session starts.

pub mod builtins;
pub mod sandbox;
pub mod search;
pub mod shell;

pub use sandbox::{PathSandbox, WriteGrant};

use ember_types::{ToolDefinition, ToolOutcome};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Cap on rendered tool output fed back to the model.
pub const MAX_OUTPUT_BYTES: usize = 48 * 1024;

/// Errors produced while registering or running tools.
///
/// These never cross the registry boundary during execution; `execute` folds
/// them into an error [`ToolOutcome`].
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("path {attempted} is outside the workspace boundary {boundary}")]
    SandboxViolation {
        attempted: PathBuf,
        boundary: PathBuf,
    },

    #[error("tool '{name}' is already registered")]
    DuplicateTool { name: String },

    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },

    #[error("invalid arguments: {message}")]
    BadArgs { message: String },

    #[error("tool '{name}' timed out after {secs}s")]
    Timeout { name: String, secs: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    ExecutionFailed { message: String },
}

/// Primitive parameter types a tool can declare.
///
/// Arrays and objects are distinct kinds; an object never satisfies an array
/// parameter or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
        }
    }
}

/// One declared tool parameter. Schemas are ordered; validation reports the
/// first offending parameter in declaration order.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
    /// Filled in for absent optional parameters before execution.
    pub default: Option<Value>,
}

impl ParamSpec {
    #[must_use]
    pub const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
            default: None,
        }
    }

    #[must_use]
    pub const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Boxed future type returned by tool executors.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<ToolOutcome, ToolError>> + Send + 'a>>;

/// A capability the model can invoke.
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn schema(&self) -> &[ParamSpec];

    /// Whether invocations must pass the human approval gate.
    fn requires_approval(&self) -> bool {
        false
    }

    /// Human-readable preview shown in the approval prompt.
    fn preview(&self, args: &Value, _ctx: &AgentContext) -> String {
        let rendered = serde_json::to_string_pretty(args).unwrap_or_else(|_| args.to_string());
        format!("{} {rendered}", self.name())
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut AgentContext) -> ToolFut<'a>;
}

/// Mutable per-session state shared by tools.
///
/// Tools within a turn run sequentially, so a mutable borrow per call is
/// enough; there is no cross-tool locking.
pub struct AgentContext {
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub sandbox: PathSandbox,
    /// Free-form scratch space tools use to pass hints to later calls.
    pub metadata: HashMap<String, Value>,
}

impl AgentContext {
    pub fn new(sandbox: PathSandbox) -> Self {
        Self {
            working_dir: sandbox.root().to_path_buf(),
            env: HashMap::new(),
            sandbox,
            metadata: HashMap::new(),
        }
    }
}

/// Write-once map from tool name to implementation.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. The first registration of a name wins; a duplicate is
    /// rejected without touching the existing entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name();
        if self.tools.contains_key(name) {
            return Err(ToolError::DuplicateTool {
                name: name.to_string(),
            });
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// Model-facing definitions, sorted by name.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| {
                ToolDefinition::new(tool.name(), tool.description(), schema_json(tool.schema()))
            })
            .collect()
    }

    /// Run a tool by name.
    ///
    /// Never returns an error: unknown names, invalid arguments, timeouts,
    /// and execution failures all come back as `ToolOutcome { success: false }`
    /// so the orchestration loop can feed them to the model uniformly.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &mut AgentContext,
        timeout: Option<Duration>,
    ) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::err(format!("unknown tool '{name}'"));
        };

        let args = match validate_args(tool.schema(), args) {
            Ok(args) => args,
            Err(err) => return ToolOutcome::err(err.to_string()),
        };

        let result = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, tool.execute(args, ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(tool = name, secs = deadline.as_secs(), "tool timed out");
                    Err(ToolError::Timeout {
                        name: name.to_string(),
                        secs: deadline.as_secs(),
                    })
                }
            },
            None => tool.execute(args, ctx).await,
        };

        match result {
            Ok(outcome) => truncate_outcome(outcome),
            Err(err) => ToolOutcome::err(err.to_string()),
        }
    }
}

/// Check `args` against an ordered schema and fill declared defaults.
///
/// Required parameters are checked for presence first, then every present
/// parameter for its kind; the first mismatch wins. Unknown extra keys are
/// tolerated and passed through.
pub fn validate_args(schema: &[ParamSpec], args: Value) -> Result<Value, ToolError> {
    let mut map = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(ToolError::BadArgs {
                message: format!("expected an object of arguments, got {other}"),
            });
        }
    };

    for spec in schema {
        match map.get(spec.name) {
            None if spec.required => {
                return Err(ToolError::BadArgs {
                    message: format!("missing required parameter '{}'", spec.name),
                });
            }
            None => {
                if let Some(default) = &spec.default {
                    map.insert(spec.name.to_string(), default.clone());
                }
            }
            Some(value) if !spec.kind.matches(value) => {
                return Err(ToolError::BadArgs {
                    message: format!(
                        "parameter '{}' expected {}, got {}",
                        spec.name,
                        spec.kind.as_str(),
                        json_kind(value)
                    ),
                });
            }
            Some(_) => {}
        }
    }

    Ok(Value::Object(map))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn schema_json(schema: &[ParamSpec]) -> Value {
    let mut properties = Map::new();
    let mut required: Vec<Value> = Vec::new();
    for spec in schema {
        properties.insert(
            spec.name.to_string(),
            json!({ "type": spec.kind.as_str(), "description": spec.description }),
        );
        if spec.required {
            required.push(Value::String(spec.name.to_string()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Cap oversized string payloads so one tool call cannot flood the window.
fn truncate_outcome(mut outcome: ToolOutcome) -> ToolOutcome {
    if let Some(Value::String(s)) = &mut outcome.data {
        if s.len() > MAX_OUTPUT_BYTES {
            let mut end = MAX_OUTPUT_BYTES;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            s.truncate(end);
            s.push_str("\n...[output truncated]");
            let note = json!({ "truncated": true });
            outcome.metadata = Some(match outcome.metadata.take() {
                Some(Value::Object(mut meta)) => {
                    meta.insert("truncated".to_string(), Value::Bool(true));
                    Value::Object(meta)
                }
                _ => note,
            });
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    struct EchoTool;

    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo the message back"
        }

        fn schema(&self) -> &[ParamSpec] {
            const SCHEMA: &[ParamSpec] = &[
                ParamSpec::required("message", ParamKind::String, "Text to echo"),
                ParamSpec::optional("repeat", ParamKind::Number, "Repeat count"),
            ];
            SCHEMA
        }

        fn execute<'a>(&'a self, args: Value, _ctx: &'a mut AgentContext) -> ToolFut<'a> {
            Box::pin(async move {
                let message = args["message"].as_str().unwrap_or_default().to_string();
                Ok(ToolOutcome::ok(json!(message)))
            })
        }
    }

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn description(&self) -> &'static str {
            "Sleeps forever"
        }

        fn schema(&self) -> &[ParamSpec] {
            &[]
        }

        fn execute<'a>(&'a self, _args: Value, _ctx: &'a mut AgentContext) -> ToolFut<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ToolOutcome::ok(json!("done")))
            })
        }
    }

    fn context() -> (tempfile::TempDir, AgentContext) {
        let dir = tempdir().unwrap();
        let sandbox = PathSandbox::new(dir.path()).unwrap();
        let ctx = AgentContext::new(sandbox);
        (dir, ctx)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, ToolError::DuplicateTool { .. }));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn definitions_are_sorted_and_carry_required_list() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).unwrap();
        registry.register(Arc::new(EchoTool)).unwrap();
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[1].name, "slow");
        assert_eq!(defs[0].parameters["required"], json!(["message"]));
        assert_eq!(
            defs[0].parameters["properties"]["message"]["type"],
            "string"
        );
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_outcome() {
        let registry = ToolRegistry::new();
        let (_dir, mut ctx) = context();
        let outcome = registry.execute("nope", json!({}), &mut ctx, None).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn missing_required_parameter_short_circuits() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let (_dir, mut ctx) = context();
        let outcome = registry.execute("echo", json!({}), &mut ctx, None).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("message"));
    }

    #[tokio::test]
    async fn type_mismatch_names_expected_and_actual() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let (_dir, mut ctx) = context();
        let outcome = registry
            .execute("echo", json!({"message": 42}), &mut ctx, None)
            .await;
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert!(error.contains("expected string"));
        assert!(error.contains("got number"));
    }

    #[tokio::test]
    async fn successful_execution_returns_data() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let (_dir, mut ctx) = context();
        let outcome = registry
            .execute("echo", json!({"message": "hi"}), &mut ctx, None)
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(json!("hi")));
    }

    #[tokio::test]
    async fn timeout_becomes_error_outcome() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).unwrap();
        let (_dir, mut ctx) = context();
        let outcome = registry
            .execute("slow", json!({}), &mut ctx, Some(Duration::from_millis(20)))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[test]
    fn array_does_not_satisfy_object_parameter() {
        let schema = [ParamSpec::required(
            "options",
            ParamKind::Object,
            "Options map",
        )];
        let err = validate_args(&schema, json!({"options": [1, 2]})).unwrap_err();
        assert!(err.to_string().contains("expected object, got array"));
    }

    #[test]
    fn defaults_fill_absent_optional_parameters() {
        let schema = [
            ParamSpec::optional("limit", ParamKind::Number, "Max results").with_default(json!(50)),
        ];
        let args = validate_args(&schema, json!({})).unwrap();
        assert_eq!(args["limit"], json!(50));
    }

    #[test]
    fn oversized_output_is_truncated_with_marker() {
        let big = "x".repeat(MAX_OUTPUT_BYTES + 100);
        let outcome = truncate_outcome(ToolOutcome::ok(json!(big)));
        let data = outcome.data.unwrap();
        let s = data.as_str().unwrap();
        assert!(s.len() < MAX_OUTPUT_BYTES + 64);
        assert!(s.ends_with("[output truncated]"));
        assert_eq!(outcome.metadata.unwrap()["truncated"], json!(true));
    }
}
