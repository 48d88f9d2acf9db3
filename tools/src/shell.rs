//! Shell command execution.

use std::process::Stdio;

use serde_json::{json, Value};
use tokio::process::Command;

use ember_types::ToolOutcome;

use crate::{AgentContext, ParamKind, ParamSpec, Tool, ToolError, ToolFut};

pub struct RunCommand;

impl Tool for RunCommand {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the workspace and return its output"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[
            ParamSpec::required("command", ParamKind::String, "Shell command line to run"),
            ParamSpec::optional(
                "cwd",
                ParamKind::String,
                "Working directory, defaults to the workspace root",
            ),
        ];
        SCHEMA
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn preview(&self, args: &Value, _ctx: &AgentContext) -> String {
        format!("run_command $ {}", args["command"].as_str().unwrap_or("?"))
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut AgentContext) -> ToolFut<'a> {
        Box::pin(async move {
            let command = args["command"].as_str().ok_or_else(|| ToolError::BadArgs {
                message: "missing required parameter 'command'".to_string(),
            })?;
            let cwd = match args["cwd"].as_str() {
                Some(raw) => ctx.sandbox.validate(raw)?,
                None => ctx.working_dir.clone(),
            };

            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .current_dir(&cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                // The child dies with the future, so a timeout that drops
                // this call does not leave the process running.
                .kill_on_drop(true)
                .env_clear()
                .envs(&ctx.env);
            if !ctx.env.contains_key("PATH") {
                if let Ok(path) = std::env::var("PATH") {
                    cmd.env("PATH", path);
                }
            }

            tracing::debug!(command, cwd = %cwd.display(), "running shell command");
            let output = cmd.output().await?;

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let code = output.status.code();

            let mut body = stdout;
            if !stderr.is_empty() {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str("stderr:\n");
                body.push_str(&stderr);
            }

            let metadata = json!({ "exit_code": code });
            if output.status.success() {
                Ok(ToolOutcome::ok(json!(body)).with_metadata(metadata))
            } else {
                let mut outcome = ToolOutcome::err(format!(
                    "command exited with status {}",
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
                ));
                outcome.data = Some(json!(body));
                outcome.metadata = Some(metadata);
                Ok(outcome)
            }
        })
    }
}
