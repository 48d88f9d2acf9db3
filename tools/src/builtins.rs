//! Built-in filesystem tools.
//!
//! All paths go through the sandbox before touching the disk. Mutating tools
//! (`write_file`, `edit_file`, `delete_file`) require approval; reads do not.

use std::sync::Arc;

use serde_json::{json, Value};
use similar::TextDiff;

use ember_types::ToolOutcome;

use crate::{AgentContext, ParamKind, ParamSpec, Tool, ToolError, ToolFut, ToolRegistry};

/// Register every built-in tool on `registry`.
pub fn register_builtins(registry: &mut ToolRegistry) -> Result<(), ToolError> {
    registry.register(Arc::new(ReadFile))?;
    registry.register(Arc::new(WriteFile))?;
    registry.register(Arc::new(EditFile))?;
    registry.register(Arc::new(DeleteFile))?;
    registry.register(Arc::new(ListDirectory))?;
    registry.register(Arc::new(crate::search::SearchCode))?;
    registry.register(Arc::new(crate::shell::RunCommand))?;
    Ok(())
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, ToolError> {
    args[name].as_str().ok_or_else(|| ToolError::BadArgs {
        message: format!("missing required parameter '{name}'"),
    })
}

pub struct ReadFile;

impl Tool for ReadFile {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a UTF-8 text file and return its contents"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[ParamSpec::required(
            "path",
            ParamKind::String,
            "File path, absolute or relative to the workspace root",
        )];
        SCHEMA
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut AgentContext) -> ToolFut<'a> {
        Box::pin(async move {
            let path = ctx.sandbox.validate(str_arg(&args, "path")?)?;
            let contents = tokio::fs::read_to_string(&path).await?;
            Ok(ToolOutcome::ok(json!(contents))
                .with_metadata(json!({ "path": path.display().to_string() })))
        })
    }
}

pub struct WriteFile;

impl Tool for WriteFile {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Create or overwrite a file with the given contents"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[
            ParamSpec::required("path", ParamKind::String, "Destination file path"),
            ParamSpec::required("content", ParamKind::String, "Full file contents to write"),
        ];
        SCHEMA
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn preview(&self, args: &Value, ctx: &AgentContext) -> String {
        let path = args["path"].as_str().unwrap_or("?");
        let new = args["content"].as_str().unwrap_or_default();
        let old = ctx
            .sandbox
            .validate(path)
            .ok()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .unwrap_or_default();
        let diff = TextDiff::from_lines(old.as_str(), new)
            .unified_diff()
            .context_radius(2)
            .to_string();
        format!("write_file {path} ({} bytes)\n{diff}", new.len())
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut AgentContext) -> ToolFut<'a> {
        Box::pin(async move {
            let raw = str_arg(&args, "path")?;
            let content = str_arg(&args, "content")?;
            let grant = ctx.sandbox.validate_for_write(raw)?;

            if let Some(parent) = grant.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&grant.path, content).await?;
            if let Some(dir) = grant.admit_dir {
                ctx.sandbox.admit_created_dir(&dir);
                tracing::info!(dir = %dir.display(), "admitted new external directory");
            }

            Ok(ToolOutcome::ok(json!(format!(
                "wrote {} bytes to {}",
                content.len(),
                grant.path.display()
            ))))
        })
    }
}

pub struct EditFile;

impl Tool for EditFile {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    fn description(&self) -> &'static str {
        "Replace an exact string in a file. The old string must occur exactly once"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[
            ParamSpec::required("path", ParamKind::String, "File to edit"),
            ParamSpec::required("old_string", ParamKind::String, "Exact text to replace"),
            ParamSpec::required("new_string", ParamKind::String, "Replacement text"),
        ];
        SCHEMA
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn preview(&self, args: &Value, _ctx: &AgentContext) -> String {
        let path = args["path"].as_str().unwrap_or("?");
        let old = args["old_string"].as_str().unwrap_or_default();
        let new = args["new_string"].as_str().unwrap_or_default();
        let diff = TextDiff::from_lines(old, new)
            .unified_diff()
            .context_radius(2)
            .to_string();
        format!("edit_file {path}\n{diff}")
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut AgentContext) -> ToolFut<'a> {
        Box::pin(async move {
            let path = ctx.sandbox.validate(str_arg(&args, "path")?)?;
            let old = str_arg(&args, "old_string")?;
            let new = str_arg(&args, "new_string")?;

            let contents = tokio::fs::read_to_string(&path).await?;
            let occurrences = contents.matches(old).count();
            match occurrences {
                0 => {
                    return Err(ToolError::ExecutionFailed {
                        message: format!("old_string not found in {}", path.display()),
                    });
                }
                1 => {}
                n => {
                    return Err(ToolError::ExecutionFailed {
                        message: format!(
                            "old_string occurs {n} times in {}; provide more context to \
                             make it unique",
                            path.display()
                        ),
                    });
                }
            }

            let updated = contents.replacen(old, new, 1);
            tokio::fs::write(&path, &updated).await?;

            let diff = TextDiff::from_lines(&contents, &updated)
                .unified_diff()
                .context_radius(3)
                .to_string();
            Ok(ToolOutcome::ok(json!(format!(
                "edited {}\n{diff}",
                path.display()
            ))))
        })
    }
}

pub struct DeleteFile;

impl Tool for DeleteFile {
    fn name(&self) -> &'static str {
        "delete_file"
    }

    fn description(&self) -> &'static str {
        "Delete a single file"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] =
            &[ParamSpec::required("path", ParamKind::String, "File to delete")];
        SCHEMA
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut AgentContext) -> ToolFut<'a> {
        Box::pin(async move {
            let path = ctx.sandbox.validate(str_arg(&args, "path")?)?;
            if path.is_dir() {
                return Err(ToolError::ExecutionFailed {
                    message: format!("{} is a directory", path.display()),
                });
            }
            tokio::fs::remove_file(&path).await?;
            Ok(ToolOutcome::ok(json!(format!("deleted {}", path.display()))))
        })
    }
}

pub struct ListDirectory;

impl Tool for ListDirectory {
    fn name(&self) -> &'static str {
        "list_directory"
    }

    fn description(&self) -> &'static str {
        "List directory entries, directories marked with a trailing slash"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[ParamSpec::optional(
            "path",
            ParamKind::String,
            "Directory to list, defaults to the workspace root",
        )];
        SCHEMA
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut AgentContext) -> ToolFut<'a> {
        Box::pin(async move {
            let raw = args["path"].as_str().unwrap_or(".");
            let dir = ctx.sandbox.validate(raw)?;

            let mut entries = Vec::new();
            let mut reader = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await?.is_dir() {
                    entries.push(format!("{name}/"));
                } else {
                    entries.push(name);
                }
            }
            entries.sort();

            Ok(ToolOutcome::ok(json!(entries.join("\n")))
                .with_metadata(json!({ "count": entries.len() })))
        })
    }
}
