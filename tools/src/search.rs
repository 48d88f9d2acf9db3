//! Regex search over workspace files.

use std::path::PathBuf;

use regex::RegexBuilder;
use serde_json::{json, Value};

use ember_types::ToolOutcome;

use crate::{AgentContext, ParamKind, ParamSpec, Tool, ToolError, ToolFut};

/// Stop collecting after this many matching lines.
const MAX_MATCHES: usize = 200;
/// Skip files larger than this; they are almost never source text.
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".cache"];

pub struct SearchCode;

impl Tool for SearchCode {
    fn name(&self) -> &'static str {
        "search_code"
    }

    fn description(&self) -> &'static str {
        "Search files recursively for a regex pattern and return matching lines"
    }

    fn schema(&self) -> &[ParamSpec] {
        const SCHEMA: &[ParamSpec] = &[
            ParamSpec::required("pattern", ParamKind::String, "Regular expression to search for"),
            ParamSpec::optional(
                "path",
                ParamKind::String,
                "Directory to search, defaults to the workspace root",
            ),
            ParamSpec::optional(
                "case_sensitive",
                ParamKind::Boolean,
                "Match case exactly, defaults to true",
            ),
        ];
        SCHEMA
    }

    fn execute<'a>(&'a self, args: Value, ctx: &'a mut AgentContext) -> ToolFut<'a> {
        Box::pin(async move {
            let pattern = args["pattern"].as_str().ok_or_else(|| ToolError::BadArgs {
                message: "missing required parameter 'pattern'".to_string(),
            })?;
            let raw_dir = args["path"].as_str().unwrap_or(".");
            let case_sensitive = args["case_sensitive"].as_bool().unwrap_or(true);

            let root = ctx.sandbox.validate(raw_dir)?;
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| ToolError::BadArgs {
                    message: format!("invalid regex: {e}"),
                })?;

            let mut hits: Vec<String> = Vec::new();
            let mut pending: Vec<PathBuf> = vec![root.clone()];

            'walk: while let Some(dir) = pending.pop() {
                let mut reader = tokio::fs::read_dir(&dir).await?;
                while let Some(entry) = reader.next_entry().await? {
                    let path = entry.path();
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let file_type = entry.file_type().await?;

                    if file_type.is_dir() {
                        if !SKIPPED_DIRS.contains(&name.as_str()) {
                            pending.push(path);
                        }
                        continue;
                    }
                    if !file_type.is_file() {
                        continue;
                    }
                    if entry.metadata().await?.len() > MAX_FILE_BYTES {
                        continue;
                    }

                    // Non-UTF-8 files are treated as binary and skipped.
                    let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                        continue;
                    };
                    let relative = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
                    for (line_no, line) in contents.lines().enumerate() {
                        if regex.is_match(line) {
                            hits.push(format!(
                                "{}:{}: {}",
                                relative.display(),
                                line_no + 1,
                                line.trim_end()
                            ));
                            if hits.len() >= MAX_MATCHES {
                                break 'walk;
                            }
                        }
                    }
                }
            }

            hits.sort();
            let truncated = hits.len() >= MAX_MATCHES;
            let body = if hits.is_empty() {
                format!("no matches for '{pattern}'")
            } else {
                hits.join("\n")
            };
            Ok(ToolOutcome::ok(json!(body)).with_metadata(json!({
                "matches": hits.len(),
                "truncated": truncated,
            })))
        })
    }
}
