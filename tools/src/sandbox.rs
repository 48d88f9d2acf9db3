//! Filesystem path boundary for tool execution.
//!
//! Every file-touching tool resolves its paths through [`PathSandbox`]. The
//! boundary is one workspace root plus a dynamic allow-list of external paths
//! that were admitted at runtime. This is a trust boundary against confused
//! models and sloppy prompts within one process, not a security kernel.

use std::path::{Component, Path, PathBuf};

use crate::ToolError;

/// Workspace path boundary with a dynamic allow-list.
#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
    allowed: Vec<PathBuf>,
}

impl PathSandbox {
    /// Create a sandbox rooted at `workspace_root`, which must exist.
    pub fn new(workspace_root: impl AsRef<Path>) -> Result<Self, ToolError> {
        let root = workspace_root.as_ref();
        let canonical = std::fs::canonicalize(root).map_err(|_| ToolError::BadArgs {
            message: format!("workspace root does not exist: {}", root.display()),
        })?;
        Ok(Self {
            root: canonical,
            allowed: Vec::new(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Admit an external path. Idempotent; relative paths are resolved
    /// against the workspace root first.
    pub fn allow_path(&mut self, path: impl AsRef<Path>) {
        let normalized = self.normalize(path.as_ref());
        if !self.allowed.contains(&normalized) {
            self.allowed.push(normalized);
        }
    }

    /// Remove a previously admitted path. Unknown paths are ignored.
    pub fn disallow_path(&mut self, path: impl AsRef<Path>) {
        let normalized = self.normalize(path.as_ref());
        self.allowed.retain(|p| p != &normalized);
    }

    #[must_use]
    pub fn allowed_paths(&self) -> &[PathBuf] {
        &self.allowed
    }

    /// Resolve `path` and check it against the boundary.
    ///
    /// Relative paths join the workspace root; `.` and `..` components are
    /// resolved lexically before the containment check, so `src/../../etc`
    /// cannot step outside unnoticed.
    pub fn validate(&self, path: &str) -> Result<PathBuf, ToolError> {
        if contains_unsafe_path_chars(path) {
            return Err(ToolError::BadArgs {
                message: "path contains invalid control characters".to_string(),
            });
        }

        let normalized = self.normalize(Path::new(path));
        if self.is_within_boundary(&normalized) {
            Ok(normalized)
        } else {
            Err(ToolError::SandboxViolation {
                attempted: normalized,
                boundary: self.root.clone(),
            })
        }
    }

    /// Non-throwing probe used by tools that filter candidate paths.
    #[must_use]
    pub fn is_safe(&self, path: &str) -> bool {
        self.validate(path).is_ok()
    }

    /// Resolve `path` for a write.
    ///
    /// Inside the boundary this behaves like [`validate`](Self::validate).
    /// Outside, the write is allowed only when it has to create its parent
    /// directory: a brand-new directory implies deliberate output placement,
    /// while a write into an existing external directory could clobber
    /// arbitrary files and is rejected. The returned grant names the
    /// directory to admit once the tool has created it.
    pub fn validate_for_write(&self, path: &str) -> Result<WriteGrant, ToolError> {
        if contains_unsafe_path_chars(path) {
            return Err(ToolError::BadArgs {
                message: "path contains invalid control characters".to_string(),
            });
        }

        let normalized = self.normalize(Path::new(path));
        if self.is_within_boundary(&normalized) {
            return Ok(WriteGrant {
                path: normalized,
                admit_dir: None,
            });
        }

        let parent = normalized
            .parent()
            .ok_or_else(|| ToolError::SandboxViolation {
                attempted: normalized.clone(),
                boundary: self.root.clone(),
            })?;

        if parent.exists() {
            return Err(ToolError::SandboxViolation {
                attempted: normalized.clone(),
                boundary: self.root.clone(),
            });
        }

        Ok(WriteGrant {
            admit_dir: Some(parent.to_path_buf()),
            path: normalized,
        })
    }

    /// Record a directory the caller just created under a write grant, so
    /// subsequent operations on it pass validation.
    pub fn admit_created_dir(&mut self, dir: impl AsRef<Path>) {
        self.allow_path(dir);
    }

    fn is_within_boundary(&self, normalized: &Path) -> bool {
        normalized.starts_with(&self.root)
            || self.allowed.iter().any(|p| normalized.starts_with(p))
    }

    /// Absolutize against the workspace root and resolve `.`/`..` lexically.
    fn normalize(&self, path: &Path) -> PathBuf {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let mut resolved = PathBuf::new();
        for component in absolute.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                other => resolved.push(other),
            }
        }
        resolved
    }
}

/// A validated write destination.
#[derive(Debug, Clone)]
pub struct WriteGrant {
    /// Normalized absolute target path.
    pub path: PathBuf,
    /// External directory to admit after the write creates it, if any.
    pub admit_dir: Option<PathBuf>,
}

fn contains_unsafe_path_chars(input: &str) -> bool {
    input
        .chars()
        .any(|c| matches!(c, '\u{0000}'..='\u{001f}' | '\u{007f}'))
}
