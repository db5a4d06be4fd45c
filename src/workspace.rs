//! File-backed agent workspace.
//!
//! The workspace is a directory on disk containing:
//! - Bootstrap documents: AGENTS.md, SOUL.md, USER.md, IDENTITY.md
//! - Long-term memory: MEMORY.md
//! - Skills: skills/<name>/SKILL.md
//! - Scratch space for downloaded media: tmp/

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::WorkspaceError;

/// Well-known workspace file paths.
pub mod paths {
    pub const AGENTS: &str = "AGENTS.md";
    pub const SOUL: &str = "SOUL.md";
    pub const USER: &str = "USER.md";
    pub const IDENTITY: &str = "IDENTITY.md";
    pub const MEMORY: &str = "MEMORY.md";
    pub const SKILL: &str = "SKILL.md";

    pub const MEMORY_DIR: &str = "memory";
    pub const SKILLS_DIR: &str = "skills";
    pub const TMP_DIR: &str = "tmp";
}

/// Bootstrap documents loaded into the system prompt, in precedence order.
pub const BOOTSTRAP_FILES: &[&str] = &[
    paths::AGENTS,
    paths::SOUL,
    paths::USER,
    paths::IDENTITY,
];

/// A bootstrap document present in the workspace root.
#[derive(Debug, Clone)]
pub struct BootstrapDoc {
    pub name: String,
    pub content: String,
}

/// An entry in a workspace directory listing.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: String,
    pub is_directory: bool,
}

impl FileEntry {
    /// Get just the filename (last component).
    pub fn name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path)
    }
}

/// File-backed workspace for agent identity, memory, and scratch files.
#[derive(Debug, Clone)]
pub struct Workspace {
    base_path: PathBuf,
}

impl Workspace {
    /// Create a new workspace rooted at `base_path`.
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn root(&self) -> &Path {
        &self.base_path
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.base_path.join(paths::MEMORY_DIR)
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.base_path.join(paths::SKILLS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.base_path.join(paths::TMP_DIR)
    }

    /// Resolve a relative workspace path to an absolute path.
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        self.base_path.join(relative)
    }

    /// Ensure the workspace directory structure exists.
    pub async fn ensure_dirs(&self) -> Result<(), WorkspaceError> {
        fs::create_dir_all(&self.base_path).await?;
        fs::create_dir_all(self.memory_dir()).await?;
        fs::create_dir_all(self.skills_dir()).await?;
        fs::create_dir_all(self.tmp_dir()).await?;
        Ok(())
    }

    /// Read a file from the workspace.
    pub async fn read(&self, path: &str) -> Result<String, WorkspaceError> {
        let full_path = self.resolve_path(path);
        fs::read_to_string(&full_path)
            .await
            .map_err(|source| WorkspaceError::ReadFailed {
                path: full_path.display().to_string(),
                source,
            })
    }

    /// Write (overwrite) a file in the workspace.
    pub async fn write(&self, path: &str, content: &str) -> Result<(), WorkspaceError> {
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, content)
            .await
            .map_err(|source| WorkspaceError::WriteFailed {
                path: full_path.display().to_string(),
                source,
            })
    }

    /// List entries in a workspace subdirectory. Missing directories list
    /// as empty rather than erroring.
    pub async fn list(&self, subpath: &str) -> Result<Vec<FileEntry>, WorkspaceError> {
        let dir = if subpath.is_empty() {
            self.base_path.clone()
        } else {
            self.resolve_path(subpath)
        };

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let path = entry
                .path()
                .strip_prefix(&self.base_path)
                .unwrap_or(&entry.path())
                .to_string_lossy()
                .to_string();
            entries.push(FileEntry {
                path,
                is_directory: metadata.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Load the bootstrap documents present in the workspace root, in
    /// precedence order. Missing or empty files are silently skipped.
    pub async fn bootstrap_documents(&self) -> Vec<BootstrapDoc> {
        let mut docs = Vec::new();
        for &file in BOOTSTRAP_FILES {
            let path = self.resolve_path(file);
            if path.exists()
                && let Ok(content) = fs::read_to_string(&path).await
                && !content.trim().is_empty()
            {
                docs.push(BootstrapDoc {
                    name: file.to_string(),
                    content,
                });
            }
        }
        docs
    }

    /// Long-term memory summary: the contents of MEMORY.md, trimmed.
    /// Empty when the file is missing or blank.
    pub async fn memory_summary(&self) -> String {
        match fs::read_to_string(self.resolve_path(paths::MEMORY)).await {
            Ok(content) => content.trim().to_string(),
            Err(_) => String::new(),
        }
    }

    /// Skills summary: one line per skill directory containing a SKILL.md,
    /// using that file's first non-empty line as the description.
    pub async fn skills_summary(&self) -> String {
        let entries = match self.list(paths::SKILLS_DIR).await {
            Ok(entries) => entries,
            Err(_) => return String::new(),
        };

        let mut lines = Vec::new();
        for entry in entries.iter().filter(|e| e.is_directory) {
            let skill_file = format!("{}/{}", entry.path, paths::SKILL);
            if let Ok(content) = self.read(&skill_file).await {
                let description = content
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .unwrap_or("")
                    .trim_start_matches('#')
                    .trim();
                lines.push(format!("- {}: {}", entry.name(), description));
            }
        }
        lines.join("\n")
    }

    /// Allocate a unique scratch path under tmp/ with the given extension.
    pub fn scratch_path(&self, extension: &str) -> PathBuf {
        self.tmp_dir()
            .join(format!("{}.{}", uuid::Uuid::new_v4(), extension))
    }
}

/// Guard owning a scratch file; the file is removed on drop, so downloads
/// are cleaned up on every exit path.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove scratch file");
        }
    }
}
