//! Read-only view of a workspace handed to the patch generator

use backspace_core::{BackspaceError, Result};
use serde::Serialize;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

/// Files that describe a project, read in full (up to the size cap)
pub const KEY_FILES: &[&str] = &[
    "README.md",
    "README.txt",
    "readme.md",
    "package.json",
    "requirements.txt",
    "pyproject.toml",
    "Cargo.toml",
    "go.mod",
    "Dockerfile",
    "docker-compose.yml",
    "tsconfig.json",
    "babel.config.js",
    ".env.example",
    "config.py",
    "settings.py",
];

const SKIP_DIRS: &[&str] = &["node_modules", "__pycache__", "target", "venv", "dist", "build"];

/// Limits applied while taking a snapshot
#[derive(Debug, Clone, Copy)]
pub struct SnapshotLimits {
    /// Characters kept per file before truncation
    pub max_file_chars: usize,
    /// Files listed in the tree
    pub max_files: usize,
    /// Source files (beyond key files) whose contents are included
    pub max_source_files: usize,
    /// Files larger than this are listed but never read
    pub max_read_bytes: u64,
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self {
            max_file_chars: 5000,
            max_files: 500,
            max_source_files: 20,
            max_read_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

/// File listing plus selected file contents of a workspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileSnapshot {
    pub files: Vec<SnapshotEntry>,
    pub contents: Vec<FileContent>,
    /// True if the listing was cut at `max_files`
    pub listing_truncated: bool,
}

impl FileSnapshot {
    /// Walk `root`, skipping hidden entries and build/cache directories
    pub fn capture(root: &Path, limits: SnapshotLimits) -> Result<Self> {
        let mut snapshot = Self::default();
        let mut listed = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

        for entry in walker {
            let entry = entry.map_err(|e| BackspaceError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if listed.len() >= limits.max_files {
                snapshot.listing_truncated = true;
                break;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| BackspaceError::Workspace(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            listed.push(SnapshotEntry {
                path: relative,
                size,
            });
        }

        for key in KEY_FILES {
            if let Some(entry) = listed.iter().find(|e| e.path == *key) {
                if let Some(content) = read_capped(root, entry, limits) {
                    snapshot.contents.push(content);
                }
            }
        }

        let mut sources = 0;
        for entry in &listed {
            if sources >= limits.max_source_files {
                break;
            }
            if KEY_FILES.contains(&entry.path.as_str()) || !is_source_file(&entry.path) {
                continue;
            }
            if let Some(content) = read_capped(root, entry, limits) {
                snapshot.contents.push(content);
                sources += 1;
            }
        }

        snapshot.files = listed;
        Ok(snapshot)
    }

    pub fn content_of(&self, path: &str) -> Option<&str> {
        self.contents
            .iter()
            .find(|c| c.path == path)
            .map(|c| c.content.as_str())
    }

    /// Render as the text block used in prompts
    pub fn render(&self) -> String {
        let mut out = String::from("## Repository files\n");
        for file in &self.files {
            out.push_str(&format!("- {} ({} bytes)\n", file.path, file.size));
        }
        if self.listing_truncated {
            out.push_str("- ... (listing truncated)\n");
        }
        for content in &self.contents {
            out.push_str(&format!("\n### {}\n```\n{}\n```\n", content.path, content.content));
        }
        out
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
}

fn is_source_file(path: &str) -> bool {
    const EXTENSIONS: &[&str] = &[
        "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "rb", "c", "h", "cpp", "cs", "html",
        "css", "toml", "yaml", "yml", "json", "md",
    ];
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

fn read_capped(root: &Path, entry: &SnapshotEntry, limits: SnapshotLimits) -> Option<FileContent> {
    if entry.size > limits.max_read_bytes {
        return None;
    }
    // Binary files are left out
    let content = std::fs::read_to_string(root.join(&entry.path)).ok()?;
    let (content, truncated) = match content.char_indices().nth(limits.max_file_chars) {
        Some((idx, _)) => (format!("{}\n... (truncated)", &content[..idx]), true),
        None => (content, false),
    };
    Some(FileContent {
        path: entry.path.clone(),
        content,
        truncated,
    })
}
