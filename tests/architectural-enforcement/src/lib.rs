//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No sleep() calls in production code
//! - No blocking I/O inside async functions
//! - No unwrap()/expect() in library code
//!
//! The helpers here scan source text; they are heuristics, not a parser, and
//! treat everything after a file's `#[cfg(test)]` line as test code.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["convo/core/src", "convo/cli/src"];

/// Workspace root (two levels above this package)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// A source file reduced to its production lines
pub struct SourceFile {
    /// Path of the file
    pub path: PathBuf,
    /// Lines before the first `#[cfg(test)]`
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Read a file, dropping its test module
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        let lines = content
            .lines()
            .take_while(|line| line.trim() != "#[cfg(test)]")
            .map(str::to_string)
            .collect();
        Some(Self {
            path: path.to_path_buf(),
            lines,
        })
    }

    /// Code part of line `idx` (comments stripped)
    #[must_use]
    pub fn code(&self, idx: usize) -> &str {
        let line = self.lines[idx].as_str();
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") {
            return "";
        }
        line.split(" //").next().unwrap_or(line)
    }

    /// Format a violation at line `idx`
    #[must_use]
    pub fn violation(&self, idx: usize, what: &str) -> String {
        format!(
            "{}:{} - {what}: {}",
            self.path.display(),
            idx + 1,
            self.lines[idx].trim()
        )
    }
}

/// Load every `.rs` file under the given directories
#[must_use]
pub fn production_files(dirs: &[&str]) -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in dirs {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                if let Some(file) = SourceFile::load(entry.path()) {
                    files.push(file);
                }
            }
        }
    }
    files
}

/// Whether `line` opens a function, and if so whether it is async
#[must_use]
pub fn fn_signature(line: &str) -> Option<bool> {
    let line = line.trim_start();
    let rest = ["pub(crate) ", "pub(super) ", "pub "]
        .iter()
        .find_map(|vis| line.strip_prefix(vis))
        .unwrap_or(line);

    if rest.starts_with("async fn ") {
        Some(true)
    } else if rest.starts_with("fn ") {
        Some(false)
    } else {
        None
    }
}

/// Whether line `idx` sits inside an async function
///
/// Scans backwards to the nearest function signature.
#[must_use]
pub fn in_async_fn(lines: &[String], idx: usize) -> bool {
    lines[..=idx]
        .iter()
        .rev()
        .find_map(|line| fn_signature(line))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(src: &[&str]) -> Vec<String> {
        src.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_fn_signature() {
        assert_eq!(fn_signature("    pub async fn next_update(&mut self) {"), Some(true));
        assert_eq!(fn_signature("pub(crate) fn get_mut(&mut self) {"), Some(false));
        assert_eq!(fn_signature("fn main() {"), Some(false));
        assert_eq!(fn_signature("let f = |x| x;"), None);
    }

    #[test]
    fn test_async_detection() {
        let src = lines(&[
            "async fn bad_function() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
            "pub fn load() {",
            "    let contents = std::fs::read_to_string(\"config.toml\")?;",
            "}",
        ]);
        assert!(in_async_fn(&src, 1));
        assert!(!in_async_fn(&src, 4));
    }

    #[test]
    fn test_production_dirs_exist() {
        let files = production_files(PRODUCTION_DIRS);
        assert!(
            files.iter().any(|f| f.path.ends_with("session.rs")),
            "scanner found no engine sources"
        );
    }
}
