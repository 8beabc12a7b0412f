//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the dispatch crates:
//! - No sleep() calls in production code outside backoff and refill waits
//! - No blocking I/O inside async code
//!
//! The helpers below are shared by the tests under `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source trees scanned by the enforcement tests
pub const SOURCE_DIRS: &[&str] = &["dispatch/core/src"];

/// Files that only exist for tests even though they live under `src/`
pub const TEST_ONLY_FILES: &[&str] = &["test_utils.rs"];

/// Absolute path of a directory relative to the workspace root
pub fn workspace_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join(relative)
}

/// One production source file, already split into lines
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

/// Every production `.rs` file under [`SOURCE_DIRS`]
pub fn production_sources() -> Vec<SourceFile> {
    let mut files = Vec::new();

    for dir in SOURCE_DIRS {
        let root = workspace_path(dir);
        if !root.exists() {
            continue;
        }

        for entry in walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if TEST_ONLY_FILES.contains(&file_name) {
                continue;
            }
            let Ok(content) = fs::read_to_string(path) else {
                continue;
            };
            files.push(SourceFile {
                path: path.to_path_buf(),
                lines: content.lines().map(str::to_string).collect(),
            });
        }
    }

    files
}

/// Strip a trailing `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether a line sits inside a `#[cfg(test)]` module
///
/// Test modules close the file in this codebase, so everything after the
/// first `#[cfg(test)]` that opens a `mod` counts as test code.
pub fn is_in_test_module<S: AsRef<str>>(lines: &[S], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].as_ref().trim();
        if line.starts_with("mod ") && i > 0 && lines[i - 1].as_ref().trim() == "#[cfg(test)]" {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_are_found() {
        let sources = production_sources();
        assert!(
            sources.iter().any(|s| s.path.ends_with("routing/engine.rs")),
            "engine.rs should be scanned"
        );
        assert!(!sources.iter().any(|s| s.path.ends_with("test_utils.rs")));
    }

    #[test]
    fn test_test_module_detection() {
        let code = [
            "fn production() {}",
            "#[cfg(test)]",
            "mod tests {",
            "    fn helper() { sleep(); }",
            "}",
        ];
        assert!(!is_in_test_module(&code, 0));
        assert!(is_in_test_module(&code, 3));
    }
}
