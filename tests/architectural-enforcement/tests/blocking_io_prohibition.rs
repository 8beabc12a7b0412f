//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Production dispatch code MUST NOT block the runtime. Async code
//! uses `tokio` primitives; `std::sync::Mutex` and `std::thread::sleep` are
//! out, `parking_lot` locks are fine as long as no guard crosses an `.await`.
//! **Exceptions**: Non-async functions, test code.

use architectural_enforcement::{code_part, is_in_test_module, production_sources};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - std::fs::*, std::net::*, std::process::Command");
        eprintln!("  - std::thread::sleep");
        eprintln!("  - std::sync::Mutex (use parking_lot or tokio::sync)");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("\n✅ ACCEPTABLE:");
        eprintln!("  - Non-async functions (configuration parsing)");
        eprintln!("  - Test code");

        panic!(
            "\nFound {} blocking violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn find_blocking_io_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            if is_in_test_module(&file.lines, idx) {
                continue;
            }
            if let Some(kind) = blocking_kind(code_part(line)) {
                // File and network I/O are tolerated outside async code
                if kind.io_only() && !is_in_async_function(&file.lines, idx) {
                    continue;
                }
                violations.push(format!(
                    "{}:{} - {}: {}",
                    file.path.display(),
                    idx + 1,
                    kind.label(),
                    line.trim()
                ));
            }
        }
    }

    violations
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Blocking {
    FileIo,
    NetworkIo,
    Process,
    HttpClient,
    ThreadSleep,
    StdMutex,
}

impl Blocking {
    fn label(self) -> &'static str {
        match self {
            Self::FileIo => "Blocking file I/O",
            Self::NetworkIo => "Blocking network I/O",
            Self::Process => "Blocking process I/O",
            Self::HttpClient => "Blocking HTTP client",
            Self::ThreadSleep => "Thread sleep",
            Self::StdMutex => "std Mutex",
        }
    }

    fn io_only(self) -> bool {
        matches!(self, Self::FileIo | Self::NetworkIo | Self::Process)
    }
}

fn blocking_kind(code: &str) -> Option<Blocking> {
    if code.contains("std::fs::") || code.contains("use std::fs") {
        Some(Blocking::FileIo)
    } else if code.contains("std::net::") || code.contains("use std::net") {
        Some(Blocking::NetworkIo)
    } else if code.contains("std::process::Command") {
        Some(Blocking::Process)
    } else if code.contains("reqwest::blocking") {
        Some(Blocking::HttpClient)
    } else if code.contains("thread::sleep") {
        Some(Blocking::ThreadSleep)
    } else if code.contains("std::sync::Mutex") || code.contains("std::sync::{Mutex") {
        Some(Blocking::StdMutex)
    } else {
        None
    }
}

/// Check if line is inside an async function
fn is_in_async_function<S: AsRef<str>>(lines: &[S], current_idx: usize) -> bool {
    for i in (0..=current_idx).rev() {
        let line = lines[i].as_ref().trim();

        if line.contains("async fn ") {
            return true;
        }

        if (line.starts_with("fn ") || line.contains(" fn ")) && !line.contains("async") {
            return false;
        }

        // Stop at module/impl boundaries
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_io_detection() {
        let test_code = [
            "async fn bad_function() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];

        assert!(is_in_async_function(&test_code, 1), "Should detect async function");
        assert_eq!(blocking_kind(test_code[1]), Some(Blocking::FileIo));
    }

    #[test]
    fn test_non_async_function_detection() {
        let test_code = [
            "pub fn from_path(path: &Path) -> Result<Self, ConfigError> {",
            "    let text = std::fs::read_to_string(path)?;",
            "}",
        ];

        assert!(!is_in_async_function(&test_code, 1));
    }

    #[test]
    fn test_std_mutex_always_flagged() {
        assert_eq!(
            blocking_kind("use std::sync::Mutex;"),
            Some(Blocking::StdMutex)
        );
        assert!(!Blocking::StdMutex.io_only());
        assert_eq!(blocking_kind("use parking_lot::Mutex;"), None);
    }
}
