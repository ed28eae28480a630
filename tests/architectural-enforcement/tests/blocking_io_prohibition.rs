//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async functions in the engine and the CLI MUST NOT block.
//! **Required**: `tokio::fs`, `tokio::io`, async `reqwest`; never `std::fs`,
//! `std::net`, `reqwest::blocking` or std stdin/stdout inside an `async fn`.
//!
//! Blocking calls in plain functions (configuration loading before any
//! stream opens, terminal output helpers) are acceptable.

use architectural_enforcement::{in_async_fn, production_files, PRODUCTION_DIRS};

const FORBIDDEN_IN_ASYNC: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin in async"),
    ("std::io::stdout()", "Blocking stdout in async"),
];

/// Test that production code does not use blocking I/O in async functions
#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();

    for file in production_files(PRODUCTION_DIRS) {
        for idx in 0..file.lines.len() {
            let code = file.code(idx);

            if code.contains("reqwest::blocking") {
                violations.push(file.violation(idx, "Blocking HTTP client"));
            }
            if !in_async_fn(&file.lines, idx) {
                continue;
            }
            for (pattern, what) in FORBIDDEN_IN_ASYNC {
                if code.contains(pattern) {
                    violations.push(file.violation(idx, what));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O found in async code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs, tokio::io::AsyncBufReadExt");
        eprintln!("  - reqwest::Client (async)");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Test that the engine library propagates errors instead of panicking
#[test]
fn test_no_unwrap_in_library_code() {
    let mut violations = Vec::new();

    for file in production_files(&["convo/core/src"]) {
        for idx in 0..file.lines.len() {
            let code = file.code(idx);
            if code.contains(".unwrap()") || code.contains(".expect(") {
                violations.push(file.violation(idx, "Panicking unwrap"));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "unwrap()/expect() in library code:\n{}",
        violations.join("\n")
    );
}
