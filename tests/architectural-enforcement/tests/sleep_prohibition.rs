//! Integration Test: Sleep Prohibition
//!
//! **Policy**: production code MUST NOT sleep. Streams are awaited, fetch
//! results arrive over channels and cancellation is signalled, so there is
//! nothing to poll for.
//! **Exceptions**: test code.

use architectural_enforcement::{production_files, PRODUCTION_DIRS};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_files(PRODUCTION_DIRS) {
        for idx in 0..file.lines.len() {
            let code = file.code(idx);
            if code.contains("::sleep(") || code.contains(".sleep(") {
                violations.push(file.violation(idx, "Sleep call"));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");
        eprintln!("  - Sleep to 'wait' for events (await the stream or channel!)");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
