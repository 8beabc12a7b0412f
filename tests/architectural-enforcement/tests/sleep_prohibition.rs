//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production dispatch code MUST NOT call sleep methods to wait for
//! events. Waiting happens on semaphores, notifications and cancellation
//! tokens.
//! **Exceptions**: Backoff between fallback attempts, token bucket refill
//! waits, test code.

use architectural_enforcement::{code_part, is_in_test_module, production_sources};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Backoff between fallback attempts (cancellable)");
        eprintln!("  - Token bucket refill waits bounded by the acquire deadline");
        eprintln!("  - Test code (#[cfg(test)] modules, test_utils.rs)");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops (use Notify / Semaphore)");
        eprintln!("  - Sleep as poor man's synchronization");
        eprintln!("  - Sleep to 'wait' for a pool to drain");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Find all sleep() calls in production code
fn find_sleep_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            if !is_sleep_call(code_part(line)) {
                continue;
            }
            if is_in_test_module(&file.lines, idx)
                || is_backoff_context(&file.lines, idx)
                || is_refill_context(&file.lines, idx)
            {
                continue;
            }

            violations.push(format!(
                "{}:{} - {}",
                file.path.display(),
                idx + 1,
                line.trim()
            ));
        }
    }

    violations
}

fn is_sleep_call(code: &str) -> bool {
    code.contains("::sleep(") || code.contains(".sleep(") || code.contains("::sleep_until(")
}

/// Check if sleep is a backoff between attempts
fn is_backoff_context<S: AsRef<str>>(lines: &[S], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(15)..std::cmp::min(current_idx + 5, lines.len());

    let mut has_delay = false;
    let mut has_attempt_context = false;

    for i in context_range {
        let line = lines[i].as_ref().to_lowercase();

        if line.contains("delay") || line.contains("backoff") || line.contains("backing off") {
            has_delay = true;
        }

        if line.contains("attempt") || line.contains("retry") {
            has_attempt_context = true;
        }
    }

    has_delay && has_attempt_context
}

/// Check if sleep waits for a token bucket refill
fn is_refill_context<S: AsRef<str>>(lines: &[S], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(10)..std::cmp::min(current_idx + 3, lines.len());

    let mut has_refill = false;
    let mut has_deadline = false;

    for i in context_range {
        let line = lines[i].as_ref().to_lowercase();
        if line.contains("refill")
            || line.contains("token bucket")
            || line.contains("ratelimited")
        {
            has_refill = true;
        }
        if line.contains("deadline") {
            has_deadline = true;
        }
    }

    has_refill && has_deadline
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_call_detection() {
        assert!(is_sleep_call("    tokio::time::sleep(Duration::from_millis(10)).await;"));
        assert!(is_sleep_call("    tokio::time::sleep_until(deadline).await;"));
        assert!(!is_sleep_call("    notified.await;"));
    }

    #[test]
    fn test_backoff_detection() {
        let test_code = [
            "let delay = tuning.backoff_for_attempt(attempt);",
            "tracing::debug!(attempt, \"Backing off\");",
            "tokio::time::sleep(delay).await;",
        ];

        assert!(
            is_backoff_context(&test_code, 2),
            "Should detect attempt backoff"
        );
    }

    #[test]
    fn test_polling_loop_is_not_backoff() {
        let test_code = [
            "loop {",
            "    if pool.in_flight() == 0 { break; }",
            "    tokio::time::sleep(Duration::from_millis(10)).await;",
            "}",
        ];

        assert!(!is_backoff_context(&test_code, 2));
        assert!(!is_refill_context(&test_code, 2));
    }

    #[test]
    fn test_refill_detection() {
        let test_code = [
            "AcquireAttempt::RateLimited(index, wait) => {",
            "    // Token bucket refill wait",
            "    tokio::time::sleep_until((now + wait).min(deadline)).await;",
            "}",
        ];

        assert!(is_refill_context(&test_code, 2));
    }
}
