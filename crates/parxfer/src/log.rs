//! Structured success/error/debug records with dual textual and machine-readable rendering,
//! built directly on `tracing` macros the way the rest of this codebase logs. `--json` mode is
//! a separate concern from severity: every message additionally knows how to render itself as
//! a single JSON line via `serde_json`.

use serde::Serialize;

use remote_storage::ListingEntry;

/// Collapses internal whitespace (newlines, tabs, runs of spaces) to a single space, so a
/// multi-line error from a storage adapter or subprocess renders as one log line. Idempotent:
/// applying it twice yields the same result.
pub fn cleanup_spaces(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Serialize)]
struct SuccessRecord<'a> {
    operation: &'a str,
    success: bool,
    source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<&'a str>,
}

#[derive(Serialize)]
struct ErrorRecord<'a> {
    operation: &'a str,
    success: bool,
    job: &'a str,
    error: String,
}

pub fn info(operation: &str, source: &str, destination: Option<&str>) {
    tracing::info!(operation, source, destination, "{operation} {source}");
    if json_mode() {
        let record = SuccessRecord {
            operation,
            success: true,
            source,
            destination,
        };
        emit_json(&record);
    }
}

pub fn warning(operation: &str, message: &str) {
    let message = cleanup_spaces(message);
    tracing::warn!(operation, "{message}");
}

pub fn debug(operation: &str, message: &str) {
    tracing::debug!(operation, "{message}");
}

pub fn error(operation: &str, job: &str, err: &anyhow::Error) {
    let message = cleanup_spaces(&err.to_string());
    tracing::error!(operation, job, error = %message, "\"{job}\" {message}");
    if json_mode() {
        let record = ErrorRecord {
            operation,
            success: false,
            job,
            error: message,
        };
        emit_json(&record);
    }
}

/// Logs a job's terminal failure. Success is not logged here: every op handler in `job.rs`
/// already emits its own success line once the destination detail is known. Cancellation errors
/// are deliberately silent too; the CLI surfaces cancellation via its exit code instead.
pub fn job_result(operation: &str, source: &str, result: &anyhow::Result<()>) {
    if let Err(err) = result {
        error(operation, source, err);
    }
}

pub fn list_entry(entry: &ListingEntry) {
    match entry.kind {
        remote_storage::EntryKind::Dir => println!("{:>19}  {:>12}  {}", "", "DIR", entry.key),
        remote_storage::EntryKind::File => {
            println!("{:>19}  {:>12}  {}", format_modified(entry.modified), entry.size, entry.key)
        }
    }
}

fn format_modified(modified: std::time::SystemTime) -> String {
    match modified.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => format!("{}s", d.as_secs()),
        Err(_) => "unknown".to_string(),
    }
}

fn json_mode() -> bool {
    crate::dispatch::JSON_OUTPUT.load(std::sync::atomic::Ordering::Relaxed)
}

fn emit_json(record: &impl Serialize) {
    if let Ok(line) = serde_json::to_string(record) {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_spaces_collapses_whitespace() {
        let input = "line one\n\tline two   three";
        assert_eq!(cleanup_spaces(input), "line one line two three");
    }

    #[test]
    fn cleanup_spaces_is_idempotent() {
        let input = "a\n\nb   c\td";
        let once = cleanup_spaces(input);
        let twice = cleanup_spaces(&once);
        assert_eq!(once, twice);
    }
}
