//! Structured logging for the bridge.
//!
//! Provides a layered `tracing` subscriber with:
//! - **stderr** output filtered by `RUST_LOG` (default `warn`).
//! - **file appender** writing JSON lines to `~/.tweety/logs/tweety-bridge.*`
//!   with daily rotation and bounded retention.
//! - **Redaction** helpers for sensitive values such as `fetch` headers.
//! - **Correlation spans** carrying the connection generation and the
//!   JSON-RPC request id.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Default log directory under the user's home.
const LOG_DIR_RELATIVE: &str = ".tweety/logs";

const LOG_FILE_PREFIX: &str = "tweety-bridge";

/// Maximum number of daily log files to retain.
const MAX_LOG_FILES: usize = 7;

/// Names whose values are replaced with `[REDACTED]`.
const REDACTED_FIELD_NAMES: &[&str] = &[
    "api_key",
    "token",
    "secret",
    "password",
    "authorization",
    "credential",
    "cookie",
    "bearer",
];

// ─── Subscriber Initialization ──────────────────────────────────────────────

/// Initialize the global tracing subscriber with stderr + file layers.
///
/// Call this **once** early in `main()`. Panics if called twice.
///
/// `log_dir` overrides `~/.tweety/logs`. The stderr layer never writes to
/// stdout, which the `relay` subcommand reserves for responses.
pub fn init_logging(log_dir: Option<&Path>) {
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let dir = log_dir.map(Path::to_path_buf).or_else(default_log_dir);
    let file_layer = dir.as_deref().and_then(make_file_layer);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    if let Some(dir) = dir {
        prune_old_logs(&dir);
    }
}

/// Capture subscriber for tests; safe to call from several tests.
#[cfg(test)]
pub fn init_test_logging() -> LogCapture {
    let capture = LogCapture::new();
    let _ = tracing_subscriber::registry()
        .with(capture.layer())
        .try_init();
    capture
}

// ─── File Layer ─────────────────────────────────────────────────────────────

#[must_use]
pub fn default_log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(LOG_DIR_RELATIVE))
}

fn make_file_layer<S>(dir: &Path) -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    std::fs::create_dir_all(dir).ok()?;

    let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The guard flushes on drop; keep it for the process lifetime.
    std::mem::forget(guard);

    let layer = fmt::layer()
        .json()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    Some(layer.boxed())
}

// ─── Pruning ────────────────────────────────────────────────────────────────

/// Removes all but the newest [`MAX_LOG_FILES`] log files in `dir`.
/// Returns how many were removed. Errors are ignored.
pub fn prune_old_logs(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut log_files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .collect();

    // Daily rotation suffixes sort chronologically.
    log_files.sort();

    let excess = log_files.len().saturating_sub(MAX_LOG_FILES);
    log_files[..excess]
        .iter()
        .filter(|path| std::fs::remove_file(path).is_ok())
        .count()
}

// ─── Redaction ──────────────────────────────────────────────────────────────

#[must_use]
pub fn is_sensitive_field(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    REDACTED_FIELD_NAMES.iter().any(|&pat| lower.contains(pat))
}

/// Returns `"[REDACTED]"` for sensitive names, the original value otherwise.
#[must_use]
pub fn redact_if_sensitive<'a>(field_name: &str, value: &'a str) -> Cow<'a, str> {
    if is_sensitive_field(field_name) {
        Cow::Borrowed("[REDACTED]")
    } else {
        Cow::Borrowed(value)
    }
}

// ─── Correlation Spans ──────────────────────────────────────────────────────

/// Span covering the lifetime of one native host connection.
pub fn connection_span(generation: u64) -> Span {
    tracing::info_span!("native_connection", generation = generation)
}

/// Span for a single JSON-RPC request, relayed or host-initiated.
pub fn request_span(request_id: &str, method: &str) -> Span {
    tracing::info_span!("rpc_request", request_id = request_id, method = method)
}

// ─── Test Capture ───────────────────────────────────────────────────────────

/// In-memory log capture for test assertions.
#[cfg(test)]
pub struct LogCapture {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl LogCapture {
    fn new() -> Self {
        Self {
            buffer: std::sync::Arc::default(),
        }
    }

    fn layer<S>(&self) -> impl Layer<S>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        CaptureLayer {
            buffer: self.buffer.clone(),
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        let buf = self.buffer.lock().unwrap();
        buf.iter().any(|line| line.contains(needle))
    }
}

#[cfg(test)]
struct CaptureLayer {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl<S> Layer<S> for CaptureLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = StringVisitor::default();
        event.record(&mut visitor);
        let level = event.metadata().level();
        let target = event.metadata().target();
        let line = format!("[{level}] {target}: {}", visitor.output);
        self.buffer.lock().unwrap().push(line);
    }
}

#[cfg(test)]
#[derive(Default)]
struct StringVisitor {
    output: String,
}

#[cfg(test)]
impl tracing::field::Visit for StringVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if !self.output.is_empty() {
            self.output.push(' ');
        }
        self.output.push_str(&format!("{}={:?}", field.name(), value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if !self.output.is_empty() {
            self.output.push(' ');
        }
        let redacted = redact_if_sensitive(field.name(), value);
        self.output
            .push_str(&format!("{}=\"{}\"", field.name(), redacted));
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_field_detection() {
        assert!(is_sensitive_field("Authorization"));
        assert!(is_sensitive_field("Cookie"));
        assert!(is_sensitive_field("set-cookie"));
        assert!(is_sensitive_field("x-api_key"));
        assert!(is_sensitive_field("X-Csrf-Token"));

        assert!(!is_sensitive_field("content-type"));
        assert!(!is_sensitive_field("accept"));
        assert!(!is_sensitive_field("method"));
    }

    #[test]
    fn redaction_replaces_sensitive_values() {
        assert_eq!(
            redact_if_sensitive("authorization", "Bearer abc").as_ref(),
            "[REDACTED]"
        );
        assert_eq!(
            redact_if_sensitive("accept", "text/html").as_ref(),
            "text/html"
        );
    }

    #[test]
    fn captured_events_redact_sensitive_strings() {
        let capture = init_test_logging();
        tracing::info!(cookie = "session=1", host = "example.com", "outgoing");
        // Another test may own the global subscriber.
        if capture.contains("outgoing") {
            assert!(capture.contains("cookie=\"[REDACTED]\""));
            assert!(capture.contains("host=\"example.com\""));
        }
    }

    #[test]
    fn spans_without_subscriber_do_not_panic() {
        let _connection = connection_span(3).entered();
        let _request = request_span("r1", "tabs.query").entered();
    }

    #[test]
    fn default_log_dir_under_home() {
        if let Some(dir) = default_log_dir() {
            assert!(dir.ends_with(".tweety/logs"), "{}", dir.display());
        }
    }

    #[test]
    fn prune_keeps_newest_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for day in 1..=9 {
            let name = format!("{LOG_FILE_PREFIX}.2026-01-{day:02}");
            std::fs::write(dir.path().join(name), "{}").expect("write");
        }
        std::fs::write(dir.path().join("unrelated.txt"), "x").expect("write");

        assert_eq!(prune_old_logs(dir.path()), 2);
        assert!(!dir.path().join(format!("{LOG_FILE_PREFIX}.2026-01-01")).exists());
        assert!(dir.path().join(format!("{LOG_FILE_PREFIX}.2026-01-09")).exists());
        assert!(dir.path().join("unrelated.txt").exists());
        assert_eq!(prune_old_logs(Path::new("/nonexistent/tweety/logs")), 0);
    }
}
