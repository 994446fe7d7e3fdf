//! Observability infrastructure for Verso.
//!
//! Structured logging with consistent spans. Every store operation runs
//! inside a span carrying the operation name and the workspace it is scoped to.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `verso_store=debug`)
///
/// # Example
///
/// ```rust
/// use verso_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .try_init();
            }
            LogFormat::Pretty => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .try_init();
            }
        }
    });
}

/// Creates a span for dataset store operations with standard fields.
///
/// # Example
///
/// ```rust
/// use verso_core::observability::store_span;
///
/// let span = store_span("save_items", "acme-research");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn store_span(operation: &str, workspace: &str) -> Span {
    tracing::info_span!("store", op = operation, workspace = workspace)
}

/// Creates a span for a streaming export.
#[must_use]
pub fn stream_span(dataset_name: &str, workspace: &str) -> Span {
    tracing::info_span!(
        "stream_export",
        dataset = dataset_name,
        workspace = workspace,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = store_span("get_item", "acme");
        let _guard = span.enter();
        tracing::info!("message in store span");

        let stream = stream_span("golden-set", "acme");
        let _guard = stream.enter();
        tracing::info!("message in stream span");
    }
}
