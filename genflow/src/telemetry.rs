//! Tracing subscriber setup and span helpers.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::{JobId, Stage};

static INIT: Once = Once::new();

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "genflow=info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Installs the global tracing subscriber.
///
/// Safe to call more than once; only the first call has an effect. If
/// another subscriber is already installed it is left in place.
pub fn init_tracing(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Text => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(true))
                .try_init(),
        };

        if let Err(e) = result {
            tracing::debug!(error = %e, "Tracing subscriber already installed");
        }
    });
}

/// Span covering one stage attempt of a job.
#[must_use]
pub fn stage_span(job_id: JobId, service_name: &str, stage: Stage, attempt: u32) -> Span {
    tracing::info_span!(
        "stage",
        job_id = %job_id,
        service = service_name,
        stage = %stage,
        attempt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing(LogFormat::Text);
        init_tracing(LogFormat::Json);
    }

    #[test]
    fn test_stage_span_enters() {
        let span = stage_span(JobId::new(), "foo-api", Stage::Build, 2);
        let _guard = span.enter();
        tracing::info!("inside stage span");
    }
}
