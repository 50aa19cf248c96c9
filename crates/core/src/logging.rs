//! Structured logging infrastructure for TrustClient.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{CoreError, Result};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Human-readable output shared by [`init`] and [`try_init`].
fn text_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
}

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level. Panics if a global subscriber is
/// already installed; use [`try_init`] where that can happen.
///
/// # Example
/// ```no_run
/// use trustclient_core::logging;
///
/// logging::init();
/// tracing::info!("Client started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(text_layer(std::io::stdout))
        .init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// # Example
/// ```no_run
/// use trustclient_core::logging;
///
/// logging::init_json();
/// tracing::info!(context = "default", "Client started");
/// ```
pub fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Like [`init`], but reports an already-installed subscriber as an error.
pub fn try_init() -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(text_layer(std::io::stdout))
        .try_init()
        .map_err(|e| CoreError::Logging(e.to_string()))
}
