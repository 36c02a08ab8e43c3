//! Explicit logging context handed to each component at construction.
//!
//! There is no per-module global logger: a component logs inside the span of
//! the `LogContext` it was built with, so every line carries the node profile
//! and the component name.

use crate::config::Profile;
use std::future::Future;
use tracing::instrument::Instrumented;
use tracing::{Instrument, Span};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct LogContext {
    span: Span,
}

impl LogContext {
    /// Root context of the process.
    pub fn root(profile: Profile) -> Self {
        Self {
            span: tracing::info_span!("gateway", %profile),
        }
    }

    /// Context that records nothing, for tests.
    pub fn disabled() -> Self {
        Self { span: Span::none() }
    }

    /// Child context for one component (`relay`, `ingestor`, ...).
    pub fn component(&self, name: &'static str) -> Self {
        Self {
            span: tracing::info_span!(parent: &self.span, "component", name),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Attaches the context to a task future before spawning it.
    pub fn in_span<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span.in_scope(f)
    }
}

/// Installs the fmt subscriber once. `RUST_LOG` wins over the configured level.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_context_still_runs_closures() {
        let ctx = LogContext::disabled().component("relay");
        assert_eq!(ctx.in_scope(|| 2 + 2), 4);
        assert!(ctx.span().is_disabled());
    }

    // `tracing::Instrument` is in scope here through `super::*`
    #[tokio::test]
    async fn in_span_future_completes() {
        let ctx = LogContext::root(Profile::Master).component("ingestor");
        assert_eq!(ctx.in_span(async { 7 }).await, 7);
    }
}
