//! Structured tracing setup for observability and debugging.
//!
//! This module configures the `tracing` subscriber for processes embedding
//! the dispatch core: structured output with file names, line numbers, log
//! levels, and span close events. The filter honors `RUST_LOG` and falls
//! back to `debug` for this crate.

use tracing_subscriber::{
    EnvFilter, Layer, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Initializes the global tracing subscriber with formatted output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("argus=debug,info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_filter(filter),
        )
        .init();
}
