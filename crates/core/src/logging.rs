//! Tracing subscriber setup
//!
//! Text or JSON on stderr; stdout stays reserved for command output.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Json,
}

impl Format {
    /// Unknown names fall back to text
    fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Install the global subscriber once; later calls do nothing.
///
/// `format` wins over `SHELLSTUDY_LOG_FORMAT`. The filter comes from
/// `SHELLSTUDY_LOG`, then `RUST_LOG`, then `info`.
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let env_format = std::env::var("SHELLSTUDY_LOG_FORMAT").ok();
        let format = Format::from_name(format.or(env_format.as_deref()));
        let span_events = span_events(format);

        let layer = fmt::layer()
            .with_target(true)
            .with_span_events(span_events)
            .with_writer(io::stderr);
        let registry = tracing_subscriber::registry().with(env_filter());
        match format {
            Format::Json => registry.with(layer.json()).init(),
            Format::Text => registry.with(layer).init(),
        }

        tracing::debug!(?format, "Logging initialized");
    });

    Ok(())
}

fn env_filter() -> EnvFilter {
    match std::env::var("SHELLSTUDY_LOG") {
        Ok(directives) => EnvFilter::try_new(&directives).unwrap_or_else(|_| {
            tracing::warn!("Invalid SHELLSTUDY_LOG '{}', using 'info'", directives);
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// `SHELLSTUDY_LOG_SPAN_EVENTS` (e.g. `new,close`) wins; JSON defaults to new/close
fn span_events(format: Format) -> FmtSpan {
    if let Ok(raw) = std::env::var("SHELLSTUDY_LOG_SPAN_EVENTS") {
        return raw
            .split([',', '|'])
            .map(|t| match t.trim().to_lowercase().as_str() {
                "new" => FmtSpan::NEW,
                "close" => FmtSpan::CLOSE,
                "enter" => FmtSpan::ENTER,
                "exit" => FmtSpan::EXIT,
                "active" => FmtSpan::ACTIVE,
                "full" => FmtSpan::FULL,
                _ => FmtSpan::NONE,
            })
            .fold(FmtSpan::NONE, |acc, e| acc | e);
    }

    match format {
        Format::Json => FmtSpan::NEW | FmtSpan::CLOSE,
        Format::Text => FmtSpan::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_ok() {
        assert!(init(None).is_ok());
        assert!(init(Some("json")).is_ok());
        assert!(init(Some("invalid")).is_ok());
    }

    #[test]
    fn test_format_names() {
        assert_eq!(Format::from_name(Some("json")), Format::Json);
        assert_eq!(Format::from_name(Some("text")), Format::Text);
        assert_eq!(Format::from_name(Some("yaml")), Format::Text);
        assert_eq!(Format::from_name(None), Format::Text);
    }

    #[test]
    fn test_span_events_default_by_format() {
        if std::env::var_os("SHELLSTUDY_LOG_SPAN_EVENTS").is_some() {
            return;
        }
        assert_eq!(span_events(Format::Text), FmtSpan::NONE);
        assert_eq!(span_events(Format::Json), FmtSpan::NEW | FmtSpan::CLOSE);
    }
}
