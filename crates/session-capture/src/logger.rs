// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for hosts that want the pipeline's logs on their console.
//!
//! Lines look like:
//!
//! ```text
//! SESSION_CAPTURE | WARN | QUEUE | Queue is full (10000 events), evicted 1 oldest event(s)
//! SESSION_CAPTURE | DEBUG | flush{session=3f2a}: UPLOAD | Delivered batch Some(1)..=Some(5)
//! ```

use crate::error::CaptureError;
use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "SESSION_CAPTURE | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs a global subscriber using [`Formatter`].
///
/// `level` is an `EnvFilter` directive such as `debug`. Noisy HTTP
/// internals are silenced. Fails if a global subscriber is already set.
pub fn init_logging(level: &str) -> Result<(), CaptureError> {
    let filter = EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{level}"))
        .map_err(|e| CaptureError::InvalidConfig(format!("invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CaptureError::Runtime(format!("failed to install logger: {e}")))?;

    tracing::debug!("Logging subsystem enabled");
    Ok(())
}
