//! Custom tracing layers

use tracing::{Subscriber, span};
use tracing_subscriber::{
    layer::{Context, Layer},
    registry::LookupSpan,
};

use crate::context::{SessionContextData, SessionContextGuard};

/// Layer that attaches the active session to every new span
///
/// Other layers can read it back through [`SessionContextExtension`] in the
/// span's extensions, even when the span is entered on another thread.
#[derive(Debug, Default)]
pub struct SessionContextLayer;

impl SessionContextLayer {
    pub fn new() -> Self {
        Self
    }
}

/// Extension data stored on spans
#[derive(Debug, Clone)]
pub struct SessionContextExtension {
    pub data: SessionContextData,
}

impl<S> Layer<S> for SessionContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        // a child span inherits the session of its parent
        let inherited = span
            .parent()
            .and_then(|parent| parent.extensions().get::<SessionContextExtension>().cloned());
        if let Some(ext) = SessionContextGuard::current()
            .map(|data| SessionContextExtension { data })
            .or(inherited)
        {
            span.extensions_mut().insert(ext);
        }
    }
}

/// Create a JSONL formatting layer writing to `writer`
pub fn jsonl_file_layer<S, W>(
    writer: W,
    include_location: bool,
    include_thread_info: bool,
) -> tracing_subscriber::fmt::Layer<
    S,
    tracing_subscriber::fmt::format::JsonFields,
    tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Json>,
    W,
>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .flatten_event(true)
        .with_file(include_location)
        .with_line_number(include_location)
        .with_thread_ids(include_thread_info)
        .with_thread_names(include_thread_info)
        .with_writer(writer)
}
