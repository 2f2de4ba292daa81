use nu_ansi_term::{Color, Style};
use std::{fmt, thread};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;

/// Single-line event format: level, worker thread, innermost span, fields.
pub struct WorkerFormatter;

fn level_style(level: &Level) -> Style {
    match *level {
        Level::ERROR => Color::Red.bold(),
        Level::WARN => Color::Yellow.into(),
        _ => Style::new(),
    }
}

impl<S, N> FormatEvent<S, N> for WorkerFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        let span_name = ctx
            .current_span()
            .metadata()
            .map(|md| md.name())
            .unwrap_or_default();

        write!(
            &mut writer,
            "[{}]\t{} {}: ",
            level_style(metadata.level()).paint(metadata.level().as_str()),
            Style::new()
                .bold()
                .paint(thread::current().name().unwrap_or_default()),
            Color::Fixed(12).paint(span_name),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}
