use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const TARGET_WIDTH: usize = 16;
const LOG_LEVEL_WIDTH: usize = 5;

/// `[timestamp] [target] [level] message` lines for the demo
pub struct TetherLogFormatter {
    color_enabled: bool,
}

impl TetherLogFormatter {
    pub fn new() -> Self {
        Self {
            color_enabled: is_terminal(),
        }
    }

    /// Last path segment of the event target, padded or truncated to a fixed width
    fn format_target(&self, target: &str) -> String {
        let name = target.rsplit("::").next().unwrap_or(target);
        if name.chars().count() > TARGET_WIDTH {
            let truncated: String = name.chars().take(TARGET_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = TARGET_WIDTH)
        }
    }

    /// Padded label and color of a level
    fn level_style(&self, level: &tracing::Level) -> (String, &'static str) {
        let (label, color) = match *level {
            tracing::Level::ERROR => ("error", COLOR_BRIGHT_RED),
            tracing::Level::WARN => ("warn", COLOR_BRIGHT_YELLOW),
            tracing::Level::INFO => ("info", COLOR_GREEN),
            tracing::Level::DEBUG => ("debug", COLOR_BRIGHT_GRAY),
            tracing::Level::TRACE => ("trace", COLOR_BRIGHT_GRAY),
        };
        let color = if self.color_enabled { color } else { "" };
        (format!("{:<width$}", label, width = LOG_LEVEL_WIDTH), color)
    }
}

impl<S, N> FormatEvent<S, N> for TetherLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let metadata = event.metadata();
        let level = metadata.level();

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let (level_label, color) = self.level_style(level);
        let reset = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.format_target(metadata.target()),
            color,
            level_label,
            reset
        )?;
        writeln!(writer, "{}{}", visitor.message, reset)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let raw = format!("{:?}", value);
            self.message = match raw.strip_prefix('"').and_then(|m| m.strip_suffix('"')) {
                Some(unquoted) => unquoted.to_string(),
                None => raw,
            };
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}
