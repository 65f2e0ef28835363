//! Console log format for the netcore binary.
//!
//! Lines look like
//! `[2026-01-02 10:11:12.345] [netcore-engine      ] [ℹ INFO   ] message key=value`.
//! A `component` field selects the middle column; every other field is
//! appended after the message.

use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_YELLOW: &str = "\x1b[93m";
const COLOR_RED: &str = "\x1b[91m";
const COLOR_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 20;
const LEVEL_WIDTH: usize = 9;

/// Event formatter for the netcore console
pub struct NetcoreLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl NetcoreLogFormatter {
    /// Formatter labelling events without a component as `service_name`
    pub fn new(service_name: impl Into<String>, color_enabled: bool) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled,
        }
    }

    fn component_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };
        if name.chars().count() > COMPONENT_WIDTH {
            let cut: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level_column(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_RED,
            Level::WARN => COLOR_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_GRAY,
        }
    }

    fn paint(&self, color: &'static str) -> &'static str {
        if self.color_enabled {
            color
        } else {
            ""
        }
    }
}

impl<S, N> FormatEvent<S, N> for NetcoreLogFormatter
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
        let level = event.metadata().level();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        write!(
            writer,
            "{}[{}]{} [{}] [{}{}{}] {}",
            self.paint(COLOR_CYAN),
            timestamp,
            self.paint(COLOR_RESET),
            self.component_column(fields.component.as_deref()),
            self.level_color(level),
            Self::level_column(level),
            self.paint(COLOR_RESET),
            fields.message
        )?;
        for (name, value) in &fields.extra {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer)
    }
}

#[derive(Debug, Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.record_str(field, &unquoted);
    }
}

/// Whether stdout looks like a color-capable terminal
pub fn color_supported() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb" && std::env::var_os("NO_COLOR").is_none(),
        Err(_) => false,
    }
}

/// Filter applying `level` to the netcore crates and `warn` elsewhere.
///
/// `RUST_LOG`, when set, wins over `level`.
pub fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let mut filter = EnvFilter::new("warn");
    for target in ["netcore", "netcore_session", "netcore_wire"] {
        filter = filter.add_directive(format!("{}={}", target, level).parse()?);
    }
    Ok(filter)
}

/// Console subscriber at `level`, not yet installed
pub fn subscriber(level: &str) -> anyhow::Result<impl Subscriber + Send + Sync + 'static> {
    let color = color_supported();
    Ok(tracing_subscriber::fmt()
        .with_env_filter(build_filter(level)?)
        .with_ansi(color)
        .event_format(NetcoreLogFormatter::new("netcore", color))
        .finish())
}

/// Install the global subscriber
pub fn init(level: &str) -> anyhow::Result<()> {
    tracing::subscriber::set_global_default(subscriber(level)?)?;
    Ok(())
}
