use std::fmt;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::Config;

const LOG_ENV: &str = "ASERVER_LOG";

struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match *self.level {
            Level::TRACE => TRACE_STR,
            Level::DEBUG => DEBUG_STR,
            Level::INFO => INFO_STR,
            Level::WARN => WARN_STR,
            Level::ERROR => ERROR_STR,
        };
        if !self.ansi {
            return f.pad(text);
        }
        let colour = match *self.level {
            Level::TRACE => Colour::Purple,
            Level::DEBUG => Colour::Blue,
            Level::INFO => Colour::Green,
            Level::WARN => Colour::Yellow,
            Level::ERROR => Colour::Red,
        };
        write!(f, "{}", colour.paint(text))
    }
}

struct ServerFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for ServerFormatter
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
        use chrono::Utc;
        let metadata = event.metadata();
        let level = FmtLevel {
            level: metadata.level(),
            ansi: self.ansi && writer.has_ansi_escapes(),
        };

        write!(
            writer,
            "[{} {} {}:{}] ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            level,
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter(default_level: &str) -> anyhow::Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(default_level.parse()?)
        .with_env_var(LOG_ENV)
        .from_env_lossy())
}

/// Log to stdout at `config.log_level`, overridable through `ASERVER_LOG`.
/// With `log_file` set, events are also appended there; the returned guard
/// flushes it on drop.
pub fn init_log(config: &Config, ansi: bool) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(ServerFormatter { ansi })
        .with_filter(env_filter(&config.log_level)?);

    let registry = tracing_subscriber::registry().with(stdout_layer);

    match &config.log_file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log_file {} has no file name", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .event_format(ServerFormatter { ansi: false })
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(env_filter(&config.log_level)?);
            registry.with(file_layer).try_init()?;
            tracing::info!("logging to {}", path.display());
            Ok(Some(guard))
        }
        None => {
            registry.try_init()?;
            tracing::info!("tracing-log initialized");
            Ok(None)
        }
    }
}
