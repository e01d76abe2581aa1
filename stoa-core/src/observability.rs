use crate::config::{AccessLogConfig, DebugConfig};
use anyhow::{anyhow, Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Keeps the non-blocking access-log writer alive; dropping it flushes the
/// buffered lines on shutdown.
pub struct LogGuards {
    _access: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init_logging(
    log_dir: &Path,
    access: &AccessLogConfig,
    debug: &DebugConfig,
) -> Result<LogGuards> {
    let default_directive = if debug.enabled { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let system_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter)
        .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
            meta.target() != "access_log"
        }));

    let (access_layer, guard) = if access.enabled {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::never(log_dir, "access.log");
        let (writer, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
            .lossy(false)
            .buffered_lines_limit(access.buffer_lines.max(16))
            .finish(appender);
        let layer = tracing_subscriber::fmt::layer()
            .event_format(AccessLogFormat)
            .with_writer(writer)
            .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
                meta.target() == "access_log"
            }));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(system_layer)
        .with(access_layer)
        .try_init()
        .map_err(|e| anyhow!("tracing init failed: {e}"))?;

    Ok(LogGuards { _access: guard })
}

/// Emit one access-log line. `request_line` is the raw request line
/// (`GET /x HTTP/1.1`); `user` is `-` when unauthenticated.
pub fn log_access(
    remote: &str,
    user: &str,
    request_line: &str,
    status: u16,
    bytes: u64,
    referer: &str,
    user_agent: &str,
) {
    tracing::info!(
        target: "access_log",
        remote = remote,
        user = user,
        request_line = request_line,
        status = status as u64,
        bytes = bytes,
        referer = referer,
        user_agent = user_agent,
    );
}

#[derive(Debug, Clone, Copy, Default)]
struct AccessLogFormat;

#[derive(Debug, Default)]
struct AccessLineFields {
    remote: Option<String>,
    user: Option<String>,
    request_line: Option<String>,
    status: Option<u64>,
    bytes: Option<u64>,
    referer: Option<String>,
    user_agent: Option<String>,
}

impl tracing::field::Visit for AccessLineFields {
    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        match field.name() {
            "status" => self.status = Some(value),
            "bytes" => self.bytes = Some(value),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "remote" => self.remote = Some(value.to_string()),
            "user" => self.user = Some(value.to_string()),
            "request_line" => self.request_line = Some(value.to_string()),
            "referer" => self.referer = Some(value.to_string()),
            "user_agent" => self.user_agent = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        // Fallback for values recorded with Display/Debug sigils.
        let rendered = format!("{value:?}");
        let rendered = rendered.trim_matches('"');
        self.record_str(field, rendered);
    }
}

fn write_quoted(out: &mut String, value: &str) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(ch),
        }
    }
    out.push('"');
}

/// `address - user [dd/Mon/YYYY:HH:MM:SS ±zzzz] "request-line" status bytes
/// "referer" "user-agent"`
fn render_access_line(fields: &AccessLineFields, timestamp: &str) -> String {
    let mut out = String::with_capacity(128);
    out.push_str(fields.remote.as_deref().unwrap_or("-"));
    out.push_str(" - ");
    out.push_str(fields.user.as_deref().unwrap_or("-"));
    let _ = write!(&mut out, " [{}] ", timestamp);
    write_quoted(&mut out, fields.request_line.as_deref().unwrap_or("-"));
    let _ = write!(
        &mut out,
        " {} {} ",
        fields.status.unwrap_or(0),
        fields.bytes.unwrap_or(0)
    );
    write_quoted(&mut out, fields.referer.as_deref().unwrap_or("-"));
    out.push(' ');
    write_quoted(&mut out, fields.user_agent.as_deref().unwrap_or("-"));
    out
}

impl<S, N> tracing_subscriber::fmt::format::FormatEvent<S, N> for AccessLogFormat
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> tracing_subscriber::fmt::format::FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut fields = AccessLineFields::default();
        event.record(&mut fields);
        let timestamp = chrono::Local::now().format("%d/%b/%Y:%H:%M:%S %z").to_string();
        writer.write_str(&render_access_line(&fields, &timestamp))?;
        writer.write_str("\n")
    }
}
