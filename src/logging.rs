use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use std::io::Write;
use std::panic;
use std::path::Path;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

pub const LOG_FILE_PREFIX: &str = "chat-sync.log";

lazy_static! {
    static ref REDACTIONS: Vec<(Regex, &'static str)> = vec![
        (
            Regex::new(r"(?i)(bearer\s+)[^\s,;]+").expect("Invalid bearer regex"),
            "${1}[REDACTED]"
        ),
        (
            Regex::new(r"(?i)((?:set-)?cookie:\s*)[^\r\n]+").expect("Invalid cookie regex"),
            "${1}[REDACTED]"
        ),
        (
            Regex::new(r"([?&]t=)[^&\s]+").expect("Invalid trace token regex"),
            "${1}[REDACTED]"
        ),
    ];
}

/// Masks credentials and trace tokens in a log line.
pub fn redact(input: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(input);
    for (pattern, replacement) in REDACTIONS.iter() {
        if pattern.is_match(&out) {
            out = Cow::Owned(pattern.replace_all(&out, *replacement).into_owned());
        }
    }
    out
}

pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        self.inner.write_all(redact(&input).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` adapter so any fmt layer output goes through [`RedactingWriter`].
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for RedactingMakeWriter<M> {
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

/// Installs the global subscriber: env filter, redacted stderr output, an optional
/// daily-rolling file under `log_dir` (NDJSON when `json` is set), and the
/// span-trace layer used by `ObservedError`.
/// Keep the returned guard alive for as long as file logging should flush.
pub fn init_tracing(default_filter: &str, log_dir: Option<&Path>, json: bool) -> Option<WorkerGuard> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => default_filter.into(),
    };

    let (writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (Some(non_blocking), Some(guard))
        }
        None => (None, None),
    };
    let (text_file, json_file) = match writer {
        Some(writer) if json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(RedactingMakeWriter::new(writer)),
            ),
        ),
        Some(writer) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(RedactingMakeWriter::new(writer))
                    .with_ansi(false),
            ),
            None,
        ),
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(RedactingMakeWriter::new(std::io::stderr))
                .with_target(false),
        )
        .with(text_file)
        .with(json_file)
        .with(tracing_error::ErrorLayer::default())
        .try_init();
    if let Err(e) = installed {
        eprintln!("Tracing already initialized: {}", e);
    }
    guard
}

/// Sets up a global panic hook that logs panics through tracing before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}
