//! Structured log multiplexing
//!
//! Every line the orchestrator or the engine emits becomes a structured
//! [`LogEvent`] encoded by one of four encoders over the same schema. Engine
//! stdio is captured unconditionally; `tf-forward-stdout` re-emits engine
//! stdout verbatim to the orchestrator's stdout *in addition to* the
//! structured channel, never instead of it.
//!
//! The writer is mutex-guarded, so a log line is emitted atomically and
//! per-unit line order is preserved; interleaving across units is not
//! ordered.

use crate::error::{Result, RunError};
use chrono::{DateTime, Local};
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use yansi::Paint;

pub mod format;
pub use format::CustomFormat;

/// Log levels, lowest to highest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    fn paint(&self, text: &str) -> String {
        match self {
            LogLevel::Trace => Paint::fixed(245, text).to_string(),
            LogLevel::Debug => Paint::blue(text).to_string(),
            LogLevel::Info => Paint::green(text).to_string(),
            LogLevel::Warn => Paint::yellow(text).to_string(),
            LogLevel::Error => Paint::red(text).bold().to_string(),
        }
    }
}

impl FromStr for LogLevel {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(RunError::msg(format!(
                "invalid log level {other:?}; expected trace, debug, info, warn or error"
            ))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The built-in encoders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Colorized human output.
    #[default]
    Pretty,
    /// logfmt `key=value` pairs.
    KeyValue,
    Json,
    /// Raw message content only, no framing.
    Bare,
}

impl FromStr for LogFormat {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pretty" => Ok(LogFormat::Pretty),
            "key-value" => Ok(LogFormat::KeyValue),
            "json" => Ok(LogFormat::Json),
            "bare" => Ok(LogFormat::Bare),
            other => Err(RunError::msg(format!(
                "invalid log format {other:?}; expected pretty, key-value, json or bare"
            ))),
        }
    }
}

/// How unit paths are rendered in log lines. Uniform across a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PathMode {
    /// Relative to the working directory root.
    #[default]
    ShortRelative,
    /// Relative to the invocation cwd.
    Relative,
    Absolute,
}

impl FromStr for PathMode {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "short-relative" => Ok(PathMode::ShortRelative),
            "relative" => Ok(PathMode::Relative),
            "absolute" => Ok(PathMode::Absolute),
            other => Err(RunError::msg(format!(
                "invalid path display mode {other:?}; expected short-relative, relative or absolute"
            ))),
        }
    }
}

/// Which engine stream a captured line came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One structured log record.
#[derive(Clone, Debug)]
pub struct LogEvent {
    pub time: DateTime<Local>,
    pub level: LogLevel,
    /// Absolute unit path; rendered per the configured [`PathMode`].
    pub prefix: Option<PathBuf>,
    pub engine_path: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: Local::now(),
            level,
            prefix: None,
            engine_path: None,
            command: None,
            args: Vec::new(),
            message: message.into(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_engine(mut self, path: impl Into<String>, command: impl Into<String>) -> Self {
        self.engine_path = Some(path.into());
        self.command = Some(command.into());
        self
    }
}

/// Options for constructing a [`Reporter`].
#[derive(Debug)]
pub struct ReporterOptions {
    pub format: LogFormat,
    pub custom: Option<CustomFormat>,
    pub level: LogLevel,
    pub color: bool,
    pub path_mode: PathMode,
    /// Base for `short-relative` path display.
    pub workspace: PathBuf,
    /// Mirror engine stdout verbatim to the orchestrator's stdout.
    pub forward_stdout: bool,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            custom: None,
            level: LogLevel::default(),
            color: true,
            path_mode: PathMode::default(),
            workspace: PathBuf::new(),
            forward_stdout: false,
        }
    }
}

/// Thread-safe sink for all structured log events of a run.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Mutex<Box<dyn Write + Send>>,
    opts: ReporterOptions,
    epoch: Instant,
}

impl Reporter {
    /// A reporter writing to the process stderr.
    pub fn new(opts: ReporterOptions) -> Self {
        Self::with_sink(opts, Box::new(io::stderr()))
    }

    /// A reporter writing to an arbitrary sink, used by tests.
    pub fn with_sink(opts: ReporterOptions, sink: Box<dyn Write + Send>) -> Self {
        Self { inner: Arc::new(Inner { sink: Mutex::new(sink), opts, epoch: Instant::now() }) }
    }

    pub fn forwards_stdout(&self) -> bool {
        self.inner.opts.forward_stdout
    }

    pub fn level(&self) -> LogLevel {
        self.inner.opts.level
    }

    pub fn log(&self, level: LogLevel, prefix: Option<&Path>, message: impl Into<String>) {
        let mut event = LogEvent::new(level, message);
        event.prefix = prefix.map(Path::to_path_buf);
        self.event(&event);
    }

    pub fn info(&self, prefix: Option<&Path>, message: impl Into<String>) {
        self.log(LogLevel::Info, prefix, message);
    }

    pub fn warn(&self, prefix: Option<&Path>, message: impl Into<String>) {
        self.log(LogLevel::Warn, prefix, message);
    }

    pub fn error(&self, prefix: Option<&Path>, message: impl Into<String>) {
        self.log(LogLevel::Error, prefix, message);
    }

    /// Emits one captured engine output line through the structured channel,
    /// plus the verbatim tee when forwarding is on.
    pub fn engine_line(
        &self,
        unit: &Path,
        engine_path: &str,
        command: &str,
        stream: StreamKind,
        line: &str,
    ) {
        let level = match stream {
            StreamKind::Stdout => LogLevel::Info,
            StreamKind::Stderr => LogLevel::Error,
        };
        let event = LogEvent::new(level, line).with_prefix(unit).with_engine(engine_path, command);
        self.event(&event);
        if stream == StreamKind::Stdout && self.inner.opts.forward_stdout {
            self.forward(line);
        }
    }

    /// Writes a raw line to the orchestrator's stdout, bypassing encoding.
    pub fn forward(&self, line: &str) {
        let stdout = io::stdout();
        let mut stdout = stdout.lock();
        let _ = writeln!(stdout, "{line}");
    }

    pub fn event(&self, event: &LogEvent) {
        if event.level < self.inner.opts.level {
            return;
        }
        let line = self.render(event);
        let mut sink = self.inner.sink.lock().expect("log sink poisoned");
        let _ = writeln!(sink, "{line}");
        let _ = sink.flush();
    }

    /// Renders a unit path per the configured display mode, with `/`
    /// separators on every platform.
    pub fn display_path(&self, path: &Path) -> String {
        use path_slash::PathExt;

        let rendered = match self.inner.opts.path_mode {
            PathMode::ShortRelative => {
                crate::utils::rebase_path(&self.inner.opts.workspace, path)
            }
            PathMode::Relative => {
                let cwd = std::env::current_dir().unwrap_or_default();
                crate::utils::rebase_path(&cwd, path)
            }
            PathMode::Absolute => path.to_path_buf(),
        };
        let rendered = rendered.to_slash_lossy().into_owned();
        if rendered.is_empty() {
            ".".to_string()
        } else {
            rendered
        }
    }

    fn render(&self, event: &LogEvent) -> String {
        if let Some(custom) = &self.inner.opts.custom {
            return custom.render(event, self.inner.epoch.elapsed(), &|p| self.display_path(p));
        }
        match self.inner.opts.format {
            LogFormat::Pretty => self.render_pretty(event),
            LogFormat::KeyValue => self.render_key_value(event),
            LogFormat::Json => self.render_json(event),
            LogFormat::Bare => event.message.clone(),
        }
    }

    fn render_pretty(&self, event: &LogEvent) -> String {
        let time = event.time.format("%H:%M:%S%.3f");
        let level = format!("{:<5}", event.level.as_str().to_uppercase());
        let level = if self.inner.opts.color { event.level.paint(&level) } else { level };
        let mut line = format!("{time} {level}");
        if let Some(prefix) = &event.prefix {
            let prefix = self.display_path(prefix);
            let prefix = if self.inner.opts.color {
                Paint::cyan(&prefix).to_string()
            } else {
                prefix
            };
            line.push_str(&format!(" [{prefix}]"));
        }
        line.push(' ');
        line.push_str(&event.message);
        line
    }

    fn render_key_value(&self, event: &LogEvent) -> String {
        let mut pairs = vec![
            format!("time={}", event.time.to_rfc3339()),
            format!("level={}", event.level),
        ];
        if let Some(prefix) = &event.prefix {
            pairs.push(format!("prefix={}", quote_logfmt(&self.display_path(prefix))));
        }
        if let Some(path) = &event.engine_path {
            pairs.push(format!("tf-path={}", quote_logfmt(path)));
        }
        if let Some(command) = &event.command {
            pairs.push(format!("tf-command={}", quote_logfmt(command)));
        }
        pairs.push(format!("msg={}", quote_logfmt(&event.message)));
        pairs.join(" ")
    }

    fn render_json(&self, event: &LogEvent) -> String {
        let mut map = serde_json::Map::new();
        map.insert("time".into(), event.time.to_rfc3339().into());
        map.insert("level".into(), event.level.as_str().into());
        if let Some(prefix) = &event.prefix {
            map.insert("prefix".into(), self.display_path(prefix).into());
        }
        if let Some(path) = &event.engine_path {
            map.insert("tf-path".into(), path.clone().into());
        }
        if let Some(command) = &event.command {
            map.insert("tf-command".into(), command.clone().into());
        }
        map.insert("msg".into(), event.message.clone().into());
        serde_json::Value::Object(map).to_string()
    }

    /// Seconds since the reporter was created, for the `%interval`
    /// placeholder.
    pub fn elapsed(&self) -> Duration {
        self.inner.epoch.elapsed()
    }
}

fn quote_logfmt(value: &str) -> String {
    if value.contains([' ', '"', '=']) {
        format!("{value:?}")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    #[derive(Clone, Default)]
    struct SharedBuf(StdArc<StdMutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn reporter(format: LogFormat) -> (Reporter, SharedBuf) {
        let buf = SharedBuf::default();
        let opts = ReporterOptions {
            format,
            color: false,
            workspace: PathBuf::from("/ws"),
            ..Default::default()
        };
        (Reporter::with_sink(opts, Box::new(buf.clone())), buf)
    }

    fn rendered(buf: &SharedBuf) -> String {
        String::from_utf8(buf.0.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn pretty_includes_prefix_and_level() {
        let (reporter, buf) = reporter(LogFormat::Pretty);
        reporter.info(Some(Path::new("/ws/app")), "planning");
        let line = rendered(&buf);
        assert!(line.contains("INFO"), "{line}");
        assert!(line.contains("[app]"), "{line}");
        assert!(line.contains("planning"), "{line}");
    }

    #[test]
    fn key_value_quotes_messages_with_spaces() {
        let (reporter, buf) = reporter(LogFormat::KeyValue);
        reporter.warn(None, "two words");
        let line = rendered(&buf);
        assert!(line.contains("level=warn"), "{line}");
        assert!(line.contains("msg=\"two words\""), "{line}");
    }

    #[test]
    fn json_lines_parse_back() {
        let (reporter, buf) = reporter(LogFormat::Json);
        reporter.engine_line(
            Path::new("/ws/app"),
            "terraform",
            "plan",
            StreamKind::Stdout,
            "No changes.",
        );
        let line = rendered(&buf);
        let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["prefix"], "app");
        assert_eq!(parsed["tf-command"], "plan");
        assert_eq!(parsed["msg"], "No changes.");
    }

    #[test]
    fn bare_emits_message_only() {
        let (reporter, buf) = reporter(LogFormat::Bare);
        reporter.info(Some(Path::new("/ws/app")), "hello");
        assert_eq!(rendered(&buf), "hello\n");
    }

    #[test]
    fn level_filter_drops_lower_events() {
        let buf = SharedBuf::default();
        let opts = ReporterOptions {
            level: LogLevel::Warn,
            color: false,
            workspace: PathBuf::from("/ws"),
            ..Default::default()
        };
        let reporter = Reporter::with_sink(opts, Box::new(buf.clone()));
        reporter.info(None, "dropped");
        reporter.error(None, "kept");
        let out = rendered(&buf);
        assert!(!out.contains("dropped"));
        assert!(out.contains("kept"));
    }

    #[test]
    fn stderr_lines_log_at_error_level() {
        let (reporter, buf) = reporter(LogFormat::KeyValue);
        reporter.engine_line(
            Path::new("/ws/app"),
            "terraform",
            "plan",
            StreamKind::Stderr,
            "Error: oh no",
        );
        assert!(rendered(&buf).contains("level=error"));
    }
}
