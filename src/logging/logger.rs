// Logger handle and output sinks

use std::ffi::CString;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{Facility, Severity};

/// Destination for formatted log lines
pub trait LogSink: Send + Sync {
    fn write(&self, severity: Severity, facility: Facility, message: &str);
}

/// Sink writing to stderr, optionally prefixed with a timestamp
/// (foreground debug mode).
pub struct StderrSink {
    timestamps: bool,
}

impl StderrSink {
    pub fn new(timestamps: bool) -> Self {
        Self { timestamps }
    }
}

impl LogSink for StderrSink {
    fn write(&self, _severity: Severity, facility: Facility, message: &str) {
        let mut stderr = std::io::stderr().lock();
        if self.timestamps {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            let _ = write!(stderr, "{}.{:06}: ", now.as_secs(), now.subsec_micros());
        }
        let _ = writeln!(stderr, "{}: {}", facility, message);
    }
}

/// Sink forwarding to syslog(3)
pub struct SyslogSink {
    // openlog(3) retains the ident pointer; the CString must outlive the sink
    _ident: CString,
}

impl SyslogSink {
    pub fn new(ident: &str) -> Self {
        let ident = CString::new(ident).unwrap_or_default();
        unsafe {
            libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON);
        }
        Self { _ident: ident }
    }
}

impl LogSink for SyslogSink {
    fn write(&self, severity: Severity, facility: Facility, message: &str) {
        let line = format!("{}: {}", facility, message);
        if let Ok(line) = CString::new(line) {
            unsafe {
                libc::syslog(
                    severity.as_u8() as libc::c_int,
                    c"%s".as_ptr(),
                    line.as_ptr(),
                );
            }
        }
    }
}

/// Sink capturing lines in memory, for tests
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Severity, Facility, String)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<(Severity, Facility, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(_, _, message)| message.contains(needle))
    }
}

impl LogSink for Arc<MemorySink> {
    fn write(&self, severity: Severity, facility: Facility, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((severity, facility, message.to_string()));
        }
    }
}

struct DiscardSink;

impl LogSink for DiscardSink {
    fn write(&self, _severity: Severity, _facility: Facility, _message: &str) {}
}

/// Logger handle for writing log lines
///
/// This is a lightweight handle that can be cloned and passed around.
/// The actual sink is shared via Arc. The numeric debug level gates
/// verbosity the same way across the daemon:
///
/// | Level | Covers |
/// |-------|--------|
/// | 0     | abnormal events only |
/// | 1     | interface activations/deactivations |
/// | 2     | IGMP/MLD packet issues |
/// | 3     | IGMP/MLD send and receive |
/// | 4     | bridge packet forwarding detail |
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    sink: Box<dyn LogSink>,
    debug_level: u8,
    max_severity: Severity,
}

fn max_severity_for(debug_level: u8) -> Severity {
    match debug_level {
        0 => Severity::Warning,
        1 => Severity::Notice,
        2 => Severity::Info,
        _ => Severity::Debug,
    }
}

impl Logger {
    pub fn new(sink: Box<dyn LogSink>, debug_level: u8) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                sink,
                debug_level,
                max_severity: max_severity_for(debug_level),
            }),
        }
    }

    /// Stderr logger; timestamps are prepended when running in the
    /// foreground with debugging enabled.
    pub fn to_stderr(debug_level: u8, timestamps: bool) -> Self {
        Self::new(Box::new(StderrSink::new(timestamps)), debug_level)
    }

    /// Syslog logger
    pub fn to_syslog(debug_level: u8, ident: &str) -> Self {
        Self::new(Box::new(SyslogSink::new(ident)), debug_level)
    }

    /// Logger that drops everything, for tests that don't inspect output
    pub fn discard() -> Self {
        Self::new(Box::new(DiscardSink), 0)
    }

    /// The configured debug level (0-4), for call sites that gate
    /// message construction on it
    #[inline]
    pub fn debug_level(&self) -> u8 {
        self.inner.debug_level
    }

    /// Write a log line, subject to the severity filter
    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if severity <= self.inner.max_severity {
            self.inner.sink.write(severity, facility, message);
        }
    }

    /// Log with critical severity
    #[inline]
    pub fn critical(&self, facility: Facility, message: &str) {
        self.log(Severity::Critical, facility, message);
    }

    /// Log with error severity
    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    /// Log with warning severity
    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    /// Log with notice severity
    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    /// Log with info severity
    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    /// Log with debug severity
    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_filter() {
        let sink = MemorySink::new();
        let logger = Logger::new(Box::new(Arc::clone(&sink)), 0);

        logger.warning(Facility::Test, "kept");
        logger.notice(Facility::Test, "dropped");
        logger.info(Facility::Test, "dropped");

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].2, "kept");
    }

    #[test]
    fn test_debug_level_gates() {
        let sink = MemorySink::new();
        let logger = Logger::new(Box::new(Arc::clone(&sink)), 3);

        assert_eq!(logger.debug_level(), 3);
        logger.debug(Facility::Test, "send/receive trace");
        assert!(sink.contains("send/receive trace"));
    }

    #[test]
    fn test_logger_clone_shares_sink() {
        let sink = MemorySink::new();
        let logger = Logger::new(Box::new(Arc::clone(&sink)), 2);
        let clone = logger.clone();

        logger.info(Facility::Test, "from original");
        clone.info(Facility::Test, "from clone");
        assert_eq!(sink.lines().len(), 2);
    }

    #[test]
    fn test_discard_logger() {
        let logger = Logger::discard();
        logger.error(Facility::Test, "goes nowhere");
    }
}
