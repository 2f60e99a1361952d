//! Error types for the PHP bridge.
//!
//! Two error kinds cross the interpreter boundary: [`InterpreterError`] for
//! exceptions thrown by PHP code, and [`Error::InterpreterExit`] when the PHP
//! process or control channel goes away. Everything else is raised on the
//! host side before a record is written.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Errors surfaced by bridge operations.
#[derive(Debug)]
pub enum Error {
    /// Static misuse of the bridge API (forbidden path shapes, spaces in
    /// names). Raised at submission time; never crosses the wire.
    InvalidUsage(String),

    /// A PHP-side exception was thrown while executing a requested operation.
    Interpreter(InterpreterError),

    /// The PHP process terminated or the control channel closed unexpectedly.
    /// `code` is -1 when no exit status is available.
    InterpreterExit {
        code: i32,
    },

    /// The inbound control connection could not be authenticated.
    Handshake(String),

    /// A FastCGI-level failure. When the PHP-FPM response completes before
    /// the control connection arrives, the handshake has failed and the
    /// response status and body are surfaced here.
    Fcgi {
        status: u16,
        body: String,
    },

    /// I/O error on the transport.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidUsage(msg) => write!(f, "invalid usage: {}", msg),
            Error::Interpreter(e) => write!(f, "{}", e),
            Error::InterpreterExit { code } => write!(f, "PHP interpreter exited with code {}", code),
            Error::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            Error::Fcgi { status, body } => write!(f, "FastCGI request failed: status {}: {}", status, body),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<InterpreterError> for Error {
    fn from(e: InterpreterError) -> Self {
        Error::Interpreter(e)
    }
}

impl Error {
    /// Returns true if this error means the interpreter is gone and the
    /// bridge will respawn it on the next operation.
    pub fn is_exit(&self) -> bool {
        matches!(self, Error::InterpreterExit { .. })
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Interpreter errors and PHP stack traces
// =============================================================================

/// An exception thrown by PHP while executing a requested operation.
///
/// Carries the script location and the PHP-formatted stack trace, parsed into
/// [`TraceFrame`]s so callers can render it in host conventions.
#[derive(Debug, Clone)]
pub struct InterpreterError {
    /// Exception message.
    pub message: String,
    /// Script file the exception originated in.
    pub file_name: String,
    /// Line number within `file_name`.
    pub line_number: u32,
    /// Parsed trace frames, outermost call last.
    pub trace: Vec<TraceFrame>,
    /// The raw PHP trace text as received.
    pub php_trace: String,
}

/// One frame of a PHP stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Source file, or a pseudo-location like `[internal function]`.
    pub file: String,
    /// Line number, absent for internal frames.
    pub line: Option<u32>,
    /// Function or method description, arguments included.
    pub func: String,
}

fn trace_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // `#<index> <location>: <info>` where location is `<file>(<line>)` or a
    // bare path. Lines that do not match (e.g. `#2 {main}`) end the parse.
    RE.get_or_init(|| Regex::new(r"^#\d+ (.+?)(?:\((\d+)\))?: (.*?)\r?$").unwrap())
}

impl InterpreterError {
    /// Build from the wire form: the JSON 4-tuple `[file, line, message, trace]`
    /// carried by a reverse `ERROR` record.
    pub fn new(
        message: impl Into<String>,
        file_name: impl Into<String>,
        line_number: u32,
        php_trace: impl Into<String>,
    ) -> Self {
        let php_trace = php_trace.into();
        let trace = parse_php_trace(&php_trace);
        Self {
            message: message.into(),
            file_name: file_name.into(),
            line_number,
            trace,
            php_trace,
        }
    }
}

impl fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file_name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} in {}:{}", self.message, self.file_name, self.line_number)
        }
    }
}

/// Parse a PHP `Throwable::getTraceAsString` dump.
///
/// Parsing is line-oriented; the first malformed line terminates it
/// gracefully, so partial traces still yield the leading frames.
pub fn parse_php_trace(trace: &str) -> Vec<TraceFrame> {
    let re = trace_line_re();
    let mut frames = Vec::new();
    for line in trace.lines() {
        let caps = match re.captures(line) {
            Some(caps) => caps,
            None => break,
        };
        let line_number = caps.get(2).and_then(|m| m.as_str().parse().ok());
        frames.push(TraceFrame {
            file: caps[1].to_string(),
            line: line_number,
            func: caps[3].to_string(),
        });
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidUsage("no spaces allowed in 'a b'".to_string());
        assert_eq!(err.to_string(), "invalid usage: no spaces allowed in 'a b'");

        let err = Error::InterpreterExit { code: 255 };
        assert_eq!(err.to_string(), "PHP interpreter exited with code 255");
        assert!(err.is_exit());
    }

    #[test]
    fn test_parse_trace() {
        let trace = "#0 /srv/app/lib.php(42): App\\Service->run(Array)\n\
                     #1 /srv/app/index.php(7): main()\n\
                     #2 {main}";
        let frames = parse_php_trace(trace);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].file, "/srv/app/lib.php");
        assert_eq!(frames[0].line, Some(42));
        assert_eq!(frames[0].func, "App\\Service->run(Array)");
        assert_eq!(frames[1].line, Some(7));
    }

    #[test]
    fn test_parse_trace_internal_frame() {
        let frames = parse_php_trace("#0 [internal function]: strlen()\n#1 {main}");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].file, "[internal function]");
        assert_eq!(frames[0].line, None);
        assert_eq!(frames[0].func, "strlen()");
    }

    #[test]
    fn test_parse_trace_malformed_tail() {
        let frames = parse_php_trace("#0 /a.php(1): f()\ngarbage line\n#1 /b.php(2): g()");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_interpreter_error_display() {
        let e = InterpreterError::new("boom", "/srv/x.php", 3, "#0 {main}");
        assert_eq!(e.to_string(), "boom in /srv/x.php:3");
        assert!(e.trace.is_empty());

        let e = InterpreterError::new("boom", "", 0, "");
        assert_eq!(e.to_string(), "boom");
    }
}
