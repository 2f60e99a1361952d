//! Bridge settings.
//!
//! `Settings` is plain data with builder-style setters; `Settings::from_env`
//! loads the same knobs from environment variables for binaries that prefer
//! env-driven configuration.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::host::OnSymbol;
use crate::transport::fcgi::{OnFcgiResponse, OnLogError};

/// What to do with the PHP process's standard output (child-process
/// transport only).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StdoutMode {
    /// Share the host's stdout.
    #[default]
    Inherit,
    /// Capture it behind the stdout multiplexer; readable through
    /// `PhpWorld::get_stdout_reader`.
    Piped,
    /// Discard it.
    Null,
    /// Redirect to an existing file descriptor, verbatim.
    #[cfg(unix)]
    Fd(std::os::unix::io::RawFd),
}

/// Configuration error, raised by [`Settings::from_env`].
#[derive(Debug)]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub error: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}={:?}: {}", self.key, self.value, self.error)
    }
}

impl std::error::Error for ConfigError {}

/// Caller-supplied envelope for the long-running FastCGI request that hosts
/// the bootstrap (method, extra headers, body).
#[derive(Clone, Debug)]
pub struct FcgiRequestInit {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for FcgiRequestInit {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// PHP-FPM transport tuning. A non-empty `listen` selects the FastCGI
/// transport; otherwise the bridge spawns a CLI child process.
#[derive(Clone, Default)]
pub struct PhpFpmSettings {
    /// FastCGI endpoint: `host:port` or a Unix socket path.
    pub listen: String,
    /// Connect timeout for new pool connections.
    pub connect_timeout: Duration,
    /// How long an idle pooled connection is kept.
    pub keep_alive_timeout: Duration,
    /// Requests served per pooled connection before it is retired.
    pub keep_alive_max: u32,
    /// Process-wide cap on concurrent FastCGI connections.
    pub max_conns: usize,
    /// Base FastCGI parameter map; the bridge adds `PHP_WORLD_HELO` and
    /// `SCRIPT_FILENAME` on top.
    pub params: HashMap<String, String>,
    /// Request URI presented to PHP-FPM.
    pub request: String,
    /// Method, headers, and body of the bootstrap request.
    pub request_init: FcgiRequestInit,
    /// Observer for the FastCGI response head.
    pub onresponse: Option<OnFcgiResponse>,
    /// Observer for FastCGI stderr records.
    pub onlogerror: Option<OnLogError>,
}

impl fmt::Debug for PhpFpmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhpFpmSettings")
            .field("listen", &self.listen)
            .field("connect_timeout", &self.connect_timeout)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("keep_alive_max", &self.keep_alive_max)
            .field("max_conns", &self.max_conns)
            .field("params", &self.params)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl PhpFpmSettings {
    pub fn is_enabled(&self) -> bool {
        !self.listen.is_empty()
    }
}

/// Bridge settings. `Default` spawns `php` as a child process with inherited
/// stdout and a TCP control listener on 127.0.0.1.
#[derive(Clone)]
pub struct Settings {
    /// Interpreter argv prefix, child-process mode only.
    pub php_cli_name: Vec<String>,
    /// FastCGI transport configuration.
    pub php_fpm: PhpFpmSettings,
    /// Non-empty: listen for the control connection on this Unix socket
    /// path instead of TCP.
    pub unix_socket_name: String,
    /// Hostname advertised to PHP for connecting back.
    pub localhost_name: String,
    /// Hostname the control listener binds to.
    pub localhost_name_bind: String,
    /// On-disk bootstrap script; when unset the inline bootstrap source is
    /// passed with `-r` (child mode) or written to a temp file (FastCGI).
    pub interpreter_script: Option<PathBuf>,
    /// Standard output handling.
    pub stdout: StdoutMode,
    /// Optional user script PHP executes before the first operation.
    pub init_php_file: String,
    /// Extra interpreter arguments, child-process mode only.
    pub override_args: Vec<String>,
    /// Fallback resolver for host symbols PHP asks for.
    pub onsymbol: Option<OnSymbol>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            php_cli_name: vec!["php".to_string()],
            php_fpm: PhpFpmSettings {
                connect_timeout: Duration::from_secs(4),
                keep_alive_timeout: Duration::from_secs(10),
                keep_alive_max: 100,
                max_conns: 128,
                request: "/".to_string(),
                ..PhpFpmSettings::default()
            },
            unix_socket_name: String::new(),
            localhost_name: "127.0.0.1".to_string(),
            localhost_name_bind: "127.0.0.1".to_string(),
            interpreter_script: None,
            stdout: StdoutMode::Inherit,
            init_php_file: String::new(),
            override_args: Vec::new(),
            onsymbol: None,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("php_cli_name", &self.php_cli_name)
            .field("php_fpm", &self.php_fpm)
            .field("unix_socket_name", &self.unix_socket_name)
            .field("localhost_name", &self.localhost_name)
            .field("localhost_name_bind", &self.localhost_name_bind)
            .field("interpreter_script", &self.interpreter_script)
            .field("stdout", &self.stdout)
            .field("init_php_file", &self.init_php_file)
            .field("override_args", &self.override_args)
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Load settings from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut s = Self::default();
        if let Some(cli) = env_opt("PHP_CLI_NAME") {
            s.php_cli_name = cli.split_whitespace().map(str::to_string).collect();
        }
        if let Some(listen) = env_opt("PHP_FPM_LISTEN") {
            s.php_fpm.listen = listen;
        }
        s.php_fpm.connect_timeout = env_secs("PHP_FPM_CONNECT_TIMEOUT", s.php_fpm.connect_timeout)?;
        s.php_fpm.keep_alive_timeout =
            env_secs("PHP_FPM_KEEP_ALIVE_TIMEOUT", s.php_fpm.keep_alive_timeout)?;
        s.php_fpm.keep_alive_max = env_parse("PHP_FPM_KEEP_ALIVE_MAX", s.php_fpm.keep_alive_max)?;
        s.php_fpm.max_conns = env_parse("PHP_FPM_MAX_CONNS", s.php_fpm.max_conns)?;
        if let Some(path) = env_opt("PHP_WORLD_UNIX_SOCKET") {
            s.unix_socket_name = path;
        }
        if let Some(host) = env_opt("PHP_WORLD_LOCALHOST") {
            s.localhost_name_bind = host.clone();
            s.localhost_name = host;
        }
        if let Some(host) = env_opt("PHP_WORLD_LOCALHOST_BIND") {
            s.localhost_name_bind = host;
        }
        if let Some(script) = env_opt("PHP_WORLD_SCRIPT") {
            s.interpreter_script = Some(PathBuf::from(script));
        }
        if let Some(file) = env_opt("PHP_WORLD_INIT_FILE") {
            s.init_php_file = file;
        }
        match env_or("PHP_WORLD_STDOUT", "inherit").as_str() {
            "inherit" => s.stdout = StdoutMode::Inherit,
            "piped" => s.stdout = StdoutMode::Piped,
            "null" => s.stdout = StdoutMode::Null,
            other => {
                return Err(ConfigError {
                    key: "PHP_WORLD_STDOUT".into(),
                    value: other.into(),
                    error: "expected inherit, piped, or null".into(),
                })
            }
        }
        Ok(s)
    }

    /// Select the FastCGI transport.
    pub fn with_php_fpm_listen(mut self, listen: impl Into<String>) -> Self {
        self.php_fpm.listen = listen.into();
        self
    }

    pub fn with_stdout(mut self, mode: StdoutMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn with_init_php_file(mut self, path: impl Into<String>) -> Self {
        self.init_php_file = path.into();
        self
    }

    pub fn with_unix_socket(mut self, path: impl Into<String>) -> Self {
        self.unix_socket_name = path.into();
        self
    }

    pub fn with_onsymbol(mut self, resolver: OnSymbol) -> Self {
        self.onsymbol = Some(resolver);
        self
    }
}

// =============================================================================
// Environment helpers
// =============================================================================

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v.parse().map_err(|e: T::Err| ConfigError {
            key: key.into(),
            value: v,
            error: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.php_cli_name, vec!["php"]);
        assert!(!s.php_fpm.is_enabled());
        assert_eq!(s.stdout, StdoutMode::Inherit);
        assert!(s.unix_socket_name.is_empty());
        assert_eq!(s.localhost_name, "127.0.0.1");
    }

    #[test]
    fn test_builders() {
        let s = Settings::default()
            .with_php_fpm_listen("127.0.0.1:9000")
            .with_stdout(StdoutMode::Piped)
            .with_unix_socket("/tmp/php_world.sock");
        assert!(s.php_fpm.is_enabled());
        assert_eq!(s.stdout, StdoutMode::Piped);
        assert_eq!(s.unix_socket_name, "/tmp/php_world.sock");
    }

    #[test]
    fn test_from_env_stdout_mode() {
        std::env::remove_var("PHP_WORLD_STDOUT");
        assert_eq!(Settings::from_env().unwrap().stdout, StdoutMode::Inherit);
        std::env::set_var("PHP_WORLD_STDOUT", "piped");
        assert_eq!(Settings::from_env().unwrap().stdout, StdoutMode::Piped);
        std::env::set_var("PHP_WORLD_STDOUT", "bogus");
        assert!(Settings::from_env().is_err());
        std::env::remove_var("PHP_WORLD_STDOUT");
    }
}
