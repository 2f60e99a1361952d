//! Child-process transport: spawn the PHP CLI and hand it the handshake.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::config::{Settings, StdoutMode};
use crate::error::{Error, Result};

/// Launch the interpreter and write the handshake line to its stdin.
///
/// The bootstrap goes in with `-f <path>` when `interpreter_script` is set,
/// else inline with `-r`. `override_args` are forwarded verbatim after `--`.
pub async fn spawn(settings: &Settings, handshake_line: &str, bootstrap_inline: &str) -> Result<Child> {
    let (program, preset_args) = settings
        .php_cli_name
        .split_first()
        .ok_or_else(|| Error::InvalidUsage("php_cli_name is empty".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(preset_args);
    match &settings.interpreter_script {
        Some(path) => {
            cmd.arg("-f").arg(path);
        }
        None => {
            cmd.arg("-r").arg(bootstrap_inline);
        }
    }
    if !settings.override_args.is_empty() {
        cmd.arg("--").args(&settings.override_args);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(stdout_stdio(settings.stdout));
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        tracing::error!(program = %program, error = %e, "failed to spawn PHP interpreter");
        Error::Io(e)
    })?;
    tracing::debug!(program = %program, pid = ?child.id(), "PHP interpreter spawned");

    // One line on stdin carries the key, sentinel, socket address, and init
    // script, all base64.
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Handshake("child stdin unavailable".to_string()))?;
    stdin.write_all(handshake_line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    drop(stdin);

    Ok(child)
}

fn stdout_stdio(mode: StdoutMode) -> Stdio {
    match mode {
        StdoutMode::Inherit => Stdio::inherit(),
        StdoutMode::Piped => Stdio::piped(),
        StdoutMode::Null => Stdio::null(),
        #[cfg(unix)]
        StdoutMode::Fd(fd) => {
            use std::os::unix::io::FromRawFd;
            // The caller vouches for the descriptor's validity.
            unsafe { Stdio::from_raw_fd(fd) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let settings = Settings {
            php_cli_name: vec!["php-definitely-not-installed".to_string()],
            ..Settings::default()
        };
        let err = spawn(&settings, "aGVsbG8=", "exit(0);").await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_spawn_empty_cli_name() {
        let settings = Settings {
            php_cli_name: Vec::new(),
            ..Settings::default()
        };
        assert!(matches!(
            spawn(&settings, "x", "exit(0);").await,
            Err(Error::InvalidUsage(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_writes_handshake_to_stdin() {
        // `sh -c cat` stands in for the interpreter and echoes its stdin;
        // the `-f /dev/null` we append lands in sh's ignored positionals.
        let settings = Settings {
            php_cli_name: vec!["sh".into(), "-c".into(), "cat".into(), "sh".into()],
            interpreter_script: Some("/dev/null".into()),
            stdout: StdoutMode::Piped,
            ..Settings::default()
        };
        let child = spawn(&settings, "a b c d", "").await.unwrap();
        let out = child.wait_with_output().await.unwrap();
        assert_eq!(out.stdout, b"a b c d\n");
    }
}
