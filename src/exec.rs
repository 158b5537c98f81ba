//! The only gateway to the operating system.
//!
//! Every external program (`ip`, `iptables`, `wg`, `wg-quick`, `ping`, ...)
//! is launched through a [`CommandRunner`]. Arguments always travel as a
//! vector, never through a shell, and values that originate from an operator
//! are checked against an allow-list before they are placed in an argument
//! position.

use crate::errors::{RouterError, RouterResult};
use log::debug;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        CommandOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }
}

/// Runs external commands with a timeout.
///
/// A non-zero exit status is not an error here; callers decide what a
/// failure means for them. Errors are reserved for commands that could not be
/// spawned or did not finish in time.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> RouterResult<CommandOutput>;
}

/// [`CommandRunner`] backed by real subprocesses
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

const POLL_STEP: Duration = Duration::from_millis(20);

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> RouterResult<CommandOutput> {
        let display = format!("{} {}", program, redact_args(args).join(" "));
        debug!("Executing command: {}", display);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RouterError::CommandExecution(format!("{}: {}", display, e)))?;

        // Drain both pipes while waiting so a chatty child never blocks on a full pipe
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let started = Instant::now();
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if started.elapsed() >= timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    debug!("Command timed out after {:?}: {}", timeout, display);
                    return Err(RouterError::Timeout {
                        command: display,
                        timeout,
                    });
                }
                None => thread::sleep(POLL_STEP),
            }
        };

        let output = CommandOutput {
            stdout: join_reader(stdout_reader),
            stderr: join_reader(stderr_reader),
            exit_code: status.code(),
        };
        debug!(
            "Command finished with {:?}: stdout={:?} stderr={:?}",
            output.exit_code,
            redact_output(&output.stdout),
            output.stderr.trim()
        );
        Ok(output)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Convenience for building argument vectors from string literals
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

const SECRET_FLAGS: &[&str] = &[
    "--auth-user-pass",
    "--askpass",
    "private-key",
    "preshared-key",
    "password",
];

/// Hide values that follow a credential flag
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            out.push("<redacted>".to_string());
            hide_next = false;
            continue;
        }
        hide_next = SECRET_FLAGS.contains(&arg.as_str());
        out.push(arg.clone());
    }
    out
}

/// Mask base64 key material (44 chars ending in '=') in command output
pub fn redact_output(text: &str) -> String {
    text.split_inclusive(|c: char| c.is_whitespace())
        .map(|token| {
            let trimmed = token.trim_end();
            if looks_like_key(trimmed) {
                token.replacen(trimmed, "<key>", 1)
            } else {
                token.to_string()
            }
        })
        .collect()
}

fn looks_like_key(token: &str) -> bool {
    token.len() == 44
        && token.ends_with('=')
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

/// Profile names end up in file names and command arguments
pub fn validate_profile_name(name: &str) -> RouterResult<()> {
    let valid = (1..=32).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RouterError::InvalidInput {
            what: "profile name",
            value: name.to_string(),
        })
    }
}

/// Linux interface names: at most 15 bytes, no slashes or whitespace
pub fn validate_interface_name(name: &str) -> RouterResult<()> {
    let valid = (1..=15).contains(&name.len())
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(RouterError::InvalidInput {
            what: "interface name",
            value: name.to_string(),
        })
    }
}

/// Hostnames, IPv4 and IPv6 literals
pub fn validate_host(host: &str) -> RouterResult<()> {
    let valid = (1..=253).contains(&host.len())
        && !host.starts_with('-')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == ':');
    if valid {
        Ok(())
    } else {
        Err(RouterError::InvalidInput {
            what: "host",
            value: host.to_string(),
        })
    }
}
