// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Bounded execution of host tools, escalating through `sudo -n` when the
//! agent does not run as root.

use std::env;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} is not installed")]
    NotInstalled(String),
    #[error("{0} needs root and password-less sudo is not available")]
    NoPrivilege(String),
    #[error("Failed to spawn {0}: {1}")]
    Spawn(String, #[source] io::Error),
    #[error("Failed waiting for {0}: {1}")]
    Wait(String, #[source] io::Error),
    #[error("{0} did not finish within {1:?}")]
    Timeout(String, Duration),
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Look `name` up on `PATH`, or check it directly when it contains a slash.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        return path.is_file().then(|| path.to_path_buf());
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

pub fn has_binary(name: &str) -> bool {
    find_binary(name).is_some()
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[derive(Clone, Debug)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        CommandRunner { timeout }
    }

    /// Run `program` with the caller's privileges and return its stdout.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        if !has_binary(program) {
            return Err(Error::NotInstalled(program.to_owned()));
        }
        let mut cmd = Command::new(program);
        cmd.args(args);
        self.execute(program, cmd)
    }

    /// Run `program` as root, through `sudo -n` when not already root.
    pub fn run_privileged(&self, program: &str, args: &[&str]) -> Result<String> {
        if !has_binary(program) {
            return Err(Error::NotInstalled(program.to_owned()));
        }

        if is_root() {
            let mut cmd = Command::new(program);
            cmd.args(args);
            return self.execute(program, cmd);
        }
        if !has_binary("sudo") {
            return Err(Error::NoPrivilege(program.to_owned()));
        }

        let mut cmd = Command::new("sudo");
        cmd.arg("-n").arg(program).args(args);
        self.execute(program, cmd).map_err(|e| escalation_error(program, e))
    }

    fn execute(&self, program: &str, mut cmd: Command) -> Result<String> {
        debug!("Running {cmd:?}");
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn(program.to_owned(), e))?;

        // Drain both pipes while waiting so a chatty child cannot block.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match child
            .wait_timeout(self.timeout)
            .map_err(|e| Error::Wait(program.to_owned(), e))?
        {
            Some(status) => status,
            None => {
                child.kill().ok();
                child.wait().ok();
                return Err(Error::Timeout(program.to_owned(), self.timeout));
            }
        };

        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        if !status.success() {
            return Err(Error::Failed {
                program: program.to_owned(),
                status,
                stderr: stderr.trim().to_owned(),
            });
        }

        Ok(stdout)
    }
}

/// `sudo -n` refuses instead of prompting when escalation needs a password
/// or a terminal.
fn sudo_refused(stderr: &str) -> bool {
    stderr.lines().any(|line| {
        line.starts_with("sudo:")
            && (line.contains("a password is required")
                || line.contains("a terminal is required")
                || line.contains("no tty present")
                || line.contains("is not in the sudoers file")
                || line.contains("is not allowed to execute"))
    })
}

fn escalation_error(program: &str, e: Error) -> Error {
    match e {
        Error::Failed { stderr, .. } if sudo_refused(&stderr) => {
            debug!("sudo refused to run {program}: {stderr}");
            Error::NoPrivilege(program.to_owned())
        }
        e => e,
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).ok();
        String::from_utf8_lossy(&buf).into_owned()
    })
}
