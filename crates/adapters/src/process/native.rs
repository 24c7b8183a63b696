// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process adapter backed by `tokio::process`

use super::{OutputReader, ProcessAdapter, ProcessError, ProcessHandle};
use async_trait::async_trait;
use kiln_core::{OutputMode, ProcessExit, ProcessSpec};
use std::process::{ExitStatus, Stdio};
use tokio::io::BufReader;
use tokio::process::{Child, Command};

/// Spawns real child processes
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeProcessAdapter;

impl NativeProcessAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessAdapter for NativeProcessAdapter {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let (program, args) = spec.argv.split_first().ok_or(ProcessError::EmptyArgv)?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if spec.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        let pty = match spec.output {
            OutputMode::Piped => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                None
            }
            OutputMode::Pty => {
                let (master, stdout, stderr) = pty::open()
                    .map_err(|e| ProcessError::SpawnFailed(format!("{}: pty: {}", program, e)))?;
                cmd.stdout(stdout).stderr(stderr);
                Some(master)
            }
        };
        cmd.kill_on_drop(true);

        let spawned = cmd.spawn();
        // The command holds our copies of the pty slave; the master only
        // reaches end of file once every slave descriptor is closed.
        drop(cmd);
        let child = spawned.map_err(|e| ProcessError::SpawnFailed(format!("{}: {}", program, e)))?;

        Ok(Box::new(NativeProcess { child, pty }))
    }
}

struct NativeProcess {
    child: Child,
    /// Master side of the child's terminal, when spawned in pty mode
    pty: Option<OutputReader>,
}

#[async_trait]
impl ProcessHandle for NativeProcess {
    fn identifier(&self) -> String {
        self.child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "exited".to_string())
    }

    fn take_stdout(&mut self) -> Option<OutputReader> {
        if let Some(master) = self.pty.take() {
            return Some(master);
        }
        let stdout = self.child.stdout.take()?;
        Some(Box::new(BufReader::new(stdout)))
    }

    fn take_stderr(&mut self) -> Option<OutputReader> {
        let stderr = self.child.stderr.take()?;
        Some(Box::new(BufReader::new(stderr)))
    }

    async fn wait(&mut self) -> Result<ProcessExit, ProcessError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ProcessError::WaitFailed(e.to_string()))?;
        Ok(exit_from_status(status))
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.child
            .kill()
            .await
            .map_err(|e| ProcessError::KillFailed(e.to_string()))
    }
}

#[cfg(unix)]
mod pty {
    use super::OutputReader;
    use std::io;
    use std::pin::Pin;
    use std::process::Stdio;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, BufReader, ReadBuf};

    /// Open a pseudo-terminal. Returns the master reader and two slave
    /// handles for the child's stdout and stderr.
    pub(super) fn open() -> io::Result<(OutputReader, Stdio, Stdio)> {
        let pair = nix::pty::openpty(None, None).map_err(io::Error::from)?;
        let stderr = pair.slave.try_clone()?;
        let master = tokio::fs::File::from_std(std::fs::File::from(pair.master));
        let reader: OutputReader = Box::new(BufReader::new(Master(master)));
        Ok((reader, Stdio::from(pair.slave), Stdio::from(stderr)))
    }

    /// Reads the master side. Linux reports `EIO` once the last slave
    /// descriptor closes; that is end of output, not an error.
    struct Master(tokio::fs::File);

    impl AsyncRead for Master {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            match Pin::new(&mut self.0).poll_read(cx, buf) {
                Poll::Ready(Err(e)) if e.raw_os_error() == Some(nix::errno::Errno::EIO as i32) => Poll::Ready(Ok(())),
                other => other,
            }
        }
    }
}

#[cfg(not(unix))]
mod pty {
    use super::OutputReader;
    use std::io;
    use std::process::Stdio;

    pub(super) fn open() -> io::Result<(OutputReader, Stdio, Stdio)> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "pseudo-terminals need unix"))
    }
}

#[cfg(unix)]
fn exit_from_status(status: ExitStatus) -> ProcessExit {
    use std::os::unix::process::ExitStatusExt;
    ProcessExit {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_from_status(status: ExitStatus) -> ProcessExit {
    ProcessExit {
        code: status.code(),
        signal: None,
    }
}

#[cfg(test)]
#[path = "native_tests.rs"]
mod tests;
