// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child process adapters

mod native;

pub use native::NativeProcessAdapter;

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeProcessAdapter, FakeProcessScript, ProcessCall};

use async_trait::async_trait;
use kiln_core::{ProcessExit, ProcessSpec};
use thiserror::Error;
use tokio::io::AsyncBufRead;

/// Errors from process operations
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("empty argument vector")]
    EmptyArgv,
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("wait failed: {0}")]
    WaitFailed(String),
    #[error("kill failed: {0}")]
    KillFailed(String),
}

/// Line-oriented reader over one of the child's output pipes
pub type OutputReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// A running child process
#[async_trait]
pub trait ProcessHandle: Send {
    /// Stable identifier for logging (the pid for real processes)
    fn identifier(&self) -> String;

    /// Take the stdout pipe. `None` when not piped or already taken.
    fn take_stdout(&mut self) -> Option<OutputReader>;

    /// Take the stderr pipe. `None` when not piped or already taken.
    fn take_stderr(&mut self) -> Option<OutputReader>;

    /// Wait for the child to exit. Cancel safe.
    async fn wait(&mut self) -> Result<ProcessExit, ProcessError>;

    /// Force the child to exit and reap it
    async fn kill(&mut self) -> Result<(), ProcessError>;
}

/// Adapter for spawning child processes
#[async_trait]
pub trait ProcessAdapter: Clone + Send + Sync + 'static {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>, ProcessError>;
}
