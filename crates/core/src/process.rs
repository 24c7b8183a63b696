// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child process descriptions and outcomes

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// stdout and stderr are piped back to the caller
    #[default]
    Piped,
    /// stdout and stderr share a pseudo-terminal; the combined output is
    /// read back through the stdout reader
    Pty,
}

/// Everything needed to spawn one child process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment instead of inheriting the caller's
    pub clear_env: bool,
    pub output: OutputMode,
}

impl ProcessSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// `/bin/sh -c <command>`
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(["/bin/sh".to_string(), "-c".to_string(), command.into()])
    }

    pub fn push_arg(&mut self, arg: impl Into<String>) {
        self.argv.push(arg.into());
    }

    pub fn setenv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn overlay_env<'a>(&mut self, env: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (key, value) in env {
            self.env.insert(key.clone(), value.clone());
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Terminating signal, when the child was killed by one
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.signal.is_none() && self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.signal, self.code) {
            (Some(signal), _) => write!(f, "terminated by signal {}", signal),
            (None, Some(code)) => write!(f, "exited with status {}", code),
            (None, None) => f.write_str("exited with unknown status"),
        }
    }
}
