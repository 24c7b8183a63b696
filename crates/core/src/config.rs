// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build configuration and the `kiln.toml` manifest

use crate::phase::{Phase, Whence};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading a build manifest
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid manifest: {0}")]
    Invalid(String),
}

/// Snapshot of the settings a pipeline builds with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub id: String,
    pub display_name: Option<String>,
    pub srcdir: PathBuf,
    pub builddir: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    /// Parallel jobs hint; absent or negative means automatic
    pub parallelism: Option<i32>,
    pub runtime_id: Option<String>,
    pub device_id: Option<String>,
    pub toolchain_id: Option<String>,
    pub prefix: Option<PathBuf>,
    pub build_commands: Vec<String>,
    pub post_install_commands: Vec<String>,
    pub ready: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: None,
            srcdir: PathBuf::new(),
            builddir: None,
            environment: BTreeMap::new(),
            parallelism: None,
            runtime_id: None,
            device_id: None,
            toolchain_id: None,
            prefix: None,
            build_commands: Vec::new(),
            post_install_commands: Vec::new(),
            ready: true,
        }
    }
}

impl Configuration {
    pub fn new(id: impl Into<String>, srcdir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            srcdir: srcdir.into(),
            ..Self::default()
        }
    }

    /// Build directory, defaulting to `<srcdir>/_build`.
    pub fn builddir(&self) -> PathBuf {
        self.builddir
            .clone()
            .unwrap_or_else(|| self.srcdir.join("_build"))
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// Parallel jobs, or `None` for automatic.
    pub fn parallelism(&self) -> Option<u32> {
        self.parallelism
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
    }

    fn resolve_against(&mut self, base: &Path) {
        if self.srcdir.as_os_str().is_empty() || self.srcdir.is_relative() {
            self.srcdir = base.join(&self.srcdir);
        }
        if let Some(builddir) = &self.builddir {
            if builddir.is_relative() {
                self.builddir = Some(base.join(builddir));
            }
        }
    }
}

/// A stage declared in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    pub phase: Phase,
    #[serde(default)]
    pub whence: Option<Whence>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub argv: Option<Vec<String>>,
    /// Shell command run through `/bin/sh -c`
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub clean_argv: Option<Vec<String>>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ignore_exit_status: bool,
    #[serde(default)]
    pub use_pty: bool,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub check_stdout: bool,
    #[serde(default)]
    pub stdout_path: Option<PathBuf>,
}

impl StageDef {
    /// Phase including the whence modifier.
    pub fn binding_phase(&self) -> Phase {
        match self.whence {
            Some(whence) => self.phase.with_whence(whence),
            None => self.phase,
        }
    }

    /// Argument vector to execute.
    pub fn exec_argv(&self) -> Vec<String> {
        match (&self.argv, &self.command) {
            (Some(argv), _) => argv.clone(),
            (None, Some(command)) => vec!["/bin/sh".into(), "-c".into(), command.clone()],
            (None, None) => Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| ConfigError::Invalid(format!("stage {}: {}", self.name, msg));

        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("stage without a name".to_string()));
        }
        match (&self.argv, &self.command) {
            (Some(_), Some(_)) => return Err(invalid("argv and command are mutually exclusive")),
            (None, None) => return Err(invalid("one of argv or command is required")),
            (Some(argv), None) if argv.is_empty() => return Err(invalid("argv is empty")),
            _ => {}
        }
        if matches!(&self.clean_argv, Some(argv) if argv.is_empty()) {
            return Err(invalid("clean_argv is empty"));
        }
        self.binding_phase()
            .validate_binding()
            .map_err(|e| invalid(&e.to_string()))
    }
}

/// A diagnostic regular expression declared in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFormatDef {
    pub regex: String,
}

/// Parsed `kiln.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildManifest {
    #[serde(default)]
    pub config: Configuration,
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageDef>,
    #[serde(default, rename = "error_format")]
    pub error_formats: Vec<ErrorFormatDef>,
}

impl BuildManifest {
    /// Parse manifest content. Relative paths resolve against `base`.
    pub fn parse(content: &str, base: &Path) -> Result<Self, ConfigError> {
        let mut manifest: BuildManifest = toml::from_str(content)?;
        manifest.config.resolve_against(base);
        if manifest.config.id.is_empty() {
            manifest.config.id = manifest
                .config
                .srcdir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string());
        }
        for stage in &manifest.stages {
            stage.validate()?;
        }
        for format in &manifest.error_formats {
            if format.regex.is_empty() {
                return Err(ConfigError::Invalid("error_format with empty regex".to_string()));
            }
        }
        tracing::debug!(
            config = %manifest.config.id,
            stages = manifest.stages.len(),
            "parsed build manifest"
        );
        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let base = std::fs::canonicalize(&base).unwrap_or(base);
        Self::parse(&content, &base)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
