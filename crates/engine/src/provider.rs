// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stage providers
//!
//! A provider is loaded once against a fresh pipeline and connects its
//! stages there. Unloading disconnects everything it registered.

use crate::error::PipelineError;
use crate::launcher::LauncherStage;
use crate::pipeline::Pipeline;
use crate::stage::Stage;
use kiln_adapters::ProcessAdapter;
use kiln_core::{BindingId, BuildManifest, ErrorFormatDef, ErrorFormatId, Phase, ProcessSpec, StageDef, Whence};
use std::path::Path;
use std::sync::Arc;

pub trait StageProvider: Send + Sync {
    fn name(&self) -> &str;

    fn load(&mut self, pipeline: &Pipeline) -> Result<(), PipelineError>;

    fn unload(&mut self, _pipeline: &Pipeline) {}
}

/// Binding and error format ids a provider registered.
#[derive(Debug, Default)]
struct Registered {
    bindings: Vec<BindingId>,
    formats: Vec<ErrorFormatId>,
}

impl Registered {
    fn release(&mut self, provider: &str, pipeline: &Pipeline) {
        for id in self.bindings.drain(..) {
            if let Err(e) = pipeline.disconnect(id) {
                tracing::warn!(provider, id = %id, error = %e, "failed to disconnect stage");
            }
        }
        for id in self.formats.drain(..) {
            pipeline.remove_error_format(id);
        }
    }
}

fn shell_launcher(pipeline: &Pipeline, command: &str) -> ProcessSpec {
    let mut spec = pipeline.create_launcher();
    for arg in ["/bin/sh", "-c", command] {
        spec.push_arg(arg);
    }
    spec
}

/// Runs the configuration's build and post-install commands through
/// `/bin/sh -c`, after the build and install phases respectively.
pub struct CommandsProvider<P: ProcessAdapter> {
    processes: P,
    registered: Registered,
}

impl<P: ProcessAdapter> CommandsProvider<P> {
    pub fn new(processes: P) -> Self {
        Self {
            processes,
            registered: Registered::default(),
        }
    }

    fn connect_all(&mut self, pipeline: &Pipeline, commands: &[String], phase: Phase) -> Result<(), PipelineError> {
        for (index, command) in commands.iter().enumerate() {
            let stage = LauncherStage::new(
                command.as_str(),
                self.processes.clone(),
                Some(shell_launcher(pipeline, command)),
            );
            let priority = i32::try_from(index).unwrap_or(i32::MAX);
            let id = pipeline.connect(phase.with_whence(Whence::After), priority, Arc::new(stage))?;
            self.registered.bindings.push(id);
        }
        Ok(())
    }
}

impl<P: ProcessAdapter> StageProvider for CommandsProvider<P> {
    fn name(&self) -> &str {
        "commands"
    }

    fn load(&mut self, pipeline: &Pipeline) -> Result<(), PipelineError> {
        let config = pipeline.config();
        self.connect_all(pipeline, &config.build_commands, Phase::BUILD)?;
        self.connect_all(pipeline, &config.post_install_commands, Phase::INSTALL)?;
        tracing::debug!(stages = self.registered.bindings.len(), "loaded configuration commands");
        Ok(())
    }

    fn unload(&mut self, pipeline: &Pipeline) {
        self.registered.release("commands", pipeline);
    }
}

/// Connects the `[[stage]]` and `[[error_format]]` entries of a build manifest.
pub struct ManifestProvider<P: ProcessAdapter> {
    processes: P,
    stages: Vec<StageDef>,
    error_formats: Vec<ErrorFormatDef>,
    registered: Registered,
}

impl<P: ProcessAdapter> ManifestProvider<P> {
    pub fn new(processes: P, manifest: &BuildManifest) -> Self {
        Self {
            processes,
            stages: manifest.stages.clone(),
            error_formats: manifest.error_formats.clone(),
            registered: Registered::default(),
        }
    }

    fn launcher(&self, pipeline: &Pipeline, def: &StageDef) -> LauncherStage<P> {
        let mut spec = pipeline.create_launcher();
        for arg in def.exec_argv() {
            spec.push_arg(arg);
        }
        if let Some(cwd) = &def.cwd {
            spec.cwd = Some(in_builddir(pipeline, cwd));
        }
        spec.overlay_env(&def.env);

        let mut stage = LauncherStage::new(def.name.as_str(), self.processes.clone(), Some(spec.clone()))
            .with_ignore_exit_status(def.ignore_exit_status)
            .with_pty(def.use_pty);
        if let Some(clean_argv) = &def.clean_argv {
            let mut clean = spec;
            clean.argv = clean_argv.clone();
            stage = stage.with_clean(clean);
        }

        let state = stage.state();
        state.set_transient(def.transient);
        state.set_disabled(def.disabled);
        state.set_check_stdout(def.check_stdout);
        state.set_stdout_path(def.stdout_path.as_deref().map(|p| in_builddir(pipeline, p)));
        stage
    }
}

fn in_builddir(pipeline: &Pipeline, path: &Path) -> std::path::PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        pipeline.builddir().join(path)
    }
}

impl<P: ProcessAdapter> StageProvider for ManifestProvider<P> {
    fn name(&self) -> &str {
        "manifest"
    }

    fn load(&mut self, pipeline: &Pipeline) -> Result<(), PipelineError> {
        for def in &self.stages {
            let stage = self.launcher(pipeline, def);
            let id = pipeline.connect(def.binding_phase(), def.priority, Arc::new(stage))?;
            self.registered.bindings.push(id);
        }
        for format in &self.error_formats {
            let id = pipeline.add_error_format(&format.regex)?;
            self.registered.formats.push(id);
        }
        tracing::debug!(
            stages = self.registered.bindings.len(),
            error_formats = self.registered.formats.len(),
            "loaded manifest stages"
        );
        Ok(())
    }

    fn unload(&mut self, pipeline: &Pipeline) {
        self.registered.release("manifest", pipeline);
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
