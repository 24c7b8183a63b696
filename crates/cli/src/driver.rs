// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wires a manifest into a build manager with native adapters

use anyhow::{Context, Result};
use kiln_adapters::{FsReaper, NativeProcessAdapter, TracedProcessAdapter, TracedReaperAdapter};
use kiln_core::{BuildManifest, LogStream};
use kiln_engine::{BuildManager, CommandsProvider, Diagnostic, ManifestProvider, Pipeline, StageProvider};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub type Manager = BuildManager<TracedReaperAdapter<FsReaper>>;

pub struct Session {
    pub manager: Arc<Manager>,
    pub pipeline: Arc<Pipeline>,
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

impl Session {
    /// Diagnostics extracted since the last call.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Load `manifest` and prepare a pipeline whose stage output goes to the
/// terminal.
pub fn open(manifest: &Path) -> Result<Session> {
    let loaded = BuildManifest::load(manifest)
        .with_context(|| format!("failed to load manifest {}", manifest.display()))?;
    let processes = TracedProcessAdapter::new(NativeProcessAdapter::new());
    let providers: Vec<Box<dyn StageProvider>> = vec![
        Box::new(ManifestProvider::new(processes.clone(), &loaded)),
        Box::new(CommandsProvider::new(processes)),
    ];

    let manager = Arc::new(BuildManager::new(TracedReaperAdapter::new(FsReaper::new())));
    let pipeline = manager
        .set_pipeline(loaded.config, providers)
        .context("failed to prepare pipeline")?;
    pipeline.add_log_observer(|stream, line| match stream {
        LogStream::Stdout => println!("{}", line),
        LogStream::Stderr => eprintln!("{}", line),
    });
    let diagnostics = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&diagnostics);
    pipeline.add_diagnostic_observer(move |d| {
        sink.lock().unwrap_or_else(|e| e.into_inner()).push(d.clone());
    });
    tracing::debug!(manifest = %manifest.display(), builddir = %pipeline.builddir().display(), "session open");

    Ok(Session {
        manager,
        pipeline,
        diagnostics,
    })
}

/// One-line diagnostic summary, if the last operation produced any.
pub fn summary(manager: &Manager) -> Option<String> {
    let counts = manager.diagnostic_counts();
    if counts.diagnostics == 0 {
        return None;
    }
    Some(format!(
        "{} error(s), {} warning(s), {} diagnostic(s) in {:.1}s",
        counts.errors,
        counts.warnings,
        counts.diagnostics,
        manager.running_time().as_secs_f64()
    ))
}
