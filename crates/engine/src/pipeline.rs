// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The build pipeline scheduler
//!
//! A [`Pipeline`] owns the stage bindings for one configuration and runs
//! them strictly in sequence. Only one execute, clean or rebuild may be in
//! flight; a second request fails with [`PipelineError::Busy`].

use crate::diagnostics::{Diagnostic, DiagnosticExtractor, Diagnostics};
use crate::error::{PipelineError, StageError};
use crate::launcher::LauncherStage;
use crate::ledger::{self, PlanStep, StageBinding};
use crate::log::LogAggregator;
use crate::stage::{run_stage, Stage, StageLog, StageRun};
use kiln_adapters::{ProcessAdapter, ReaperAdapter};
use kiln_core::{
    BindingId, CancellationToken, Configuration, ErrorFormatId, IdSeq, LogStream, ObserverId,
    OutputMode, Phase, ProcessSpec, ReapSet,
};
use regex::Regex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::Instrument;

/// Host variables carried into a cleared launcher environment.
const HOST_ENV_PASSTHROUGH: &[&str] = &["PATH", "HOME", "USER", "LOGNAME", "TMPDIR", "TERM"];

/// Where the pipeline is in its current or last operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Preparing,
    Running { stage: String, phase: Phase },
    Cleaning { stage: String },
    Succeeded,
    Failed { stage: Option<String> },
    Cancelled,
}

/// A planned stage, as reported by [`Pipeline::plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub id: BindingId,
    pub name: String,
    pub phase: Phase,
    pub priority: i32,
    pub completed: bool,
    pub chained: Vec<String>,
}

struct Inner {
    bindings: Vec<StageBinding>,
    requested: Phase,
    state: PipelineState,
}

/// Clears the busy flag when an operation ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Pipeline {
    config: Configuration,
    srcdir: PathBuf,
    builddir: PathBuf,
    cache_root: Option<PathBuf>,
    inner: Mutex<Inner>,
    busy: AtomicBool,
    ids: IdSeq,
    log: LogAggregator,
    diagnostics: Arc<Diagnostics>,
}

impl Pipeline {
    pub fn new(config: Configuration) -> Self {
        let srcdir = config.srcdir.clone();
        let builddir = config.builddir();
        let diagnostics = Arc::new(Diagnostics::new(DiagnosticExtractor::new(
            srcdir.clone(),
            builddir.clone(),
        )));

        let log = LogAggregator::new();
        let feed = Arc::clone(&diagnostics);
        log.add_observer(move |stream, line| feed.observe(stream, line));

        Self {
            config,
            srcdir,
            builddir,
            cache_root: dirs::cache_dir(),
            inner: Mutex::new(Inner {
                bindings: Vec::new(),
                requested: Phase::NONE,
                state: PipelineState::Idle,
            }),
            busy: AtomicBool::new(false),
            ids: IdSeq::new(),
            log,
            diagnostics,
        }
    }

    /// Override the directory under which the builddir may be deleted on rebuild.
    pub fn with_cache_root(mut self, root: Option<PathBuf>) -> Self {
        self.cache_root = root;
        self
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn srcdir(&self) -> &Path {
        &self.srcdir
    }

    pub fn builddir(&self) -> &Path {
        &self.builddir
    }

    pub fn builddir_path<I, P>(&self, parts: I) -> PathBuf
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        parts.into_iter().fold(self.builddir.clone(), |acc, p| acc.join(p))
    }

    pub fn srcdir_path<I, P>(&self, parts: I) -> PathBuf
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        parts.into_iter().fold(self.srcdir.clone(), |acc, p| acc.join(p))
    }

    pub fn busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PipelineState {
        self.lock().state.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self) -> Result<BusyGuard<'_>, PipelineError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::Busy);
        }
        Ok(BusyGuard(&self.busy))
    }

    fn set_state(&self, state: PipelineState) {
        self.lock().state = state;
    }

    /// Reset per-operation bookkeeping and record the outcome.
    fn finish(&self, state: PipelineState) {
        let mut inner = self.lock();
        inner.requested = Phase::NONE;
        inner.state = state;
    }

    // -------------------------------------------------------------------------
    // Bindings
    // -------------------------------------------------------------------------

    /// Bind `stage` to `phase`. Fails while an operation is in flight.
    pub fn connect(
        &self,
        phase: Phase,
        priority: i32,
        stage: Arc<dyn Stage>,
    ) -> Result<BindingId, PipelineError> {
        phase
            .validate_binding()
            .map_err(|e| PipelineError::invalid_phase(phase, e))?;
        if self.busy() {
            return Err(PipelineError::Busy);
        }
        let id = self.ids.next();
        tracing::debug!(id = %id, phase = %phase, priority, stage = %stage.name(), "connect");
        ledger::insert(
            &mut self.lock().bindings,
            StageBinding {
                id,
                phase,
                priority,
                stage,
            },
        );
        Ok(id)
    }

    pub fn disconnect(&self, id: BindingId) -> Result<(), PipelineError> {
        if self.busy() {
            return Err(PipelineError::Busy);
        }
        let mut inner = self.lock();
        let before = inner.bindings.len();
        inner.bindings.retain(|b| b.id != id);
        if inner.bindings.len() == before {
            return Err(PipelineError::UnknownBinding(id));
        }
        tracing::debug!(id = %id, "disconnect");
        Ok(())
    }

    pub fn stage_by_id(&self, id: BindingId) -> Option<Arc<dyn Stage>> {
        self.lock()
            .bindings
            .iter()
            .find(|b| b.id == id)
            .map(|b| Arc::clone(&b.stage))
    }

    /// All bindings in execution order.
    pub fn bindings(&self) -> Vec<StageBinding> {
        self.lock().bindings.clone()
    }

    /// A base process spec for this configuration: cleared environment with
    /// the host basics, the configuration environment on top, `V=0`, cwd in
    /// the builddir and piped output.
    pub fn create_launcher(&self) -> ProcessSpec {
        let mut spec = ProcessSpec {
            clear_env: true,
            output: OutputMode::Piped,
            cwd: Some(self.builddir.clone()),
            ..ProcessSpec::default()
        };
        for key in HOST_ENV_PASSTHROUGH {
            if let Ok(value) = std::env::var(key) {
                spec.setenv(*key, value);
            }
        }
        spec.overlay_env(&self.config.environment);
        spec.setenv("V", "0");
        spec
    }

    /// Wrap `spec` in a launcher stage and bind it.
    pub fn connect_launcher<P: ProcessAdapter>(
        &self,
        phase: Phase,
        priority: i32,
        processes: P,
        spec: ProcessSpec,
    ) -> Result<BindingId, PipelineError> {
        let name = spec.to_string();
        let stage = LauncherStage::new(name, processes, Some(spec));
        self.connect(phase, priority, Arc::new(stage))
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    pub fn add_log_observer(
        &self,
        observer: impl Fn(LogStream, &str) + Send + Sync + 'static,
    ) -> ObserverId {
        self.log.add_observer(observer)
    }

    pub fn remove_log_observer(&self, id: ObserverId) -> bool {
        self.log.remove_observer(id)
    }

    pub fn add_error_format(&self, regex: &str) -> Result<ErrorFormatId, PipelineError> {
        let regex = Regex::new(regex)?;
        Ok(self.diagnostics.add_format(regex))
    }

    pub fn remove_error_format(&self, id: ErrorFormatId) -> bool {
        self.diagnostics.remove_format(id)
    }

    pub fn add_diagnostic_observer(
        &self,
        observer: impl Fn(&Diagnostic) + Send + Sync + 'static,
    ) -> ObserverId {
        self.diagnostics.add_observer(Arc::new(observer))
    }

    pub fn remove_diagnostic_observer(&self, id: ObserverId) -> bool {
        self.diagnostics.remove_observer(id)
    }

    // -------------------------------------------------------------------------
    // Phase queries
    // -------------------------------------------------------------------------

    /// Add `phase` and everything before it to the requested mask. Returns
    /// whether any stage in the mask still has work; when none does, the
    /// request is already satisfied and the mask is cleared.
    pub fn request_phase(&self, phase: Phase) -> Result<bool, PipelineError> {
        if phase.primary().is_empty() {
            return Err(PipelineError::invalid_phase(phase, "no primary phase"));
        }
        let mut inner = self.lock();
        inner.requested |= phase.and_earlier();
        let pending = ledger::has_work(&inner.bindings, inner.requested);
        if !pending {
            inner.requested = Phase::NONE;
        }
        Ok(pending)
    }

    /// Clear `completed` on stages at or after the lowest phase in `phases`.
    pub fn invalidate_phase(&self, phases: Phase) -> usize {
        let cleared = ledger::invalidate(&self.lock().bindings, phases);
        tracing::debug!(phases = %phases, cleared, "invalidated");
        cleared
    }

    /// Stages the next run to `phase` would execute, in order.
    pub fn plan(&self, phase: Phase) -> Vec<PlannedStage> {
        let inner = self.lock();
        ledger::plan(&inner.bindings, phase.and_earlier())
            .into_iter()
            .map(|step| PlannedStage {
                id: step.binding.id,
                name: step.binding.stage.name(),
                phase: step.binding.phase,
                priority: step.binding.priority,
                completed: step.binding.stage.state().completed(),
                chained: step.chained.iter().map(|c| c.stage.name()).collect(),
            })
            .collect()
    }

    /// Phase of the running stage, or the outcome of the last run.
    pub fn phase(&self) -> Phase {
        match &self.lock().state {
            PipelineState::Running { phase, .. } => phase.primary(),
            PipelineState::Succeeded => Phase::FINISHED,
            PipelineState::Failed { .. } => Phase::FAILED,
            PipelineState::Idle
            | PipelineState::Preparing
            | PipelineState::Cleaning { .. }
            | PipelineState::Cancelled => Phase::NONE,
        }
    }

    /// Human readable progress.
    pub fn message(&self) -> String {
        let state = self.lock().state.clone();
        match state {
            PipelineState::Cleaning { .. } => "Cleaning…".to_string(),
            PipelineState::Running { stage, .. } if !stage.is_empty() => stage,
            PipelineState::Running { phase, .. } => phase_message(phase).to_string(),
            PipelineState::Preparing => "Preparing…".to_string(),
            PipelineState::Succeeded => "Success".to_string(),
            PipelineState::Failed { .. } => "Failed".to_string(),
            PipelineState::Idle | PipelineState::Cancelled => "Ready".to_string(),
        }
    }

    pub fn can_export(&self) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|b| b.phase.contains(Phase::EXPORT))
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Run every stage needed to reach `phase`.
    pub async fn execute(&self, phase: Phase, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let _busy = self.acquire()?;
        let span = tracing::info_span!("pipeline.execute", phase = %phase);
        self.run_execute(phase, cancel).instrument(span).await
    }

    /// Clean every stage at or after `phase`, in reverse order.
    pub async fn clean(&self, phase: Phase, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let _busy = self.acquire()?;
        let span = tracing::info_span!("pipeline.clean", phase = %phase);
        self.run_clean(phase, cancel).instrument(span).await
    }

    /// Invalidate from `phase` on, reap, then execute up to `phase`.
    pub async fn rebuild<R: ReaperAdapter>(
        &self,
        phase: Phase,
        reaper: &R,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let _busy = self.acquire()?;
        let span = tracing::info_span!("pipeline.rebuild", phase = %phase);
        async {
            if phase.primary().is_empty() {
                return Err(PipelineError::invalid_phase(phase, "no primary phase"));
            }
            self.set_state(PipelineState::Preparing);

            let mut reap = ReapSet::new();
            let invalidate = if self.can_remove_builddir() {
                reap.add_directory(&self.builddir);
                Phase::MASK
            } else {
                phase.and_later()
            };
            let affected: Vec<StageBinding> = {
                let inner = self.lock();
                ledger::invalidate(&inner.bindings, invalidate);
                inner
                    .bindings
                    .iter()
                    .filter(|b| b.phase.intersects(invalidate))
                    .cloned()
                    .collect()
            };
            for binding in &affected {
                binding.stage.reap(self, &mut reap);
            }

            if !reap.is_empty() {
                if let Err(e) = reaper.reap(&reap).await {
                    self.finish(PipelineState::Failed { stage: None });
                    return Err(e.into());
                }
            }

            self.run_execute(phase, cancel).await
        }
        .instrument(span)
        .await
    }

    fn can_remove_builddir(&self) -> bool {
        if self.builddir == self.srcdir || self.srcdir.starts_with(&self.builddir) {
            return false;
        }
        match &self.cache_root {
            Some(root) => self.builddir.starts_with(root),
            None => false,
        }
    }

    fn prepare_builddir(&self) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.builddir).map_err(|source| PipelineError::Io {
            path: self.builddir.clone(),
            source,
        })
    }

    async fn stage_log(&self, stage: &dyn Stage) -> Result<StageLog, StageError> {
        let log = StageLog::new(self.log.writer());
        match stage.state().stdout_path() {
            Some(path) => Ok(log.redirect_stdout(&path).await?),
            None => Ok(log),
        }
    }

    /// Await `fut` while dispatching queued log lines on this task.
    async fn drive<F: Future>(&self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => {
                    self.log.flush();
                    return out;
                }
                _ = self.log.ready() => {
                    self.log.dispatch();
                }
            }
        }
    }

    async fn run_execute(&self, phase: Phase, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            self.finish(PipelineState::Cancelled);
            return Err(PipelineError::Cancelled);
        }
        if !self.request_phase(phase)? {
            tracing::debug!("nothing to do");
            self.finish(PipelineState::Succeeded);
            return Ok(());
        }

        self.set_state(PipelineState::Preparing);
        if let Err(e) = self.prepare_builddir() {
            self.finish(PipelineState::Failed { stage: None });
            return Err(e);
        }
        self.diagnostics.reset();

        let steps: Vec<PlanStep> = {
            let inner = self.lock();
            ledger::plan(&inner.bindings, inner.requested)
        };
        tracing::info!(stages = steps.len(), "executing");

        for step in steps {
            if cancel.is_cancelled() {
                tracing::info!("cancelled");
                self.finish(PipelineState::Cancelled);
                return Err(PipelineError::Cancelled);
            }

            let stage = Arc::clone(step.stage());
            let name = stage.name();
            self.set_state(PipelineState::Running {
                stage: name.clone(),
                phase: step.binding.phase,
            });
            self.diagnostics.set_check_stdout(stage.state().check_stdout());

            let start = Instant::now();
            let result = match self.stage_log(stage.as_ref()).await {
                Ok(log) => {
                    let result = self.drive(run_stage(stage.as_ref(), self, &log, cancel)).await;
                    log.flush().await;
                    result
                }
                Err(e) => Err(e),
            };
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(run) => {
                    step.set_completed(true);
                    tracing::info!(
                        stage = %name,
                        elapsed_ms,
                        up_to_date = run == StageRun::UpToDate,
                        "completed"
                    );
                }
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                    step.set_completed(false);
                    tracing::info!(stage = %name, elapsed_ms, "cancelled");
                    self.finish(PipelineState::Cancelled);
                    return Err(PipelineError::Cancelled);
                }
                Err(e) => {
                    step.set_completed(false);
                    tracing::error!(stage = %name, elapsed_ms, error = %e, "failed");
                    self.log.write(LogStream::Stderr, &format!("{}: {}", name, e));
                    self.finish(PipelineState::Failed {
                        stage: Some(name.clone()),
                    });
                    return Err(PipelineError::StageFailed {
                        stage: name,
                        source: e,
                    });
                }
            }
        }

        self.finish(PipelineState::Succeeded);
        Ok(())
    }

    async fn run_clean(&self, phase: Phase, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if phase.primary().is_empty() {
            return Err(PipelineError::invalid_phase(phase, "no primary phase"));
        }
        let bindings = ledger::clean_order(&self.lock().bindings, phase);
        tracing::info!(stages = bindings.len(), "cleaning");

        for binding in bindings {
            if cancel.is_cancelled() {
                self.finish(PipelineState::Cancelled);
                return Err(PipelineError::Cancelled);
            }
            let name = binding.stage.name();
            self.set_state(PipelineState::Cleaning { stage: name.clone() });

            let start = Instant::now();
            let log = StageLog::new(self.log.writer());
            let result = self.drive(binding.stage.clean(self, &log, cancel)).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    binding.stage.state().set_completed(false);
                    tracing::info!(stage = %name, elapsed_ms, "cleaned");
                }
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                    self.finish(PipelineState::Cancelled);
                    return Err(PipelineError::Cancelled);
                }
                Err(e) => {
                    tracing::error!(stage = %name, elapsed_ms, error = %e, "clean failed");
                    self.log.write(LogStream::Stderr, &format!("{}: {}", name, e));
                    self.finish(PipelineState::Failed {
                        stage: Some(name.clone()),
                    });
                    return Err(PipelineError::CleanFailed {
                        stage: name,
                        source: e,
                    });
                }
            }
        }

        self.finish(PipelineState::Idle);
        Ok(())
    }
}

fn phase_message(phase: Phase) -> &'static str {
    match phase.nick() {
        Some("prepare") => "Preparing…",
        Some("downloads") => "Downloading…",
        Some("dependencies") => "Building dependencies…",
        Some("autogen") => "Bootstrapping…",
        Some("configure") => "Configuring…",
        Some("build") => "Building…",
        Some("install") => "Installing…",
        Some("commit") => "Committing…",
        Some("export") => "Exporting…",
        Some("final") => "Finalizing…",
        _ => "Ready",
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config.id)
            .field("builddir", &self.builddir)
            .field("busy", &self.busy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
