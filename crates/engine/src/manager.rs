// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build manager
//!
//! Owns the current pipeline and its providers, layers cancellation and
//! build bookkeeping over the pipeline operations.

use crate::diagnostics::{Diagnostic, Severity};
use crate::error::{ManagerError, PipelineError};
use crate::pipeline::Pipeline;
use crate::provider::StageProvider;
use chrono::{DateTime, Local};
use kiln_adapters::ReaperAdapter;
use kiln_core::{CancellationToken, Clock, Configuration, Phase, SystemClock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Diagnostic totals for the current or last operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticCounts {
    pub diagnostics: usize,
    pub errors: usize,
    pub warnings: usize,
}

#[derive(Default)]
struct Counters {
    diagnostics: AtomicUsize,
    errors: AtomicUsize,
    warnings: AtomicUsize,
}

impl Counters {
    fn record(&self, diagnostic: &Diagnostic) {
        self.diagnostics.fetch_add(1, Ordering::Relaxed);
        if diagnostic.severity.is_error() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        } else if diagnostic.severity == Severity::Warning {
            self.warnings.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reset(&self) {
        self.diagnostics.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.warnings.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DiagnosticCounts {
        DiagnosticCounts {
            diagnostics: self.diagnostics.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Timing {
    started: Option<Instant>,
    elapsed: Duration,
    last_build_time: Option<DateTime<Local>>,
}

/// Holds the manager's operation slot until dropped.
struct Claim<'a>(&'a AtomicBool);

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BuildManager<R: ReaperAdapter, C: Clock = SystemClock> {
    reaper: R,
    clock: C,
    pipeline: Mutex<Option<Arc<Pipeline>>>,
    providers: Mutex<Vec<Box<dyn StageProvider>>>,
    cancel: Mutex<CancellationToken>,
    timing: Mutex<Timing>,
    counters: Arc<Counters>,
    active: AtomicBool,
}

impl<R: ReaperAdapter> BuildManager<R, SystemClock> {
    pub fn new(reaper: R) -> Self {
        Self::with_clock(reaper, SystemClock)
    }
}

impl<R: ReaperAdapter, C: Clock> BuildManager<R, C> {
    pub fn with_clock(reaper: R, clock: C) -> Self {
        Self {
            reaper,
            clock,
            pipeline: Mutex::new(None),
            providers: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
            timing: Mutex::new(Timing::default()),
            counters: Arc::new(Counters::default()),
            active: AtomicBool::new(false),
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Build a pipeline for `config` and load `providers` into it.
    pub fn set_pipeline(
        &self,
        config: Configuration,
        providers: Vec<Box<dyn StageProvider>>,
    ) -> Result<Arc<Pipeline>, ManagerError> {
        self.install_pipeline(Pipeline::new(config), providers)
    }

    /// Replace the current pipeline with `pipeline`, loading each provider once.
    /// A provider failure unloads the providers loaded so far and leaves the
    /// manager without a pipeline.
    pub fn install_pipeline(
        &self,
        pipeline: Pipeline,
        mut providers: Vec<Box<dyn StageProvider>>,
    ) -> Result<Arc<Pipeline>, ManagerError> {
        self.invalidate_pipeline();

        let pipeline = Arc::new(pipeline);
        let counters = Arc::clone(&self.counters);
        pipeline.add_diagnostic_observer(move |d| counters.record(d));

        for index in 0..providers.len() {
            if let Err(source) = providers[index].load(&pipeline) {
                let provider = providers[index].name().to_string();
                tracing::error!(provider = %provider, error = %source, "stage provider failed to load");
                for loaded in providers[..index].iter_mut().rev() {
                    loaded.unload(&pipeline);
                }
                return Err(ManagerError::Provider { provider, source });
            }
        }

        tracing::info!(
            config = %pipeline.config().id,
            stages = pipeline.bindings().len(),
            "pipeline ready"
        );
        *Self::lock(&self.providers) = providers;
        *Self::lock(&self.pipeline) = Some(Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Cancel any operation, unload providers and drop the pipeline.
    pub fn invalidate_pipeline(&self) {
        let Some(pipeline) = Self::lock(&self.pipeline).take() else {
            return;
        };
        self.cancel();
        let mut providers = std::mem::take(&mut *Self::lock(&self.providers));
        for provider in providers.iter_mut().rev() {
            provider.unload(&pipeline);
        }
        tracing::debug!(config = %pipeline.config().id, "pipeline invalidated");
    }

    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        Self::lock(&self.pipeline).clone()
    }

    fn ready_pipeline(&self) -> Result<Arc<Pipeline>, ManagerError> {
        match self.pipeline() {
            Some(p) if p.config().ready => Ok(p),
            _ => Err(ManagerError::NotReady),
        }
    }

    /// Token for one operation: cancelled by [`BuildManager::cancel`] or by `caller`.
    fn operation_token(&self, caller: Option<&CancellationToken>) -> CancellationToken {
        let op = Self::lock(&self.cancel).child_token();
        if let Some(caller) = caller {
            caller.adopt(&op);
        }
        op
    }

    /// Reserve the manager for one operation. Counters and timing belong to
    /// the holder until the claim drops.
    fn claim(&self, pipeline: &Pipeline) -> Result<Claim<'_>, ManagerError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::Busy.into());
        }
        let claim = Claim(&self.active);
        if pipeline.busy() {
            return Err(PipelineError::Busy.into());
        }
        Ok(claim)
    }

    fn begin(&self, phase: Phase) {
        self.counters.reset();
        let mut timing = Self::lock(&self.timing);
        timing.started = Some(self.clock.now());
        if phase.primary().ordinal() >= Phase::BUILD.ordinal() && !phase.primary().is_empty() {
            timing.last_build_time = Some(self.clock.wall_now());
        }
    }

    fn end(&self, op: &str, result: &Result<(), PipelineError>) {
        let elapsed = {
            let mut timing = Self::lock(&self.timing);
            if let Some(started) = timing.started.take() {
                timing.elapsed = self.clock.now().saturating_duration_since(started);
            }
            timing.elapsed
        };
        let elapsed_ms = elapsed.as_millis() as u64;
        match result {
            Ok(()) => tracing::info!(op, elapsed_ms, "finished"),
            Err(e) if e.is_cancelled() => tracing::info!(op, elapsed_ms, "cancelled"),
            Err(e) => tracing::warn!(op, elapsed_ms, error = %e, "failed"),
        }
    }

    /// Run the pipeline up to `phase`. Succeeds without running anything
    /// when every stage in the requested phases is already complete.
    pub async fn execute(&self, phase: Phase, cancel: Option<&CancellationToken>) -> Result<(), ManagerError> {
        let pipeline = self.ready_pipeline()?;
        let _claim = self.claim(&pipeline)?;
        if !pipeline.request_phase(phase)? {
            tracing::debug!(phase = %phase, "already up to date");
            return Ok(());
        }

        let op = self.operation_token(cancel);
        self.begin(phase);
        let result = pipeline.execute(phase, &op).await;
        self.end("execute", &result);
        result.map_err(Into::into)
    }

    pub async fn clean(&self, phase: Phase, cancel: Option<&CancellationToken>) -> Result<(), ManagerError> {
        let pipeline = self.ready_pipeline()?;
        let _claim = self.claim(&pipeline)?;
        let op = self.operation_token(cancel);
        self.begin(Phase::NONE);
        let result = pipeline.clean(phase, &op).await;
        self.end("clean", &result);
        result.map_err(Into::into)
    }

    pub async fn rebuild(&self, phase: Phase, cancel: Option<&CancellationToken>) -> Result<(), ManagerError> {
        let pipeline = self.ready_pipeline()?;
        let _claim = self.claim(&pipeline)?;
        let op = self.operation_token(cancel);
        self.begin(phase);
        let result = pipeline.rebuild(phase, &self.reaper, &op).await;
        self.end("rebuild", &result);
        result.map_err(Into::into)
    }

    /// Cancel the running operation. Later operations get a fresh token.
    pub fn cancel(&self) {
        let previous = std::mem::replace(&mut *Self::lock(&self.cancel), CancellationToken::new());
        tracing::debug!("cancelling build operations");
        previous.cancel();
    }

    pub fn busy(&self) -> bool {
        self.active.load(Ordering::Acquire) || self.pipeline().is_some_and(|p| p.busy())
    }

    pub fn message(&self) -> String {
        match self.pipeline() {
            Some(p) => p.message(),
            None => "Not ready".to_string(),
        }
    }

    pub fn last_build_time(&self) -> Option<DateTime<Local>> {
        Self::lock(&self.timing).last_build_time
    }

    /// Time spent in the running operation, or in the last one when idle.
    pub fn running_time(&self) -> Duration {
        let timing = Self::lock(&self.timing);
        match timing.started {
            Some(started) => self.clock.now().saturating_duration_since(started),
            None => timing.elapsed,
        }
    }

    pub fn diagnostic_counts(&self) -> DiagnosticCounts {
        self.counters.snapshot()
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
