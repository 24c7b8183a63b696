// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::stage::StageState;
use async_trait::async_trait;
use kiln_adapters::FakeReaperAdapter;
use kiln_core::Whence;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tempfile::TempDir;

const GCC: &str = r"(?P<filename>[a-zA-Z0-9\+\-\.\/_]+):(?P<line>\d+):(?P<column>\d+): (?P<level>[\w\s]+): (?P<message>.*)";

/// Shared record of what stages did
#[derive(Clone, Default)]
struct Journal {
    events: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl Journal {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail,
    Sleep(Duration),
    WaitForCancel,
    Log(Vec<(LogStream, String)>),
}

struct Recorder {
    state: StageState,
    journal: Journal,
    behavior: Behavior,
    reap_file: Option<PathBuf>,
    absorbs: Option<String>,
}

impl Recorder {
    fn new(name: &str, journal: &Journal) -> Self {
        Self {
            state: StageState::new(name),
            journal: journal.clone(),
            behavior: Behavior::Succeed,
            reap_file: None,
            absorbs: None,
        }
    }

    fn behave(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    async fn act(&self, verb: &str, log: &StageLog, cancel: &CancellationToken) -> Result<(), StageError> {
        let now = self.journal.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.max_running.fetch_max(now, Ordering::SeqCst);
        self.journal.push(format!("{}:{}", verb, self.state.name()));

        let result = match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(StageError::Failed("boom".to_string())),
            Behavior::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
            Behavior::WaitForCancel => {
                cancel.cancelled().await;
                Err(StageError::Cancelled)
            }
            Behavior::Log(lines) => {
                for (stream, line) in lines {
                    log.log(*stream, line.clone());
                }
                Ok(())
            }
        };

        self.journal.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl Stage for Recorder {
    fn state(&self) -> &StageState {
        &self.state
    }

    async fn execute(&self, _: &Pipeline, log: &StageLog, cancel: &CancellationToken) -> Result<(), StageError> {
        self.act("exec", log, cancel).await
    }

    async fn clean(&self, _: &Pipeline, log: &StageLog, cancel: &CancellationToken) -> Result<(), StageError> {
        self.act("clean", log, cancel).await
    }

    fn chain(&self, next: &dyn Stage) -> bool {
        self.absorbs.as_deref() == Some(next.name().as_str())
    }

    fn reap(&self, _pipeline: &Pipeline, reaper: &mut ReapSet) {
        if let Some(path) = &self.reap_file {
            reaper.add_file(path);
        }
    }
}

struct Fixture {
    dir: TempDir,
    pipeline: Pipeline,
    journal: Journal,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(Configuration::new("test", dir.path())).with_cache_root(None);
        Self {
            dir,
            pipeline,
            journal: Journal::default(),
        }
    }

    fn stage(&self, name: &str) -> Recorder {
        Recorder::new(name, &self.journal)
    }

    fn bind(&self, phase: Phase, priority: i32, stage: Recorder) -> Arc<Recorder> {
        let stage = Arc::new(stage);
        self.pipeline.connect(phase, priority, stage.clone()).unwrap();
        stage
    }

    fn events(&self) -> Vec<String> {
        self.journal.events()
    }
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn executes_bindings_in_plan_order() {
    let fx = Fixture::new();
    let s1 = fx.bind(Phase::CONFIGURE, 0, fx.stage("S1"));
    fx.bind(Phase::BUILD, 0, fx.stage("S2"));
    fx.bind(Phase::BUILD, -5, fx.stage("S3"));
    let s4 = fx.bind(Phase::INSTALL, 0, fx.stage("S4"));

    fx.pipeline.execute(Phase::INSTALL, &token()).await.unwrap();

    assert_eq!(fx.events(), vec!["exec:S1", "exec:S3", "exec:S2", "exec:S4"]);
    assert!(s1.state.completed() && s4.state.completed());
    assert_eq!(fx.pipeline.phase(), Phase::FINISHED);
    assert_eq!(fx.pipeline.message(), "Success");
    assert!(!fx.pipeline.busy());
}

#[tokio::test]
async fn completed_stages_do_not_rerun() {
    let fx = Fixture::new();
    fx.bind(Phase::CONFIGURE, 0, fx.stage("configure"));
    fx.bind(Phase::BUILD, 0, fx.stage("make"));

    fx.pipeline.execute(Phase::CONFIGURE, &token()).await.unwrap();
    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();
    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();

    assert_eq!(fx.events(), vec!["exec:configure", "exec:make"]);
    assert!(!fx.pipeline.request_phase(Phase::BUILD).unwrap());
}

#[tokio::test]
async fn transient_stage_runs_every_time() {
    let fx = Fixture::new();
    let stage = fx.stage("check");
    stage.state.set_transient(true);
    fx.bind(Phase::BUILD, 0, stage);

    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();
    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();

    assert_eq!(fx.events(), vec!["exec:check", "exec:check"]);
}

#[tokio::test(start_paused = true)]
async fn stages_never_overlap() {
    let fx = Fixture::new();
    for (i, phase) in [Phase::PREPARE, Phase::CONFIGURE, Phase::BUILD, Phase::INSTALL]
        .into_iter()
        .enumerate()
    {
        let stage = fx
            .stage(&format!("s{}", i))
            .behave(Behavior::Sleep(Duration::from_millis(50)));
        fx.bind(phase.with_whence(Whence::Before), 0, stage);
        fx.bind(phase, 0, fx.stage(&format!("t{}", i)));
    }

    fx.pipeline.execute(Phase::INSTALL, &token()).await.unwrap();

    assert_eq!(fx.events().len(), 8);
    assert_eq!(fx.journal.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failure_stops_remaining_stages() {
    let fx = Fixture::new();
    let first = fx.bind(Phase::CONFIGURE, 0, fx.stage("configure"));
    let failing = fx.bind(Phase::BUILD, 0, fx.stage("make").behave(Behavior::Fail));
    let last = fx.bind(Phase::INSTALL, 0, fx.stage("install"));

    let err = fx.pipeline.execute(Phase::INSTALL, &token()).await.unwrap_err();

    assert!(matches!(err, PipelineError::StageFailed { ref stage, .. } if stage == "make"));
    assert_eq!(fx.events(), vec!["exec:configure", "exec:make"]);
    assert!(first.state.completed());
    assert!(!failing.state.completed());
    assert!(!last.state.completed());
    assert_eq!(fx.pipeline.phase(), Phase::FAILED);
    assert_eq!(fx.pipeline.message(), "Failed");
    assert!(!fx.pipeline.busy());
}

#[tokio::test]
async fn failed_run_can_be_retried() {
    let fx = Fixture::new();
    fx.bind(Phase::BUILD, 0, fx.stage("make").behave(Behavior::Fail));

    assert!(fx.pipeline.execute(Phase::BUILD, &token()).await.is_err());
    assert!(fx.pipeline.execute(Phase::BUILD, &token()).await.is_err());
    assert_eq!(fx.events(), vec!["exec:make", "exec:make"]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_are_rejected_while_busy() {
    let fx = Fixture::new();
    let slow = fx.stage("slow").behave(Behavior::Sleep(Duration::from_secs(1)));
    let id = fx.pipeline.connect(Phase::BUILD, 0, Arc::new(slow)).unwrap();
    let reaper = FakeReaperAdapter::new();

    let cancel = token();
    let (first, ()) = tokio::join!(fx.pipeline.execute(Phase::BUILD, &cancel), async {
        tokio::task::yield_now().await;
        assert!(fx.pipeline.busy());
        assert!(matches!(
            fx.pipeline.execute(Phase::BUILD, &token()).await,
            Err(PipelineError::Busy)
        ));
        assert!(matches!(
            fx.pipeline.clean(Phase::BUILD, &token()).await,
            Err(PipelineError::Busy)
        ));
        assert!(matches!(
            fx.pipeline.connect(Phase::BUILD, 0, Arc::new(fx.stage("late"))),
            Err(PipelineError::Busy)
        ));
        assert!(matches!(fx.pipeline.disconnect(id), Err(PipelineError::Busy)));
        assert!(matches!(
            fx.pipeline.rebuild(Phase::BUILD, &reaper, &token()).await,
            Err(PipelineError::Busy)
        ));
    });

    first.unwrap();
    assert_eq!(fx.events(), vec!["exec:slow"]);
    assert!(fx.pipeline.stage_by_id(id).is_some());
    assert!(reaper.paths().is_empty());
    assert!(!fx.pipeline.busy());
}

#[tokio::test(start_paused = true)]
async fn paused_stage_blocks_the_pipeline() {
    let fx = Fixture::new();
    let gated = fx.bind(Phase::BUILD, 0, fx.stage("gated"));
    gated.state.pause();
    let releaser = gated.state.clone();

    let cancel = token();
    let (result, ()) = tokio::join!(fx.pipeline.execute(Phase::BUILD, &cancel), async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fx.journal.events().is_empty());
        releaser.unpause().unwrap();
    });

    result.unwrap();
    assert_eq!(fx.events(), vec!["exec:gated"]);
}

#[tokio::test]
async fn cancellation_stops_after_the_running_stage() {
    let fx = Fixture::new();
    let done = fx.bind(Phase::CONFIGURE, 0, fx.stage("configure"));
    fx.bind(Phase::BUILD, 0, fx.stage("make").behave(Behavior::WaitForCancel));
    fx.bind(Phase::INSTALL, 0, fx.stage("install"));
    let cancel = token();

    let (result, ()) = tokio::join!(fx.pipeline.execute(Phase::INSTALL, &cancel), async {
        while fx.journal.events().len() < 2 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
    });

    let err = result.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(fx.events(), vec!["exec:configure", "exec:make"]);
    assert!(done.state.completed());
    assert_eq!(fx.pipeline.phase(), Phase::NONE);
    assert_eq!(fx.pipeline.message(), "Ready");
    assert!(!fx.pipeline.busy());
}

#[tokio::test]
async fn cancelled_token_runs_nothing() {
    let fx = Fixture::new();
    fx.bind(Phase::BUILD, 0, fx.stage("make"));
    let cancel = token();
    cancel.cancel();

    let err = fx.pipeline.execute(Phase::BUILD, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(fx.events().is_empty());
}

#[tokio::test]
async fn disconnected_stage_is_not_run() {
    let fx = Fixture::new();
    let id = fx
        .pipeline
        .connect(Phase::BUILD, 0, Arc::new(fx.stage("gone")))
        .unwrap();
    fx.bind(Phase::BUILD, 1, fx.stage("kept"));

    assert!(fx.pipeline.stage_by_id(id).is_some());
    fx.pipeline.disconnect(id).unwrap();
    assert!(fx.pipeline.stage_by_id(id).is_none());
    assert!(matches!(
        fx.pipeline.disconnect(id),
        Err(PipelineError::UnknownBinding(_))
    ));

    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();
    assert_eq!(fx.events(), vec!["exec:kept"]);
}

#[test]
fn connect_rejects_invalid_phases() {
    let fx = Fixture::new();
    for phase in [Phase::NONE, Phase::BUILD | Phase::INSTALL, Phase::FINISHED | Phase::BUILD] {
        assert!(matches!(
            fx.pipeline.connect(phase, 0, Arc::new(fx.stage("bad"))),
            Err(PipelineError::InvalidPhase { .. })
        ));
    }
}

#[tokio::test]
async fn chained_stage_runs_once_and_completes() {
    let fx = Fixture::new();
    let mut make = fx.stage("make");
    make.absorbs = Some("make install".to_string());
    fx.bind(Phase::BUILD, 0, make);
    let install = fx.bind(Phase::INSTALL, 0, fx.stage("make install"));

    fx.pipeline.execute(Phase::INSTALL, &token()).await.unwrap();

    assert_eq!(fx.events(), vec!["exec:make"]);
    assert!(install.state.completed());
}

#[tokio::test]
async fn request_and_invalidate_phase() {
    let fx = Fixture::new();
    let configure = fx.bind(Phase::CONFIGURE, 0, fx.stage("configure"));
    let make = fx.bind(Phase::BUILD, 0, fx.stage("make"));

    assert!(fx.pipeline.request_phase(Phase::BUILD).unwrap());
    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();
    assert!(!fx.pipeline.request_phase(Phase::BUILD).unwrap());

    assert_eq!(fx.pipeline.invalidate_phase(Phase::BUILD), 1);
    assert!(configure.state.completed());
    assert!(!make.state.completed());
    assert!(fx.pipeline.request_phase(Phase::BUILD).unwrap());
    assert!(fx.pipeline.request_phase(Phase::BUILD | Phase::AFTER).is_ok());
    assert!(fx.pipeline.request_phase(Phase::NONE).is_err());
}

#[tokio::test]
async fn clean_runs_in_reverse_and_clears_completion() {
    let fx = Fixture::new();
    let configure = fx.bind(Phase::CONFIGURE, 0, fx.stage("configure"));
    let make = fx.bind(Phase::BUILD, 0, fx.stage("make"));
    let install = fx.bind(Phase::INSTALL, 0, fx.stage("install"));
    fx.pipeline.execute(Phase::INSTALL, &token()).await.unwrap();

    fx.pipeline.clean(Phase::BUILD, &token()).await.unwrap();

    assert_eq!(
        fx.events()[3..],
        ["clean:install".to_string(), "clean:make".to_string()]
    );
    assert!(configure.state.completed());
    assert!(!make.state.completed());
    assert!(!install.state.completed());
}

#[tokio::test]
async fn clean_failure_stops_cleaning() {
    let fx = Fixture::new();
    fx.bind(Phase::BUILD, 0, fx.stage("make"));
    fx.bind(Phase::INSTALL, 0, fx.stage("install").behave(Behavior::Fail));

    let err = fx.pipeline.clean(Phase::BUILD, &token()).await.unwrap_err();

    assert!(matches!(err, PipelineError::CleanFailed { ref stage, .. } if stage == "install"));
    assert_eq!(fx.events(), vec!["clean:install"]);
}

#[tokio::test]
async fn rebuild_reruns_from_phase_and_reaps() {
    let fx = Fixture::new();
    let reaper = FakeReaperAdapter::new();
    let stale = fx.dir.path().join("_build/config.cache");
    fx.bind(Phase::CONFIGURE, 0, fx.stage("configure"));
    let mut make = fx.stage("make");
    make.reap_file = Some(stale.clone());
    fx.bind(Phase::BUILD, 0, make);
    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();

    fx.pipeline.rebuild(Phase::BUILD, &reaper, &token()).await.unwrap();

    assert_eq!(fx.events(), vec!["exec:configure", "exec:make", "exec:make"]);
    // in-tree builddir is never reaped
    assert_eq!(reaper.paths(), vec![stale]);
}

#[tokio::test]
async fn rebuild_reaps_builddir_under_cache_root() {
    let cache = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    let builddir = cache.path().join("kiln/proj");
    let mut config = Configuration::new("proj", src.path());
    config.builddir = Some(builddir.clone());
    let pipeline = Pipeline::new(config).with_cache_root(Some(cache.path().to_path_buf()));
    let journal = Journal::default();
    pipeline
        .connect(Phase::CONFIGURE, 0, Arc::new(Recorder::new("configure", &journal)))
        .unwrap();
    pipeline.execute(Phase::CONFIGURE, &token()).await.unwrap();

    let reaper = FakeReaperAdapter::new();
    pipeline.rebuild(Phase::BUILD, &reaper, &token()).await.unwrap();

    assert_eq!(reaper.paths(), vec![builddir.clone()]);
    // everything was invalidated, so configure ran again
    assert_eq!(journal.events(), vec!["exec:configure", "exec:configure"]);
    assert!(builddir.is_dir());
}

#[tokio::test]
async fn rebuild_reports_reap_failure() {
    let fx = Fixture::new();
    let mut make = fx.stage("make");
    make.reap_file = Some(fx.dir.path().join("stale"));
    fx.bind(Phase::BUILD, 0, make);
    let reaper = FakeReaperAdapter::new();
    reaper.fail("denied");

    let err = fx.pipeline.rebuild(Phase::BUILD, &reaper, &token()).await.unwrap_err();

    assert!(matches!(err, PipelineError::Reap(_)));
    assert!(fx.events().is_empty());
    assert!(!fx.pipeline.busy());
}

#[tokio::test]
async fn execute_creates_the_build_directory() {
    let fx = Fixture::new();
    fx.bind(Phase::BUILD, 0, fx.stage("make"));

    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();

    assert!(fx.pipeline.builddir().is_dir());
    assert_eq!(
        fx.pipeline.builddir_path(["a", "b"]),
        fx.dir.path().join("_build/a/b")
    );
    assert_eq!(fx.pipeline.srcdir_path(["x"]), fx.dir.path().join("x"));
}

#[tokio::test]
async fn log_observers_receive_stage_output_in_order() {
    let fx = Fixture::new();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let id = fx
        .pipeline
        .add_log_observer(move |stream, line| sink.lock().unwrap().push((stream, line.to_string())));
    let output: Vec<(LogStream, String)> = (0..45)
        .map(|i| (LogStream::Stdout, format!("line {}", i)))
        .collect();
    fx.bind(Phase::BUILD, 0, fx.stage("make").behave(Behavior::Log(output.clone())));

    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();

    let seen = lines.lock().unwrap().clone();
    assert_eq!(seen, output);
    assert!(fx.pipeline.remove_log_observer(id));
}

#[tokio::test]
async fn stdout_path_redirects_stage_output() {
    let fx = Fixture::new();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    fx.pipeline
        .add_log_observer(move |stream, line| sink.lock().unwrap().push((stream, line.to_string())));
    let target = fx.dir.path().join("captured.txt");
    let stage = fx.stage("capture").behave(Behavior::Log(vec![
        (LogStream::Stdout, "out".to_string()),
        (LogStream::Stderr, "err".to_string()),
    ]));
    stage.state.set_stdout_path(Some(target.clone()));
    fx.bind(Phase::BUILD, 0, stage);

    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();

    assert_eq!(std::fs::read_to_string(&target).unwrap(), "out\n");
    assert_eq!(
        *lines.lock().unwrap(),
        vec![(LogStream::Stderr, "err".to_string())]
    );
}

#[tokio::test]
async fn diagnostics_are_extracted_from_stage_output() {
    let fx = Fixture::new();
    let format = fx.pipeline.add_error_format(GCC).unwrap();
    let found = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&found);
    fx.pipeline
        .add_diagnostic_observer(move |d| sink.lock().unwrap().push(d.clone()));
    fx.bind(
        Phase::BUILD,
        0,
        fx.stage("make").behave(Behavior::Log(vec![
            (LogStream::Stdout, "main.c:1:1: warning: ignored on stdout".to_string()),
            (LogStream::Stderr, "main.c:3:7: error: boom".to_string()),
        ])),
    );

    fx.pipeline.execute(Phase::BUILD, &token()).await.unwrap();

    let found = found.lock().unwrap().clone();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].file, fx.dir.path().join("_build/main.c"));
    assert_eq!((found[0].line, found[0].column), (2, 6));
    assert!(found[0].severity.is_error());
    assert!(fx.pipeline.remove_error_format(format));
    assert!(fx.pipeline.add_error_format("(unclosed").is_err());
}

#[test]
fn create_launcher_uses_configuration() {
    let dir = TempDir::new().unwrap();
    let mut config = Configuration::new("proj", dir.path());
    config.environment.insert("CFLAGS".into(), "-O2".into());
    config.environment.insert("V".into(), "1".into());
    let pipeline = Pipeline::new(config);

    let spec = pipeline.create_launcher();

    assert!(spec.clear_env);
    assert_eq!(spec.output, OutputMode::Piped);
    assert_eq!(spec.cwd.as_deref(), Some(pipeline.builddir()));
    assert_eq!(spec.env.get("CFLAGS").map(String::as_str), Some("-O2"));
    assert_eq!(spec.env.get("V").map(String::as_str), Some("0"));
}

#[test]
fn can_export_and_plan_report_bindings() {
    let fx = Fixture::new();
    assert!(!fx.pipeline.can_export());
    fx.bind(Phase::BUILD, 0, fx.stage("make"));
    fx.bind(Phase::EXPORT.with_whence(Whence::After), 0, fx.stage("bundle"));
    assert!(fx.pipeline.can_export());

    let plan = fx.pipeline.plan(Phase::BUILD);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].name, "make");
    assert_eq!(fx.pipeline.plan(Phase::FINAL).len(), 2);
    assert_eq!(fx.pipeline.phase(), Phase::NONE);
    assert_eq!(fx.pipeline.message(), "Ready");
}
