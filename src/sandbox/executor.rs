//! Sandbox executor state machine.
//!
//! ```text
//!   Provisioned ──► Running ──┬──► Completed ──┐
//!        │                    ├──► TimedOut  ──┼──► Disposed
//!        │                    └──► Faulted   ──┘
//!        └───────────────────────────────────────► Disposed
//! ```
//!
//! Every run gets a fresh working directory and a fresh isolate. Teardown
//! (dispose the isolate, delete the directory) runs on every exit path; the
//! `TempDir` guard and `kill_on_drop` cover unwinding as well.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::isolate::{Isolate, IsolateChannel, IsolateProvider};
use super::limits::SandboxLimits;
use super::protocol::{HostMessage, IsolateMessage, MAX_MESSAGE_BYTES};
use super::scoped_fs::ScopedFs;
use crate::error::SandboxError;
use crate::metrics::MetricsCollector;

/// Prefix of every sandbox working directory.
const WORKDIR_PREFIX: &str = "debt-forge-sandbox-";

/// Lifecycle states of a sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Provisioned,
    Running,
    Completed,
    TimedOut,
    Faulted,
    Disposed,
}

impl SandboxState {
    /// Returns whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Provisioned, Running) => true,
            (Running, Completed | TimedOut | Faulted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SandboxState::Provisioned => "provisioned",
            SandboxState::Running => "running",
            SandboxState::Completed => "completed",
            SandboxState::TimedOut => "timed_out",
            SandboxState::Faulted => "faulted",
            SandboxState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// What a run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The tests ran and reported exactly once.
    Completed { passed: bool, details: String },
    /// The tests raised an error that was not an assertion failure.
    RuntimeError { message: String },
    /// The wall-clock budget ran out before a report arrived.
    TimedOut { timeout_ms: u64 },
    /// The isolate could not be provisioned, crashed or broke protocol.
    Faulted { reason: String },
}

impl RunOutcome {
    /// Label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed { passed: true, .. } => "passed",
            RunOutcome::Completed { passed: false, .. } => "failed",
            RunOutcome::RuntimeError { .. } => "runtime_error",
            RunOutcome::TimedOut { .. } => "timed_out",
            RunOutcome::Faulted { .. } => "faulted",
        }
    }

    fn terminal_state(&self) -> SandboxState {
        match self {
            RunOutcome::Completed { .. } | RunOutcome::RuntimeError { .. } => {
                SandboxState::Completed
            }
            RunOutcome::TimedOut { .. } => SandboxState::TimedOut,
            RunOutcome::Faulted { .. } => SandboxState::Faulted,
        }
    }
}

/// Record of one sandbox run. The working directory no longer exists
/// by the time this is returned.
#[derive(Debug, Clone)]
pub struct SandboxReport {
    pub outcome: RunOutcome,
    pub workdir: Option<PathBuf>,
    pub states: Vec<SandboxState>,
    pub duration_ms: u64,
}

/// Code handed to an isolate.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxProgram {
    pub source_code: String,
    pub test_code: String,
}

impl SandboxProgram {
    pub fn new(source_code: impl Into<String>, test_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            test_code: test_code.into(),
        }
    }
}

/// Runs programs in freshly provisioned isolates.
#[derive(Clone)]
pub struct SandboxExecutor {
    provider: Arc<dyn IsolateProvider>,
    limits: SandboxLimits,
    workdir_parent: Option<PathBuf>,
    metrics: MetricsCollector,
}

impl SandboxExecutor {
    pub fn new(provider: Arc<dyn IsolateProvider>, limits: SandboxLimits) -> Self {
        Self {
            provider,
            limits,
            workdir_parent: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates working directories under `parent` instead of the system temp dir.
    pub fn with_workdir_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.workdir_parent = Some(parent.into());
        self
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Provisions, runs, collects and tears down one isolate.
    ///
    /// Never returns an error: every failure is folded into the outcome.
    pub async fn execute(&self, program: &SandboxProgram) -> SandboxReport {
        let started = Instant::now();
        let mut tracker = StateTracker::default();

        let workdir = match self.create_workdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracker.advance(SandboxState::Disposed);
                return self.finish(
                    RunOutcome::Faulted {
                        reason: format!("failed to create working directory: {}", e),
                    },
                    None,
                    tracker,
                    started,
                );
            }
        };
        let workdir_path = workdir.path().to_path_buf();

        let mut isolate = match self.provider.provision(&workdir_path, &self.limits).await {
            Ok(isolate) => isolate,
            Err(e) => {
                close_workdir(workdir);
                tracker.advance(SandboxState::Disposed);
                return self.finish(
                    RunOutcome::Faulted {
                        reason: e.to_string(),
                    },
                    Some(workdir_path),
                    tracker,
                    started,
                );
            }
        };
        tracker.advance(SandboxState::Provisioned);

        tracker.advance(SandboxState::Running);
        let outcome = match ScopedFs::new(&workdir_path, self.limits.max_file_bytes).await {
            Ok(fs) => {
                let run = drive(isolate.as_mut(), &fs, program);
                match tokio::time::timeout(self.limits.timeout(), run).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => RunOutcome::Faulted {
                        reason: with_diagnostics(e.to_string(), isolate.diagnostics()),
                    },
                    Err(_) => RunOutcome::TimedOut {
                        timeout_ms: self.limits.timeout_ms,
                    },
                }
            }
            Err(e) => RunOutcome::Faulted {
                reason: format!("failed to open working directory: {}", e),
            },
        };
        tracker.advance(outcome.terminal_state());

        if let Err(e) = isolate.dispose().await {
            warn!(provider = self.provider.name(), error = %e, "Failed to dispose isolate");
        }
        close_workdir(workdir);
        tracker.advance(SandboxState::Disposed);

        self.finish(outcome, Some(workdir_path), tracker, started)
    }

    fn create_workdir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKDIR_PREFIX);
        match &self.workdir_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
    }

    fn finish(
        &self,
        outcome: RunOutcome,
        workdir: Option<PathBuf>,
        tracker: StateTracker,
        started: Instant,
    ) -> SandboxReport {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_sandbox_run(outcome.label());
        info!(
            provider = self.provider.name(),
            outcome = outcome.label(),
            duration_ms,
            "Sandbox run finished"
        );

        SandboxReport {
            outcome,
            workdir,
            states: tracker.states,
            duration_ms,
        }
    }
}

#[derive(Default)]
struct StateTracker {
    states: Vec<SandboxState>,
}

impl StateTracker {
    fn advance(&mut self, next: SandboxState) {
        if let Some(current) = self.states.last() {
            debug_assert!(
                current.can_transition_to(next),
                "illegal sandbox transition {} -> {}",
                current,
                next
            );
        }
        self.states.push(next);
    }
}

fn close_workdir(workdir: tempfile::TempDir) {
    let path = workdir.path().to_path_buf();
    if let Err(e) = workdir.close() {
        warn!(workdir = %path.display(), error = %e, "Failed to remove sandbox working directory");
    }
}

fn with_diagnostics(reason: String, diagnostics: Option<String>) -> String {
    match diagnostics {
        Some(stderr) => format!("{} (stderr: {})", reason, stderr),
        None => reason,
    }
}

/// Starts the isolate, sends the program and serves capability calls until
/// the isolate sends its single terminal message.
async fn drive(
    isolate: &mut dyn Isolate,
    fs: &ScopedFs,
    program: &SandboxProgram,
) -> Result<RunOutcome, SandboxError> {
    let IsolateChannel {
        mut reader,
        mut writer,
    } = isolate.start().await?;

    let hello = HostMessage::Program {
        source_code: program.source_code.clone(),
        test_code: program.test_code.clone(),
    };
    writer.write_all(hello.to_line()?.as_bytes()).await?;
    writer.flush().await?;

    loop {
        let mut line = String::new();
        let read = (&mut reader)
            .take(MAX_MESSAGE_BYTES)
            .read_line(&mut line)
            .await?;

        if read == 0 {
            return Err(SandboxError::IsolateExited(
                "stream closed without a report".to_string(),
            ));
        }
        if !line.ends_with('\n') && read as u64 >= MAX_MESSAGE_BYTES {
            return Err(SandboxError::Protocol(format!(
                "message exceeds {} bytes",
                MAX_MESSAGE_BYTES
            )));
        }
        if line.trim().is_empty() {
            continue;
        }

        let message = match IsolateMessage::parse(&line) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Ignoring non-protocol output from isolate");
                continue;
            }
        };

        let reply = match message {
            IsolateMessage::Report { passed, details } => {
                return Ok(RunOutcome::Completed { passed, details });
            }
            IsolateMessage::Error { message } => {
                return Ok(RunOutcome::RuntimeError { message });
            }
            IsolateMessage::Write { id, path, content } => {
                match fs.write(&path, &content).await {
                    Ok(bytes) => HostMessage::success(id, bytes.to_string()),
                    Err(e) => HostMessage::failure(id, e.to_string()),
                }
            }
            IsolateMessage::Read { id, path } => match fs.read(&path).await {
                Ok(content) => HostMessage::success(id, content),
                Err(e) => HostMessage::failure(id, e.to_string()),
            },
        };

        writer.write_all(reply.to_line()?.as_bytes()).await?;
        writer.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Isolate whose "guest" is a scripted task on the other end of a duplex pipe.
    #[derive(Clone, Copy)]
    enum Script {
        WriteReadReport,
        Escape,
        Throw,
        Hang,
        CloseEarly,
    }

    struct ScriptedProvider {
        script: Script,
        disposed: Arc<AtomicUsize>,
    }

    struct ScriptedIsolate {
        script: Script,
        disposed: Arc<AtomicUsize>,
        guest: Option<tokio::task::JoinHandle<()>>,
    }

    #[async_trait]
    impl IsolateProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn provision(
            &self,
            _workdir: &Path,
            _limits: &SandboxLimits,
        ) -> Result<Box<dyn Isolate>, SandboxError> {
            Ok(Box::new(ScriptedIsolate {
                script: self.script,
                disposed: Arc::clone(&self.disposed),
                guest: None,
            }))
        }
    }

    #[async_trait]
    impl Isolate for ScriptedIsolate {
        async fn start(&mut self) -> Result<IsolateChannel, SandboxError> {
            let (host_side, guest_side) = tokio::io::duplex(64 * 1024);
            let (host_read, host_write) = tokio::io::split(host_side);
            let (guest_read, mut guest_write) = tokio::io::split(guest_side);
            let script = self.script;

            self.guest = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(guest_read).lines();
                let _program = lines.next_line().await;
                let send = |v: serde_json::Value| format!("{}\n", v);
                match script {
                    Script::WriteReadReport => {
                        let _ = guest_write
                            .write_all(send(serde_json::json!({"type":"write","id":1,"path":"out/r.txt","content":"42"})).as_bytes())
                            .await;
                        let _ = lines.next_line().await;
                        let _ = guest_write
                            .write_all(send(serde_json::json!({"type":"read","id":2,"path":"out/r.txt"})).as_bytes())
                            .await;
                        let reply = lines.next_line().await.ok().flatten().unwrap_or_default();
                        let value: serde_json::Value =
                            serde_json::from_str(&reply).unwrap_or_default();
                        let passed = value["value"] == "42";
                        let _ = guest_write
                            .write_all(send(serde_json::json!({"type":"report","passed":passed,"details":"round trip"})).as_bytes())
                            .await;
                    }
                    Script::Escape => {
                        let _ = guest_write
                            .write_all(send(serde_json::json!({"type":"write","id":1,"path":"../../escape.txt","content":"x"})).as_bytes())
                            .await;
                        let reply = lines.next_line().await.ok().flatten().unwrap_or_default();
                        let value: serde_json::Value =
                            serde_json::from_str(&reply).unwrap_or_default();
                        let _ = guest_write
                            .write_all(send(serde_json::json!({"type":"report","passed":value["ok"] == false,"details":value["error"]})).as_bytes())
                            .await;
                    }
                    Script::Throw => {
                        let _ = guest_write
                            .write_all(send(serde_json::json!({"type":"error","message":"TypeError: boom"})).as_bytes())
                            .await;
                    }
                    Script::Hang => {
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                    }
                    Script::CloseEarly => {}
                }
            }));

            Ok(IsolateChannel::new(BufReader::new(host_read), host_write))
        }

        async fn dispose(mut self: Box<Self>) -> Result<(), SandboxError> {
            if let Some(guest) = self.guest.take() {
                guest.abort();
            }
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn executor(script: Script, timeout_ms: u64) -> (SandboxExecutor, Arc<AtomicUsize>) {
        let disposed = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(ScriptedProvider {
            script,
            disposed: Arc::clone(&disposed),
        });
        let limits = SandboxLimits::default().with_timeout_ms(timeout_ms);
        (SandboxExecutor::new(provider, limits), disposed)
    }

    fn program() -> SandboxProgram {
        SandboxProgram::new("function f() {}", "f();")
    }

    #[test]
    fn test_state_transitions() {
        use SandboxState::*;
        assert!(Provisioned.can_transition_to(Running));
        assert!(Running.can_transition_to(TimedOut));
        assert!(Faulted.can_transition_to(Disposed));
        assert!(Provisioned.can_transition_to(Disposed));
        assert!(!Disposed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Provisioned.can_transition_to(Completed));
    }

    #[tokio::test]
    async fn test_capabilities_round_trip_and_teardown() {
        let (executor, disposed) = executor(Script::WriteReadReport, 4500);
        let report = executor.execute(&program()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Completed {
                passed: true,
                details: "round trip".to_string()
            }
        );
        assert_eq!(
            report.states,
            vec![
                SandboxState::Provisioned,
                SandboxState::Running,
                SandboxState::Completed,
                SandboxState::Disposed
            ]
        );
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        let workdir = report.workdir.expect("workdir");
        assert!(workdir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(WORKDIR_PREFIX)));
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_escape_attempt_is_refused() {
        let parent = tempfile::tempdir().expect("parent");
        let (executor, _) = executor(Script::Escape, 4500);
        let executor = executor.with_workdir_parent(parent.path());
        let report = executor.execute(&program()).await;

        match report.outcome {
            RunOutcome::Completed { passed, details } => {
                assert!(passed, "escape must be answered with ok=false");
                assert!(details.contains("escapes"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!parent.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_runtime_error_outcome() {
        let (executor, disposed) = executor(Script::Throw, 4500);
        let report = executor.execute(&program()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::RuntimeError {
                message: "TypeError: boom".to_string()
            }
        );
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(!report.workdir.expect("workdir").exists());
    }

    #[tokio::test]
    async fn test_timeout_outcome_still_disposes() {
        let (executor, disposed) = executor(Script::Hang, 50);
        let report = executor.execute(&program()).await;

        assert_eq!(report.outcome, RunOutcome::TimedOut { timeout_ms: 50 });
        assert_eq!(report.states[2], SandboxState::TimedOut);
        assert_eq!(report.states.last(), Some(&SandboxState::Disposed));
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(!report.workdir.expect("workdir").exists());
    }

    #[tokio::test]
    async fn test_isolate_exit_without_report_faults() {
        let (executor, disposed) = executor(Script::CloseEarly, 4500);
        let report = executor.execute(&program()).await;

        assert!(matches!(report.outcome, RunOutcome::Faulted { .. }));
        assert_eq!(report.states[2], SandboxState::Faulted);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runs_never_share_a_workdir() {
        let (executor, _) = executor(Script::WriteReadReport, 4500);
        let first = executor.execute(&program()).await;
        let second = executor.execute(&program()).await;
        assert_ne!(first.workdir, second.workdir);
    }
}
