/// One execution slot per session: spawn, stream, time out, cancel.
///
/// An executor owns a small state machine (idle, starting, running,
/// terminal) and runs four concerns for every execution: a stdout drain, a
/// stderr drain, a wall-clock timeout, and a heartbeat that fires only
/// after a full interval of stream silence. The drains never serialize each
/// other, output events carry gapless sequence numbers across both streams,
/// and the terminal event is always the last event on the channel. After a
/// terminal event the executor can be reused for a new execution.
use crate::classify::{ClassificationTag, ErrorReport, OutputClassifier};
use crate::config::ServerConfig;
use crate::process::{self, OutputLines, ProcessHandle, SpawnError, StreamSource};
use nix::sys::signal::Signal;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for stream readers to hit EOF after group teardown.
/// Only a process that escaped the group can hold a pipe open past this.
const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    TimedOut,
    Cancelled,
    ProcessError,
}

impl ExecutionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::TimedOut => "timed_out",
            ExecutionOutcome::Cancelled => "cancelled",
            ExecutionOutcome::ProcessError => "process_error",
        }
    }

    /// Cancellation is a deliberate stop, not a failure.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExecutionOutcome::TimedOut | ExecutionOutcome::ProcessError
        )
    }

    pub fn from_status(status: &str) -> Option<Self> {
        match status {
            "completed" => Some(ExecutionOutcome::Completed),
            "timed_out" => Some(ExecutionOutcome::TimedOut),
            "cancelled" => Some(ExecutionOutcome::Cancelled),
            "process_error" => Some(ExecutionOutcome::ProcessError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record of one execution.
#[derive(Debug, Clone)]
pub struct TerminalInfo {
    pub outcome: ExecutionOutcome,
    pub exit_code: Option<i32>,
    pub pid: u32,
    pub pgid: i32,
    /// The first classified error seen on either stream, if any.
    pub first_error: Option<ErrorReport>,
}

/// Events emitted over the per-execution channel, terminal strictly last.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    Output {
        stream: StreamSource,
        text: String,
        seq: u64,
        truncated: bool,
        tag: ClassificationTag,
    },
    /// Emitted once, for the first error-classified chunk only.
    ClassifiedError(ErrorReport),
    Heartbeat,
    Terminal(TerminalInfo),
}

/// Errors from [`SessionExecutor::start`].
#[derive(Debug)]
pub enum StartError {
    /// The session already has an execution in flight.
    AlreadyRunning,
    Spawn { source: SpawnError },
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::AlreadyRunning => write!(f, "a process is already running"),
            StartError::Spawn { source } => write!(f, "failed to start process: {source}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::AlreadyRunning => None,
            StartError::Spawn { source } => Some(source),
        }
    }
}

/// Callback fired exactly once per execution when it reaches a terminal
/// state, after the state is recorded and before the terminal event is sent.
pub trait TerminalObserver: Send + Sync {
    fn on_terminal(&self, session_id: &str, outcome: ExecutionOutcome);
}

/// Observer that ignores every notification.
pub struct NoopObserver;

impl TerminalObserver for NoopObserver {
    fn on_terminal(&self, _session_id: &str, _outcome: ExecutionOutcome) {}
}

/// Tuning knobs for an executor, usually derived from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub terminate_grace: Duration,
    pub max_line_bytes: usize,
}

impl ExecutorSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            terminate_grace: Duration::from_secs(config.terminate_grace_secs),
            max_line_bytes: config.max_line_bytes,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// A request to run one command.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    /// Wall-clock limit; falls back to the configured default.
    pub timeout: Option<Duration>,
}

/// Handle returned once an execution is off the ground.
pub struct Started {
    pub pid: u32,
    pub pgid: i32,
    pub events: mpsc::Receiver<ExecEvent>,
}

enum ExecState {
    Idle,
    Starting {
        cancel: watch::Sender<bool>,
    },
    Running {
        cancel: watch::Sender<bool>,
        pid: u32,
        pgid: i32,
    },
    Terminal(ExecutionOutcome),
}

enum StopCause {
    Exited(i32),
    TimedOut,
    Cancelled,
}

pub struct SessionExecutor {
    session_id: String,
    settings: ExecutorSettings,
    classifier: Arc<OutputClassifier>,
    observer: Arc<dyn TerminalObserver>,
    state: StdMutex<ExecState>,
}

impl SessionExecutor {
    pub fn new(
        session_id: impl Into<String>,
        settings: ExecutorSettings,
        classifier: Arc<OutputClassifier>,
        observer: Arc<dyn TerminalObserver>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            settings,
            classifier,
            observer,
            state: StdMutex::new(ExecState::Idle),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True while an execution is starting or running.
    pub fn is_active(&self) -> bool {
        matches!(
            &*self.state.lock().unwrap(),
            ExecState::Starting { .. } | ExecState::Running { .. }
        )
    }

    /// Begin an execution. Fails if one is already in flight.
    pub async fn start(self: &Arc<Self>, req: ExecRequest) -> Result<Started, StartError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut state = self.state.lock().unwrap();
            match &*state {
                ExecState::Starting { .. } | ExecState::Running { .. } => {
                    return Err(StartError::AlreadyRunning);
                }
                ExecState::Idle | ExecState::Terminal(_) => {}
            }
            *state = ExecState::Starting { cancel: cancel_tx };
        }

        let mut handle = match process::spawn(&req.command, self.settings.max_line_bytes) {
            Ok(handle) => handle,
            Err(source) => {
                *self.state.lock().unwrap() = ExecState::Terminal(ExecutionOutcome::ProcessError);
                self.observer
                    .on_terminal(&self.session_id, ExecutionOutcome::ProcessError);
                return Err(StartError::Spawn { source });
            }
        };
        let pid = handle.pid();
        let pgid = handle.pgid();
        let stdout = handle.take_stdout();
        let stderr = handle.take_stderr();

        let timeout = req.timeout.unwrap_or(self.settings.default_timeout);
        let deadline = Instant::now() + timeout;
        tracing::info!(
            session_id = %self.session_id,
            pid,
            pgid,
            timeout_secs = timeout.as_secs(),
            command = %req.command,
            "execution started"
        );

        {
            let mut state = self.state.lock().unwrap();
            // a cancel may already have landed while we were spawning; the
            // supervisor picks it up from the watch on its first poll
            let cancel = match std::mem::replace(&mut *state, ExecState::Idle) {
                ExecState::Starting { cancel } => cancel,
                _ => unreachable!("state changed out from under start"),
            };
            *state = ExecState::Running { cancel, pid, pgid };
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let seq = Arc::new(Mutex::new(0u64));
        let first_error: Arc<StdMutex<Option<ErrorReport>>> = Arc::new(StdMutex::new(None));
        let last_activity = Arc::new(StdMutex::new(Instant::now()));

        let mut drains = Vec::new();
        if let Some(lines) = stdout {
            drains.push(tokio::spawn(drain_stream(
                lines,
                StreamSource::Stdout,
                tx.clone(),
                Arc::clone(&seq),
                Arc::clone(&self.classifier),
                Arc::clone(&first_error),
                Arc::clone(&last_activity),
            )));
        }
        if let Some(lines) = stderr {
            drains.push(tokio::spawn(drain_stream(
                lines,
                StreamSource::Stderr,
                tx.clone(),
                Arc::clone(&seq),
                Arc::clone(&self.classifier),
                Arc::clone(&first_error),
                Arc::clone(&last_activity),
            )));
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.supervise(
                handle,
                cancel_rx,
                tx,
                drains,
                first_error,
                last_activity,
                deadline,
            )
            .await;
        });

        Ok(Started {
            pid,
            pgid,
            events: rx,
        })
    }

    /// Request cancellation of the in-flight execution, if any. Idempotent.
    pub fn cancel(&self) -> bool {
        let state = self.state.lock().unwrap();
        match &*state {
            ExecState::Starting { cancel } | ExecState::Running { cancel, .. } => {
                let _ = cancel.send(true);
                true
            }
            ExecState::Idle | ExecState::Terminal(_) => false,
        }
    }

    /// SIGSTOP the running group. False when nothing is running.
    pub fn pause(&self) -> bool {
        match &*self.state.lock().unwrap() {
            ExecState::Running { pgid, .. } => process::signal_group(*pgid, Signal::SIGSTOP),
            _ => false,
        }
    }

    /// SIGCONT the running group. False when nothing is running.
    pub fn resume(&self) -> bool {
        match &*self.state.lock().unwrap() {
            ExecState::Running { pgid, .. } => process::signal_group(*pgid, Signal::SIGCONT),
            _ => false,
        }
    }

    async fn supervise(
        self: Arc<Self>,
        mut handle: ProcessHandle,
        mut cancel_rx: watch::Receiver<bool>,
        tx: mpsc::Sender<ExecEvent>,
        drains: Vec<tokio::task::JoinHandle<()>>,
        first_error: Arc<StdMutex<Option<ErrorReport>>>,
        last_activity: Arc<StdMutex<Instant>>,
        deadline: Instant,
    ) {
        let pid = handle.pid();
        let pgid = handle.pgid();

        let heartbeat = tokio::spawn(heartbeat_loop(
            tx.clone(),
            self.settings.heartbeat_interval,
            last_activity,
        ));

        let cause = tokio::select! {
            res = tokio::time::timeout_at(deadline, handle.wait()) => match res {
                Ok(code) => StopCause::Exited(code),
                Err(_) => StopCause::TimedOut,
            },
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => StopCause::Cancelled,
        };

        // teardown runs on every path so orphaned descendants get reaped
        handle.terminate(self.settings.terminate_grace).await;
        let exit_code = handle.wait().await;

        // every other producer must be done before the terminal event goes
        // out: join the drains (group death closes the pipes) and stop the
        // heartbeat
        for mut task in drains {
            if tokio::time::timeout(STREAM_CLOSE_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                tracing::warn!(pid, "stream reader still open after teardown, aborting");
                task.abort();
                let _ = task.await;
            }
        }
        heartbeat.abort();
        let _ = heartbeat.await;

        let first = first_error.lock().unwrap().clone();
        let outcome = match cause {
            StopCause::Cancelled => ExecutionOutcome::Cancelled,
            StopCause::TimedOut => ExecutionOutcome::TimedOut,
            StopCause::Exited(code) => {
                if self
                    .classifier
                    .classify_exit(code, first.as_ref().map(|r| r.tag))
                {
                    ExecutionOutcome::Completed
                } else {
                    ExecutionOutcome::ProcessError
                }
            }
        };
        tracing::info!(
            session_id = %self.session_id,
            pid,
            exit_code,
            outcome = %outcome,
            "execution finished"
        );

        *self.state.lock().unwrap() = ExecState::Terminal(outcome);
        self.observer.on_terminal(&self.session_id, outcome);
        let _ = tx
            .send(ExecEvent::Terminal(TerminalInfo {
                outcome,
                exit_code: Some(exit_code),
                pid,
                pgid,
                first_error: first,
            }))
            .await;
    }
}

async fn drain_stream<R: AsyncRead + Unpin>(
    mut lines: OutputLines<R>,
    stream: StreamSource,
    tx: mpsc::Sender<ExecEvent>,
    seq: Arc<Mutex<u64>>,
    classifier: Arc<OutputClassifier>,
    first_error: Arc<StdMutex<Option<ErrorReport>>>,
    last_activity: Arc<StdMutex<Instant>>,
) {
    while let Some(chunk) = lines.next_chunk().await {
        *last_activity.lock().unwrap() = Instant::now();
        let tag = classifier.classify(&chunk.text);
        let won_first = tag.is_error() && {
            let mut slot = first_error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(classifier.report(tag, &chunk.text));
                true
            } else {
                false
            }
        };

        {
            // lock held across the send so sequence numbers arrive in order
            let mut next = seq.lock().await;
            let event = ExecEvent::Output {
                stream,
                text: chunk.text,
                seq: *next,
                truncated: chunk.truncated,
                tag,
            };
            *next += 1;
            if tx.send(event).await.is_err() {
                // receiver gone; keep reading so the child never blocks on a
                // full pipe
                continue;
            }
        }

        if won_first {
            let report = first_error.lock().unwrap().clone();
            if let Some(report) = report {
                let _ = tx.send(ExecEvent::ClassifiedError(report)).await;
            }
        }
    }
}

/// Emit a heartbeat once the streams have been silent for a full interval.
/// Output pushes the deadline back; a sent heartbeat schedules the next one,
/// so sustained silence beats once per interval.
async fn heartbeat_loop(
    tx: mpsc::Sender<ExecEvent>,
    interval: Duration,
    last_activity: Arc<StdMutex<Instant>>,
) {
    let mut floor = Instant::now();
    loop {
        let deadline = {
            let last = *last_activity.lock().unwrap();
            last.max(floor) + interval
        };
        tokio::time::sleep_until(deadline).await;
        // output may have arrived while we slept
        if last_activity.lock().unwrap().elapsed() < interval {
            continue;
        }
        if tx.send(ExecEvent::Heartbeat).await.is_err() {
            break;
        }
        floor = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::group_alive;

    fn executor(settings: ExecutorSettings) -> Arc<SessionExecutor> {
        Arc::new(SessionExecutor::new(
            "test-session",
            settings,
            Arc::new(OutputClassifier::default()),
            Arc::new(NoopObserver),
        ))
    }

    fn fast_settings() -> ExecutorSettings {
        ExecutorSettings {
            default_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_millis(100),
            terminate_grace: Duration::from_millis(500),
            max_line_bytes: 1024 * 1024,
        }
    }

    fn request(command: &str) -> ExecRequest {
        ExecRequest {
            command: command.to_string(),
            timeout: None,
        }
    }

    async fn run_to_terminal(started: Started) -> (Vec<ExecEvent>, TerminalInfo) {
        let mut events = Vec::new();
        let mut rx = started.events;
        let info = loop {
            match rx.recv().await.expect("channel closed before terminal") {
                ExecEvent::Terminal(info) => break info,
                other => events.push(other),
            }
        };
        // terminal is the last event; the channel closes after it
        assert!(rx.recv().await.is_none());
        (events, info)
    }

    fn output_texts(events: &[ExecEvent], source: StreamSource) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Output { stream, text, .. } if *stream == source => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let exec = executor(fast_settings());
        let started = exec.start(request("echo hello")).await.unwrap();
        let (events, info) = run_to_terminal(started).await;

        assert_eq!(output_texts(&events, StreamSource::Stdout), "hello\n");
        assert_eq!(info.outcome, ExecutionOutcome::Completed);
        assert_eq!(info.exit_code, Some(0));
        assert!(info.first_error.is_none());
        assert!(!exec.is_active());
    }

    #[tokio::test]
    async fn test_seq_is_gapless_across_streams() {
        let exec = executor(fast_settings());
        let started = exec
            .start(request(
                "for i in 1 2 3 4 5; do echo out$i; echo err$i >&2; done",
            ))
            .await
            .unwrap();
        let (events, info) = run_to_terminal(started).await;

        let mut seqs: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Output { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs.len(), 10);
        // already in arrival order; must be 0..n with no gaps
        let sorted = seqs.clone();
        seqs.sort_unstable();
        assert_eq!(seqs, sorted);
        assert_eq!(seqs, (0..10).collect::<Vec<u64>>());
        assert_eq!(info.outcome, ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_timeout_kills_group() {
        let exec = executor(fast_settings());
        let started = exec
            .start(ExecRequest {
                command: "sleep 30".to_string(),
                timeout: Some(Duration::from_millis(300)),
            })
            .await
            .unwrap();
        let pgid = started.pgid;
        let start = std::time::Instant::now();
        let (_, info) = run_to_terminal(started).await;

        assert_eq!(info.outcome, ExecutionOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!group_alive(pgid));
    }

    #[tokio::test]
    async fn test_cancel_stops_execution() {
        let exec = executor(fast_settings());
        let started = exec.start(request("sleep 30")).await.unwrap();
        assert!(exec.cancel());
        let (_, info) = run_to_terminal(started).await;

        assert_eq!(info.outcome, ExecutionOutcome::Cancelled);
        assert!(!info.outcome.is_failure());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let exec = executor(fast_settings());
        let started = exec.start(request("sleep 30")).await.unwrap();
        assert!(exec.cancel());
        assert!(exec.cancel() || !exec.is_active());
        let (_, info) = run_to_terminal(started).await;
        assert_eq!(info.outcome, ExecutionOutcome::Cancelled);

        // nothing in flight any more
        assert!(!exec.cancel());
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let exec = executor(fast_settings());
        let started = exec.start(request("sleep 30")).await.unwrap();

        match exec.start(request("echo nope")).await {
            Err(StartError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {other:?}", other = other.err()),
        }

        exec.cancel();
        run_to_terminal(started).await;
    }

    #[tokio::test]
    async fn test_reusable_after_terminal() {
        let exec = executor(fast_settings());
        let first = exec.start(request("echo one")).await.unwrap();
        let (_, info) = run_to_terminal(first).await;
        assert_eq!(info.outcome, ExecutionOutcome::Completed);

        let second = exec.start(request("echo two")).await.unwrap();
        let (events, info) = run_to_terminal(second).await;
        assert_eq!(output_texts(&events, StreamSource::Stdout), "two\n");
        assert_eq!(info.outcome, ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_classified_error_overrides_zero_exit() {
        let exec = executor(fast_settings());
        let started = exec
            .start(request("echo 'Error: rate limit exceeded'; exit 0"))
            .await
            .unwrap();
        let (events, info) = run_to_terminal(started).await;

        assert_eq!(info.outcome, ExecutionOutcome::ProcessError);
        let report = info.first_error.expect("first error recorded");
        assert_eq!(report.tag, ClassificationTag::RateLimitExceeded);
        assert_eq!(report.retry_after, Some(60));

        let classified: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ExecEvent::ClassifiedError(_)))
            .collect();
        assert_eq!(classified.len(), 1);
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let exec = executor(fast_settings());
        let started = exec
            .start(request(
                "echo 'response exceeded the token limit'; echo 'rate limit hit' >&2; exit 1",
            ))
            .await
            .unwrap();
        let (events, info) = run_to_terminal(started).await;

        assert_eq!(info.outcome, ExecutionOutcome::ProcessError);
        assert_eq!(
            info.first_error.unwrap().tag,
            ClassificationTag::TokenLimitExceeded
        );
        let classified: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::ClassifiedError(report) => Some(report.tag),
                _ => None,
            })
            .collect();
        assert_eq!(classified, vec![ClassificationTag::TokenLimitExceeded]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_process_error() {
        let exec = executor(fast_settings());
        let started = exec.start(request("exit 3")).await.unwrap();
        let (_, info) = run_to_terminal(started).await;
        assert_eq!(info.outcome, ExecutionOutcome::ProcessError);
        assert_eq!(info.exit_code, Some(3));
        assert!(info.first_error.is_none());
    }

    #[tokio::test]
    async fn test_heartbeats_flow_while_running() {
        let exec = executor(fast_settings());
        let started = exec.start(request("sleep 1")).await.unwrap();
        let (events, info) = run_to_terminal(started).await;

        let beats = events
            .iter()
            .filter(|e| matches!(e, ExecEvent::Heartbeat))
            .count();
        assert!(beats >= 3, "expected heartbeats at 100ms, saw {beats}");
        assert_eq!(info.outcome, ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_steady_output_suppresses_heartbeats() {
        let exec = executor(ExecutorSettings {
            heartbeat_interval: Duration::from_millis(300),
            ..fast_settings()
        });
        // a line every 80ms keeps the silence window well under the interval
        let started = exec
            .start(request(
                "for i in 1 2 3 4 5 6 7 8 9 10; do echo tick$i; sleep 0.08; done",
            ))
            .await
            .unwrap();
        let (events, info) = run_to_terminal(started).await;

        let beats = events
            .iter()
            .filter(|e| matches!(e, ExecEvent::Heartbeat))
            .count();
        assert_eq!(beats, 0, "steady output must keep the heartbeat quiet");
        assert_eq!(
            output_texts(&events, StreamSource::Stdout).lines().count(),
            10
        );
        assert_eq!(info.outcome, ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_heartbeats_do_not_extend_timeout() {
        let exec = executor(fast_settings());
        let started = exec
            .start(ExecRequest {
                command: "sleep 30".to_string(),
                timeout: Some(Duration::from_millis(500)),
            })
            .await
            .unwrap();
        let start = std::time::Instant::now();
        let (_, info) = run_to_terminal(started).await;

        assert_eq!(info.outcome, ExecutionOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stderr_burst_does_not_block_stdout() {
        let exec = executor(ExecutorSettings {
            max_line_bytes: 64 * 1024,
            ..fast_settings()
        });
        // 2 MB on stderr as one unterminated line, then a line on stdout
        let started = exec
            .start(request(
                "head -c 2000000 /dev/zero | tr '\\0' x >&2; echo done",
            ))
            .await
            .unwrap();
        let (events, info) = run_to_terminal(started).await;

        let stderr_bytes: usize = events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Output {
                    stream: StreamSource::Stderr,
                    text,
                    ..
                } => Some(text.len()),
                _ => None,
            })
            .sum();
        assert_eq!(stderr_bytes, 2_000_000);
        assert_eq!(output_texts(&events, StreamSource::Stdout), "done\n");
        assert!(events.iter().any(|e| matches!(
            e,
            ExecEvent::Output {
                truncated: true,
                ..
            }
        )));
        assert_eq!(info.outcome, ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_observer_fires_once_per_execution() {
        struct Recording(StdMutex<Vec<(String, ExecutionOutcome)>>);
        impl TerminalObserver for Recording {
            fn on_terminal(&self, session_id: &str, outcome: ExecutionOutcome) {
                self.0
                    .lock()
                    .unwrap()
                    .push((session_id.to_string(), outcome));
            }
        }

        let observer = Arc::new(Recording(StdMutex::new(Vec::new())));
        let exec = Arc::new(SessionExecutor::new(
            "obs-session",
            fast_settings(),
            Arc::new(OutputClassifier::default()),
            Arc::clone(&observer) as Arc<dyn TerminalObserver>,
        ));

        let started = exec.start(request("echo done")).await.unwrap();
        run_to_terminal(started).await;

        let seen = observer.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![("obs-session".to_string(), ExecutionOutcome::Completed)]
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume_running_group() {
        let exec = executor(fast_settings());
        let started = exec.start(request("sleep 2")).await.unwrap();

        assert!(exec.pause());
        assert!(exec.resume());

        exec.cancel();
        let (_, info) = run_to_terminal(started).await;
        assert_eq!(info.outcome, ExecutionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_pause_without_execution_fails() {
        let exec = executor(fast_settings());
        assert!(!exec.pause());
        assert!(!exec.resume());
    }
}
