/// Process supervision: spawn a shell command as a new process-group leader,
/// expose stdout/stderr as independent line-chunk readers, and tear the whole
/// group down with SIGTERM-then-SIGKILL escalation.
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Errors that can occur while launching a command.
#[derive(Debug)]
pub enum SpawnError {
    /// The shell could not be created.
    Spawn { source: std::io::Error },
    /// The child exited before its pid could be observed.
    Reaped,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Spawn { source } => {
                write!(f, "failed to spawn shell: {source}")
            }
            SpawnError::Reaped => {
                write!(f, "child exited before a pid could be observed")
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Spawn { source } => Some(source),
            SpawnError::Reaped => None,
        }
    }
}

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }
}

/// One line-delimited chunk of subprocess output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Raw text, newline included when one terminated the chunk.
    pub text: String,
    /// Set when a single line exceeded the byte cap and was flushed early;
    /// the rest of the line follows in later chunks.
    pub truncated: bool,
}

/// Lazy line-chunk reader over one child stream.
///
/// Finite and not restartable: yields `None` after end-of-stream. Read
/// errors are treated as end-of-stream, not failures. Bytes are decoded
/// lossily so binary garbage never aborts a stream, and memory stays bounded
/// by the line cap.
pub struct OutputLines<R> {
    reader: R,
    carry: Vec<u8>,
    max_line_bytes: usize,
    done: bool,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            carry: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            done: false,
        }
    }

    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        loop {
            if let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.carry.drain(..=pos).collect();
                return Some(OutputChunk {
                    text: String::from_utf8_lossy(&line).into_owned(),
                    truncated: false,
                });
            }
            if self.carry.len() >= self.max_line_bytes {
                let line = std::mem::take(&mut self.carry);
                return Some(OutputChunk {
                    text: String::from_utf8_lossy(&line).into_owned(),
                    truncated: true,
                });
            }
            if self.done {
                if self.carry.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut self.carry);
                return Some(OutputChunk {
                    text: String::from_utf8_lossy(&line).into_owned(),
                    truncated: false,
                });
            }
            match self.reader.read_buf(&mut self.carry).await {
                Ok(0) => self.done = true,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "stream read error treated as end of stream");
                    self.done = true;
                }
            }
        }
    }
}

/// A spawned process group and its output streams.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    pgid: i32,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    max_line_bytes: usize,
}

/// Launch `sh -c <command>` as a new process-group leader.
///
/// stdin is closed and both output streams are piped. The child becomes its
/// own group leader (pgid == pid) so one signal reaches every descendant.
pub fn spawn(command: &str, max_line_bytes: usize) -> Result<ProcessHandle, SpawnError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // New process group for clean kill
        .spawn()
        .map_err(|source| SpawnError::Spawn { source })?;

    let pid = child.id().ok_or(SpawnError::Reaped)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tracing::info!(pid, "spawned process group");

    Ok(ProcessHandle {
        child,
        pid,
        pgid: pid as i32,
        stdout,
        stderr,
        max_line_bytes,
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Take the stdout reader; `None` if already taken.
    pub fn take_stdout(&mut self) -> Option<OutputLines<ChildStdout>> {
        let reader = self.stdout.take()?;
        Some(OutputLines::new(reader, self.max_line_bytes))
    }

    /// Take the stderr reader; `None` if already taken.
    pub fn take_stderr(&mut self) -> Option<OutputLines<ChildStderr>> {
        let reader = self.stderr.take()?;
        Some(OutputLines::new(reader, self.max_line_bytes))
    }

    /// Suspend until the process exits and return its exit code.
    ///
    /// A process reaped after a signal death yields the negative signal
    /// number. Safe to call again after exit; the status is cached.
    pub async fn wait(&mut self) -> i32 {
        match self.child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "wait on child failed");
                -1
            }
        }
    }

    /// Best-effort group teardown: SIGTERM, a grace period, then SIGKILL.
    ///
    /// Idempotent and safe on an already-exited process. Never returns an
    /// error; OS-level failures are logged and swallowed. The final SIGKILL
    /// goes to the whole group even when the leader exited within the grace
    /// period, to reap descendants that ignored SIGTERM.
    pub async fn terminate(&mut self, escalate_after: Duration) {
        signal_group(self.pgid, Signal::SIGTERM);
        if tokio::time::timeout(escalate_after, self.child.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pid = self.pid,
                pgid = self.pgid,
                "group ignored SIGTERM, escalating to SIGKILL"
            );
            signal_group(self.pgid, Signal::SIGKILL);
            let _ = self.child.wait().await;
        }
        signal_group(self.pgid, Signal::SIGKILL);
    }
}

/// Deliver a signal to an entire process group.
///
/// Returns whether the signal was delivered; a group that is already gone is
/// not an error.
pub fn signal_group(pgid: i32, sig: Signal) -> bool {
    match signal::killpg(Pid::from_raw(pgid), sig) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => {
            tracing::debug!(pgid, signal = %sig, "process group already gone");
            false
        }
        Err(e) => {
            tracing::warn!(pgid, signal = %sig, error = %e, "failed to signal process group");
            false
        }
    }
}

/// True while at least one member of the group is alive.
pub fn group_alive(pgid: i32) -> bool {
    signal::killpg(Pid::from_raw(pgid), None).is_ok()
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| status.signal().map(|s| -s).unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;

    const CAP: usize = 8 * 1024 * 1024;

    async fn collect<R: AsyncRead + Unpin>(mut lines: OutputLines<R>) -> Vec<OutputChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = lines.next_chunk().await {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_chunker_splits_lines() {
        let lines = OutputLines::new(Cursor::new(b"one\ntwo\nthree".to_vec()), CAP);
        let chunks = collect(lines).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "one\n");
        assert_eq!(chunks[1].text, "two\n");
        // final unterminated line still comes out
        assert_eq!(chunks[2].text, "three");
        assert!(chunks.iter().all(|c| !c.truncated));
    }

    #[tokio::test]
    async fn test_chunker_caps_long_lines() {
        let data = vec![b'a'; 2500];
        let lines = OutputLines::new(Cursor::new(data), 1000);
        let chunks = collect(lines).await;
        let total: usize = chunks.iter().map(|c| c.text.len()).sum();
        assert_eq!(total, 2500);
        assert!(chunks[0].truncated);
        assert!(!chunks.last().unwrap().truncated);
    }

    #[tokio::test]
    async fn test_chunker_lossy_decode() {
        let lines = OutputLines::new(Cursor::new(b"bad\xffbyte\n".to_vec()), CAP);
        let chunks = collect(lines).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn test_spawn_echo_round_trip() {
        let mut handle = spawn("echo hello", CAP).unwrap();
        let stdout = handle.take_stdout().unwrap();
        let chunks = collect(stdout).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello\n");
        assert_eq!(handle.wait().await, 0);
    }

    #[tokio::test]
    async fn test_group_leader_is_child() {
        let mut handle = spawn("true", CAP).unwrap();
        assert_eq!(handle.pgid(), handle.pid() as i32);
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let mut handle = spawn("echo out; echo err >&2", CAP).unwrap();
        let stdout = handle.take_stdout().unwrap();
        let stderr = handle.take_stderr().unwrap();
        let (out, err) = tokio::join!(collect(stdout), collect(stderr));
        assert_eq!(out[0].text, "out\n");
        assert_eq!(err[0].text, "err\n");
        assert_eq!(handle.wait().await, 0);
    }

    #[tokio::test]
    async fn test_exit_code_passthrough() {
        let mut handle = spawn("exit 42", CAP).unwrap();
        assert_eq!(handle.wait().await, 42);
    }

    #[tokio::test]
    async fn test_wait_is_fused() {
        let mut handle = spawn("exit 7", CAP).unwrap();
        assert_eq!(handle.wait().await, 7);
        assert_eq!(handle.wait().await, 7);
    }

    #[tokio::test]
    async fn test_signal_death_is_negative_sentinel() {
        let mut handle = spawn("sleep 30", CAP).unwrap();
        handle.terminate(Duration::from_millis(500)).await;
        // sh/sleep die on the initial SIGTERM
        assert_eq!(handle.wait().await, -(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut handle = spawn("sleep 30", CAP).unwrap();
        handle.terminate(Duration::from_millis(200)).await;
        handle.terminate(Duration::from_millis(200)).await;
        assert!(handle.wait().await < 0);

        // an unrelated process spawned afterwards is unaffected
        let mut other = spawn("echo fine", CAP).unwrap();
        assert_eq!(other.wait().await, 0);
    }

    #[tokio::test]
    async fn test_terminate_on_exited_process_is_noop() {
        let mut handle = spawn("true", CAP).unwrap();
        assert_eq!(handle.wait().await, 0);
        handle.terminate(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_terminate_kills_descendants() {
        let mut handle = spawn("sleep 30 & sleep 30", CAP).unwrap();
        let pgid = handle.pgid();
        // give the shell a moment to fork both sleeps
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(group_alive(pgid));

        handle.terminate(Duration::from_millis(500)).await;

        let deadline = Instant::now() + Duration::from_secs(2);
        while group_alive(pgid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!group_alive(pgid), "process group survived teardown");
    }

    #[tokio::test]
    async fn test_truncated_chunks_from_real_process() {
        let mut handle = spawn("head -c 100000 /dev/zero | tr '\\0' a", 4096).unwrap();
        let stdout = handle.take_stdout().unwrap();
        let chunks = collect(stdout).await;
        let total: usize = chunks.iter().map(|c| c.text.len()).sum();
        assert_eq!(total, 100_000);
        assert!(chunks.iter().any(|c| c.truncated));
        assert_eq!(handle.wait().await, 0);
    }

    #[test]
    fn test_spawn_error_display() {
        let err = SpawnError::Spawn {
            source: std::io::Error::other("boom"),
        };
        assert!(err.to_string().contains("failed to spawn"));
    }
}
