//! Subprocess spawn, bidirectional JSON-lines protocol, and graceful
//! shutdown. Generalizes the stdout/stderr/stdin task triad and the
//! `tokio::select!` wait/kill/timeout race used for one-shot exec into a
//! long-lived, resumable conduit: one subprocess serves many turns.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ag_domain::agent_event::AgentEvent;
use ag_domain::error::{Error, Result};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::options::AgentOptions;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A bidirectional conduit to one running agent subprocess.
pub struct AgentClient {
    pid: u32,
    stdin: AsyncMutex<ChildStdin>,
    child: AsyncMutex<Child>,
    active_turn: Arc<SyncMutex<Option<mpsc::Sender<AgentEvent>>>>,
    reader_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    last_used_millis: AtomicI64,
    turn_timeout: Duration,
}

impl AgentClient {
    /// Spawn a fresh subprocess rooted at `cwd`, with `env` applied on
    /// top of the inherited environment and `options` serialized as the
    /// CLI's startup options blob.
    pub fn spawn(
        program: &str,
        cwd: &str,
        env: &std::collections::HashMap<String, String>,
        options: &AgentOptions,
        turn_timeout: Duration,
    ) -> Result<Self> {
        let options_json = serde_json::to_string(options)?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.current_dir(cwd)
            .arg("--options")
            .arg(&options_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Fatal(format!("spawning agent subprocess: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Fatal("agent subprocess exited before pid was available".into()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Fatal("agent subprocess stdout not piped".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Fatal("agent subprocess stdin not piped".into()))?;
        let stderr = child.stderr.take();

        let active_turn: Arc<SyncMutex<Option<mpsc::Sender<AgentEvent>>>> =
            Arc::new(SyncMutex::new(None));

        let reader_task = spawn_stdout_reader(stdout, active_turn.clone(), pid);
        if let Some(stderr) = stderr {
            spawn_stderr_drain(stderr, pid);
        }

        Ok(Self {
            pid,
            stdin: AsyncMutex::new(stdin),
            child: AsyncMutex::new(child),
            active_turn,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
            last_used_millis: AtomicI64::new(now_millis()),
            turn_timeout,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Monotonic timestamp (ms since UNIX epoch) of the last completed
    /// or in-progress turn.
    pub fn last_used_millis(&self) -> i64 {
        self.last_used_millis.load(Ordering::Relaxed)
    }

    /// Coarse RSS estimate (megabytes) covering the subprocess and its
    /// direct descendants.
    pub fn rss_mb(&self) -> u64 {
        process_tree_rss_mb(self.pid)
    }

    /// Send one prompt and return a stream of events for the resulting
    /// turn. The caller must drain the stream to `Done` (or until it
    /// yields `None`) before issuing another `ask`; the Session Manager's
    /// per-session lock is what actually enforces that.
    pub async fn ask(&self, prompt: &str) -> Result<AgentEventStream> {
        self.last_used_millis.store(now_millis(), Ordering::Relaxed);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        {
            let mut slot = self.active_turn.lock();
            if slot.is_some() {
                return Err(Error::Fatal(
                    "ask() called while a turn is already in flight".into(),
                ));
            }
            *slot = Some(tx);
        }

        let request = serde_json::to_string(&Request { prompt })?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::Fatal(format!("writing prompt to agent stdin: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Fatal(format!("writing prompt to agent stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Fatal(format!("flushing agent stdin: {e}")))?;

        Ok(AgentEventStream {
            rx,
            timeout: self.turn_timeout,
            pending: VecDeque::new(),
            timed_out: false,
            active_turn: self.active_turn.clone(),
        })
    }

    /// Cooperative shutdown: close stdin (EOF), wait up to the grace
    /// period, then escalate to a forced kill. Never leaves the
    /// subprocess running on any exit path.
    pub async fn close(&self) -> Result<()> {
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }

        let mut child = self.child.lock().await;
        let waited = tokio::time::timeout(CLOSE_GRACE_PERIOD, child.wait()).await;
        match waited {
            Ok(Ok(_status)) => {}
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "error waiting on agent subprocess");
            }
            Err(_elapsed) => {
                tracing::warn!(pid = self.pid, "agent subprocess did not exit within grace period, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }

        if let Some(handle) = self.reader_task.lock().unwrap().take() {
            handle.abort();
        }

        Ok(())
    }
}

#[derive(serde::Serialize)]
struct Request<'a> {
    prompt: &'a str,
}

/// A single turn's event stream, with a per-turn timeout. If the agent
/// exceeds `timeout` without emitting `Done`, the turn is abandoned (a
/// synthetic `Error` then `Done` pair is yielded) but the underlying
/// subprocess is left running.
pub struct AgentEventStream {
    rx: mpsc::Receiver<AgentEvent>,
    timeout: Duration,
    pending: VecDeque<AgentEvent>,
    timed_out: bool,
    active_turn: Arc<SyncMutex<Option<mpsc::Sender<AgentEvent>>>>,
}

impl AgentEventStream {
    pub async fn next(&mut self) -> Option<AgentEvent> {
        if let Some(ev) = self.pending.pop_front() {
            return Some(ev);
        }
        if self.timed_out {
            return None;
        }

        match tokio::time::timeout(self.timeout, self.rx.recv()).await {
            Ok(Some(ev)) => Some(ev),
            Ok(None) => None,
            Err(_elapsed) => {
                self.timed_out = true;
                *self.active_turn.lock() = None;
                let [err, done] = AgentEvent::timed_out(format!(
                    "turn exceeded {:?} without a done event",
                    self.timeout
                ));
                self.pending.push_back(done);
                Some(err)
            }
        }
    }
}

fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    active_turn: Arc<SyncMutex<Option<mpsc::Sender<AgentEvent>>>>,
    pid: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event: AgentEvent = match serde_json::from_str(&line) {
                        Ok(ev) => ev,
                        Err(e) => {
                            tracing::warn!(pid, error = %e, line, "malformed agent event line");
                            continue;
                        }
                    };
                    let done = event.is_done();
                    let sender = active_turn.lock().clone();
                    if let Some(tx) = sender {
                        let _ = tx.send(event).await;
                    }
                    if done {
                        *active_turn.lock() = None;
                    }
                }
                Ok(None) => {
                    // Subprocess closed stdout (exited). If a turn was in
                    // flight, it never got its `done` — tell the waiter.
                    let sender = active_turn.lock().take();
                    if let Some(tx) = sender {
                        let _ = tx
                            .send(AgentEvent::Error {
                                kind: "subprocess_exited".into(),
                                detail: "agent subprocess closed its output stream".into(),
                            })
                            .await;
                        let _ = tx.send(AgentEvent::Done).await;
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "error reading agent stdout");
                    break;
                }
            }
        }
    })
}

fn spawn_stderr_drain(stderr: tokio::process::ChildStderr, pid: u32) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(pid, "agent stderr: {line}");
        }
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn process_tree_rss_mb(root_pid: u32) -> u64 {
    use sysinfo::{PidExt, ProcessExt, System, SystemExt};

    let mut sys = System::new();
    sys.refresh_processes();

    let root = sysinfo::Pid::from_u32(root_pid);
    let mut total_kb: u64 = sys.process(root).map(|p| p.memory()).unwrap_or(0);

    for process in sys.processes().values() {
        if process.parent() == Some(root) {
            total_kb += process.memory();
        }
    }

    total_kb / 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn opts() -> AgentOptions {
        AgentOptions {
            system_prompt: None,
            permission_mode: ag_domain::config::PermissionMode::Default,
            allowed_tools: vec![],
            add_dirs: vec![],
            model: None,
            max_turns: 50,
            max_budget_usd: None,
            mcp_servers: HashMap::new(),
            setting_sources: vec![],
            plugins: vec![],
            resume: None,
        }
    }

    /// A stand-in "agent" that echoes one `text_delta` per line of input
    /// then emits `done` — used instead of a real Claude Code CLI so
    /// tests don't require that binary to be installed.
    fn echo_script() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("fake_agent.sh");
        std::fs::write(
            &script_path,
            "#!/bin/sh\nwhile IFS= read -r line; do\n  echo '{\"type\":\"text_delta\",\"text\":\"echo\"}'\n  echo '{\"type\":\"done\"}'\ndone\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        (dir, script_path.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn ask_streams_events_to_done() {
        let (_dir, script) = echo_script();
        let mut env = HashMap::new();
        env.insert("DUMMY".to_string(), "1".to_string());
        let client = AgentClient::spawn(&script, "/tmp", &env, &opts(), Duration::from_secs(5)).unwrap();

        let mut stream = client.ask("hello").await.unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, AgentEvent::TextDelta { .. }));
        let second = stream.next().await.unwrap();
        assert!(second.is_done());

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_graceful_and_idempotent_on_already_exited_process() {
        let client = AgentClient::spawn(
            "sh",
            "/tmp",
            &HashMap::new(),
            &opts(),
            Duration::from_secs(5),
        )
        .unwrap();
        client.close().await.unwrap();
        // Closing again must not panic or hang.
        client.close().await.unwrap();
    }
}
