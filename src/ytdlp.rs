//! yt-dlp Runner
//!
//! Starts a download with the yt-dlp executable and streams its output, one
//! decoded line at a time, to a [`RunSink`]. Only one download runs at a time.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::decode::LineDecoder;
use crate::events::{CompletionSink, LineSink, RunSink};
use crate::platform::Platform;
use crate::settings::resolve_against;

/// File name pattern handed to yt-dlp's `-o`.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Stderr lines kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a download is already running")]
    AlreadyRunning,

    #[error("failed to capture yt-dlp {0}")]
    Pipe(&'static str),

    #[error("failed to spawn yt-dlp {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed waiting for yt-dlp: {0}")]
    Wait(#[source] std::io::Error),

    #[error("yt-dlp exited with {status}")]
    Exit {
        code: Option<i32>,
        status: ExitStatus,
        stderr_tail: Vec<String>,
    },
}

/// Whether a download is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/// Holding a ticket means owning the `Running` state; dropping it goes back
/// to `Idle`, whichever way the run ended.
struct RunTicket<'a> {
    state: &'a Mutex<RunState>,
}

impl Drop for RunTicket<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = RunState::Idle;
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub id: Uuid,
    pub output_template: PathBuf,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
}

/// What one capture task saw.
#[derive(Debug, Default)]
struct Captured {
    lines: usize,
    tail: Vec<String>,
}

/// Single-flight runner for yt-dlp downloads.
#[derive(Debug)]
pub struct YtDlpRunner {
    install_dir: PathBuf,
    platform: Platform,
    state: Mutex<RunState>,
}

impl YtDlpRunner {
    pub fn new(install_dir: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            install_dir: install_dir.into(),
            platform,
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Check-and-set `Idle -> Running` in one critical section.
    fn try_start(&self) -> Option<RunTicket<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            RunState::Running => None,
            RunState::Idle => {
                *state = RunState::Running;
                Some(RunTicket { state: &self.state })
            }
        }
    }

    /// `<output_dir>/%(title)s.%(ext)s`, with a relative `output_dir` taken
    /// from the install directory.
    pub fn output_template(&self, output_dir: &str) -> PathBuf {
        resolve_against(&self.install_dir, output_dir).join(OUTPUT_TEMPLATE)
    }

    /// Download `target_url` into `output_dir` and wait for yt-dlp to exit.
    ///
    /// Every line yt-dlp prints goes to `sink` as it arrives, and the outcome
    /// is reported through `sink.complete` on every path except
    /// [`RunError::AlreadyRunning`], which is returned without side effects.
    pub async fn run(
        &self,
        exe: &Path,
        output_dir: &str,
        target_url: &str,
        sink: Arc<dyn RunSink>,
    ) -> Result<RunReport, RunError> {
        let Some(_ticket) = self.try_start() else {
            log::info!("Rejected download of {}: another download is running", target_url);
            return Err(RunError::AlreadyRunning);
        };

        let id = Uuid::new_v4();
        let result = self.run_inner(id, exe, output_dir, target_url, &sink).await;

        match &result {
            Ok(report) => {
                log::info!(
                    "[{}] yt-dlp finished ({} stdout / {} stderr lines)",
                    id,
                    report.stdout_lines,
                    report.stderr_lines
                );
                sink.complete(true, format!("Download finished: {target_url}"));
            }
            Err(e) => {
                log::error!("[{}] Download of {} failed: {}", id, target_url, e);
                sink.complete(false, failure_message(e));
            }
        }

        result
    }

    async fn run_inner(
        &self,
        id: Uuid,
        exe: &Path,
        output_dir: &str,
        target_url: &str,
        sink: &Arc<dyn RunSink>,
    ) -> Result<RunReport, RunError> {
        let output_template = self.output_template(output_dir);

        let mut cmd = Command::new(exe);
        cmd.arg("-o")
            .arg(&output_template)
            .arg(target_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // yt-dlp reads yt-dlp.conf from its own directory.
        if let Some(dir) = exe.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        self.platform.suppress_console(&mut cmd);

        log::info!(
            "[{}] Starting {} -o {} {}",
            id,
            exe.display(),
            output_template.display(),
            target_url
        );

        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            path: exe.to_path_buf(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr) = match (stdout, stderr) {
            (Some(out), Some(err)) => (out, err),
            (out, _) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(RunError::Pipe(if out.is_none() { "stdout" } else { "stderr" }));
            }
        };

        let decoder = LineDecoder::new(self.platform.legacy_decoding());
        let out_task = capture(id, "stdout", stdout, decoder, Arc::clone(sink));
        let err_task = capture(id, "stderr", stderr, decoder, Arc::clone(sink));

        // Drain both streams before reaping the child so no output is lost.
        let (out, err) = tokio::join!(out_task, err_task);
        let out = joined(id, "stdout", out);
        let err = joined(id, "stderr", err);

        let status = child.wait().await.map_err(RunError::Wait)?;
        if !status.success() {
            return Err(RunError::Exit {
                code: status.code(),
                status,
                stderr_tail: err.tail,
            });
        }

        Ok(RunReport {
            id,
            output_template,
            stdout_lines: out.lines,
            stderr_lines: err.lines,
        })
    }
}

/// Forward every line of `stream` to `sink`, in order.
fn capture<R>(
    id: Uuid,
    name: &'static str,
    stream: R,
    decoder: LineDecoder,
    sink: Arc<dyn RunSink>,
) -> JoinHandle<Captured>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        let mut captured = Captured::default();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decoder.decode(&buf);
                    log::debug!("[{}] {}: {}", id, name, line);
                    captured.lines += 1;
                    if captured.tail.len() == STDERR_TAIL_LINES {
                        captured.tail.remove(0);
                    }
                    captured.tail.push(line.clone());
                    sink.line(line);
                }
                Err(e) => {
                    log::warn!("[{}] error reading yt-dlp {}: {}", id, name, e);
                    break;
                }
            }
        }

        captured
    })
}

fn joined(
    id: Uuid,
    name: &str,
    result: Result<Captured, tokio::task::JoinError>,
) -> Captured {
    result.unwrap_or_else(|e| {
        log::warn!("[{}] {} capture task failed: {}", id, name, e);
        Captured::default()
    })
}

fn failure_message(err: &RunError) -> String {
    match err {
        RunError::Exit { stderr_tail, .. } => match stderr_tail.last() {
            Some(last) => format!("{err}: {last}"),
            None => err.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        lines: Mutex<Vec<String>>,
        done: Mutex<Vec<(bool, String)>>,
    }

    impl LineSink for Collect {
        fn line(&self, text: String) {
            self.lines.lock().unwrap().push(text);
        }
    }

    impl CompletionSink for Collect {
        fn complete(&self, ok: bool, message: String) {
            self.done.lock().unwrap().push((ok, message));
        }
    }

    #[cfg(unix)]
    fn fake_ytdlp(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_output_template() {
        let runner = YtDlpRunner::new("/opt/desk", Platform::Unix);
        assert_eq!(
            runner.output_template("downloads"),
            PathBuf::from("/opt/desk/downloads/%(title)s.%(ext)s")
        );
        assert_eq!(
            runner.output_template("./out"),
            PathBuf::from("/opt/desk/out/%(title)s.%(ext)s")
        );
        #[cfg(unix)]
        assert_eq!(
            runner.output_template("/srv/media"),
            PathBuf::from("/srv/media/%(title)s.%(ext)s")
        );
    }

    #[test]
    fn test_ticket_resets_state() {
        let runner = YtDlpRunner::new("/opt/desk", Platform::Unix);
        let ticket = runner.try_start().unwrap();
        assert!(runner.is_running());
        assert!(runner.try_start().is_none());
        drop(ticket);
        assert_eq!(runner.state(), RunState::Idle);
        assert!(runner.try_start().is_some());
    }

    #[cfg(unix)]
    #[serial]
    #[tokio::test]
    async fn test_run_streams_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_ytdlp(
            dir.path(),
            "echo \"args: $1 $2 $3\"\necho one\necho two\necho warn >&2\necho three",
        );
        let runner = YtDlpRunner::new(dir.path(), Platform::Unix);
        let sink = Arc::new(Collect::default());

        let report = runner
            .run(&exe, "out", "https://example.com/v", sink.clone())
            .await
            .unwrap();

        let template = dir.path().join("out").join(OUTPUT_TEMPLATE);
        assert_eq!(report.output_template, template);
        assert_eq!(report.stdout_lines, 4);
        assert_eq!(report.stderr_lines, 1);

        // The two streams may interleave; stdout alone keeps its order.
        let lines = sink.lines.lock().unwrap().clone();
        assert!(lines.contains(&"warn".to_string()));
        let stdout: Vec<String> = lines.into_iter().filter(|l| l != "warn").collect();
        assert_eq!(
            stdout,
            vec![
                format!("args: -o {} https://example.com/v", template.display()),
                "one".to_string(),
                "two".to_string(),
                "three".to_string(),
            ]
        );

        let done = sink.done.lock().unwrap().clone();
        assert_eq!(done.len(), 1);
        assert!(done[0].0);
        assert!(!runner.is_running());
    }

    #[cfg(unix)]
    #[serial]
    #[tokio::test]
    async fn test_run_uses_exe_directory() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_ytdlp(dir.path(), "pwd");
        let runner = YtDlpRunner::new(dir.path(), Platform::Unix);
        let sink = Arc::new(Collect::default());

        runner
            .run(&exe, "out", "https://example.com/v", sink.clone())
            .await
            .unwrap();

        let lines = sink.lines.lock().unwrap().clone();
        assert_eq!(
            std::fs::canonicalize(&lines[0]).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[cfg(unix)]
    #[serial]
    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_ytdlp(dir.path(), "echo 'ERROR: Unsupported URL' >&2\nexit 2");
        let runner = YtDlpRunner::new(dir.path(), Platform::Unix);
        let sink = Arc::new(Collect::default());

        let err = runner
            .run(&exe, "out", "https://example.com/nope", sink.clone())
            .await
            .unwrap_err();

        match err {
            RunError::Exit {
                code, stderr_tail, ..
            } => {
                assert_eq!(code, Some(2));
                assert_eq!(stderr_tail, vec!["ERROR: Unsupported URL".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let done = sink.done.lock().unwrap().clone();
        assert_eq!(done.len(), 1);
        assert!(!done[0].0);
        assert!(done[0].1.contains("Unsupported URL"));
        assert!(!runner.is_running());
    }

    #[serial]
    #[tokio::test]
    async fn test_spawn_failure_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let runner = YtDlpRunner::new(dir.path(), Platform::current());
        let sink = Arc::new(Collect::default());

        let err = runner
            .run(
                &dir.path().join("does-not-exist"),
                "out",
                "https://example.com/v",
                sink.clone(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Spawn { .. }));
        assert!(!runner.is_running());
        let done = sink.done.lock().unwrap().clone();
        assert_eq!(done.len(), 1);
        assert!(!done[0].0);
    }

    #[cfg(unix)]
    #[serial]
    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("starts");
        let exe = fake_ytdlp(
            dir.path(),
            &format!("echo started >> '{}'\nsleep 1", counter.display()),
        );
        let runner = Arc::new(YtDlpRunner::new(dir.path(), Platform::Unix));

        let first = {
            let runner = Arc::clone(&runner);
            let exe = exe.clone();
            tokio::spawn(async move {
                let sink: Arc<dyn RunSink> = Arc::new(Collect::default());
                runner.run(&exe, "out", "https://example.com/a", sink).await
            })
        };

        while !runner.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sink = Arc::new(Collect::default());
        let second = runner
            .run(&exe, "out", "https://example.com/b", sink.clone())
            .await;
        assert!(matches!(second, Err(RunError::AlreadyRunning)));
        assert!(sink.done.lock().unwrap().is_empty());

        first.await.unwrap().unwrap();
        assert!(!runner.is_running());
        let starts = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(starts.lines().count(), 1);
    }
}
