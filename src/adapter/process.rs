use super::StepDeadline;
use crate::error::AdapterError;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub exit_code: i32,
}

impl ProcessOutput {
    /// Append both streams to `<logs>/<name>.stdout.log` and `<name>.stderr.log`
    pub fn append_logs(&self, logs_dir: &Path, name: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(logs_dir)?;
        for (suffix, content) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(logs_dir.join(format!("{}.{}.log", name, suffix)))?;
            file.write_all(content.as_bytes())?;
        }
        Ok(())
    }
}

type Captured = Arc<Mutex<Vec<u8>>>;

/// Drain a pipe into a shared buffer so partial output survives an abort
async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>, sink: Captured) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = sink.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

fn take_captured(sink: &Captured) -> String {
    match sink.lock() {
        Ok(mut buf) => String::from_utf8_lossy(&std::mem::take(&mut *buf)).into_owned(),
        Err(_) => String::new(),
    }
}

/// Put the child in its own process group so signals reach its descendants
pub fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Run a command until it exits or the deadline passes.
///
/// On expiry the child's process group gets SIGTERM, then `deadline.grace()`
/// to exit, then SIGKILL. Expiry always yields `AdapterError::Timeout`.
///
/// With `log = Some((dir, name))` whatever the child wrote is appended to
/// `<dir>/<name>.stdout.log` and `<name>.stderr.log`, including the partial
/// output of a process that timed out.
pub async fn run_supervised(
    mut cmd: Command,
    stdin: Option<&str>,
    deadline: &StepDeadline,
    log: Option<(&Path, &str)>,
) -> Result<ProcessOutput, AdapterError> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    own_process_group(&mut cmd);

    let start = Instant::now();
    let mut child = cmd.spawn()?;

    let stdout_buf = Captured::default();
    let stderr_buf = Captured::default();
    let stdout_task = tokio::spawn(read_pipe(child.stdout.take(), stdout_buf.clone()));
    let stderr_task = tokio::spawn(read_pipe(child.stderr.take(), stderr_buf.clone()));

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                debug!("Child closed stdin early: {}", e);
            }
            let _ = pipe.shutdown().await;
        }
    }

    let status = tokio::select! {
        status = child.wait() => Some(status?),
        _ = tokio::time::sleep_until(deadline.expires_at()) => {
            warn!("Process exceeded {:?}, terminating", deadline.timeout());
            terminate(&mut child, deadline.grace()).await;
            None
        }
    };

    // Readers finish once every holder of the pipes is gone
    let drain = async {
        let _ = stdout_task.await;
        let _ = stderr_task.await;
    };
    if tokio::time::timeout(deadline.grace().max(Duration::from_millis(100)), drain)
        .await
        .is_err()
    {
        debug!("Output pipes still open after exit, keeping what was read");
    }

    let output = ProcessOutput {
        stdout: take_captured(&stdout_buf),
        stderr: take_captured(&stderr_buf),
        duration: start.elapsed(),
        exit_code: status.and_then(|s| s.code()).unwrap_or(-1),
    };
    if let Some((dir, name)) = log {
        output.append_logs(dir, name)?;
    }

    match status {
        Some(_) => Ok(output),
        None => Err(AdapterError::Timeout(deadline.timeout())),
    }
}

/// Graceful then forced termination of the child and its process group
pub async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        signal(pid, "TERM", true).await;
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            debug!("Process {} exited after SIGTERM", pid);
            // Descendants that outlived the leader still hold the group.
            // The leader is reaped, so its pid alone must not be signalled.
            signal(pid, "KILL", false).await;
            return;
        }
        warn!("Process {} ignored SIGTERM for {:?}, killing", pid, grace);
        signal(pid, "KILL", true).await;
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Signal the process group led by `pid`, optionally falling back to the
/// process itself when it does not lead a group
#[cfg(unix)]
async fn signal(pid: u32, name: &str, fallback: bool) {
    let kill = |target: String| {
        let mut cmd = Command::new("kill");
        cmd.arg(format!("-{}", name))
            .arg("--")
            .arg(target)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    };
    let group = kill(format!("-{}", pid)).status().await;
    if fallback && !matches!(group, Ok(status) if status.success()) {
        let _ = kill(pid.to_string()).status().await;
    }
}

#[cfg(not(unix))]
async fn signal(_pid: u32, _name: &str, _fallback: bool) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_captures_output_and_stdin() {
        let deadline = StepDeadline::new(Duration::from_secs(10), Duration::from_secs(1));
        let output = run_supervised(sh("cat; echo oops >&2"), Some("hello"), &deadline, None)
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let deadline = StepDeadline::new(Duration::from_secs(10), Duration::from_secs(1));
        let output = run_supervised(sh("exit 3"), None, &deadline, None).await.unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_timeout_terminates() {
        let deadline = StepDeadline::new(Duration::from_millis(200), Duration::from_millis(500));
        let start = Instant::now();
        let err = run_supervised(sh("sleep 30"), None, &deadline, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_forces_kill_when_term_ignored() {
        let deadline = StepDeadline::new(Duration::from_millis(200), Duration::from_millis(300));
        let start = Instant::now();
        let err = run_supervised(sh("trap '' TERM; sleep 30"), None, &deadline, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output_in_logs() {
        let dir = TempDir::new().unwrap();
        let deadline = StepDeadline::new(Duration::from_millis(300), Duration::from_millis(300));
        let err = run_supervised(
            sh("echo partial-progress; echo warming-up >&2; sleep 30"),
            None,
            &deadline,
            Some((dir.path(), "tool")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));

        let stdout = std::fs::read_to_string(dir.path().join("tool.stdout.log")).unwrap();
        let stderr = std::fs::read_to_string(dir.path().join("tool.stderr.log")).unwrap();
        assert!(stdout.contains("partial-progress"));
        assert!(stderr.contains("warming-up"));
    }

    #[tokio::test]
    async fn test_timeout_reaches_background_descendants() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let deadline = StepDeadline::new(Duration::from_millis(300), Duration::from_millis(300));

        let start = Instant::now();
        let err = run_supervised(sh(&script), None, &deadline, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        // Give the kernel a moment to deliver the group signal
        tokio::time::sleep(Duration::from_millis(200)).await;
        let alive = std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.trim())
            .stderr(Stdio::null())
            .status()
            .unwrap()
            .success();
        assert!(!alive, "background sleep {} outlived the timeout", pid.trim());
    }

    #[test]
    fn test_append_logs() {
        let dir = TempDir::new().unwrap();
        let output = ProcessOutput {
            stdout: "a\n".into(),
            stderr: "b\n".into(),
            duration: Duration::ZERO,
            exit_code: 0,
        };
        output.append_logs(dir.path(), "tool").unwrap();
        output.append_logs(dir.path(), "tool").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("tool.stdout.log")).unwrap(),
            "a\na\n"
        );
    }
}
