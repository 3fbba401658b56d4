//! Running an external filter program with a timeout and bounded output.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of a filter run.
#[derive(Debug)]
pub struct FilterOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub timed_out: bool,
}

impl FilterOutput {
    /// Last line of stderr, for error messages.
    pub fn stderr_tail(&self) -> String {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

/// Pipe `input` through `cmd`, killing it after `timeout`.
///
/// stdin is fed from its own thread so a child that starts writing before it
/// has consumed all of its input cannot deadlock against us. At most
/// `output_limit_bytes` of stdout are kept; the rest is drained and counted.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), input_bytes = input.len()))]
pub fn run_filter(
    mut cmd: Command,
    input: &[u8],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<FilterOutput> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning filter process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn filter");
            return Err(e).context("spawn filter");
        }
    };

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let input = input.to_vec();
    let stdin_handle = thread::spawn(move || {
        // A filter may exit without reading everything; a broken pipe is fine.
        let _ = stdin.write_all(&input);
    });
    let stdout_handle = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for filter")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "filter timed out, killing");
            timed_out = true;
            child.kill().context("kill filter")?;
            child.wait().context("wait filter after kill")?
        }
    };

    let _ = stdin_handle.join();
    let (stdout, stdout_truncated) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, _) = join_reader(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, stdout_truncated, "filter finished");
    Ok(FilterOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn pipes_input_through_filter() {
        let out = run_filter(sh("tr a-z A-Z"), b"hello", Duration::from_secs(5), 1024)
            .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout, b"HELLO");
        assert!(!out.timed_out);
    }

    #[test]
    fn truncates_stdout_beyond_limit() {
        let out = run_filter(sh("cat"), b"0123456789", Duration::from_secs(5), 4).expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn kills_filter_after_timeout() {
        let out =
            run_filter(sh("exec sleep 5"), b"", Duration::from_millis(100), 1024).expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    #[test]
    fn stderr_tail_reports_last_line() {
        let out = run_filter(
            sh("echo first >&2; echo 'bad input' >&2; exit 3"),
            b"",
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stderr_tail(), "bad input");
    }
}
