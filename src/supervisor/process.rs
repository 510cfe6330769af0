//! Low-level runner process plumbing: bounded output capture, process-group
//! termination, and CPU sampling from `/proc`.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state_machine::FailureClassification;

/// Combined stdout and stderr of one runner, capped at `max_bytes`.
///
/// Past the cap the capture keeps the first quarter of the budget and a
/// rolling window of the most recent output, since test summaries and
/// compiler errors come last. Every byte is still counted (and drained from
/// the pipe) so the health check keeps seeing progress.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    inner: Arc<CaptureInner>,
}

#[derive(Debug)]
struct CaptureInner {
    buf: Mutex<Window>,
    seen: AtomicU64,
    truncated: AtomicBool,
    max_bytes: usize,
}

#[derive(Debug, Default)]
struct Window {
    head: Vec<u8>,
    tail: VecDeque<u8>,
}

impl OutputCapture {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                buf: Mutex::new(Window {
                    head: Vec::with_capacity(8192.min(max_bytes)),
                    tail: VecDeque::new(),
                }),
                seen: AtomicU64::new(0),
                truncated: AtomicBool::new(false),
                max_bytes,
            }),
        }
    }

    fn head_cap(&self) -> usize {
        self.inner.max_bytes / 4
    }

    fn tail_cap(&self) -> usize {
        self.inner.max_bytes - self.head_cap()
    }

    pub fn push(&self, chunk: &[u8]) {
        self.inner.seen.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        let mut window = self.inner.buf.lock().unwrap_or_else(PoisonError::into_inner);

        let room = self.head_cap().saturating_sub(window.head.len());
        let (to_head, rest) = chunk.split_at(chunk.len().min(room));
        window.head.extend_from_slice(to_head);

        let tail_cap = self.tail_cap();
        let skipped = rest.len().saturating_sub(tail_cap);
        let rest = &rest[skipped..];
        let overflow = (window.tail.len() + rest.len()).saturating_sub(tail_cap);
        window.tail.drain(..overflow);
        window.tail.extend(rest);

        if skipped + overflow > 0 && !self.inner.truncated.swap(true, Ordering::Relaxed) {
            warn!(max_bytes = self.inner.max_bytes, "runner output exceeded limit, truncating");
        }
    }

    pub fn bytes_seen(&self) -> u64 {
        self.inner.seen.load(Ordering::Relaxed)
    }

    pub fn truncated(&self) -> bool {
        self.inner.truncated.load(Ordering::Relaxed)
    }

    /// Captured output. A truncated capture marks the gap between the head
    /// and the tail window.
    pub fn snapshot(&self) -> Vec<u8> {
        let window = self.inner.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::with_capacity(window.head.len() + window.tail.len() + 64);
        out.extend_from_slice(&window.head);
        if self.truncated() {
            let kept = (window.head.len() + window.tail.len()) as u64;
            let omitted = self.bytes_seen().saturating_sub(kept);
            let marker = format!("\n[... {omitted} bytes of output omitted ...]\n");
            out.extend_from_slice(marker.as_bytes());
        }
        out.extend(window.tail.iter().copied());
        out
    }

    /// Pump `reader` into the capture until EOF.
    pub fn spawn_reader<R>(&self, mut reader: R) -> JoinHandle<io::Result<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capture = self.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                capture.push(&chunk[..n]);
            }
        })
    }
}

/// Map a spawn failure to the classification it deserves.
pub fn classify_spawn_error(err: &io::Error) -> FailureClassification {
    match err.kind() {
        io::ErrorKind::NotFound => FailureClassification::MissingDependency,
        io::ErrorKind::PermissionDenied => FailureClassification::PermissionError,
        _ => FailureClassification::RuntimeCrash,
    }
}

/// SIGTERM the runner's process group, wait `grace`, then SIGKILL.
pub async fn terminate_group(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    signal_group(pid, libc::SIGTERM);
    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "runner exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for runner after SIGTERM");
        }
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "runner ignored SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill runner");
            }
        }
    }

    // Stragglers left in the group would hold the output pipes open.
    #[cfg(unix)]
    signal_group(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    let Some(pid) = pid else { return };
    // The runner was spawned as leader of its own group, so pgid == pid.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

/// Accumulated user + system CPU ticks of `pid` and its reaped children.
#[cfg(target_os = "linux")]
pub fn cpu_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_ticks(&stat)
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

/// Sum of utime, stime, cutime and cstime from a `/proc/<pid>/stat` line.
pub fn parse_stat_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces, so start after its closing paren.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state, field 3 of the full line.
    let mut total = 0u64;
    for idx in 11..=14 {
        total += fields.get(idx)?.parse::<i64>().ok()?.max(0) as u64;
    }
    Some(total)
}

pub fn ticks_to_ms(ticks: u64) -> u64 {
    #[cfg(unix)]
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    #[cfg(not(unix))]
    let hz = 100;
    let hz = if hz > 0 { hz as u64 } else { 100 };
    ticks.saturating_mul(1000) / hz
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_is_bounded_but_counts_everything() {
        let capture = OutputCapture::new(8);
        capture.push(b"hello ");
        capture.push(b"world");
        let text = String::from_utf8(capture.snapshot()).unwrap();
        assert_eq!(text, "he\n[... 3 bytes of output omitted ...]\n world");
        assert_eq!(capture.bytes_seen(), 11);
        assert!(capture.truncated());
    }

    #[test]
    fn capture_under_the_cap_is_verbatim() {
        let capture = OutputCapture::new(64);
        capture.push(b"running 2 tests\n");
        capture.push(b"test result: ok. 2 passed\n");
        assert_eq!(capture.snapshot(), b"running 2 tests\ntest result: ok. 2 passed\n");
        assert!(!capture.truncated());
    }

    #[test]
    fn overflowing_capture_keeps_the_summary() {
        let capture = OutputCapture::new(400);
        capture.push(b"running 1000 tests\n");
        for i in 0..1000 {
            capture.push(format!("test case_{i} ... ok\n").as_bytes());
        }
        capture.push(b"test result: ok. 1000 passed; 0 failed; 0 ignored\n");

        let text = String::from_utf8(capture.snapshot()).unwrap();
        assert!(capture.truncated());
        assert!(text.starts_with("running 1000 tests\n"));
        assert!(text.contains("bytes of output omitted"));
        assert!(text.ends_with("test result: ok. 1000 passed; 0 failed; 0 ignored\n"));
        assert!(text.len() < 400 + 64);
    }

    #[test]
    fn stat_line_with_spaces_in_name() {
        let stat = "4242 (my test runner) S 1 4242 4242 0 -1 4194560 300 0 0 0 17 5 2 1 20 0 1 0 100 0 0";
        assert_eq!(parse_stat_ticks(stat), Some(17 + 5 + 2 + 1));
        assert_eq!(parse_stat_ticks("garbage"), None);
    }

    #[test]
    fn spawn_errors_are_classified() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert_eq!(
            classify_spawn_error(&missing),
            FailureClassification::MissingDependency
        );
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            classify_spawn_error(&denied),
            FailureClassification::PermissionError
        );
    }

    #[tokio::test]
    async fn reader_drains_into_capture() {
        let capture = OutputCapture::new(1024);
        let handle = capture.spawn_reader(&b"line one\nline two\n"[..]);
        handle.await.unwrap().unwrap();
        assert_eq!(capture.snapshot(), b"line one\nline two\n");
    }
}
