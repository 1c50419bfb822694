//! Shared helpers: subprocess execution under a hard deadline, output
//! trimming, and filesystem-safe naming.

use anyhow::{Context, Result};
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shorten a string for display, appending an ellipsis. Unicode-safe.
pub fn ellipsize(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some(_) if max_chars <= 3 => s.chars().take(max_chars).collect(),
        Some(_) => {
            let kept: String = s.chars().take(max_chars - 3).collect();
            format!("{}...", kept)
        }
    }
}

/// Keep only the final `max_chars` characters of process output.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => text[idx..].to_string(),
        None => text.to_string(),
    }
}

/// Reduce a label to a filesystem-safe component.
pub fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        }
    }
    if out.is_empty() {
        out.push_str("unnamed");
    }
    out
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Run a child process under a hard deadline. The kill-on-deadline branch is
/// a first-class field of the result, not an error.
pub fn run_with_deadline(command: &mut Command, timeout: Duration) -> Result<ProcessOutput> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to start command")?;

    // Both pipes are drained off-thread so a chatty child cannot fill a pipe
    // buffer and deadlock against our wait loop.
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait().context("Failed to wait for command")? {
            Some(status) => break Some(status),
            None if Instant::now() >= deadline => {
                timed_out = true;
                let _ = child.kill();
                break child.wait().ok();
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    Ok(ProcessOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
        timed_out,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle.and_then(|h| h.join().ok()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}
