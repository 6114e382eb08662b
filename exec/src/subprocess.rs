//! Local subprocess execution.
//!
//! Commands run through `/bin/sh -c` in their own process group, stdout and
//! stderr captured into one buffer. The set mirrors the remote process set:
//! completions arrive on a channel the event loop selects over.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::warn;

/// Run one command to completion, returning `(exit_code, output)`. A death
/// by signal maps to `128 + signo`.
pub async fn run_command(command: &str, cwd: &str) -> std::io::Result<(i32, String)> {
    let output = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((exit_code_of(output.status), combined))
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// A reaped local process.
pub struct FinishedProcess {
    pub id: u64,
    pub exit_code: i32,
    pub output: String,
}

impl FinishedProcess {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

struct RunningChild {
    pid: Option<i32>,
    use_console: bool,
}

/// The set of in-flight local subprocesses. Only the build-driver thread
/// touches it; the spawned reader tasks communicate through the completion
/// channel.
pub struct SubprocessSet {
    next_id: u64,
    running: HashMap<u64, RunningChild>,
    finished: std::collections::VecDeque<FinishedProcess>,
    completions_tx: mpsc::UnboundedSender<FinishedProcess>,
    completions_rx: mpsc::UnboundedReceiver<FinishedProcess>,
}

impl Default for SubprocessSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessSet {
    pub fn new() -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            next_id: 0,
            running: HashMap::new(),
            finished: std::collections::VecDeque::new(),
            completions_tx,
            completions_rx,
        }
    }

    /// Launch `command`. Console commands inherit the terminal and are not
    /// captured; everything else runs in its own process group with both
    /// output streams piped.
    pub fn add(&mut self, command: &str, cwd: &str, use_console: bool) -> std::io::Result<u64> {
        let id = self.next_id;
        self.next_id += 1;

        let mut builder = tokio::process::Command::new("/bin/sh");
        builder.arg("-c").arg(command).current_dir(cwd);
        if use_console {
            builder
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            builder
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0);
        }
        let mut child = builder.spawn()?;
        let pid = child.id().map(|p| p as i32);
        self.running.insert(id, RunningChild { pid, use_console });

        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let mut output = String::new();
            if let Some(mut stdout) = child.stdout.take() {
                let mut buffer = String::new();
                let _ = stdout.read_to_string(&mut buffer).await;
                output.push_str(&buffer);
            }
            if let Some(mut stderr) = child.stderr.take() {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer).await;
                output.push_str(&buffer);
            }
            let exit_code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!("wait failed: {}", e);
                    -1
                }
            };
            // Sender is moved in; the completion fires exactly once.
            let _ = tx.send(FinishedProcess {
                id,
                exit_code,
                output,
            });
        });
        Ok(id)
    }

    /// Wait for the next completion. Cancel-safe; used inside the event
    /// loop's select.
    pub async fn recv_completion(&mut self) -> Option<FinishedProcess> {
        self.completions_rx.recv().await
    }

    pub fn on_completion(&mut self, finished: FinishedProcess) {
        self.running.remove(&finished.id);
        self.finished.push_back(finished);
    }

    pub fn next_finished(&mut self) -> Option<FinishedProcess> {
        self.finished.pop_front()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Forward `signal` to the process groups of all non-console children.
    /// Console children share our process group and already received it.
    pub fn kill_running(&self, signal: i32) {
        for child in self.running.values() {
            if child.use_console {
                continue;
            }
            if let Some(pid) = child.pid {
                unsafe {
                    libc::kill(-pid, signal);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_captures_both_streams() {
        let (code, output) = run_command("echo out; echo err >&2", "/tmp").await.unwrap();
        assert_eq!(code, 0);
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn run_command_reports_exit_code() {
        let (code, _) = run_command("exit 7", "/tmp").await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn set_completes_processes() {
        let mut set = SubprocessSet::new();
        let id = set.add("echo hello", "/tmp", false).unwrap();
        assert_eq!(set.running_count(), 1);
        let finished = set.recv_completion().await.unwrap();
        set.on_completion(finished);
        assert_eq!(set.running_count(), 0);
        let finished = set.next_finished().unwrap();
        assert_eq!(finished.id, id);
        assert!(finished.success());
        assert_eq!(finished.output.trim(), "hello");
    }
}
