//! The remote process set and the unified event loop.
//!
//! A [RemoteProcess] stands in for an in-flight remote action the way a
//! local subprocess does for a local one: the worker runs the whole
//! per-action routine off the driver thread and reports `(exit_code,
//! output)` over a completion channel exactly once. The driver's event loop
//! selects over local completions, remote completions and the blocked
//! signals.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::context::ExecutionContext;
use crate::spawn::RemoteSpawn;
use crate::subprocess::SubprocessSet;
use crate::Error;

/// A reaped remote action.
pub struct RemoteProcess {
    pub id: u64,
    pub exit_code: i32,
    pub output: String,
}

impl RemoteProcess {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Worker pool + bookkeeping for in-flight remote actions. Owned by the
/// build-driver thread; the workers are tokio tasks gated by a semaphore
/// sized to the configured worker count.
pub struct RemoteProcessSet {
    context: Arc<ExecutionContext>,
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    next_id: u64,
    running: HashSet<u64>,
    finished: VecDeque<RemoteProcess>,
    completions_tx: mpsc::UnboundedSender<RemoteProcess>,
    completions_rx: mpsc::UnboundedReceiver<RemoteProcess>,
}

impl RemoteProcessSet {
    pub fn new(context: Arc<ExecutionContext>, pool_size: usize) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            context,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
            next_id: 0,
            running: HashSet::new(),
            finished: VecDeque::new(),
            completions_tx,
            completions_rx,
        }
    }

    /// Hand one spawn to the pool. Paths are rewritten here, before any
    /// remote-facing work happens.
    pub fn add(&mut self, mut spawn: RemoteSpawn) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        spawn.convert_paths_to_relative(&self.context.config().rbe_config);

        let context = self.context.clone();
        let permits = self.permits.clone();
        let waiting = self.waiting.clone();
        let tx = self.completions_tx.clone();
        waiting.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            waiting.fetch_sub(1, Ordering::SeqCst);
            let permit = match permit {
                Ok(permit) => permit,
                // The semaphore only closes on teardown.
                Err(_) => return,
            };
            let (exit_code, output) = match context.execute(&mut spawn).await {
                Ok(done) => done,
                Err(Error::Cancelled) => (-1, "nimbus: action cancelled".to_string()),
                Err(e) => {
                    error!(rule = %spawn.rule, "remote action failed: {}", e);
                    (1, format!("nimbus: fatal: {}", e))
                }
            };
            drop(permit);
            // Sender moved in: one completion per process, never two.
            let _ = tx.send(RemoteProcess {
                id,
                exit_code,
                output,
            });
        });
        self.running.insert(id);
        id
    }

    /// Backpressure: the dispatcher refuses new edges while enqueued work
    /// is still waiting for a worker.
    pub fn has_waiting_task(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) > 0
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub async fn recv_completion(&mut self) -> Option<RemoteProcess> {
        self.completions_rx.recv().await
    }

    pub fn on_completion(&mut self, process: RemoteProcess) {
        self.running.remove(&process.id);
        self.finished.push_back(process);
    }

    pub fn next_finished(&mut self) -> Option<RemoteProcess> {
        self.finished.pop_front()
    }

    /// Drop bookkeeping for all in-flight work. Workers observe the stop
    /// token and wind down on their own.
    pub fn clear(&mut self) {
        self.running.clear();
    }
}

/// The signals the driver blocks and surfaces as an interrupted flag. Any
/// receipt cancels the stop token.
pub struct Interrupts {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
    stop_token: CancellationToken,
}

impl Interrupts {
    pub fn new(stop_token: CancellationToken) -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
            stop_token,
        })
    }

    /// Wait for any of the blocked signals; returns the signal number.
    pub async fn recv(&mut self) -> i32 {
        let signo = tokio::select! {
            _ = self.sigint.recv() => libc::SIGINT,
            _ = self.sigterm.recv() => libc::SIGTERM,
            _ = self.sighup.recv() => libc::SIGHUP,
        };
        self.stop_token.cancel();
        signo
    }
}

/// One turn of the build driver's event loop.
pub enum WorkStatus {
    /// Some process moved to its set's finished queue.
    Completed,
    /// A signal arrived; the stop token is cancelled and local children
    /// have been re-signalled.
    Interrupted(i32),
}

/// Block until a local or remote completion, or a signal. The caller owns
/// both sets; reaping stays on this thread.
pub async fn do_work(
    locals: &mut SubprocessSet,
    remotes: &mut RemoteProcessSet,
    interrupts: &mut Interrupts,
) -> WorkStatus {
    tokio::select! {
        Some(finished) = locals.recv_completion() => {
            locals.on_completion(finished);
            WorkStatus::Completed
        }
        Some(process) = remotes.recv_completion() => {
            remotes.on_completion(process);
            WorkStatus::Completed
        }
        signal = interrupts.recv() => {
            locals.kill_running(signal);
            WorkStatus::Interrupted(signal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;

    async fn test_context() -> Arc<ExecutionContext> {
        let config = BuildConfig {
            cloud_run: true,
            rbe_config: crate::config::RbeConfig {
                grpc_url: "grpc://localhost:9".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        Arc::new(
            ExecutionContext::new(Arc::new(config), CancellationToken::new())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn completions_move_processes_to_finished() {
        let context = test_context().await;
        let mut set = RemoteProcessSet::new(context, 2);
        // Inject a completion directly; the worker path needs a server.
        set.running.insert(7);
        set.completions_tx
            .send(RemoteProcess {
                id: 7,
                exit_code: 0,
                output: "done".to_string(),
            })
            .unwrap();
        let process = set.recv_completion().await.unwrap();
        set.on_completion(process);
        assert_eq!(set.running_count(), 0);
        let process = set.next_finished().unwrap();
        assert!(process.success());
        assert_eq!(process.output, "done");
    }

    #[tokio::test]
    async fn waiting_counter_reflects_queued_work() {
        let context = test_context().await;
        let set = RemoteProcessSet::new(context, 1);
        assert!(!set.has_waiting_task());
    }
}
