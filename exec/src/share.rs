//! Shared-build delegation: forwards whole edge commands to a peer proxy
//! instead of describing them as REAPI actions.
//!
//! A pool of proxy clients is filled at startup; `SendCommand` picks one
//! round-robin and runs the RPC asynchronously. The event loop sweeps the
//! task set for completions like any other process set.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::{error, info};

use nimbus_reapi::channel_from_addr;
use nimbus_reapi::proto::proxy::{
    ClearBuildEnvRequest, ForwardAndExecuteRequest, InitializeBuildEnvRequest, Project,
    ProxyCode, ShareBuildProxyClient,
};

use crate::config::RbeConfig;
use crate::Error;

fn project_of(config: &RbeConfig) -> Project {
    Project {
        ninja_host: config.self_ipv4_addr.clone(),
        ninja_dir: config.cwd.clone(),
        root_dir: config.project_root.clone(),
    }
}

/// Ask the proxy to provision `worker_num` workers running the declared
/// container image for this project.
pub async fn initialize_build_env(config: &RbeConfig) -> Result<bool, Error> {
    let container_image = config
        .rbe_properties
        .get("container-image")
        .cloned()
        .unwrap_or_default();
    let mut client = ShareBuildProxyClient::new(channel_from_addr(&config.shareproxy_addr)?);
    let response = client
        .initialize_build_env(InitializeBuildEnvRequest {
            project: Some(project_of(config)),
            container_image,
            worker_num: config.worker_num,
        })
        .await?
        .into_inner();
    Ok(response
        .status
        .map(|s| s.code == ProxyCode::Ok as i32)
        .unwrap_or(false))
}

/// Tear the build environment down again.
pub async fn clear_build_env(config: &RbeConfig) -> Result<bool, Error> {
    let mut client = ShareBuildProxyClient::new(channel_from_addr(&config.shareproxy_addr)?);
    let response = client
        .clear_build_env(ClearBuildEnvRequest {
            project: Some(project_of(config)),
        })
        .await?
        .into_inner();
    Ok(response
        .status
        .map(|s| s.code == ProxyCode::Ok as i32)
        .unwrap_or(false))
}

/// A completed shared-build delegation.
pub struct ShareTask {
    pub id: u64,
    pub cmd_id: String,
    pub exit_code: i32,
    pub output: String,
}

impl ShareTask {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Round-robin pool of proxy clients.
pub struct RemoteCommandDispatcher {
    clients: Vec<ShareBuildProxyClient>,
    next_client: AtomicUsize,
}

impl RemoteCommandDispatcher {
    pub fn new(proxy_addr: &str, pool_size: usize) -> Result<Self, Error> {
        let mut clients = Vec::with_capacity(pool_size);
        for _ in 0..pool_size.max(1) {
            clients.push(ShareBuildProxyClient::new(channel_from_addr(proxy_addr)?));
        }
        Ok(Self {
            clients,
            next_client: AtomicUsize::new(0),
        })
    }

    /// Forward one command; the result lands on `tx` when the proxy
    /// answers. An RPC failure or a non-OK proxy status maps to exit code
    /// -1 with a diagnostic.
    pub fn send_command(
        &self,
        id: u64,
        cmd_id: String,
        command: String,
        config: &RbeConfig,
        tx: mpsc::UnboundedSender<ShareTask>,
    ) {
        let index = self.next_client.fetch_add(1, Ordering::SeqCst) % self.clients.len();
        let mut client = self.clients[index].clone();
        let request = ForwardAndExecuteRequest {
            project: Some(project_of(config)),
            cmd_id: cmd_id.clone(),
            cmd_content: command,
        };
        tokio::spawn(async move {
            let task = match client.forward_and_execute(request).await {
                Ok(response) => {
                    let response = response.into_inner();
                    let proxy_ok = response
                        .status
                        .as_ref()
                        .map(|s| s.code == ProxyCode::Ok as i32)
                        .unwrap_or(false);
                    if proxy_ok {
                        ShareTask {
                            id,
                            cmd_id,
                            exit_code: 0,
                            output: format!(
                                "stdout: {}, stderr: {}",
                                response.std_out, response.std_err
                            ),
                        }
                    } else {
                        let message = response
                            .status
                            .map(|s| s.message)
                            .unwrap_or_else(|| "no status".to_string());
                        error!(cmd_id = %cmd_id, "proxy reported failure: {}", message);
                        ShareTask {
                            id,
                            cmd_id,
                            exit_code: -1,
                            output: "RPC failed or execution error".to_string(),
                        }
                    }
                }
                Err(status) => {
                    error!(cmd_id = %cmd_id, "ForwardAndExecute rpc failed: {}", status);
                    ShareTask {
                        id,
                        cmd_id,
                        exit_code: -1,
                        output: "RPC failed or execution error".to_string(),
                    }
                }
            };
            let _ = tx.send(task);
        });
    }
}

/// In-flight shared-build delegations, swept by the event loop.
pub struct ShareTaskSet {
    config: RbeConfig,
    dispatcher: RemoteCommandDispatcher,
    next_id: u64,
    task_seq: u64,
    running: HashSet<u64>,
    finished: VecDeque<ShareTask>,
    completions_tx: mpsc::UnboundedSender<ShareTask>,
    completions_rx: mpsc::UnboundedReceiver<ShareTask>,
}

impl ShareTaskSet {
    pub fn new(config: RbeConfig) -> Result<Self, Error> {
        let pool_size = std::thread::available_parallelism()
            .map(|n| n.get() + 2)
            .unwrap_or(4);
        let dispatcher = RemoteCommandDispatcher::new(&config.shareproxy_addr, pool_size)?;
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            dispatcher,
            next_id: 0,
            task_seq: 0,
            running: HashSet::new(),
            finished: VecDeque::new(),
            completions_tx,
            completions_rx,
        })
    }

    /// Delegate one command; command ids are `<self-ip>_<seq>`.
    pub fn add(&mut self, command: &str) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.task_seq += 1;
        let cmd_id = format!("{}_{}", self.config.self_ipv4_addr, self.task_seq);
        info!(cmd_id = %cmd_id, "delegating command to shared-build proxy");
        self.dispatcher.send_command(
            id,
            cmd_id,
            command.to_string(),
            &self.config,
            self.completions_tx.clone(),
        );
        self.running.insert(id);
        id
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub async fn recv_completion(&mut self) -> Option<ShareTask> {
        self.completions_rx.recv().await
    }

    pub fn on_completion(&mut self, task: ShareTask) {
        self.running.remove(&task.id);
        self.finished.push_back(task);
    }

    pub fn next_finished(&mut self) -> Option<ShareTask> {
        self.finished.pop_front()
    }

    pub fn clear(&mut self) {
        self.running.clear();
    }
}

/// Event-loop turn for a shared build: local completions, proxy
/// completions, or a signal.
pub async fn do_share_work(
    locals: &mut crate::subprocess::SubprocessSet,
    shares: &mut ShareTaskSet,
    interrupts: &mut crate::process::Interrupts,
) -> crate::process::WorkStatus {
    use crate::process::WorkStatus;
    tokio::select! {
        Some(finished) = locals.recv_completion() => {
            locals.on_completion(finished);
            WorkStatus::Completed
        }
        Some(task) = shares.recv_completion() => {
            shares.on_completion(task);
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

    fn config() -> RbeConfig {
        RbeConfig {
            shareproxy_addr: "127.0.0.1:9".to_string(),
            self_ipv4_addr: "10.0.0.5".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn command_ids_are_host_qualified_and_sequential() {
        let mut set = ShareTaskSet::new(config()).unwrap();
        set.add("g++ -c a.cc");
        set.add("g++ -c b.cc");
        assert_eq!(set.running_count(), 2);
        // The ids were handed to the dispatcher; completions will carry
        // them back. Sequence numbers start at 1.
        assert_eq!(set.task_seq, 2);
    }

    #[tokio::test]
    async fn rpc_failure_maps_to_error_exit() {
        // Port 9 (discard) has no gRPC server; the dispatch must complete
        // with the error exit code instead of hanging.
        let mut set = ShareTaskSet::new(config()).unwrap();
        set.add("true");
        let task = set.recv_completion().await.unwrap();
        assert_eq!(task.exit_code, -1);
        assert_eq!(task.output, "RPC failed or execution error");
        set.on_completion(task);
        assert!(set.next_finished().unwrap().exit_code != 0);
    }
}
