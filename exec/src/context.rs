//! The per-edge worker routine: cache lookup, then one of cache-hit
//! download, local execution with cache population, or remote execution.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, error, info, instrument};

use nimbus_castore::{fsutil, CasClient, DigestFunction, UploadRequest};
use nimbus_reapi::proto::{ActionResult, Digest, OutputFile};
use nimbus_reapi::{channel_from_url, MetadataInjector, Retrier, RetryPolicy};

use crate::action;
use crate::config::{tool_invocation_id, BuildConfig, TOOL_NAME, TOOL_VERSION};
use crate::reclient::RemoteExecutionClient;
use crate::spawn::RemoteSpawn;
use crate::subprocess;
use crate::Error;

/// Shared state for all per-edge executions: the gRPC channel, the build
/// configuration and the process-wide stop token. Both are init-once,
/// read-many; workers receive them as explicit parameters.
pub struct ExecutionContext {
    config: Arc<BuildConfig>,
    channel: Channel,
    digest_function: DigestFunction,
    stop_token: CancellationToken,
}

impl ExecutionContext {
    pub async fn new(
        config: Arc<BuildConfig>,
        stop_token: CancellationToken,
    ) -> Result<Self, Error> {
        let url = url::Url::parse(&config.rbe_config.grpc_url)
            .map_err(|e| Error::InvalidAction(format!("bad grpc url: {}", e)))?;
        let channel = channel_from_url(&url).await?;
        Ok(Self {
            config,
            channel,
            digest_function: DigestFunction::default(),
            stop_token,
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop_token
    }

    fn clients(&self, action_digest: &Digest) -> (CasClient, RemoteExecutionClient) {
        let metadata = MetadataInjector::new(
            TOOL_NAME,
            TOOL_VERSION,
            &action_digest.to_display_string(),
            &tool_invocation_id(),
            "",
        );
        let policy: RetryPolicy = self.config.rbe_config.retry_policy();
        let retrier = Retrier::new(policy, self.stop_token.clone());
        let cas = CasClient::new(
            self.channel.clone(),
            self.config.rbe_config.instance_name.clone(),
            self.digest_function,
            retrier.clone(),
            metadata.clone(),
        );
        let re_client = RemoteExecutionClient::new(
            self.channel.clone(),
            self.config.rbe_config.instance_name.clone(),
            retrier,
            metadata,
        );
        (cas, re_client)
    }

    /// Execute one spawn to completion and return `(exit_code, output)`.
    /// This is the routine the remote-build worker pool runs.
    #[instrument(skip_all, fields(rule = %spawn.rule))]
    pub async fn execute(&self, spawn: &mut RemoteSpawn) -> Result<(i32, String), Error> {
        let rbe = &self.config.rbe_config;

        // Header discovery feeds the input tree; dep-file products join the
        // outputs.
        let headers = spawn.gather_header_files().await;
        spawn.inputs.extend(headers);

        let mut bundle = action::build_action(spawn, rbe, self.digest_function).await?;
        let action_digest = bundle.action_digest.clone();
        let (cas, re_client) = self.clients(&action_digest);

        let cached = re_client
            .fetch_from_action_cache(&action_digest, &bundle.products)
            .await?;
        debug!(
            command = %spawn.command,
            cached = cached.is_some(),
            can_remote = spawn.can_remote,
            "classified edge"
        );

        let mut result = match cached {
            Some(result) => result,
            None if !spawn.can_remote => {
                // Local execution, then populate the cache for peers.
                return self
                    .execute_locally_and_update(&cas, &re_client, spawn, &bundle)
                    .await;
            }
            None => {
                let blobs = std::mem::take(&mut bundle.blobs);
                let file_inputs = std::mem::take(&mut bundle.file_inputs);
                self.upload_resources(&cas, blobs, file_inputs).await?;

                // A stop raised between upload and execute means the
                // Execute RPC is never issued.
                if self.stop_token.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                re_client.execute_action(&action_digest, false).await?
            }
        };

        let exit_code = result.exit_code;
        if exit_code != 0 {
            // Nothing to stage; surface whatever the tool wrote.
            let output = inline_output(&result);
            return Ok((exit_code, output));
        }
        if result.output_files.is_empty() && !bundle.products.is_empty() {
            return Err(Error::Execution(
                "action produced none of the expected output_files".to_string(),
            ));
        }

        // Stdout/stderr stored by digest ride the normal output download
        // under a well-known prefix.
        let postfix = format!("{}_{}", spawn.rule, fsutil::random_hex_string());
        let capture_prefix = format!("{}/.remote_stdout_stderr/", rbe.cwd);
        let stdout_path = result.stdout_digest.clone().map(|digest| {
            let path = format!("{}.remote_execute_stdout_{}", capture_prefix, postfix);
            result.output_files.push(OutputFile {
                path: path.clone(),
                digest: Some(digest),
                is_executable: false,
                contents: Bytes::new(),
                node_properties: None,
            });
            path
        });
        let stderr_path = result.stderr_digest.clone().map(|digest| {
            let path = format!("{}.remote_execute_stderr_{}", capture_prefix, postfix);
            result.output_files.push(OutputFile {
                path: path.clone(),
                digest: Some(digest),
                is_executable: false,
                contents: Bytes::new(),
                node_properties: None,
            });
            path
        });

        re_client
            .download_outputs(&cas, &result, Path::new(&rbe.cwd))
            .await?;

        let mut output = String::new();
        match stdout_path {
            Some(path) => {
                output.push_str(&tokio::fs::read_to_string(&path).await.unwrap_or_default());
                let _ = tokio::fs::remove_file(&path).await;
            }
            None => output.push_str(&String::from_utf8_lossy(&result.stdout_raw)),
        }
        match stderr_path {
            Some(path) => {
                output.push_str(&tokio::fs::read_to_string(&path).await.unwrap_or_default());
                let _ = tokio::fs::remove_file(&path).await;
            }
            None => output.push_str(&String::from_utf8_lossy(&result.stderr_raw)),
        }
        Ok((exit_code, output))
    }

    /// Cache miss on an edge that may not run remotely: run it locally and,
    /// on success, publish its outputs and result for peers.
    async fn execute_locally_and_update(
        &self,
        cas: &CasClient,
        re_client: &RemoteExecutionClient,
        spawn: &RemoteSpawn,
        bundle: &action::ActionBundle,
    ) -> Result<(i32, String), Error> {
        let rbe = &self.config.rbe_config;
        info!(command = %spawn.command, "cache miss, executing locally");
        let (exit_code, output) = subprocess::run_command(&spawn.command, &rbe.cwd).await?;
        if exit_code != 0 {
            // The failure is the edge's result; the cache is left alone.
            return Ok((exit_code, output));
        }

        let (result, mut blobs, output_files) =
            action::build_action_result(spawn, rbe, self.digest_function).await?;
        let action_blob = bundle
            .blobs
            .get(&bundle.action_digest)
            .cloned()
            .ok_or_else(|| Error::Execution("serialized action missing".to_string()))?;
        blobs.insert(bundle.action_digest.clone(), action_blob);
        self.upload_resources(cas, blobs, output_files).await?;
        if let Err(e) = re_client
            .update_to_action_cache(&bundle.action_digest, &result)
            .await
        {
            error!(
                "error while updating action cache at \"{}\": {}",
                rbe.grpc_url, e
            );
        }
        Ok((0, output))
    }

    /// Upload whichever of `blobs`/`files` the CAS reports missing.
    async fn upload_resources(
        &self,
        cas: &CasClient,
        mut blobs: HashMap<Digest, Bytes>,
        files: HashMap<Digest, String>,
    ) -> Result<(), Error> {
        let digests: Vec<Digest> = blobs.keys().chain(files.keys()).cloned().collect();
        let missing = cas.find_missing_blobs(&digests).await?;
        let mut uploads = Vec::with_capacity(missing.len());
        for digest in missing {
            if let Some(data) = blobs.remove(&digest) {
                uploads.push(UploadRequest::from_bytes(digest, data));
            } else if let Some(path) = files.get(&digest) {
                uploads.push(UploadRequest::from_path(
                    digest,
                    disk_path(path, &self.config.rbe_config.cwd),
                ));
            } else {
                return Err(Error::Execution(
                    "FindMissingBlobs returned non-existent digest".to_string(),
                ));
            }
        }
        cas.upload_blobs(uploads).await?;
        Ok(())
    }
}

fn disk_path(path: &str, cwd: &str) -> std::path::PathBuf {
    if path.starts_with('/') {
        std::path::PathBuf::from(path)
    } else {
        Path::new(cwd).join(path)
    }
}

/// The inline capture of a result, stdout first, used when there is nothing
/// to stage.
fn inline_output(result: &ActionResult) -> String {
    let mut output = String::from_utf8_lossy(&result.stdout_raw).into_owned();
    output.push_str(&String::from_utf8_lossy(&result.stderr_raw));
    output
}
