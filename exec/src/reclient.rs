//! Remote execution client: action-cache lookups and updates, the streaming
//! Execute RPC with cooperative cancellation, and staging of action outputs
//! into the working tree.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use prost::Message;
use tonic::transport::Channel;
use tonic::Code;
use tracing::{info, instrument, warn};

use nimbus_castore::{fsutil, BlobStatus, CasClient, DownloadedBlob};
use nimbus_reapi::proto::{
    longrunning, ActionCacheClient, ActionResult, Digest, Directory, ExecuteRequest,
    ExecuteResponse, ExecutionClient, GetActionResultRequest, OperationsClient, Tree,
    UpdateActionResultRequest, EXECUTE_RESPONSE_TYPE_URL,
};
use nimbus_reapi::{MetadataInjector, Retrier};

use crate::Error;

/// How long one read on the operation stream may block before the stop
/// token is checked.
const POLL_WAIT: Duration = Duration::from_secs(1);

pub struct RemoteExecutionClient {
    exec: ExecutionClient,
    operations: OperationsClient,
    action_cache: ActionCacheClient,
    retrier: Retrier,
    metadata: MetadataInjector,
    instance_name: String,
}

impl RemoteExecutionClient {
    pub fn new(
        channel: Channel,
        instance_name: String,
        retrier: Retrier,
        metadata: MetadataInjector,
    ) -> Self {
        Self {
            exec: ExecutionClient::new(channel.clone()),
            operations: OperationsClient::new(channel.clone()),
            action_cache: ActionCacheClient::new(channel),
            retrier,
            metadata,
            instance_name,
        }
    }

    /// Look up `action_digest` in the action cache. Absence is not an
    /// error. Small stdout/stderr and the requested outputs come back
    /// inline.
    #[instrument(skip_all, fields(action = %action_digest))]
    pub async fn fetch_from_action_cache(
        &self,
        action_digest: &Digest,
        outputs: &BTreeSet<String>,
    ) -> Result<Option<ActionResult>, Error> {
        let request = GetActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(action_digest.clone()),
            inline_stdout: true,
            inline_stderr: true,
            inline_output_files: outputs.iter().cloned().collect(),
        };
        let result = self
            .retrier
            .issue("ActionCache.GetActionResult()", || {
                let mut client = self.action_cache.clone();
                let request = self.metadata.request(request.clone());
                async move {
                    match client.get_action_result(request).await {
                        Ok(response) => Ok(Some(response.into_inner())),
                        Err(status) if status.code() == Code::NotFound => Ok(None),
                        Err(status) => Err(status),
                    }
                }
            })
            .await?;
        Ok(result)
    }

    /// Publish `result` under `action_digest`. A result that is already
    /// there counts as success.
    #[instrument(skip_all, fields(action = %action_digest))]
    pub async fn update_to_action_cache(
        &self,
        action_digest: &Digest,
        result: &ActionResult,
    ) -> Result<bool, Error> {
        let request = UpdateActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(action_digest.clone()),
            action_result: Some(result.clone()),
        };
        let updated = self
            .retrier
            .issue("ActionCache.UpdateActionResult()", || {
                let mut client = self.action_cache.clone();
                let request = self.metadata.request(request.clone());
                async move {
                    match client.update_action_result(request).await {
                        Ok(_) => Ok(true),
                        Err(status) if status.code() == Code::AlreadyExists => Ok(true),
                        Err(status) => Err(status),
                    }
                }
            })
            .await?;
        Ok(updated)
    }

    /// Run the action remotely, reading long-running-operation updates
    /// until one arrives done. Between reads the stop token is observed;
    /// cancellation is forwarded to the server by operation name,
    /// best-effort.
    #[instrument(skip_all, fields(action = %action_digest))]
    pub async fn execute_action(
        &self,
        action_digest: &Digest,
        skip_cache: bool,
    ) -> Result<ActionResult, Error> {
        let request = ExecuteRequest {
            instance_name: self.instance_name.clone(),
            skip_cache_lookup: skip_cache,
            action_digest: Some(action_digest.clone()),
        };
        let mut stream = self
            .retrier
            .issue("Execution.Execute()", || {
                let mut client = self.exec.clone();
                let request = self.metadata.request(request.clone());
                async move { Ok(client.execute(request).await?.into_inner()) }
            })
            .await?;

        let mut operation: Option<longrunning::Operation> = None;
        loop {
            match tokio::time::timeout(POLL_WAIT, stream.message()).await {
                Ok(Ok(Some(update))) => {
                    let done = update.done;
                    operation = Some(update);
                    if done {
                        break;
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(status)) => return Err(status.into()),
                Err(_) => {
                    if self.retrier.stop_token().is_cancelled() {
                        if let Some(op) = &operation {
                            if !op.name.is_empty() {
                                warn!("cancelling job, operation name: {}", op.name);
                                self.cancel_operation(&op.name).await;
                            }
                        }
                        return Err(Error::Cancelled);
                    }
                }
            }
        }

        let operation = operation.ok_or_else(|| {
            Error::Execution("server closed stream without any operation".to_string())
        })?;
        if !operation.done {
            return Err(Error::Execution(
                "server closed stream before operation finished".to_string(),
            ));
        }
        unpack_operation(operation)
    }

    /// Best-effort server-side cancellation of a named operation.
    async fn cancel_operation(&self, name: &str) {
        let request = longrunning::CancelOperationRequest {
            name: name.to_string(),
        };
        let mut client = self.operations.clone();
        let request = self.metadata.request(request);
        match client.cancel_operation(request).await {
            Ok(_) => info!("cancelled job {}", name),
            Err(status) => warn!("failed to cancel job {}: {}", name, status),
        }
    }

    /// Stage every output of `result` below `root`.
    ///
    /// Blobs land in a `.reclient-<hex>` staging directory first and are
    /// renamed into place, so partially-downloaded outputs never alias
    /// final paths. Duplicated digests are copied so each output path owns
    /// an independent file.
    #[instrument(skip_all, fields(outputs = result.output_files.len()))]
    pub async fn download_outputs(
        &self,
        cas: &CasClient,
        result: &ActionResult,
        root: &Path,
    ) -> Result<(), Error> {
        // 1. Trees referenced by output directories.
        let tree_digests: HashSet<Digest> = result
            .output_directories
            .iter()
            .filter_map(|dir| dir.tree_digest.clone())
            .collect();
        let tree_digest_list: Vec<Digest> = tree_digests.into_iter().collect();
        let downloaded_trees = cas.download_blobs(&tree_digest_list).await?;
        check_download_results(&downloaded_trees)?;

        // 2. Deduplicate file digests across output files and tree nodes.
        let mut file_digests: HashSet<Digest> = HashSet::new();
        let mut duplicate_digests: HashSet<Digest> = HashSet::new();
        let mut directories: HashMap<Digest, Directory> = HashMap::new();
        let mut tree_roots: HashMap<Digest, Digest> = HashMap::new();

        let mut track = |digest: &Digest,
                         seen: &mut HashSet<Digest>,
                         duplicates: &mut HashSet<Digest>| {
            if !seen.insert(digest.clone()) {
                duplicates.insert(digest.clone());
            }
        };

        for file in &result.output_files {
            if let Some(digest) = &file.digest {
                if !file.contents.is_empty() {
                    continue; // Inlined; no download needed.
                }
                track(digest, &mut file_digests, &mut duplicate_digests);
            }
        }
        for dir in &result.output_directories {
            let tree_digest = dir
                .tree_digest
                .clone()
                .ok_or_else(|| Error::Execution("output directory without tree".to_string()))?;
            let blob = downloaded_trees
                .get(&tree_digest.hash)
                .map(|b| b.data.clone())
                .unwrap_or_default();
            let tree = Tree::decode(blob)
                .map_err(|_| Error::Execution("could not deserialize downloaded Tree".to_string()))?;
            let root_dir = tree.root.unwrap_or_default();
            let root_digest = add_directory(cas, &mut directories, root_dir);
            tree_roots.insert(tree_digest, root_digest);
            for child in tree.children {
                add_directory(cas, &mut directories, child);
            }
        }
        for directory in directories.values() {
            for node in &directory.files {
                if let Some(digest) = &node.digest {
                    track(digest, &mut file_digests, &mut duplicate_digests);
                }
            }
        }

        // 3./4. Stage all file blobs into a temporary directory, named by
        // hash.
        let staging_name = format!(".reclient-{}", fsutil::random_hex_string());
        let staging = root.join(&staging_name);
        tokio::fs::create_dir_all(&staging).await?;

        let file_digest_list: Vec<Digest> = file_digests.into_iter().collect();
        let downloaded_files = cas
            .download_blobs_to_directory(&file_digest_list, &staging)
            .await?;
        check_download_results(&downloaded_files)?;

        // 5. Output files: parents, mode, then an atomic rename.
        for file in &result.output_files {
            fsutil::ensure_parent_dirs(root, &file.path).await?;
            let final_path = root.join(&file.path);
            if !file.contents.is_empty() {
                tokio::fs::write(&final_path, &file.contents).await?;
                fsutil::set_output_mode(&final_path, file.is_executable).await?;
                continue;
            }
            let digest = file
                .digest
                .clone()
                .ok_or_else(|| Error::Execution("output file without digest".to_string()))?;
            stage_file(
                &staging,
                &digest,
                &final_path,
                file.is_executable,
                &duplicate_digests,
            )
            .await?;
        }

        // 6. Output symlinks.
        for symlink in &result.output_symlinks {
            fsutil::ensure_parent_dirs(root, &symlink.path).await?;
            tokio::fs::symlink(&symlink.target, root.join(&symlink.path)).await?;
        }

        // 7. Output directories, rebuilt from their trees.
        for dir in &result.output_directories {
            let tree_digest = dir.tree_digest.clone().unwrap_or_default();
            let root_digest = tree_roots
                .get(&tree_digest)
                .ok_or_else(|| Error::Execution("tree root digest missing".to_string()))?;
            fsutil::ensure_parent_dirs(root, &dir.path).await?;
            stage_directory(
                root.join(&dir.path),
                root_digest.clone(),
                &staging,
                &directories,
                &duplicate_digests,
            )
            .await?;
        }

        // 8. Drop the staging directory.
        tokio::fs::remove_dir_all(&staging).await?;
        Ok(())
    }
}

fn add_directory(
    cas: &CasClient,
    directories: &mut HashMap<Digest, Directory>,
    directory: Directory,
) -> Digest {
    let digest = cas.digest_function().digest_of(directory.encode_to_vec());
    directories.insert(digest.clone(), directory);
    digest
}

/// Missing blobs are reported together by hash; any other failure is fatal
/// on its own.
fn check_download_results(results: &HashMap<String, DownloadedBlob>) -> Result<(), Error> {
    let mut missing: Vec<String> = Vec::new();
    for (hash, blob) in results {
        match &blob.status {
            BlobStatus::Ok => {}
            BlobStatus::Missing => missing.push(hash.clone()),
            BlobStatus::Failed { code, message } => {
                return Err(Error::Execution(format!(
                    "failed to download output blob {}: [{}] {}",
                    hash, code, message
                )));
            }
        }
    }
    if !missing.is_empty() {
        missing.sort();
        return Err(nimbus_castore::Error::missing_blobs(missing).into());
    }
    Ok(())
}

/// Move a staged blob to its final location. Duplicated digests get copied
/// first so every use owns its bytes.
async fn stage_file(
    staging: &Path,
    digest: &Digest,
    final_path: &Path,
    executable: bool,
    duplicates: &HashSet<Digest>,
) -> Result<(), Error> {
    let mut staged = staging.join(&digest.hash);
    if duplicates.contains(digest) {
        let copy = staging.join(format!("{}{}", digest.hash, fsutil::random_hex_string()));
        tokio::fs::copy(&staged, &copy).await?;
        staged = copy;
    }
    fsutil::set_output_mode(&staged, executable).await?;
    tokio::fs::rename(&staged, final_path).await?;
    Ok(())
}

/// Rebuild an output directory from its (already downloaded) tree,
/// iteratively to keep the function non-recursive.
async fn stage_directory(
    target: PathBuf,
    root_digest: Digest,
    staging: &Path,
    directories: &HashMap<Digest, Directory>,
    duplicates: &HashSet<Digest>,
) -> Result<(), Error> {
    let mut queue: VecDeque<(PathBuf, Digest)> = VecDeque::new();
    queue.push_back((target, root_digest));
    while let Some((path, digest)) = queue.pop_front() {
        let directory = directories
            .get(&digest)
            .ok_or_else(|| Error::Execution("tree child directory missing".to_string()))?;
        tokio::fs::create_dir_all(&path).await?;
        for file in &directory.files {
            let file_digest = file
                .digest
                .clone()
                .ok_or_else(|| Error::Execution("tree file node without digest".to_string()))?;
            stage_file(
                staging,
                &file_digest,
                &path.join(&file.name),
                file.is_executable,
                duplicates,
            )
            .await?;
        }
        for symlink in &directory.symlinks {
            tokio::fs::symlink(&symlink.target, path.join(&symlink.name)).await?;
        }
        for subdir in &directory.directories {
            let subdir_digest = subdir.digest.clone().ok_or_else(|| {
                Error::Execution("tree directory node without digest".to_string())
            })?;
            queue.push_back((path.join(&subdir.name), subdir_digest));
        }
    }
    Ok(())
}

/// Unpack the ExecuteResponse embedded in a finished operation. A non-OK
/// embedded status is fatal; a message on a failing result is surfaced.
fn unpack_operation(operation: longrunning::Operation) -> Result<ActionResult, Error> {
    match operation.result {
        Some(longrunning::operation::Result::Error(status)) => Err(Error::Execution(format!(
            "operation failed: [{}] {}",
            status.code, status.message
        ))),
        Some(longrunning::operation::Result::Response(any)) => {
            if any.type_url != EXECUTE_RESPONSE_TYPE_URL {
                return Err(Error::Execution(format!(
                    "server returned invalid operation result: {}",
                    any.type_url
                )));
            }
            let response = ExecuteResponse::decode(any.value.as_slice())
                .map_err(|_| Error::Execution("operation response unpacking failed".to_string()))?;
            if let Some(status) = &response.status {
                if !status.is_ok() {
                    return Err(Error::Execution(format!(
                        "execution failed: [{}] {}",
                        status.code, status.message
                    )));
                }
            }
            let result = response
                .result
                .ok_or_else(|| Error::Execution("execute response without result".to_string()))?;
            if result.exit_code != 0 && !response.message.is_empty() {
                info!("remote execution message: {}", response.message);
            }
            Ok(result)
        }
        None => Err(Error::Execution(
            "operation finished without a result".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_reapi::proto::rpc;

    fn done_operation(response: ExecuteResponse) -> longrunning::Operation {
        longrunning::Operation {
            name: "op/1".to_string(),
            metadata: None,
            done: true,
            result: Some(longrunning::operation::Result::Response(prost_types::Any {
                type_url: EXECUTE_RESPONSE_TYPE_URL.to_string(),
                value: response.encode_to_vec(),
            })),
        }
    }

    #[test]
    fn ok_response_yields_the_action_result() {
        let response = ExecuteResponse {
            result: Some(ActionResult {
                exit_code: 3,
                ..Default::default()
            }),
            cached_result: false,
            status: Some(rpc::Status::default()),
            message: String::new(),
        };
        let result = unpack_operation(done_operation(response)).unwrap();
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn embedded_error_status_is_fatal() {
        let response = ExecuteResponse {
            result: Some(ActionResult::default()),
            cached_result: false,
            status: Some(rpc::Status {
                code: Code::Internal as i32,
                message: "boom".to_string(),
                details: vec![],
            }),
            message: String::new(),
        };
        let err = unpack_operation(done_operation(response)).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn operation_error_is_fatal() {
        let operation = longrunning::Operation {
            name: "op/2".to_string(),
            metadata: None,
            done: true,
            result: Some(longrunning::operation::Result::Error(rpc::Status {
                code: Code::Unavailable as i32,
                message: "worker lost".to_string(),
                details: vec![],
            })),
        };
        assert!(unpack_operation(operation).is_err());
    }

    #[test]
    fn unexpected_payload_type_is_fatal() {
        let operation = longrunning::Operation {
            name: "op/3".to_string(),
            metadata: None,
            done: true,
            result: Some(longrunning::operation::Result::Response(prost_types::Any {
                type_url: "type.googleapis.com/not.an.ExecuteResponse".to_string(),
                value: vec![],
            })),
        };
        assert!(unpack_operation(operation).is_err());
    }

    #[tokio::test]
    async fn duplicate_digests_stage_independent_copies() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join(".reclient-test");
        tokio::fs::create_dir_all(&staging).await.unwrap();

        let digest = Digest {
            hash: "aabb".to_string(),
            size_bytes: 4,
        };
        tokio::fs::write(staging.join(&digest.hash), b"obj!").await.unwrap();
        let mut duplicates = HashSet::new();
        duplicates.insert(digest.clone());

        let first = root.path().join("one.o");
        let second = root.path().join("two.o");
        stage_file(&staging, &digest, &first, true, &duplicates)
            .await
            .unwrap();
        stage_file(&staging, &digest, &second, false, &duplicates)
            .await
            .unwrap();

        // Byte-identical, independent files; executable iff declared.
        assert_eq!(tokio::fs::read(&first).await.unwrap(), b"obj!");
        assert_eq!(tokio::fs::read(&second).await.unwrap(), b"obj!");
        use std::os::unix::fs::PermissionsExt;
        let first_mode = std::fs::metadata(&first).unwrap().permissions().mode();
        let second_mode = std::fs::metadata(&second).unwrap().permissions().mode();
        assert_ne!(first_mode & 0o100, 0);
        assert_eq!(second_mode & 0o100, 0);
        // The shared staged blob is still there for further uses.
        assert!(staging.join(&digest.hash).exists());
    }

    #[test]
    fn missing_blobs_are_listed_together() {
        let mut results = HashMap::new();
        results.insert(
            "aa".to_string(),
            DownloadedBlob {
                status: BlobStatus::Missing,
                data: bytes::Bytes::new(),
            },
        );
        results.insert(
            "bb".to_string(),
            DownloadedBlob {
                status: BlobStatus::Missing,
                data: bytes::Bytes::new(),
            },
        );
        let err = check_download_results(&results).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("aa") && message.contains("bb"));
        assert!(message.contains('2'));
    }
}
