//! CAS client: moves blobs between the local tree and the remote store.
//!
//! Small blobs travel through the batch RPCs, everything else through the
//! byte-stream API. Every byte that crosses the wire is re-hashed and
//! checked against its stated digest; a mismatch is fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tonic::transport::Channel;
use tracing::instrument;

use nimbus_reapi::proto::{
    batch_update_blobs_request, bytestream, BatchReadBlobsRequest, BatchUpdateBlobsRequest,
    ByteStreamClient, ContentAddressableStorageClient, Digest, FindMissingBlobsRequest,
};
use nimbus_reapi::{MetadataInjector, Retrier};

use crate::{DigestFunction, Error};

/// Payload cap per byte-stream message. The default gRPC message limit is
/// 4 MiB; 1 MiB leaves ample headroom for metadata.
const BYTESTREAM_CHUNK_SIZE: usize = 1024 * 1024;

/// Slack subtracted from the receive limit for response metadata.
const MAX_METADATA_SIZE: usize = 1 << 16;

/// The default gRPC max receive message length.
const GRPC_DEFAULT_MAX_RECV: usize = 4 * 1024 * 1024;

/// Estimated encoded size of a batch request/response shell.
const BATCH_TOP_LEVEL_OVERHEAD: usize = 256;

/// Estimated per-blob metadata (digest, status) inside a batch.
const BLOB_METADATA_SIZE: usize = 256;

/// One blob to upload: its stated digest plus where the bytes come from.
pub struct UploadRequest {
    pub digest: Digest,
    pub source: UploadSource,
}

pub enum UploadSource {
    Bytes(Bytes),
    File(PathBuf),
}

impl UploadRequest {
    pub fn from_bytes(digest: Digest, data: impl Into<Bytes>) -> Self {
        UploadRequest {
            digest,
            source: UploadSource::Bytes(data.into()),
        }
    }

    pub fn from_path(digest: Digest, path: impl Into<PathBuf>) -> Self {
        UploadRequest {
            digest,
            source: UploadSource::File(path.into()),
        }
    }
}

/// Per-blob outcome of a bulk download.
#[derive(Clone, Debug, PartialEq)]
pub enum BlobStatus {
    Ok,
    Missing,
    Failed { code: i32, message: String },
}

#[derive(Clone, Debug)]
pub struct DownloadedBlob {
    pub status: BlobStatus,
    /// Blob bytes for in-memory downloads; empty when downloading into a
    /// directory (the file is named after the hex hash there).
    pub data: Bytes,
}

#[derive(Clone)]
pub struct CasClient {
    bytestream: ByteStreamClient,
    cas: ContentAddressableStorageClient,
    retrier: Retrier,
    metadata: MetadataInjector,
    instance_name: String,
    /// Generated once per client, names every byte-stream upload.
    uuid: String,
    digest_function: DigestFunction,
    max_batch_total_size: usize,
}

impl CasClient {
    pub fn new(
        channel: Channel,
        instance_name: String,
        digest_function: DigestFunction,
        retrier: Retrier,
        metadata: MetadataInjector,
    ) -> Self {
        Self {
            bytestream: ByteStreamClient::new(channel.clone()),
            cas: ContentAddressableStorageClient::new(channel),
            retrier,
            metadata,
            instance_name,
            uuid: uuid::Uuid::new_v4().to_string(),
            digest_function,
            max_batch_total_size: GRPC_DEFAULT_MAX_RECV - MAX_METADATA_SIZE,
        }
    }

    pub fn digest_function(&self) -> DigestFunction {
        self.digest_function
    }

    /// `[instance/]uploads/<uuid>/blobs/<hash>/<size>` for uploads,
    /// `[instance/]blobs/<hash>/<size>` for reads.
    fn resource_name(&self, digest: &Digest, is_upload: bool) -> String {
        let mut name = String::new();
        if !self.instance_name.is_empty() {
            name.push_str(&self.instance_name);
            name.push('/');
        }
        if is_upload {
            name.push_str("uploads/");
            name.push_str(&self.uuid);
            name.push('/');
        }
        name.push_str("blobs/");
        name.push_str(&digest.hash);
        name.push('/');
        name.push_str(&digest.size_bytes.to_string());
        name
    }

    /// Fetch a single blob into memory over the byte-stream API, resuming
    /// from the last received byte if an attempt fails midway.
    #[instrument(skip(self), fields(digest = %digest))]
    pub async fn fetch_blob(&self, digest: &Digest) -> Result<Bytes, Error> {
        let resource_name = self.resource_name(digest, false);
        let state = Arc::new(tokio::sync::Mutex::new((
            Some(self.digest_function.context()),
            BytesMut::with_capacity(digest.size_bytes.max(0) as usize),
        )));

        self.retrier
            .issue("ByteStream.Read()", || {
                let mut client = self.bytestream.clone();
                let metadata = self.metadata.clone();
                let resource_name = resource_name.clone();
                let state = state.clone();
                async move {
                    let mut state = state.lock().await;
                    let request = metadata.request(bytestream::ReadRequest {
                        resource_name,
                        read_offset: state.1.len() as i64,
                        read_limit: 0,
                    });
                    let mut stream = client.read(request).await?.into_inner();
                    while let Some(response) = stream.message().await? {
                        if let Some(ctx) = state.0.as_mut() {
                            ctx.update(&response.data);
                        }
                        state.1.extend_from_slice(&response.data);
                    }
                    Ok(())
                }
            })
            .await?;

        let (ctx, data) = Arc::try_unwrap(state)
            .map_err(|_| Error::Storage("download state still shared".to_string()))?
            .into_inner();
        let data = data.freeze();
        if data.len() as i64 != digest.size_bytes {
            return Err(Error::SizeMismatch {
                expected: digest.size_bytes,
                actual: data.len() as i64,
            });
        }
        let actual = ctx
            .ok_or_else(|| Error::Storage("digest context consumed".to_string()))?
            .finalize();
        if actual != *digest {
            return Err(Error::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }
        Ok(data)
    }

    /// Download a single blob into `path`, resuming on retry from the bytes
    /// already written.
    #[instrument(skip(self, path), fields(digest = %digest))]
    pub async fn download_to_path(&self, digest: &Digest, path: &Path) -> Result<(), Error> {
        let resource_name = self.resource_name(digest, false);
        let file = tokio::fs::File::create(path).await?;
        let state = Arc::new(tokio::sync::Mutex::new((
            Some(self.digest_function.context()),
            file,
            0i64,
        )));

        self.retrier
            .issue("ByteStream.Read()", || {
                let mut client = self.bytestream.clone();
                let metadata = self.metadata.clone();
                let resource_name = resource_name.clone();
                let state = state.clone();
                async move {
                    let mut state = state.lock().await;
                    let request = metadata.request(bytestream::ReadRequest {
                        resource_name,
                        read_offset: state.2,
                        read_limit: 0,
                    });
                    let mut stream = client.read(request).await?.into_inner();
                    while let Some(response) = stream.message().await? {
                        let (ctx, file, written) = &mut *state;
                        if let Some(ctx) = ctx.as_mut() {
                            ctx.update(&response.data);
                        }
                        file.write_all(&response.data).await.map_err(|e| {
                            tonic::Status::internal(format!("write failed: {}", e))
                        })?;
                        *written += response.data.len() as i64;
                    }
                    Ok(())
                }
            })
            .await?;

        let (ctx, mut file, written) = Arc::try_unwrap(state)
            .map_err(|_| Error::Storage("download state still shared".to_string()))?
            .into_inner();
        file.flush().await?;
        if written != digest.size_bytes {
            return Err(Error::SizeMismatch {
                expected: digest.size_bytes,
                actual: written,
            });
        }
        let actual = ctx
            .ok_or_else(|| Error::Storage("digest context consumed".to_string()))?
            .finalize();
        if actual != *digest {
            return Err(Error::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Upload one in-memory blob over the byte-stream API.
    #[instrument(skip(self, data), fields(digest = %digest))]
    pub async fn upload_blob(&self, digest: &Digest, data: Bytes) -> Result<(), Error> {
        if data.len() as i64 != digest.size_bytes {
            return Err(Error::SizeMismatch {
                expected: digest.size_bytes,
                actual: data.len() as i64,
            });
        }
        let resource_name = self.resource_name(digest, true);
        let response = self
            .retrier
            .issue("ByteStream.Write()", || {
                let mut client = self.bytestream.clone();
                let metadata = self.metadata.clone();
                let requests = write_requests(&resource_name, data.clone());
                let mut request = tonic::Request::new(futures::stream::iter(requests));
                metadata.attach(request.metadata_mut());
                async move { Ok(client.write(request).await?.into_inner()) }
            })
            .await?;
        if response.committed_size != digest.size_bytes {
            return Err(Error::ShortWrite {
                hash: digest.hash.clone(),
                expected: digest.size_bytes,
                committed: response.committed_size,
            });
        }
        Ok(())
    }

    /// Upload a file over the byte-stream API, streaming it from disk in
    /// 1 MiB chunks.
    #[instrument(skip(self, path), fields(digest = %digest))]
    pub async fn upload_file(&self, digest: &Digest, path: &Path) -> Result<(), Error> {
        let resource_name = self.resource_name(digest, true);
        let expected_size = digest.size_bytes;
        let response = self
            .retrier
            .issue("ByteStream.Write()", || {
                let mut client = self.bytestream.clone();
                let metadata = self.metadata.clone();
                let resource_name = resource_name.clone();
                let path = path.to_path_buf();
                async move {
                    let mut file = tokio::fs::File::open(&path)
                        .await
                        .map_err(|e| tonic::Status::internal(format!("open failed: {}", e)))?;
                    file.rewind()
                        .await
                        .map_err(|e| tonic::Status::internal(format!("seek failed: {}", e)))?;
                    let stream = async_stream::stream! {
                        let mut file = file;
                        let mut offset: i64 = 0;
                        loop {
                            let mut buffer = BytesMut::zeroed(BYTESTREAM_CHUNK_SIZE);
                            let n = match file.read(&mut buffer).await {
                                Ok(n) => n,
                                // The stream cannot carry the error; a short
                                // upload is caught by the committed-size
                                // check.
                                Err(_) => break,
                            };
                            buffer.truncate(n);
                            let last_chunk = offset + n as i64 >= expected_size || n == 0;
                            yield bytestream::WriteRequest {
                                resource_name: resource_name.clone(),
                                write_offset: offset,
                                finish_write: last_chunk,
                                data: buffer.freeze(),
                            };
                            offset += n as i64;
                            if last_chunk {
                                break;
                            }
                        }
                    };
                    let mut request = tonic::Request::new(Box::pin(stream));
                    metadata.attach(request.metadata_mut());
                    Ok(client.write(request).await?.into_inner())
                }
            })
            .await?;
        if response.committed_size != digest.size_bytes {
            return Err(Error::ShortWrite {
                hash: digest.hash.clone(),
                expected: digest.size_bytes,
                committed: response.committed_size,
            });
        }
        Ok(())
    }

    /// Ask the CAS which of `digests` it does not have yet. The list is
    /// split across requests so no single message exceeds the chunk budget.
    #[instrument(skip_all, fields(digests = digests.len()))]
    pub async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, Error> {
        let mut requests: Vec<FindMissingBlobsRequest> = Vec::new();
        let mut current = FindMissingBlobsRequest {
            instance_name: self.instance_name.clone(),
            blob_digests: vec![],
        };
        let mut batch_size = 0usize;
        for digest in digests {
            let digest_size = digest.encoded_len();
            if batch_size + digest_size > BYTESTREAM_CHUNK_SIZE {
                requests.push(current.clone());
                current.blob_digests.clear();
                batch_size = 0;
            } else {
                batch_size += digest_size;
            }
            current.blob_digests.push(digest.clone());
        }
        requests.push(current);

        let mut missing = Vec::new();
        for request in requests {
            let response = self
                .retrier
                .issue("FindMissingBlobs()", || {
                    let mut client = self.cas.clone();
                    let request = self.metadata.request(request.clone());
                    async move { Ok(client.find_missing_blobs(request).await?.into_inner()) }
                })
                .await?;
            missing.extend(response.missing_blob_digests);
        }
        Ok(missing)
    }

    /// Upload a set of blobs: batched greedily in ascending size order,
    /// with everything over the per-batch budget falling back to the
    /// byte-stream API.
    #[instrument(skip_all, fields(blobs = requests.len()))]
    pub async fn upload_blobs(&self, mut requests: Vec<UploadRequest>) -> Result<(), Error> {
        requests.sort_by(|a, b| a.digest.size_bytes.cmp(&b.digest.size_bytes));
        let sizes: Vec<i64> = requests.iter().map(|r| r.digest.size_bytes).collect();
        let batches = plan_batches(&sizes, self.max_batch_size());

        for (start, end) in &batches {
            self.batch_upload(&requests[*start..*end]).await?;
        }

        // Everything past the last batch is too large for batching.
        let batch_end = batches.last().map(|(_, end)| *end).unwrap_or(0);
        for request in &requests[batch_end..] {
            match &request.source {
                UploadSource::Bytes(data) => {
                    self.upload_blob(&request.digest, data.clone()).await?
                }
                UploadSource::File(path) => self.upload_file(&request.digest, path).await?,
            }
        }
        Ok(())
    }

    async fn batch_upload(&self, requests: &[UploadRequest]) -> Result<(), Error> {
        let mut batch = BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone(),
            requests: Vec::with_capacity(requests.len()),
        };
        for request in requests {
            let data = match &request.source {
                UploadSource::Bytes(data) => data.clone(),
                UploadSource::File(path) => tokio::fs::read(path).await?.into(),
            };
            batch.requests.push(batch_update_blobs_request::Request {
                digest: Some(request.digest.clone()),
                data,
            });
        }
        let response = self
            .retrier
            .issue("BatchUpdateBlobs()", || {
                let mut client = self.cas.clone();
                let request = self.metadata.request(batch.clone());
                async move { Ok(client.batch_update_blobs(request).await?.into_inner()) }
            })
            .await?;
        for entry in response.responses {
            if let Some(status) = entry.status {
                if !status.is_ok() {
                    return Err(Error::Storage(format!(
                        "failed to upload blob {}: [{}] {}",
                        entry.digest.map(|d| d.hash).unwrap_or_default(),
                        status.code,
                        status.message
                    )));
                }
            }
        }
        Ok(())
    }

    /// Download a set of blobs into memory, keyed by hash.
    pub async fn download_blobs(
        &self,
        digests: &[Digest],
    ) -> Result<HashMap<String, DownloadedBlob>, Error> {
        self.download_blobs_inner(digests, None).await
    }

    /// Download a set of blobs into `dir`, one file per blob named after its
    /// hex hash.
    pub async fn download_blobs_to_directory(
        &self,
        digests: &[Digest],
        dir: &Path,
    ) -> Result<HashMap<String, DownloadedBlob>, Error> {
        self.download_blobs_inner(digests, Some(dir)).await
    }

    #[instrument(skip_all, fields(blobs = digests.len()))]
    async fn download_blobs_inner(
        &self,
        digests: &[Digest],
        dir: Option<&Path>,
    ) -> Result<HashMap<String, DownloadedBlob>, Error> {
        let mut sorted: Vec<Digest> = digests.to_vec();
        sorted.sort_by(|a, b| a.size_bytes.cmp(&b.size_bytes));
        let sizes: Vec<i64> = sorted.iter().map(|d| d.size_bytes).collect();
        let batches = plan_batches(&sizes, self.max_batch_size());

        let mut results = HashMap::new();
        for (start, end) in &batches {
            self.batch_download(&sorted[*start..*end], dir, &mut results)
                .await?;
        }

        // Tail blobs go through the byte-stream API one by one.
        let batch_end = batches.last().map(|(_, end)| *end).unwrap_or(0);
        for digest in &sorted[batch_end..] {
            let data = match dir {
                None => self.fetch_blob(digest).await?,
                Some(dir) => {
                    // Write straight into the target file to avoid holding
                    // large blobs in memory.
                    self.download_to_path(digest, &dir.join(&digest.hash))
                        .await?;
                    Bytes::new()
                }
            };
            results.insert(
                digest.hash.clone(),
                DownloadedBlob {
                    status: BlobStatus::Ok,
                    data,
                },
            );
        }
        Ok(results)
    }

    async fn batch_download(
        &self,
        digests: &[Digest],
        dir: Option<&Path>,
        results: &mut HashMap<String, DownloadedBlob>,
    ) -> Result<(), Error> {
        let request = BatchReadBlobsRequest {
            instance_name: self.instance_name.clone(),
            digests: digests.to_vec(),
        };
        let response = self
            .retrier
            .issue("BatchReadBlobs()", || {
                let mut client = self.cas.clone();
                let request = self.metadata.request(request.clone());
                async move { Ok(client.batch_read_blobs(request).await?.into_inner()) }
            })
            .await?;

        for entry in response.responses {
            let digest = entry.digest.unwrap_or_default();
            let status = entry.status.unwrap_or_default();
            if !status.is_ok() {
                let blob_status = if status.code == tonic::Code::NotFound as i32 {
                    BlobStatus::Missing
                } else {
                    BlobStatus::Failed {
                        code: status.code,
                        message: status.message,
                    }
                };
                results.insert(
                    digest.hash.clone(),
                    DownloadedBlob {
                        status: blob_status,
                        data: Bytes::new(),
                    },
                );
                continue;
            }
            let actual = self.digest_function.digest_of(&entry.data);
            if actual != digest {
                return Err(Error::DigestMismatch {
                    expected: digest,
                    actual,
                });
            }
            let data = match dir {
                None => entry.data,
                Some(dir) => {
                    tokio::fs::write(dir.join(&digest.hash), &entry.data).await?;
                    Bytes::new()
                }
            };
            results.insert(
                digest.hash.clone(),
                DownloadedBlob {
                    status: BlobStatus::Ok,
                    data,
                },
            );
        }
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_total_size - BATCH_TOP_LEVEL_OVERHEAD
    }
}

/// Split `data` into byte-stream write requests of at most
/// [BYTESTREAM_CHUNK_SIZE] bytes. The final request carries `finish_write`;
/// a zero-byte blob yields exactly one (empty, finishing) request.
fn write_requests(resource_name: &str, data: Bytes) -> Vec<bytestream::WriteRequest> {
    let mut requests = Vec::new();
    let mut offset = 0usize;
    loop {
        let chunk_len = BYTESTREAM_CHUNK_SIZE.min(data.len() - offset);
        let last_chunk = offset + chunk_len == data.len();
        requests.push(bytestream::WriteRequest {
            resource_name: resource_name.to_string(),
            write_offset: offset as i64,
            finish_write: last_chunk,
            data: data.slice(offset..offset + chunk_len),
        });
        offset += chunk_len;
        if last_chunk {
            break;
        }
    }
    requests
}

/// Greedily group (ascending-size-sorted) blobs into batches.
///
/// Each blob contributes its size plus [BLOB_METADATA_SIZE]; a batch never
/// exceeds `max_batch_size`. The first blob too large to ever fit ends the
/// planning: it and everything after it must use the byte-stream API.
fn plan_batches(sizes: &[i64], max_batch_size: usize) -> Vec<(usize, usize)> {
    let mut batches = Vec::new();
    let mut batch_start = 0usize;
    let mut batch_end = 0usize;
    while batch_end < sizes.len() {
        if sizes[batch_end] > (max_batch_size - BLOB_METADATA_SIZE) as i64 {
            // All blobs from here on are larger than a batch can carry.
            return batches;
        }
        let mut bytes_in_batch = 0usize;
        while batch_end < sizes.len()
            && sizes[batch_end] <= (max_batch_size - bytes_in_batch - BLOB_METADATA_SIZE) as i64
        {
            bytes_in_batch += sizes[batch_end] as usize + BLOB_METADATA_SIZE;
            batch_end += 1;
        }
        batches.push((batch_start, batch_end));
        batch_start = batch_end;
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = GRPC_DEFAULT_MAX_RECV - MAX_METADATA_SIZE - BATCH_TOP_LEVEL_OVERHEAD;

    #[test]
    fn chunking_covers_all_bytes_in_order() {
        let data = Bytes::from(vec![7u8; BYTESTREAM_CHUNK_SIZE * 2 + 10]);
        let requests = write_requests("res", data.clone());
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].write_offset, 0);
        assert_eq!(requests[1].write_offset, BYTESTREAM_CHUNK_SIZE as i64);
        assert_eq!(requests[2].data.len(), 10);
        assert!(requests[2].finish_write);
        assert!(requests[..2].iter().all(|r| !r.finish_write));
        let total: usize = requests.iter().map(|r| r.data.len()).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn zero_byte_blob_yields_one_finishing_request() {
        let requests = write_requests("res", Bytes::new());
        assert_eq!(requests.len(), 1);
        assert!(requests[0].finish_write);
        assert!(requests[0].data.is_empty());
    }

    #[test]
    fn exact_chunk_multiple_has_no_empty_tail() {
        let data = Bytes::from(vec![1u8; BYTESTREAM_CHUNK_SIZE]);
        let requests = write_requests("res", data);
        assert_eq!(requests.len(), 1);
        assert!(requests[0].finish_write);
    }

    #[test]
    fn small_blobs_form_one_batch() {
        let sizes = vec![1, 2, 3, 4];
        assert_eq!(plan_batches(&sizes, MAX), vec![(0, 4)]);
    }

    #[test]
    fn batches_respect_the_budget() {
        // Two blobs that almost fill a batch each.
        let big = (MAX - BLOB_METADATA_SIZE - 1) as i64;
        let sizes = vec![big, big];
        assert_eq!(plan_batches(&sizes, MAX), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn batch_content_obeys_size_invariant() {
        let sizes: Vec<i64> = (0..100).map(|i| (i * 37_000) as i64).collect();
        for (start, end) in plan_batches(&sizes, MAX) {
            let total: usize = sizes[start..end]
                .iter()
                .map(|s| *s as usize + BLOB_METADATA_SIZE)
                .sum();
            assert!(total <= MAX, "batch [{start}, {end}) exceeds budget");
        }
    }

    #[test]
    fn oversized_blob_defers_tail_to_bytestream() {
        let huge = (MAX + 1) as i64;
        let sizes = vec![1, 2, huge, huge];
        // Planning stops at the first oversized blob; the tail is the
        // byte-stream fallback.
        assert_eq!(plan_batches(&sizes, MAX), vec![(0, 2)]);
    }

    #[test]
    fn empty_input_plans_nothing() {
        assert_eq!(plan_batches(&[], MAX), Vec::<(usize, usize)>::new());
    }

    #[tokio::test]
    async fn resource_names_follow_the_scheme() {
        let retrier = Retrier::new(
            nimbus_reapi::RetryPolicy::default(),
            tokio_util::sync::CancellationToken::new(),
        );
        let metadata = MetadataInjector::new("nimbus", "test", "a/1", "host:1", "");
        let channel =
            tonic::transport::Endpoint::from_static("http://localhost:9").connect_lazy();
        let client = CasClient::new(
            channel,
            "inst".to_string(),
            DigestFunction::Sha256,
            retrier,
            metadata,
        );
        let digest = Digest {
            hash: "abcd".to_string(),
            size_bytes: 5,
        };
        assert_eq!(
            client.resource_name(&digest, false),
            "inst/blobs/abcd/5"
        );
        let upload_name = client.resource_name(&digest, true);
        assert!(upload_name.starts_with("inst/uploads/"));
        assert!(upload_name.ends_with("/blobs/abcd/5"));
    }
}
