//! `google.bytestream`, used for blobs too large for the batch RPCs.

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadRequest {
    #[prost(string, tag = "1")]
    pub resource_name: String,
    #[prost(int64, tag = "2")]
    pub read_offset: i64,
    #[prost(int64, tag = "3")]
    pub read_limit: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadResponse {
    #[prost(bytes = "bytes", tag = "10")]
    pub data: ::bytes::Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequest {
    #[prost(string, tag = "1")]
    pub resource_name: String,
    #[prost(int64, tag = "2")]
    pub write_offset: i64,
    #[prost(bool, tag = "3")]
    pub finish_write: bool,
    #[prost(bytes = "bytes", tag = "10")]
    pub data: ::bytes::Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteResponse {
    #[prost(int64, tag = "1")]
    pub committed_size: i64,
}

#[derive(Clone)]
pub struct ByteStreamClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ByteStreamClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn read(
        &mut self,
        request: impl tonic::IntoRequest<ReadRequest>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<ReadResponse>>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unknown(format!("Service was not ready: {}", e))
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/google.bytestream.ByteStream/Read");
        self.inner
            .server_streaming(request.into_request(), path, codec)
            .await
    }

    pub async fn write(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = WriteRequest>,
    ) -> Result<tonic::Response<WriteResponse>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unknown(format!("Service was not ready: {}", e))
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/google.bytestream.ByteStream/Write");
        self.inner
            .client_streaming(request.into_streaming_request(), path, codec)
            .await
    }
}
