//! The shared-build proxy protocol: a peer-to-peer delegation service
//! distinct from REAPI. One proxy fronts a set of workers; the build driver
//! initializes a build environment on it, forwards individual edge commands,
//! and tears the environment down at the end of the build.

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Project {
    /// IPv4 address of the driver host, used by workers to fetch sources.
    #[prost(string, tag = "1")]
    pub ninja_host: String,
    /// Directory the build is driven from.
    #[prost(string, tag = "2")]
    pub ninja_dir: String,
    #[prost(string, tag = "3")]
    pub root_dir: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProxyCode {
    Ok = 0,
    Error = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusDetail {
    #[prost(enumeration = "ProxyCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializeBuildEnvRequest {
    #[prost(message, optional, tag = "1")]
    pub project: Option<Project>,
    #[prost(string, tag = "2")]
    pub container_image: String,
    #[prost(int32, tag = "3")]
    pub worker_num: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializeBuildEnvResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<StatusDetail>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearBuildEnvRequest {
    #[prost(message, optional, tag = "1")]
    pub project: Option<Project>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearBuildEnvResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<StatusDetail>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ForwardAndExecuteRequest {
    #[prost(message, optional, tag = "1")]
    pub project: Option<Project>,
    #[prost(string, tag = "2")]
    pub cmd_id: String,
    #[prost(string, tag = "3")]
    pub cmd_content: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ForwardAndExecuteResponse {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, optional, tag = "2")]
    pub status: Option<StatusDetail>,
    #[prost(string, tag = "3")]
    pub std_out: String,
    #[prost(string, tag = "4")]
    pub std_err: String,
}

#[derive(Clone)]
pub struct ShareBuildProxyClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ShareBuildProxyClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn initialize_build_env(
        &mut self,
        request: impl tonic::IntoRequest<InitializeBuildEnvRequest>,
    ) -> Result<tonic::Response<InitializeBuildEnvResponse>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unknown(format!("Service was not ready: {}", e))
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/api.ShareBuildProxy/InitializeBuildEnv");
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn clear_build_env(
        &mut self,
        request: impl tonic::IntoRequest<ClearBuildEnvRequest>,
    ) -> Result<tonic::Response<ClearBuildEnvResponse>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unknown(format!("Service was not ready: {}", e))
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/api.ShareBuildProxy/ClearBuildEnv");
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn forward_and_execute(
        &mut self,
        request: impl tonic::IntoRequest<ForwardAndExecuteRequest>,
    ) -> Result<tonic::Response<ForwardAndExecuteResponse>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unknown(format!("Service was not ready: {}", e))
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/api.ShareBuildProxy/ForwardAndExecute");
        self.inner.unary(request.into_request(), path, codec).await
    }
}
