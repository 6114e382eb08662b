//! `google.longrunning` operations, as returned by the streaming Execute RPC.

use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Operation {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<::prost_types::Any>,
    #[prost(bool, tag = "3")]
    pub done: bool,
    #[prost(oneof = "operation::Result", tags = "4, 5")]
    pub result: Option<operation::Result>,
}

pub mod operation {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "4")]
        Error(super::super::rpc::Status),
        #[prost(message, tag = "5")]
        Response(::prost_types::Any),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelOperationRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

/// Client for `google.longrunning.Operations`. Only the cancellation RPC is
/// used here; it is issued best-effort when the stop token fires mid-execute.
#[derive(Clone)]
pub struct OperationsClient {
    inner: tonic::client::Grpc<Channel>,
}

impl OperationsClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn cancel_operation(
        &mut self,
        request: impl tonic::IntoRequest<CancelOperationRequest>,
    ) -> Result<tonic::Response<()>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::unknown(format!("Service was not ready: {}", e))
        })?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/google.longrunning.Operations/CancelOperation");
        self.inner
            .unary(request.into_request(), path, codec)
            .await
    }
}
