//! The `google.rpc` status types carried inside responses and error details.

/// `google.rpc.Status`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<::prost_types::Any>,
}

/// `google.rpc.RetryInfo`, found in the error details of a failed RPC when
/// the server wants to dictate the retry delay.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetryInfo {
    #[prost(message, optional, tag = "1")]
    pub retry_delay: Option<::prost_types::Duration>,
}

pub const RETRY_INFO_TYPE_URL: &str = "type.googleapis.com/google.rpc.RetryInfo";

impl Status {
    pub fn is_ok(&self) -> bool {
        self.code == tonic::Code::Ok as i32
    }
}
