use prost::Message;
use tonic::metadata::{MetadataMap, MetadataValue};

use crate::proto::{RequestMetadata, ToolDetails};

/// The binary metadata header every REAPI RPC carries.
pub const HEADER_NAME: &str = "build.bazel.remote.execution.v2.requestmetadata-bin";

/// Attaches a serialized [RequestMetadata] to outgoing requests.
///
/// Constructed once per action: the action id is the display form of the
/// action digest, the tool invocation id is `<hostname>:<parent-pid>`.
#[derive(Clone)]
pub struct MetadataInjector {
    encoded: bytes::Bytes,
}

impl MetadataInjector {
    pub fn new(
        tool_name: &str,
        tool_version: &str,
        action_id: &str,
        tool_invocation_id: &str,
        correlated_invocations_id: &str,
    ) -> Self {
        let metadata = RequestMetadata {
            tool_details: Some(ToolDetails {
                tool_name: tool_name.to_string(),
                tool_version: tool_version.to_string(),
            }),
            action_id: action_id.to_string(),
            tool_invocation_id: tool_invocation_id.to_string(),
            correlated_invocations_id: correlated_invocations_id.to_string(),
        };
        Self {
            encoded: metadata.encode_to_vec().into(),
        }
    }

    /// Insert the header into a request's metadata map.
    pub fn attach(&self, metadata: &mut MetadataMap) {
        metadata.insert_bin(HEADER_NAME, MetadataValue::from_bytes(&self.encoded));
    }

    /// Build a [tonic::Request] with the header already attached.
    pub fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        self.attach(request.metadata_mut());
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let injector = MetadataInjector::new("nimbus", "0.1.0", "abc/3", "host:42", "");
        let request = injector.request(());
        let value = request
            .metadata()
            .get_bin(HEADER_NAME)
            .expect("header must be present");
        let decoded =
            RequestMetadata::decode(value.to_bytes().unwrap().as_ref()).expect("must decode");
        assert_eq!(decoded.action_id, "abc/3");
        assert_eq!(decoded.tool_invocation_id, "host:42");
        assert_eq!(decoded.tool_details.unwrap().tool_name, "nimbus");
    }
}
