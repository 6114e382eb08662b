use tonic::transport::{Channel, Endpoint};
use url::Url;

/// Turn a `grpc://host:port` URL into a [Channel].
///
/// The remote endpoints nimbus talks to are declared with a `grpc://`
/// scheme, connecting over unencrypted HTTP/2 (h2c). By default the
/// connection is established lazily on first use; adding `wait-connect=1`
/// as a URL parameter connects eagerly and surfaces connection errors here.
pub async fn channel_from_url(url: &Url) -> Result<Channel, Error> {
    if url.scheme() != "grpc" {
        return Err(Error::UnsupportedScheme(url.scheme().to_string()));
    }
    if !url.path().is_empty() {
        return Err(Error::PathMayNotBeSet());
    }

    // Stringify the URL and swap the scheme for something tonic knows.
    let http_url_str = match url.to_string().strip_prefix("grpc://") {
        None => return Err(Error::UnsupportedScheme(url.scheme().to_string())),
        Some(rest) => format!("http://{}", rest),
    };

    let endpoint = Endpoint::try_from(http_url_str)?;
    if url_wants_wait_connect(url) {
        Ok(endpoint.connect().await?)
    } else {
        Ok(endpoint.connect_lazy())
    }
}

/// Turn a bare `host:port` address (the shared-build proxy convention) into
/// a lazily-connecting [Channel].
pub fn channel_from_addr(addr: &str) -> Result<Channel, Error> {
    let endpoint = Endpoint::try_from(format!("http://{}", addr))?;
    Ok(endpoint.connect_lazy())
}

fn url_wants_wait_connect(url: &Url) -> bool {
    url.query_pairs()
        .filter(|(k, v)| k == "wait-connect" && v == "1")
        .count()
        > 0
}

/// Errors occuring when trying to connect to a backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("path may not be set")]
    PathMayNotBeSet(),

    #[error("transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),
}

#[cfg(test)]
mod tests {
    use super::{channel_from_addr, channel_from_url};
    use test_case::test_case;
    use url::Url;

    /// Correct scheme to connect to localhost, with port 12345.
    #[test_case("grpc://[::1]:12345", true; "grpc valid IPv6 localhost port 12345")]
    /// Correct scheme to connect to localhost, without specifying a port.
    #[test_case("grpc://localhost", true; "grpc valid host without port")]
    /// Correct scheme, but with an additional path, which is invalid.
    #[test_case("grpc://localhost/some-path", false; "grpc invalid host and path")]
    /// Connecting with wait-connect set to 0 succeeds, as that's the default.
    #[test_case("grpc://localhost?wait-connect=0", true; "grpc valid host wait-connect=0")]
    /// Connecting with wait-connect set to 1 fails, as the host doesn't exist.
    #[test_case("grpc://nonexist.invalid?wait-connect=1", false; "grpc valid host wait-connect=1")]
    /// https is not how these endpoints are declared.
    #[test_case("https://localhost", false; "https scheme rejected")]
    #[tokio::test]
    async fn test_channel_from_url(uri_str: &str, is_ok: bool) {
        let url = Url::parse(uri_str).expect("must parse");
        assert_eq!(channel_from_url(&url).await.is_ok(), is_ok);
    }

    #[tokio::test]
    async fn test_channel_from_addr() {
        assert!(channel_from_addr("127.0.0.1:8012").is_ok());
    }
}
