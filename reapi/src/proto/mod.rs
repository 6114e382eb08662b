//! Wire types for the services nimbus speaks to.
//!
//! The message structs mirror the upstream `.proto` definitions field for
//! field (tags included), but are written by hand with prost derives so the
//! build does not depend on protoc. Only the fields we actually touch are
//! declared; prost skips unknown fields on decode, so this stays compatible
//! with full servers.

pub mod bytestream;
pub mod longrunning;
pub mod proxy;
pub mod rpc;

mod rexec;

pub use bytestream::ByteStreamClient;
pub use longrunning::OperationsClient;
pub use rexec::*;

use std::cmp::Ordering;
use std::fmt;

impl Digest {
    /// The canonical `<hash>/<size>` rendering used in resource names,
    /// request metadata and diagnostics.
    pub fn to_display_string(&self) -> String {
        format!("{}/{}", self.hash, self.size_bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl Eq for Digest {}

impl std::hash::Hash for Digest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.size_bytes.hash(state);
    }
}

/// Total order on (hash, size), size as tiebreaker. Used for deterministic
/// batching.
impl Ord for Digest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then(self.size_bytes.cmp(&other.size_bytes))
    }
}

impl PartialOrd for Digest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::Digest;

    fn digest(hash: &str, size: i64) -> Digest {
        Digest {
            hash: hash.to_string(),
            size_bytes: size,
        }
    }

    #[test]
    fn display_is_hash_slash_size() {
        assert_eq!(digest("abcd", 42).to_string(), "abcd/42");
    }

    #[test]
    fn ordering_is_hash_then_size() {
        let mut digests = vec![digest("bb", 1), digest("aa", 2), digest("aa", 1)];
        digests.sort();
        assert_eq!(
            digests,
            vec![digest("aa", 1), digest("aa", 2), digest("bb", 1)]
        );
    }

    #[test]
    fn equality_is_on_both_fields() {
        assert_eq!(digest("aa", 1), digest("aa", 1));
        assert_ne!(digest("aa", 1), digest("aa", 2));
        assert_ne!(digest("aa", 1), digest("ab", 1));
    }
}
