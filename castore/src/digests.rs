use data_encoding::HEXLOWER;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use nimbus_reapi::proto::Digest;

use crate::Error;

/// Files are hashed in chunks of this size.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// The hash family blobs are addressed with. SHA-256 unless the endpoint
/// was configured otherwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DigestFunction {
    Md5,
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestFunction {
    /// Start an incremental hashing context.
    pub fn context(&self) -> DigestContext {
        let inner = match self {
            DigestFunction::Md5 => Context::Md5(Md5::new()),
            DigestFunction::Sha1 => Context::Sha1(Sha1::new()),
            DigestFunction::Sha256 => Context::Sha256(Sha256::new()),
            DigestFunction::Sha384 => Context::Sha384(Sha384::new()),
            DigestFunction::Sha512 => Context::Sha512(Sha512::new()),
        };
        DigestContext { inner, size: 0 }
    }

    /// Hash a byte string in one go.
    pub fn digest_of(&self, data: impl AsRef<[u8]>) -> Digest {
        let mut ctx = self.context();
        ctx.update(data.as_ref());
        ctx.finalize()
    }

    /// Hash a file, reading from position zero in [HASH_CHUNK_SIZE] chunks.
    pub async fn digest_of_file(&self, file: &mut tokio::fs::File) -> Result<Digest, Error> {
        file.rewind().await?;
        let mut ctx = self.context();
        let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            ctx.update(&buffer[..n]);
        }
        Ok(ctx.finalize())
    }

    /// Hash the file at `path`.
    pub async fn digest_of_path(&self, path: &std::path::Path) -> Result<Digest, Error> {
        let mut file = tokio::fs::File::open(path).await?;
        self.digest_of_file(&mut file).await
    }
}

enum Context {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// An incremental hashing context. Finalizing consumes the context, so a
/// finalized digest can neither be updated nor finalized again.
pub struct DigestContext {
    inner: Context,
    size: u64,
}

impl DigestContext {
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Context::Md5(h) => h.update(data),
            Context::Sha1(h) => h.update(data),
            Context::Sha256(h) => h.update(data),
            Context::Sha384(h) => h.update(data),
            Context::Sha512(h) => h.update(data),
        }
        self.size += data.len() as u64;
    }

    pub fn finalize(self) -> Digest {
        let hash = match self.inner {
            Context::Md5(h) => HEXLOWER.encode(&h.finalize()),
            Context::Sha1(h) => HEXLOWER.encode(&h.finalize()),
            Context::Sha256(h) => HEXLOWER.encode(&h.finalize()),
            Context::Sha384(h) => HEXLOWER.encode(&h.finalize()),
            Context::Sha512(h) => HEXLOWER.encode(&h.finalize()),
        };
        Digest {
            hash,
            size_bytes: self.size as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_case::test_case;
    use tokio::io::AsyncSeekExt;

    #[test]
    fn empty_string_sha256() {
        let digest = DigestFunction::Sha256.digest_of(b"");
        assert_eq!(
            digest.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.size_bytes, 0);
    }

    #[test]
    fn abc_sha256() {
        let digest = DigestFunction::Sha256.digest_of(b"abc");
        assert_eq!(
            digest.hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest.size_bytes, 3);
    }

    #[test_case(DigestFunction::Md5, 32; "md5 is 16 bytes")]
    #[test_case(DigestFunction::Sha1, 40; "sha1 is 20 bytes")]
    #[test_case(DigestFunction::Sha256, 64; "sha256 is 32 bytes")]
    #[test_case(DigestFunction::Sha384, 96; "sha384 is 48 bytes")]
    #[test_case(DigestFunction::Sha512, 128; "sha512 is 64 bytes")]
    fn hex_width_per_family(function: DigestFunction, hex_len: usize) {
        let digest = function.digest_of(b"nimbus");
        assert_eq!(digest.hash.len(), hex_len);
        assert_eq!(digest.size_bytes, 6);
    }

    #[test]
    fn chunked_updates_match_one_shot() {
        let mut ctx = DigestFunction::Sha256.context();
        ctx.update(b"hello ");
        ctx.update(b"world");
        assert_eq!(ctx.finalize(), DigestFunction::Sha256.digest_of(b"hello world"));
    }

    #[tokio::test]
    async fn file_hash_reads_from_position_zero() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"some file contents").unwrap();

        let mut file = tokio::fs::File::open(tmp.path()).await.unwrap();
        // Move the cursor away; hashing must rewind first.
        file.seek(std::io::SeekFrom::Start(5)).await.unwrap();
        let digest = DigestFunction::Sha256
            .digest_of_file(&mut file)
            .await
            .unwrap();
        assert_eq!(digest, DigestFunction::Sha256.digest_of(b"some file contents"));
    }
}
