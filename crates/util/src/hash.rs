//! Streamed file hashing.
//! Artifact integrity everywhere in weir is a sha256 over file contents,
//! computed in fixed-size chunks so large files never load into memory.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// The label stored next to every hash we produce.
pub const HASH_ALGORITHM: &str = "sha256";

/// How many bytes we read per chunk while hashing.
/// This affects memory use only; the resulting hash is the same
/// for any chunk size.
pub const HASH_CHUNK_SIZE: usize = 1_048_576;

/// Hash a file on disk, reading it in [`HASH_CHUNK_SIZE`] chunks.
/// Returns the digest as lowercase hex.
pub async fn hash_file(path: &Path) -> Result<String, std::io::Error> {
	hash_file_chunked(path, HASH_CHUNK_SIZE).await
}

/// Hash a file with an explicit chunk size.
pub async fn hash_file_chunked(path: &Path, chunk_size: usize) -> Result<String, std::io::Error> {
	let mut file = tokio::fs::File::open(path).await?;
	let mut hasher = Sha256::new();
	let mut buf = vec![0u8; chunk_size];

	loop {
		let n = file.read(&mut buf).await?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}

	return Ok(format!("{:x}", hasher.finalize()));
}

/// An incremental sha256, for hashing data as it streams past.
pub struct StreamHasher {
	inner: Sha256,
}

impl StreamHasher {
	pub fn new() -> Self {
		Self {
			inner: Sha256::new(),
		}
	}

	pub fn update(&mut self, data: &[u8]) {
		self.inner.update(data);
	}

	/// Finish this hash, returning lowercase hex.
	pub fn finish(self) -> String {
		format!("{:x}", self.inner.finalize())
	}
}
