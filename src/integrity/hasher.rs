//! SHA-256 digests used by [`super::verify`].
//!
//! The source and the received copy are hashed the same way: in 64 KiB
//! blocks, so neither file is ever held in memory whole. Digests are compared
//! as lowercase hex strings, which is also how they appear in mismatch errors
//! and in the JSON verdict.

use std::fmt::Write as _;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const BLOCK: usize = 64 * 1024;

/// Hex digest of everything in the file at `path`.
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut sha = Sha256::new();
    let mut block = vec![0u8; BLOCK];
    loop {
        match file.read(&mut block).await? {
            0 => return Ok(to_hex(&sha.finalize())),
            n => sha.update(&block[..n]),
        }
    }
}

/// Hex digest of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
