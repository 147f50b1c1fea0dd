/// Whole-file MD5 fingerprint used for end-to-end integrity checks.
///
/// MD5 is chosen for speed and for matching `md5sum`-style hex output from
/// other implementations. It is not a security boundary.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::error::TransferError;

/// Length of a hex-encoded MD5 digest.
pub const DIGEST_HEX_LEN: usize = 32;

const READ_BUF: usize = 64 * 1024;

/// Stream the file at `path` through MD5 and return the lowercase hex digest.
pub fn compute_digest(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path).map_err(|e| TransferError::file(path, e))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf).map_err(|e| TransferError::file(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Exact, case-sensitive comparison.
pub fn digests_equal(a: &str, b: &str) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn known_vectors() {
        assert_eq!(digest_bytes(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(digest_bytes(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn file_digest_matches_buffer_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        // Larger than one read buffer so the streaming path is exercised.
        let data: Vec<u8> = (0..READ_BUF * 3 + 17).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        let a = compute_digest(&path).unwrap();
        let b = compute_digest(&path).unwrap();
        assert!(digests_equal(&a, &b));
        assert_eq!(a, digest_bytes(&data));
        assert_eq!(a.len(), DIGEST_HEX_LEN);
    }

    #[test]
    fn one_byte_change_changes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, b"hello world").unwrap();
        fs::write(&b, b"hello worle").unwrap();
        assert!(!digests_equal(
            &compute_digest(&a).unwrap(),
            &compute_digest(&b).unwrap()
        ));
    }

    #[test]
    fn comparison_is_case_sensitive() {
        assert!(!digests_equal("abcdef", "ABCDEF"));
    }

    #[test]
    fn missing_file_is_a_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = compute_digest(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, TransferError::File { .. }));
    }
}
