//! BLAKE3 content hashing for change detection
//!
//! Size and modification time catch almost every content change. Hashing is
//! opt-in and catches same-size rewrites that land inside the filesystem's
//! timestamp granularity.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

/// Files at least this large are hashed through a memory map
pub const MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

/// A BLAKE3 content hash (32 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_bytes(*blake3::hash(data).as_bytes())
}

/// Hash a file, streaming small files and mapping large ones
pub fn hash_file(path: &Path) -> io::Result<ContentHash> {
    let file = File::open(path)?;
    if file.metadata()?.len() >= MMAP_THRESHOLD {
        return hash_mapped(&file);
    }

    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(ContentHash::from_bytes(*hasher.finalize().as_bytes()))
}

/// Hash a file through a memory map
pub fn hash_file_mmap(path: &Path) -> io::Result<ContentHash> {
    let file = File::open(path)?;
    hash_mapped(&file)
}

fn hash_mapped(file: &File) -> io::Result<ContentHash> {
    // SAFETY: the map is read once and dropped before returning; a concurrent
    // writer can only make the hash stale, which the stable variant detects.
    let mmap = unsafe { memmap2::Mmap::map(file)? };
    Ok(hash_bytes(&mmap))
}

/// Hash a file that may still be being written
///
/// Stats before and after reading; retries with exponential backoff while
/// size or mtime keep moving.
pub fn hash_file_stable(path: &Path, max_retries: u8) -> io::Result<ContentHash> {
    let attempts = max_retries.max(1);
    for attempt in 0..attempts {
        // 1. Stat before read
        let before = fs::metadata(path)?;

        // 2. Hash
        let hash = hash_file(path)?;

        // 3. Stat after read
        let after = fs::metadata(path)?;

        // 4. Size and mtime must agree
        if before.len() == after.len() && before.modified()? == after.modified()? {
            return Ok(hash);
        }

        if attempt + 1 < attempts {
            sleep(Duration::from_millis(50u64 << attempt));
        }
    }

    Err(io::Error::new(
        io::ErrorKind::Other,
        format!(
            "{} is unstable after {} read attempts",
            path.display(),
            attempts
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_consistency() {
        assert_eq!(hash_bytes(b"hello world"), hash_bytes(b"hello world"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }

    #[test]
    fn test_hex_is_lowercase() {
        let hash = ContentHash::from_bytes([0xde; 32]);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_eq!(hash.short(), "dededededede");
    }

    #[test]
    fn test_hash_file_matches_bytes() -> io::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let file_path = temp_dir.path().join("test.txt");
        std::fs::write(&file_path, b"test file content")?;

        assert_eq!(hash_file(&file_path)?, hash_bytes(b"test file content"));
        assert_eq!(hash_file_mmap(&file_path)?, hash_bytes(b"test file content"));
        Ok(())
    }

    #[test]
    fn test_large_file_takes_mapped_path() -> io::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let file_path = temp_dir.path().join("large.bin");

        let mut file = std::fs::File::create(&file_path)?;
        let chunk = vec![0xAB; 1024 * 1024];
        for _ in 0..5 {
            file.write_all(&chunk)?;
        }
        drop(file);

        let expected = hash_bytes(&vec![0xAB; 5 * 1024 * 1024]);
        assert_eq!(hash_file(&file_path)?, expected);
        Ok(())
    }

    #[test]
    fn test_stable_file_succeeds() -> io::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let file = temp_dir.path().join("stable.txt");
        std::fs::write(&file, b"stable content")?;

        assert_eq!(hash_file_stable(&file, 3)?, hash_bytes(b"stable content"));
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = hash_file_stable(&temp_dir.path().join("missing"), 2);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
