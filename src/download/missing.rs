use crate::download::availability::AvailabilityMap;
use crate::download::errors::DownloadError;
use crate::meta::CtHash;
use crate::peer::{InterestGuard, PeerId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

pub type Result<T> = std::result::Result<T, DownloadError>;

/// One block asked of one peer, alive until the matching reply lands or the
/// request is canceled by timeout, choke, or departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub peer: PeerId,
    pub offset: u32,
    pub size: u32,
    pub started: Instant,
}

/// A chunk being reconstructed from block replies into a sparse scratch
/// file. Once `complete()`, `release_chunk` hands the file over for ingest
/// into the chunk store.
#[derive(Debug)]
pub struct MissingChunk {
    ct_hash: CtHash,
    chunk_path: PathBuf,
    file_map: AvailabilityMap,
    /// Outstanding block requests, any number per peer.
    pub requests: Vec<BlockRequest>,
    /// One interest token per peer that currently has a request on this
    /// chunk. Dropping an entry releases that peer's interest reference.
    pub owned_by: HashMap<PeerId, InterestGuard>,
    /// Times reconstruction of this chunk was restarted after a scratch
    /// failure.
    pub retry_count: u32,
}

impl MissingChunk {
    /// Allocates the backing file at its final scratch path, truncated to
    /// `size` bytes (sparse where the filesystem supports it).
    pub async fn new(scratch_dir: &Path, ct_hash: CtHash, size: u32) -> Result<Self> {
        let chunk_path = scratch_dir.join(format!("{}.chunk", ct_hash.to_hex_lower()));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&chunk_path)
            .await
            .map_err(|source| DownloadError::Scratch {
                path: chunk_path.clone(),
                source,
            })?;
        file.set_len(u64::from(size))
            .await
            .map_err(|source| DownloadError::Scratch {
                path: chunk_path.clone(),
                source,
            })?;

        Ok(Self {
            ct_hash,
            chunk_path,
            file_map: AvailabilityMap::new(size),
            requests: Vec::new(),
            owned_by: HashMap::new(),
            retry_count: 0,
        })
    }

    pub fn ct_hash(&self) -> CtHash {
        self.ct_hash
    }

    pub fn size(&self) -> u64 {
        self.file_map.size_original()
    }

    pub fn complete(&self) -> bool {
        self.file_map.full()
    }

    pub fn file_map(&self) -> &AvailabilityMap {
        &self.file_map
    }

    pub fn first_gap(&self) -> Option<(u32, u32)> {
        self.file_map.first_gap()
    }

    /// Writes `content` at `offset` and records the range as filled.
    /// Overlapping writes are byte-idempotent; the map coalesces.
    pub async fn put_block(&mut self, offset: u32, content: &[u8]) -> Result<()> {
        let len = u32::try_from(content.len()).unwrap_or(u32::MAX);
        let end = u64::from(offset) + content.len() as u64;
        if end > self.size() {
            return Err(DownloadError::OutOfRange {
                ct_hash: self.ct_hash,
                offset,
                len,
                size: self.size(),
            });
        }
        if content.is_empty() {
            return Ok(());
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.chunk_path)
            .await
            .map_err(|source| DownloadError::Scratch {
                path: self.chunk_path.clone(),
                source,
            })?;
        file.seek(std::io::SeekFrom::Start(u64::from(offset)))
            .await
            .map_err(|source| DownloadError::Scratch {
                path: self.chunk_path.clone(),
                source,
            })?;
        file.write_all(content)
            .await
            .map_err(|source| DownloadError::Scratch {
                path: self.chunk_path.clone(),
                source,
            })?;
        file.flush()
            .await
            .map_err(|source| DownloadError::Scratch {
                path: self.chunk_path.clone(),
                source,
            })?;

        self.file_map.insert(offset, len);
        Ok(())
    }

    /// Hands the assembled ciphertext file to the caller. Consumes the
    /// chunk; any remaining interest guards are released on drop.
    pub fn release_chunk(self) -> PathBuf {
        self.chunk_path
    }

    /// Tears the chunk down without completing it, removing the backing
    /// file. Requests and interest guards die with the value.
    pub async fn discard(self) {
        if let Err(error) = tokio::fs::remove_file(&self.chunk_path).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                path = %self.chunk_path.display(),
                error = %error,
                "failed to remove scratch file for discarded chunk"
            );
        }
    }

    pub fn requests_for(&self, peer: PeerId) -> usize {
        self.requests.iter().filter(|r| r.peer == peer).count()
    }

    pub fn has_request(&self, peer: PeerId, offset: u32, size: u32) -> bool {
        self.requests
            .iter()
            .any(|r| r.peer == peer && r.offset == offset && r.size == size)
    }

    /// Removes every outstanding request owned by `peer` and its interest
    /// guard. Returns how many requests were dropped.
    pub fn drop_peer_requests(&mut self, peer: PeerId) -> usize {
        let before = self.requests.len();
        self.requests.retain(|r| r.peer != peer);
        self.owned_by.remove(&peer);
        before - self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-vault-missing-{tag}-{nanos}"));
        p
    }

    #[tokio::test]
    async fn new_allocates_backing_file_of_exact_size() {
        let root = temp_dir("alloc");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");

        let chunk = MissingChunk::new(&root, CtHash([1u8; 32]), 4096)
            .await
            .expect("new");
        assert_eq!(chunk.size(), 4096);
        assert!(!chunk.complete());

        let path = chunk.release_chunk();
        let meta = std::fs::metadata(&path).expect("metadata");
        assert_eq!(meta.len(), 4096);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn put_block_fills_and_completes() {
        let root = temp_dir("fill");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");

        let mut chunk = MissingChunk::new(&root, CtHash([2u8; 32]), 8)
            .await
            .expect("new");
        chunk.put_block(0, b"abcd").await.expect("first half");
        assert!(!chunk.complete());
        assert_eq!(chunk.first_gap(), Some((4, 4)));

        chunk.put_block(4, b"efgh").await.expect("second half");
        assert!(chunk.complete());

        let path = chunk.release_chunk();
        assert_eq!(std::fs::read(&path).expect("read"), b"abcdefgh");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn put_block_rejects_writes_past_the_end() {
        let root = temp_dir("range");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");

        let mut chunk = MissingChunk::new(&root, CtHash([3u8; 32]), 8)
            .await
            .expect("new");
        let err = chunk.put_block(6, b"toolong").await.expect_err("must fail");
        assert!(matches!(err, DownloadError::OutOfRange { .. }));
        assert_eq!(chunk.file_map().size_filled(), 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn overlapping_writes_are_idempotent() {
        let root = temp_dir("overlap");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");

        let mut chunk = MissingChunk::new(&root, CtHash([4u8; 32]), 8)
            .await
            .expect("new");
        chunk.put_block(0, b"abcd").await.expect("write");
        chunk.put_block(0, b"abcd").await.expect("duplicate write");
        assert_eq!(chunk.file_map().size_filled(), 4);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn discard_removes_the_backing_file() {
        let root = temp_dir("discard");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");

        let chunk = MissingChunk::new(&root, CtHash([5u8; 32]), 16)
            .await
            .expect("new");
        let path = root.join(format!("{}.chunk", CtHash([5u8; 32]).to_hex_lower()));
        assert!(path.exists());

        chunk.discard().await;
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn drop_peer_requests_clears_bookkeeping() {
        let root = temp_dir("reqs");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");

        let mut chunk = MissingChunk::new(&root, CtHash([6u8; 32]), 64)
            .await
            .expect("new");
        let peer_a = PeerId(1);
        let peer_b = PeerId(2);
        let now = Instant::now();
        chunk.requests.push(BlockRequest {
            peer: peer_a,
            offset: 0,
            size: 32,
            started: now,
        });
        chunk.requests.push(BlockRequest {
            peer: peer_a,
            offset: 32,
            size: 32,
            started: now,
        });
        chunk.requests.push(BlockRequest {
            peer: peer_b,
            offset: 0,
            size: 32,
            started: now,
        });

        assert!(chunk.has_request(peer_a, 0, 32));
        assert_eq!(chunk.drop_peer_requests(peer_a), 2);
        assert_eq!(chunk.requests_for(peer_a), 0);
        assert_eq!(chunk.requests_for(peer_b), 1);
        assert!(!chunk.has_request(peer_a, 0, 32));
        let _ = std::fs::remove_dir_all(root);
    }
}
