use crate::meta::{Bitfield, CtHash, PathRevision, SignedMeta};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    EnsureDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Ingest {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureDir { path, source } => {
                write!(f, "failed to ensure directory '{}': {source}", path.display())
            }
            Self::Ingest { from, to, source } => write!(
                f,
                "failed to ingest chunk '{}' -> '{}': {source}",
                from.display(),
                to.display()
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EnsureDir { source, .. } => Some(source),
            Self::Ingest { source, .. } => Some(source),
        }
    }
}

/// Index of signed manifests known to this folder. The indexer writes it,
/// the download core only reads.
pub trait MetaStore: Send + Sync {
    fn have_meta(&self, revision: &PathRevision) -> bool;
    fn get_meta(&self, revision: &PathRevision) -> Option<SignedMeta>;
}

/// Storage of complete encrypted chunks, keyed by ciphertext hash. Must be
/// safe for concurrent `put_chunk` calls from multiple folders.
pub trait ChunkStore: Send + Sync {
    fn have_chunk(&self, ct_hash: &CtHash) -> bool;

    /// Moves the given file into the store as the canonical encrypted chunk.
    /// The source file is consumed on success.
    fn put_chunk(&self, ct_hash: &CtHash, file: &Path) -> Result<()>;

    /// Presence vector for the chunks of `meta`, in manifest order.
    fn make_bitfield(&self, meta: &SignedMeta) -> Bitfield {
        meta.chunks
            .iter()
            .map(|c| self.have_chunk(&c.ct_hash))
            .collect()
    }
}

/// In-memory meta index, enough for composition and tests; the persistent
/// index lives outside the download core.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    metas: RwLock<HashMap<PathRevision, SignedMeta>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: SignedMeta) {
        let mut metas = self.metas.write().unwrap_or_else(|e| e.into_inner());
        metas.insert(meta.path_revision, meta);
    }
}

impl MetaStore for MemoryMetaStore {
    fn have_meta(&self, revision: &PathRevision) -> bool {
        let metas = self.metas.read().unwrap_or_else(|e| e.into_inner());
        metas.contains_key(revision)
    }

    fn get_meta(&self, revision: &PathRevision) -> Option<SignedMeta> {
        let metas = self.metas.read().unwrap_or_else(|e| e.into_inner());
        metas.get(revision).cloned()
    }
}

/// Chunk store backed by a flat directory; chunks are files named by their
/// hex ciphertext hash.
#[derive(Debug, Clone)]
pub struct DirectoryChunkStore {
    root: PathBuf,
}

impl DirectoryChunkStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::EnsureDir {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn chunk_path(&self, ct_hash: &CtHash) -> PathBuf {
        self.root.join(format!("{}.chunk", ct_hash.to_hex_lower()))
    }
}

impl ChunkStore for DirectoryChunkStore {
    fn have_chunk(&self, ct_hash: &CtHash) -> bool {
        self.chunk_path(ct_hash).exists()
    }

    fn put_chunk(&self, ct_hash: &CtHash, file: &Path) -> Result<()> {
        let target = self.chunk_path(ct_hash);
        match std::fs::rename(file, &target) {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                // Rename fails across filesystems; fall back to copy + remove.
                std::fs::copy(file, &target).map_err(|source| StoreError::Ingest {
                    from: file.to_path_buf(),
                    to: target.clone(),
                    source,
                })?;
                std::fs::remove_file(file).map_err(|source| StoreError::Ingest {
                    from: file.to_path_buf(),
                    to: target.clone(),
                    source,
                })?;
                tracing::debug!(
                    from = %file.display(),
                    to = %target.display(),
                    error = %rename_err,
                    "chunk ingest used copy/remove fallback"
                );
                Ok(())
            }
        }
    }
}
