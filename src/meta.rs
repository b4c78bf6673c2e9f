use serde::{Deserialize, Serialize};

/// Strong hash of a chunk's encrypted contents. This is the identity key for
/// chunks everywhere in the daemon; the indexer produces it, we only carry it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtHash(pub [u8; 32]);

impl CtHash {
    pub fn to_hex_lower(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (idx, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            out[idx] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(out))
    }
}

impl std::fmt::Debug for CtHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CtHash({})", crate::logging::redact_hex(&self.to_hex_lower()))
    }
}

impl std::fmt::Display for CtHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", crate::logging::redact_hex(&self.to_hex_lower()))
    }
}

/// One version of one file: the keyed path hash plus the revision timestamp
/// assigned by the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathRevision {
    pub path_id: [u8; 32],
    pub revision: i64,
}

/// A chunk as enumerated by a signed manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub ct_hash: CtHash,
    pub size: u32,
}

/// Signed manifest of one file revision. Signature verification happens at
/// the transport/index boundary; by the time a meta reaches the download
/// core it is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMeta {
    pub path_revision: PathRevision,
    pub chunks: Vec<ChunkRef>,
}

/// Per-meta presence vector: bit i is set iff the owner holds the complete
/// encrypted chunk i of that meta.
pub type Bitfield = Vec<bool>;
