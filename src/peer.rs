use crate::meta::{Bitfield, CtHash, PathRevision};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Small integer handle identifying one connected remote within a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Outbound traffic toward one remote. Sends are fire-and-forget: replies
/// (block payloads, chokes) come back through the downloader's own channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Interest,
    Uninterest,
    RequestBlock {
        ct_hash: CtHash,
        offset: u32,
        size: u32,
    },
}

/// Events a remote delivers to the folder's download core. The transport
/// layer parses wire messages into these and pushes them at the handle.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Choke,
    Unchoke,
    HaveMeta {
        revision: PathRevision,
        bitfield: Bitfield,
    },
    HaveChunk {
        ct_hash: CtHash,
    },
    BlockReply {
        ct_hash: CtHash,
        offset: u32,
        data: Vec<u8>,
    },
    Disconnect,
}

struct InterestState {
    refs: Mutex<usize>,
    tx: mpsc::UnboundedSender<PeerMessage>,
}

/// Handle to one connected remote: identity plus the outbound message lane.
///
/// Interest toward the remote is reference-counted across all chunks via
/// [`InterestGuard`]: the first live guard emits `Interest`, dropping the
/// last emits `Uninterest`.
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    tx: mpsc::UnboundedSender<PeerMessage>,
    interest: Arc<InterestState>,
}

impl PeerHandle {
    pub fn new(id: PeerId, tx: mpsc::UnboundedSender<PeerMessage>) -> Self {
        let interest = Arc::new(InterestState {
            refs: Mutex::new(0),
            tx: tx.clone(),
        });
        Self { id, tx, interest }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn request_block(&self, ct_hash: CtHash, offset: u32, size: u32) {
        let _ = self.tx.send(PeerMessage::RequestBlock {
            ct_hash,
            offset,
            size,
        });
    }

    /// Takes one interest reference on this remote. Emits `Interest` on the
    /// zero-to-one transition, before any block request that follows it.
    pub fn acquire_interest(&self) -> InterestGuard {
        InterestGuard::acquire(self.interest.clone())
    }

    /// Live interest references. Zero means we have told the remote we are
    /// not interested (or never were).
    pub fn interest_refs(&self) -> usize {
        *self.interest.refs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("interest_refs", &self.interest_refs())
            .finish()
    }
}

/// Scoped interest token for one (peer, chunk) pair.
#[derive(Debug)]
pub struct InterestGuard {
    state: Arc<InterestState>,
}

impl InterestGuard {
    fn acquire(state: Arc<InterestState>) -> Self {
        {
            let mut refs = state.refs.lock().unwrap_or_else(|e| e.into_inner());
            *refs += 1;
            if *refs == 1 {
                let _ = state.tx.send(PeerMessage::Interest);
            }
        }
        Self { state }
    }
}

impl std::fmt::Debug for InterestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterestState").finish_non_exhaustive()
    }
}

impl Drop for InterestGuard {
    fn drop(&mut self) {
        let mut refs = self.state.refs.lock().unwrap_or_else(|e| e.into_inner());
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            let _ = self.state.tx.send(PeerMessage::Uninterest);
        }
    }
}
