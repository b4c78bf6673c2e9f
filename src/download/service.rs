use crate::download::errors::DownloadError;
use crate::download::missing::{BlockRequest, MissingChunk};
use crate::download::queue::WeightedDownloadQueue;
use crate::folder::{ChunkStore, MetaStore};
use crate::meta::{Bitfield, CtHash, PathRevision};
use crate::peer::{PeerEvent, PeerHandle, PeerId};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

pub type Result<T> = std::result::Result<T, DownloadError>;

const SCRATCH_RETRY_LIMIT: u32 = 1;
const SCRATCH_RETRY_BASE_MS: u64 = 200;
const SCRATCH_RETRY_MAX_MS: u64 = 5_000;

/// Scheduler knobs. Defaults match the wire behavior the daemon is tuned
/// for; deployments may override them through the `[download]` config
/// section.
#[derive(Debug, Clone)]
pub struct DownloadTuning {
    /// Outstanding block requests across all chunks of the folder.
    pub max_in_flight: usize,
    /// Request granularity in bytes.
    pub max_block_size: u32,
    /// Outstanding requests older than this are silently retired.
    pub request_timeout: Duration,
    /// Cadence of the maintenance sweep.
    pub maintain_period: Duration,
}

impl Default for DownloadTuning {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            max_block_size: 32 * 1024,
            request_timeout: Duration::from_secs(10),
            maintain_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadStatus {
    pub running: bool,
    pub missing_chunks: usize,
    pub requests_outstanding: usize,
    pub remotes: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub store_failures_total: u64,
    pub timed_out_requests_total: u64,
    pub ignored_replies_total: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissingChunkSummary {
    pub ct_hash_hex: String,
    pub size: u64,
    pub filled: u64,
    pub requests: usize,
    pub remotes_count: u32,
    pub clustered: bool,
    pub immediate: bool,
    pub weight_value: f32,
}

#[derive(Debug)]
pub enum DownloaderCommand {
    NotifyLocalMeta {
        revision: PathRevision,
        bitfield: Bitfield,
        reply: oneshot::Sender<()>,
    },
    NotifyLocalChunk {
        ct_hash: CtHash,
        reply: oneshot::Sender<()>,
    },
    NotifyRemoteMeta {
        peer: PeerId,
        revision: PathRevision,
        bitfield: Bitfield,
        reply: oneshot::Sender<()>,
    },
    NotifyRemoteChunk {
        peer: PeerId,
        ct_hash: CtHash,
        reply: oneshot::Sender<()>,
    },
    HandleChoke {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    HandleUnchoke {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    PutBlock {
        ct_hash: CtHash,
        offset: u32,
        data: Vec<u8>,
        from: PeerId,
        reply: oneshot::Sender<()>,
    },
    AttachPeer {
        handle: PeerHandle,
        reply: oneshot::Sender<()>,
    },
    ErasePeer {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    MarkImmediate {
        ct_hash: CtHash,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<(DownloadStatus, Vec<MissingChunkSummary>)>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct DownloaderHandle {
    tx: mpsc::Sender<DownloaderCommand>,
}

impl DownloaderHandle {
    async fn send_unit(
        &self,
        make: impl FnOnce(oneshot::Sender<()>) -> DownloaderCommand,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    pub async fn notify_local_meta(
        &self,
        revision: PathRevision,
        bitfield: Bitfield,
    ) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::NotifyLocalMeta {
            revision,
            bitfield,
            reply,
        })
        .await
    }

    pub async fn notify_local_chunk(&self, ct_hash: CtHash) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::NotifyLocalChunk { ct_hash, reply })
            .await
    }

    pub async fn notify_remote_meta(
        &self,
        peer: PeerId,
        revision: PathRevision,
        bitfield: Bitfield,
    ) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::NotifyRemoteMeta {
            peer,
            revision,
            bitfield,
            reply,
        })
        .await
    }

    pub async fn notify_remote_chunk(&self, peer: PeerId, ct_hash: CtHash) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::NotifyRemoteChunk {
            peer,
            ct_hash,
            reply,
        })
        .await
    }

    pub async fn handle_choke(&self, peer: PeerId) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::HandleChoke { peer, reply })
            .await
    }

    pub async fn handle_unchoke(&self, peer: PeerId) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::HandleUnchoke { peer, reply })
            .await
    }

    pub async fn put_block(
        &self,
        ct_hash: CtHash,
        offset: u32,
        data: Vec<u8>,
        from: PeerId,
    ) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::PutBlock {
            ct_hash,
            offset,
            data,
            from,
            reply,
        })
        .await
    }

    pub async fn attach_peer(&self, handle: PeerHandle) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::AttachPeer { handle, reply })
            .await
    }

    pub async fn erase_peer(&self, peer: PeerId) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::ErasePeer { peer, reply })
            .await
    }

    pub async fn mark_immediate(&self, ct_hash: CtHash) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::MarkImmediate { ct_hash, reply })
            .await
    }

    /// Routes one parsed transport event from `peer` to the matching
    /// operation. This is the adapter the connection layer drives.
    pub async fn deliver(&self, peer: PeerId, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Choke => self.handle_choke(peer).await,
            PeerEvent::Unchoke => self.handle_unchoke(peer).await,
            PeerEvent::HaveMeta { revision, bitfield } => {
                self.notify_remote_meta(peer, revision, bitfield).await
            }
            PeerEvent::HaveChunk { ct_hash } => self.notify_remote_chunk(peer, ct_hash).await,
            PeerEvent::BlockReply {
                ct_hash,
                offset,
                data,
            } => self.put_block(ct_hash, offset, data, peer).await,
            PeerEvent::Disconnect => self.erase_peer(peer).await,
        }
    }

    pub async fn snapshot(&self) -> Result<(DownloadStatus, Vec<MissingChunkSummary>)> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DownloaderCommand::Snapshot { reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send_unit(|reply| DownloaderCommand::Shutdown { reply })
            .await
    }
}

/// Collaborators and placement for one folder's downloader.
pub struct DownloaderDeps {
    pub folder_id: String,
    pub scratch_dir: PathBuf,
    pub meta_store: Arc<dyn MetaStore>,
    pub chunk_store: Arc<dyn ChunkStore>,
}

pub async fn start_downloader(
    tuning: DownloadTuning,
    deps: DownloaderDeps,
) -> Result<(
    DownloaderHandle,
    watch::Receiver<DownloadStatus>,
    tokio::task::JoinHandle<Result<()>>,
)> {
    tokio::fs::create_dir_all(&deps.scratch_dir)
        .await
        .map_err(|source| DownloadError::Scratch {
            path: deps.scratch_dir.clone(),
            source,
        })?;

    let (tx, rx) = mpsc::channel(128);
    let (status_tx, status_rx) = watch::channel(DownloadStatus {
        running: true,
        missing_chunks: 0,
        requests_outstanding: 0,
        remotes: 0,
        completed_total: 0,
        failed_total: 0,
        store_failures_total: 0,
        timed_out_requests_total: 0,
        ignored_replies_total: 0,
    });
    let join = tokio::spawn(run_downloader(rx, status_tx, tuning, deps));
    Ok((DownloaderHandle { tx }, status_rx, join))
}

struct RemotePeer {
    handle: PeerHandle,
    choking_us: bool,
    advertised: HashSet<CtHash>,
}

struct ScratchRetry {
    size: u32,
    retry_at: Instant,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct DownloadStats {
    completed_total: u64,
    failed_total: u64,
    store_failures_total: u64,
    timed_out_requests_total: u64,
    ignored_replies_total: u64,
}

struct DownloaderState {
    folder_id: String,
    scratch_dir: PathBuf,
    tuning: DownloadTuning,
    meta_store: Arc<dyn MetaStore>,
    chunk_store: Arc<dyn ChunkStore>,
    missing: HashMap<CtHash, MissingChunk>,
    queue: WeightedDownloadQueue,
    remotes: HashMap<PeerId, RemotePeer>,
    scratch_retries: HashMap<CtHash, ScratchRetry>,
    stats: DownloadStats,
}

async fn run_downloader(
    mut rx: mpsc::Receiver<DownloaderCommand>,
    status_tx: watch::Sender<DownloadStatus>,
    tuning: DownloadTuning,
    deps: DownloaderDeps,
) -> Result<()> {
    let mut state = DownloaderState {
        folder_id: deps.folder_id,
        scratch_dir: deps.scratch_dir,
        tuning,
        meta_store: deps.meta_store,
        chunk_store: deps.chunk_store,
        missing: HashMap::new(),
        queue: WeightedDownloadQueue::new(),
        remotes: HashMap::new(),
        scratch_retries: HashMap::new(),
        stats: DownloadStats::default(),
    };

    let mut maintain_tick = tokio::time::interval(state.tuning.maintain_period);
    maintain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = maintain_tick.tick() => {
                sweep_expired_requests(&mut state);
                revive_failed_chunks(&mut state).await;
                maintain_requests(&mut state)?;
            }
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    DownloaderCommand::NotifyLocalMeta { revision, bitfield, reply } => {
                        notify_local_meta(&mut state, revision, &bitfield).await;
                        let _ = reply.send(());
                    }
                    DownloaderCommand::NotifyLocalChunk { ct_hash, reply } => {
                        remove_missing_chunk(&mut state, ct_hash).await;
                        let _ = reply.send(());
                    }
                    DownloaderCommand::NotifyRemoteMeta { peer, revision, bitfield, reply } => {
                        notify_remote_meta(&mut state, peer, revision, &bitfield);
                        maintain_requests(&mut state)?;
                        let _ = reply.send(());
                    }
                    DownloaderCommand::NotifyRemoteChunk { peer, ct_hash, reply } => {
                        note_remote_chunk(&mut state, peer, ct_hash);
                        maintain_requests(&mut state)?;
                        let _ = reply.send(());
                    }
                    DownloaderCommand::HandleChoke { peer, reply } => {
                        handle_choke(&mut state, peer);
                        let _ = reply.send(());
                    }
                    DownloaderCommand::HandleUnchoke { peer, reply } => {
                        handle_unchoke(&mut state, peer);
                        maintain_requests(&mut state)?;
                        let _ = reply.send(());
                    }
                    DownloaderCommand::PutBlock { ct_hash, offset, data, from, reply } => {
                        put_block(&mut state, ct_hash, offset, &data, from).await;
                        maintain_requests(&mut state)?;
                        let _ = reply.send(());
                    }
                    DownloaderCommand::AttachPeer { handle, reply } => {
                        attach_peer(&mut state, handle);
                        let _ = reply.send(());
                    }
                    DownloaderCommand::ErasePeer { peer, reply } => {
                        erase_remote(&mut state, peer);
                        let _ = reply.send(());
                    }
                    DownloaderCommand::MarkImmediate { ct_hash, reply } => {
                        state.queue.mark_immediate(&ct_hash);
                        maintain_requests(&mut state)?;
                        let _ = reply.send(());
                    }
                    DownloaderCommand::Snapshot { reply } => {
                        let _ = reply.send(snapshot(&state));
                    }
                    DownloaderCommand::Shutdown { reply } => {
                        let _ = reply.send(());
                        let _ = status_tx.send(make_status(&state, false));
                        return Ok(());
                    }
                }
            }
        }
        let _ = status_tx.send(make_status(&state, true));
    }

    let _ = status_tx.send(make_status(&state, false));
    Ok(())
}

fn make_status(state: &DownloaderState, running: bool) -> DownloadStatus {
    DownloadStatus {
        running,
        missing_chunks: state.missing.len(),
        requests_outstanding: requests_overall(state),
        remotes: state.remotes.len(),
        completed_total: state.stats.completed_total,
        failed_total: state.stats.failed_total,
        store_failures_total: state.stats.store_failures_total,
        timed_out_requests_total: state.stats.timed_out_requests_total,
        ignored_replies_total: state.stats.ignored_replies_total,
    }
}

fn snapshot(state: &DownloaderState) -> (DownloadStatus, Vec<MissingChunkSummary>) {
    let overall = state.queue.overall_remotes_count();
    let items = state
        .queue
        .chunks()
        .into_iter()
        .filter_map(|ct_hash| {
            let chunk = state.missing.get(&ct_hash)?;
            let weight = state.queue.weight_of(&ct_hash)?;
            Some(MissingChunkSummary {
                ct_hash_hex: ct_hash.to_hex_lower(),
                size: chunk.size(),
                filled: chunk.file_map().size_filled(),
                requests: chunk.requests.len(),
                remotes_count: weight.remotes_count,
                clustered: weight.clustered,
                immediate: weight.immediate,
                weight_value: weight.value(overall),
            })
        })
        .collect();
    (make_status(state, true), items)
}

async fn notify_local_meta(state: &mut DownloaderState, revision: PathRevision, bitfield: &[bool]) {
    let Some(meta) = state.meta_store.get_meta(&revision) else {
        tracing::warn!(
            folder = %state.folder_id,
            revision = revision.revision,
            "local meta notification for unknown revision"
        );
        return;
    };
    if bitfield.len() != meta.chunks.len() {
        tracing::warn!(
            folder = %state.folder_id,
            revision = revision.revision,
            bits = bitfield.len(),
            chunks = meta.chunks.len(),
            "local bitfield length does not match meta"
        );
        return;
    }

    for (have, chunk_ref) in bitfield.iter().zip(&meta.chunks) {
        if *have {
            remove_missing_chunk(state, chunk_ref.ct_hash).await;
        } else {
            ensure_missing_chunk(state, chunk_ref.ct_hash, chunk_ref.size).await;
        }
    }
}

fn notify_remote_meta(
    state: &mut DownloaderState,
    peer: PeerId,
    revision: PathRevision,
    bitfield: &[bool],
) {
    let Some(meta) = state.meta_store.get_meta(&revision) else {
        tracing::debug!(
            folder = %state.folder_id,
            %peer,
            revision = revision.revision,
            "remote meta notification for unknown revision"
        );
        return;
    };
    for (have, chunk_ref) in bitfield.iter().zip(&meta.chunks) {
        if *have {
            note_remote_chunk(state, peer, chunk_ref.ct_hash);
        }
    }
}

fn note_remote_chunk(state: &mut DownloaderState, peer: PeerId, ct_hash: CtHash) {
    let Some(remote) = state.remotes.get_mut(&peer) else {
        return;
    };
    if !remote.advertised.insert(ct_hash) {
        return;
    }
    if !state.missing.contains_key(&ct_hash) {
        // Nothing we need right now; the advertisement is remembered for
        // rarity counts should the chunk go missing later.
        return;
    }
    state.queue.add_chunk(ct_hash);
    let count = count_advertisers(state, &ct_hash);
    state.queue.set_chunk_remotes_count(&ct_hash, count);
}

fn count_advertisers(state: &DownloaderState, ct_hash: &CtHash) -> u32 {
    state
        .remotes
        .values()
        .filter(|r| r.advertised.contains(ct_hash))
        .count() as u32
}

async fn ensure_missing_chunk(state: &mut DownloaderState, ct_hash: CtHash, size: u32) {
    if state.scratch_retries.contains_key(&ct_hash) {
        return;
    }
    if state.missing.contains_key(&ct_hash) {
        state.queue.add_chunk(ct_hash);
        return;
    }
    match MissingChunk::new(&state.scratch_dir, ct_hash, size).await {
        Ok(chunk) => {
            state.missing.insert(ct_hash, chunk);
            state.queue.add_chunk(ct_hash);
            let count = count_advertisers(state, &ct_hash);
            state.queue.set_chunk_remotes_count(&ct_hash, count);
            tracing::debug!(folder = %state.folder_id, chunk = %ct_hash, size, "tracking missing chunk");
        }
        Err(error) => {
            tracing::warn!(
                folder = %state.folder_id,
                chunk = %ct_hash,
                error = %error,
                "failed to allocate scratch file; scheduling retry"
            );
            schedule_scratch_retry(state, ct_hash, size, 1);
        }
    }
}

async fn remove_missing_chunk(state: &mut DownloaderState, ct_hash: CtHash) {
    state.queue.remove_chunk(&ct_hash);
    state.scratch_retries.remove(&ct_hash);
    if let Some(chunk) = state.missing.remove(&ct_hash) {
        // Requests and interest guards die with the chunk.
        chunk.discard().await;
        tracing::debug!(folder = %state.folder_id, chunk = %ct_hash, "missing chunk dropped");
    }
}

fn handle_choke(state: &mut DownloaderState, peer: PeerId) {
    let Some(remote) = state.remotes.get_mut(&peer) else {
        return;
    };
    remote.choking_us = true;
    drop_requests_for_peer(state, peer);
}

fn handle_unchoke(state: &mut DownloaderState, peer: PeerId) {
    if let Some(remote) = state.remotes.get_mut(&peer) {
        remote.choking_us = false;
    }
}

fn attach_peer(state: &mut DownloaderState, handle: PeerHandle) {
    let peer = handle.id();
    state.remotes.insert(
        peer,
        RemotePeer {
            handle,
            choking_us: false,
            advertised: HashSet::new(),
        },
    );
    state
        .queue
        .set_overall_remotes_count(state.remotes.len() as u32);
    tracing::debug!(folder = %state.folder_id, %peer, "remote attached");
}

fn erase_remote(state: &mut DownloaderState, peer: PeerId) {
    let Some(remote) = state.remotes.remove(&peer) else {
        return;
    };
    state
        .queue
        .set_overall_remotes_count(state.remotes.len() as u32);
    for ct_hash in remote.advertised {
        if state.missing.contains_key(&ct_hash) {
            let count = count_advertisers(state, &ct_hash);
            state.queue.set_chunk_remotes_count(&ct_hash, count);
        }
    }
    drop_requests_for_peer(state, peer);
    tracing::debug!(folder = %state.folder_id, %peer, "remote erased");
}

fn drop_requests_for_peer(state: &mut DownloaderState, peer: PeerId) {
    for (ct_hash, chunk) in state.missing.iter_mut() {
        let dropped = chunk.drop_peer_requests(peer);
        for _ in 0..dropped {
            state.queue.decrement_owned_by(ct_hash);
        }
    }
}

async fn put_block(
    state: &mut DownloaderState,
    ct_hash: CtHash,
    offset: u32,
    data: &[u8],
    from: PeerId,
) {
    let Some(chunk) = state.missing.get_mut(&ct_hash) else {
        state.stats.ignored_replies_total += 1;
        tracing::debug!(folder = %state.folder_id, chunk = %ct_hash, %from, "block reply for untracked chunk");
        return;
    };

    if u64::from(offset) + data.len() as u64 > chunk.size() {
        state.stats.ignored_replies_total += 1;
        tracing::warn!(
            folder = %state.folder_id,
            chunk = %ct_hash,
            %from,
            offset,
            len = data.len(),
            size = chunk.size(),
            "block reply exceeds chunk size"
        );
        return;
    }

    let matching = chunk
        .requests
        .iter()
        .position(|r| r.peer == from && r.offset == offset && r.size as usize == data.len());
    let Some(pos) = matching else {
        state.stats.ignored_replies_total += 1;
        tracing::debug!(
            folder = %state.folder_id,
            chunk = %ct_hash,
            %from,
            offset,
            "block reply matches no outstanding request"
        );
        return;
    };

    chunk.requests.remove(pos);
    state.queue.decrement_owned_by(&ct_hash);

    if let Err(error) = chunk.put_block(offset, data).await {
        tracing::warn!(
            folder = %state.folder_id,
            chunk = %ct_hash,
            error = %error,
            "scratch write failed; resetting chunk"
        );
        fail_chunk(state, ct_hash).await;
        return;
    }

    if state.missing.get(&ct_hash).is_some_and(MissingChunk::complete) {
        harvest_chunk(state, ct_hash);
    }
}

fn harvest_chunk(state: &mut DownloaderState, ct_hash: CtHash) {
    let Some(chunk) = state.missing.remove(&ct_hash) else {
        return;
    };
    state.queue.remove_chunk(&ct_hash);
    let size = chunk.size();
    // Consuming the chunk drops its interest guards; peers we no longer
    // need anything from see our uninterest.
    let path = chunk.release_chunk();
    match state.chunk_store.put_chunk(&ct_hash, &path) {
        Ok(()) => {
            state.stats.completed_total += 1;
            tracing::info!(folder = %state.folder_id, chunk = %ct_hash, size, "chunk assembled");
        }
        Err(error) => {
            // Keep the harvested file for a later reconciler; abandon the
            // chunk for this meta.
            state.stats.store_failures_total += 1;
            tracing::error!(
                folder = %state.folder_id,
                chunk = %ct_hash,
                path = %path.display(),
                error = %error,
                "chunk store rejected completed chunk"
            );
        }
    }
}

async fn fail_chunk(state: &mut DownloaderState, ct_hash: CtHash) {
    state.queue.remove_chunk(&ct_hash);
    let Some(chunk) = state.missing.remove(&ct_hash) else {
        return;
    };
    let size = chunk.size() as u32;
    let attempts = chunk.retry_count + 1;
    chunk.discard().await;

    if attempts > SCRATCH_RETRY_LIMIT {
        state.stats.failed_total += 1;
        state.scratch_retries.remove(&ct_hash);
        tracing::error!(
            folder = %state.folder_id,
            chunk = %ct_hash,
            attempts,
            "giving up on chunk after repeated scratch failures"
        );
        return;
    }
    schedule_scratch_retry(state, ct_hash, size, attempts);
}

fn schedule_scratch_retry(state: &mut DownloaderState, ct_hash: CtHash, size: u32, attempts: u32) {
    let shift = attempts.saturating_sub(1).min(6);
    let delay_ms = (SCRATCH_RETRY_BASE_MS << shift).min(SCRATCH_RETRY_MAX_MS);
    state.scratch_retries.insert(
        ct_hash,
        ScratchRetry {
            size,
            retry_at: Instant::now() + Duration::from_millis(delay_ms),
            attempts,
        },
    );
}

async fn revive_failed_chunks(state: &mut DownloaderState) {
    let now = Instant::now();
    let due: Vec<(CtHash, u32, u32)> = state
        .scratch_retries
        .iter()
        .filter(|(_, retry)| retry.retry_at <= now)
        .map(|(&ct_hash, retry)| (ct_hash, retry.size, retry.attempts))
        .collect();

    for (ct_hash, size, attempts) in due {
        state.scratch_retries.remove(&ct_hash);
        match MissingChunk::new(&state.scratch_dir, ct_hash, size).await {
            Ok(mut chunk) => {
                chunk.retry_count = attempts;
                state.missing.insert(ct_hash, chunk);
                state.queue.add_chunk(ct_hash);
                let count = count_advertisers(state, &ct_hash);
                state.queue.set_chunk_remotes_count(&ct_hash, count);
                tracing::info!(
                    folder = %state.folder_id,
                    chunk = %ct_hash,
                    attempts,
                    "retrying chunk reconstruction with fresh state"
                );
            }
            Err(error) => {
                let attempts = attempts + 1;
                if attempts > SCRATCH_RETRY_LIMIT {
                    state.stats.failed_total += 1;
                    tracing::error!(
                        folder = %state.folder_id,
                        chunk = %ct_hash,
                        error = %error,
                        "giving up on chunk after repeated scratch failures"
                    );
                } else {
                    schedule_scratch_retry(state, ct_hash, size, attempts);
                }
            }
        }
    }
}

fn sweep_expired_requests(state: &mut DownloaderState) {
    let now = Instant::now();
    let timeout = state.tuning.request_timeout;
    let mut timed_out = 0u64;

    for (ct_hash, chunk) in state.missing.iter_mut() {
        let before = chunk.requests.len();
        chunk
            .requests
            .retain(|r| now.saturating_duration_since(r.started) < timeout);
        let dropped = before - chunk.requests.len();
        for _ in 0..dropped {
            state.queue.decrement_owned_by(ct_hash);
        }
        timed_out += dropped as u64;
    }

    if timed_out > 0 {
        state.stats.timed_out_requests_total += timed_out;
        if crate::logging::warn_throttled("download_request_timeout", Duration::from_secs(30)) {
            tracing::warn!(
                folder = %state.folder_id,
                count = timed_out,
                "outstanding block requests timed out; blocks will be re-requested"
            );
        }
    }
}

fn requests_overall(state: &DownloaderState) -> usize {
    state.missing.values().map(|c| c.requests.len()).sum()
}

fn requests_to_peer(state: &DownloaderState, peer: PeerId) -> usize {
    state.missing.values().map(|c| c.requests_for(peer)).sum()
}

fn maintain_requests(state: &mut DownloaderState) -> Result<()> {
    while requests_overall(state) < state.tuning.max_in_flight {
        if !request_one(state)? {
            break;
        }
    }
    sync_interest_guards(state);
    Ok(())
}

/// Drops interest guards for (peer, chunk) pairs with nothing outstanding.
/// Deferred to the end of the top-up so interest held across back-to-back
/// block requests never flaps.
fn sync_interest_guards(state: &mut DownloaderState) {
    for chunk in state.missing.values_mut() {
        let requests = &chunk.requests;
        chunk
            .owned_by
            .retain(|peer, _| requests.iter().any(|r| r.peer == *peer));
    }
}

/// Picks the heaviest requestable (chunk, block, peer) tuple and fires one
/// block request at it. Returns false when nothing can be requested.
fn request_one(state: &mut DownloaderState) -> Result<bool> {
    for ct_hash in state.queue.chunks() {
        let Some(chunk) = state.missing.get(&ct_hash) else {
            return Err(DownloadError::Desync("queue references untracked chunk"));
        };
        let Some((offset, gap_len)) = chunk.first_gap() else {
            // Complete but not yet harvested; the reply path handles it.
            continue;
        };
        let size = gap_len.min(state.tuning.max_block_size);
        let Some(peer) = find_node_for_request(state, &ct_hash, offset, size) else {
            continue;
        };
        let Some(remote) = state.remotes.get(&peer) else {
            continue;
        };
        let handle = remote.handle.clone();
        let advertised: Vec<CtHash> = remote.advertised.iter().copied().collect();
        let Some(chunk) = state.missing.get_mut(&ct_hash) else {
            continue;
        };

        // Interest must reach the peer before the first block request.
        chunk
            .owned_by
            .entry(peer)
            .or_insert_with(|| handle.acquire_interest());
        handle.request_block(ct_hash, offset, size);
        chunk.requests.push(BlockRequest {
            peer,
            offset,
            size,
            started: Instant::now(),
        });
        state.queue.increment_owned_by(&ct_hash);

        // Everything else this peer holds becomes a clustering candidate.
        for other in advertised {
            if other != ct_hash && state.missing.contains_key(&other) {
                state.queue.mark_clustered(&other);
            }
        }

        tracing::debug!(
            folder = %state.folder_id,
            chunk = %ct_hash,
            %peer,
            offset,
            size,
            "block requested"
        );
        return Ok(true);
    }
    Ok(false)
}

/// An eligible peer advertises the chunk, is not choking us, and does not
/// already run this exact block request. Least-loaded peer wins.
fn find_node_for_request(
    state: &DownloaderState,
    ct_hash: &CtHash,
    offset: u32,
    size: u32,
) -> Option<PeerId> {
    let chunk = state.missing.get(ct_hash)?;
    state
        .remotes
        .iter()
        .filter(|(peer, remote)| {
            remote.advertised.contains(ct_hash)
                && !remote.choking_us
                && !chunk.has_request(**peer, offset, size)
        })
        .min_by_key(|(peer, _)| (requests_to_peer(state, **peer), peer.0))
        .map(|(peer, _)| *peer)
}
