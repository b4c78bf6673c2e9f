pub mod api;
pub mod app;
pub mod config;
pub mod download;
pub mod folder;
pub mod logging;
pub mod meta;
pub mod peer;
pub mod single_instance;

pub use download::{DownloadTuning, DownloaderDeps, DownloaderHandle, start_downloader};
pub use meta::{Bitfield, ChunkRef, CtHash, PathRevision, SignedMeta};
pub use peer::{PeerEvent, PeerHandle, PeerId, PeerMessage};
