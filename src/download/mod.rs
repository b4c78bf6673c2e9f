pub mod availability;
pub mod errors;
pub mod missing;
pub mod queue;
pub mod service;

pub use availability::AvailabilityMap;
pub use errors::DownloadError;
pub use missing::{BlockRequest, MissingChunk};
pub use queue::{Weight, WeightedDownloadQueue};
pub use service::{
    DownloadStatus, DownloadTuning, DownloaderDeps, DownloaderHandle, MissingChunkSummary,
    start_downloader,
};
