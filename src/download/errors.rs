use crate::meta::CtHash;

#[derive(Debug)]
pub enum DownloadError {
    /// Backing-file allocation or write failed in the scratch directory.
    Scratch {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// A block write would land past the end of the chunk.
    OutOfRange {
        ct_hash: CtHash,
        offset: u32,
        len: u32,
        size: u64,
    },
    /// The downloader task is gone.
    ChannelClosed,
    /// Internal bookkeeping desynchronized; the folder must be torn down.
    Desync(&'static str),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scratch { path, source } => {
                write!(f, "scratch file '{}' failed: {source}", path.display())
            }
            Self::OutOfRange {
                ct_hash,
                offset,
                len,
                size,
            } => write!(
                f,
                "block [{offset}, +{len}) exceeds chunk {ct_hash} of size {size}"
            ),
            Self::ChannelClosed => write!(f, "downloader channel closed"),
            Self::Desync(what) => write!(f, "downloader state desynchronized: {what}"),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Scratch { source, .. } => Some(source),
            Self::OutOfRange { .. } | Self::ChannelClosed | Self::Desync(_) => None,
        }
    }
}
