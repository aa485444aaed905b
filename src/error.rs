//! Error taxonomy for the cache and download paths.
//!
//! Cache and disk operations always resolve to an image-or-none outcome
//! (see [`crate::image_cache`]); these types exist for the paths that do
//! surface errors --- the downloader, and swallowed disk failures that are
//! still worth a typed shape for logging.

use std::io;
use std::path::PathBuf;

/// Errors produced while reading or writing the disk tier.
///
/// Disk tier call sites treat these as best-effort: the error is logged
/// via `tracing::warn!` and discarded, never propagated to a client
/// completion.
#[derive(Debug, thiserror::Error)]
pub enum DiskCacheError {
    #[error("failed to create cache namespace directory at {path}")]
    CreateNamespace { path: PathBuf, #[source] source: io::Error },

    #[error("failed to write cache file at {path}")]
    Write { path: PathBuf, #[source] source: io::Error },

    #[error("failed to read cache file at {path}")]
    Read { path: PathBuf, #[source] source: io::Error },

    #[error("failed to remove cache file at {path}")]
    Remove { path: PathBuf, #[source] source: io::Error },

    #[error("failed to enumerate cache directory at {path}")]
    Enumerate { path: PathBuf, #[source] source: io::Error },
}

/// Transient causes for a downloader failure. A URL that fails for one of
/// these reasons is never blacklisted --- the same request is expected to
/// succeed on a later attempt with no code change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientCause {
    NotConnected,
    Cancelled,
    TimedOut,
    InternationalRoamingOff,
    DataNotAllowed,
    CannotFindHost,
    CannotConnectToHost,
}

/// Errors surfaced from the downloader (C5) completion callback.
#[derive(Debug, thiserror::Error)]
pub enum DownloaderError {
    /// Could not reach the host at all (DNS failure, connection
    /// refused, connect timeout). Transient --- the same URL is
    /// expected to succeed unchanged on a later attempt.
    #[error("could not connect: {0}")]
    Connection(String),

    /// Every other transport-layer failure: TLS/certificate errors,
    /// malformed requests, and response body errors (e.g. a failed
    /// decode). Not transient --- these recur on retry without a code
    /// or configuration change, so the url is blacklisted.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http status {status}")]
    Http { status: u16 },

    #[error("request was cancelled")]
    Cancelled,

    #[error("request timed out")]
    TimedOut,
}

impl DownloaderError {
    /// Classifies this error as transient (never blacklisted) or not,
    /// per the set named in spec §4.5 / §7.
    pub fn transient_cause(&self) -> Option<TransientCause> {
        match self {
            DownloaderError::Cancelled => Some(TransientCause::Cancelled),
            DownloaderError::TimedOut => Some(TransientCause::TimedOut),
            DownloaderError::Connection(_) => Some(TransientCause::NotConnected),
            DownloaderError::Transport(_) => None,
            DownloaderError::Http { .. } => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient_cause().is_some()
    }
}

/// A URL-domain error delivered when a request is rejected before any
/// network activity --- empty URL, or blacklisted without retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("url is empty")]
    Empty,
    #[error("url is on the failed-url blacklist")]
    Blacklisted,
}

/// Error surfaced by [`crate::manager::Manager::download_image`]'s
/// completion callback --- either a request rejected before any network
/// activity ([`UrlError`]) or a downloader failure propagated verbatim
/// ([`DownloaderError`]). See spec §7: both `UrlEmpty` and
/// `UrlBlacklisted` are delivered as a "file does not exist" error in
/// the URL-error domain, never as a bare missing value.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error(transparent)]
    Downloader(#[from] DownloaderError),
}

/// Errors from loading a [`crate::config::CacheConfig`] from disk.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}")]
    Read { path: PathBuf, #[source] source: io::Error },

    #[error("failed to parse config file at {path}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
}
