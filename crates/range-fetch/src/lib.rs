//! Seekable, buffered random access to remote HTTP resources and local
//! files, built for archive readers that probe large images a few bytes
//! at a time. Every transport failure surfaces as [`FetchError`] so
//! callers can distinguish I/O trouble from "not found" in their own
//! formats.

use thiserror::Error;

mod backend;
mod file;
mod reader;

pub use backend::{FetchedRange, HttpBackend, RangeBackend, ResourceInfo};
pub use file::FileRangeReader;
pub use reader::{RangeReader, DEFAULT_BUFFER_SIZE};

/// Change-detection validators captured from the first successful
/// response. Values are opaque; only equality matters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// The single error kind for everything that can go wrong while reading
/// a range source. Archive parsers map this to their own I/O error and
/// must never interpret it as a missing entry.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("server ignored the range request for {url} (HTTP {status})")]
    RangeNotSupported { url: String, status: u16 },
    #[error("missing or malformed Content-Range in response for {url}")]
    ContentRange { url: String },
    #[error("missing Content-Length in response for {url}")]
    Length { url: String },
    #[error("resource changed while reading: {detail}")]
    ResourceChanged { detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FetchError> for std::io::Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Io(io) => io,
            other => std::io::Error::other(other),
        }
    }
}
