use std::time::Duration;

use bytes::Bytes;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, ETAG, LAST_MODIFIED, RANGE};
use reqwest::StatusCode;
use url::Url;

use crate::{FetchError, Validators};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of probing a resource without transferring its body.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub length: u64,
    pub validators: Validators,
}

/// One fetched byte range plus the metadata needed for change detection.
#[derive(Debug, Clone)]
pub struct FetchedRange {
    pub data: Bytes,
    pub total_length: u64,
    pub validators: Validators,
}

/// Transfer side of [`crate::RangeReader`]. The buffering logic never
/// talks to the network directly, which keeps it testable against an
/// in-memory implementation.
pub trait RangeBackend: Send {
    /// Discover the resource length and validators without a body.
    fn probe(&mut self) -> Result<ResourceInfo, FetchError>;

    /// Fetch `[start, end)`, or everything from `start` when `end` is
    /// `None`. Implementations must report the resource's total length
    /// with every response.
    fn fetch(&mut self, start: u64, end: Option<u64>) -> Result<FetchedRange, FetchError>;
}

/// HTTP implementation backed by a dedicated blocking client. Readers
/// run on archive worker threads, never on the async reactor.
pub struct HttpBackend {
    client: Client,
    url: Url,
}

impl HttpBackend {
    pub fn new(url: Url) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn transport(&self, source: reqwest::Error) -> FetchError {
        FetchError::Transport {
            url: self.url.to_string(),
            source,
        }
    }
}

impl RangeBackend for HttpBackend {
    fn probe(&mut self) -> Result<ResourceInfo, FetchError> {
        let response = self
            .client
            .head(self.url.clone())
            .send()
            .map_err(|err| self.transport(err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.to_string(),
                status: status.as_u16(),
            });
        }
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| FetchError::Length {
                url: self.url.to_string(),
            })?;
        let validators = read_validators(response.headers());
        tracing::debug!(target: "range_fetch", url = %self.url, length, "probed resource");
        Ok(ResourceInfo { length, validators })
    }

    fn fetch(&mut self, start: u64, end: Option<u64>) -> Result<FetchedRange, FetchError> {
        // Range headers use an inclusive end offset.
        let range = match end {
            Some(end) => format!("bytes={}-{}", start, end.saturating_sub(1)),
            None => format!("bytes={}-", start),
        };
        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, range)
            .send()
            .map_err(|err| self.transport(err))?;
        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            // A success status other than 206 means the server ignored
            // the Range header and is streaming the whole resource.
            return Err(if status.is_success() {
                FetchError::RangeNotSupported {
                    url: self.url.to_string(),
                    status: status.as_u16(),
                }
            } else {
                FetchError::Status {
                    url: self.url.to_string(),
                    status: status.as_u16(),
                }
            });
        }
        let total_length = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(content_range_total)
            .ok_or_else(|| FetchError::ContentRange {
                url: self.url.to_string(),
            })?;
        let validators = read_validators(response.headers());
        let data = response.bytes().map_err(|err| self.transport(err))?;
        Ok(FetchedRange {
            data,
            total_length,
            validators,
        })
    }
}

fn read_validators(headers: &reqwest::header::HeaderMap) -> Validators {
    let text = |name| {
        headers
            .get(name)
            .and_then(|value: &reqwest::header::HeaderValue| value.to_str().ok())
            .map(str::to_owned)
    };
    Validators {
        etag: text(ETAG),
        last_modified: text(LAST_MODIFIED),
    }
}

/// Extract the total length from a `Content-Range: bytes a-b/total`
/// header. A `*` total means the server does not know the length.
fn content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_parses_well_formed_header() {
        assert_eq!(content_range_total("bytes 0-5/52"), Some(52));
        assert_eq!(content_range_total("bytes 100-199/4294967296"), Some(4294967296));
    }

    #[test]
    fn content_range_total_rejects_unknown_or_garbage() {
        assert_eq!(content_range_total("bytes 0-5/*"), None);
        assert_eq!(content_range_total("items 0-5/52"), None);
        assert_eq!(content_range_total("bytes"), None);
        assert_eq!(content_range_total(""), None);
    }
}
