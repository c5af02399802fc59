use std::io::{self, SeekFrom};

use bytes::{Bytes, BytesMut};
use url::Url;

use crate::backend::{HttpBackend, RangeBackend};
use crate::{FetchError, Validators};

/// Read-ahead window. Sized for central-directory probing: large enough
/// to swallow a burst of small scattered reads, small enough that a
/// miss costs one cheap request.
pub const DEFAULT_BUFFER_SIZE: u64 = 64 * 1024;

/// Seekable view of a remote resource that satisfies reads from a single
/// contiguous read-ahead buffer whenever it can, and otherwise issues
/// exactly one ranged fetch shaped to the access pattern.
///
/// Every fetch re-checks the validators captured on the first response;
/// a mismatch fails hard with [`FetchError::ResourceChanged`] because
/// bytes already handed out may no longer match the resource.
pub struct RangeReader<B> {
    backend: B,
    buffer_size: u64,
    offset: u64,
    length: Option<u64>,
    validators: Option<Validators>,
    buffer: Bytes,
    buffer_offset: u64,
}

impl RangeReader<HttpBackend> {
    pub fn open(url: Url) -> Result<Self, FetchError> {
        Ok(Self::with_backend(HttpBackend::new(url)?))
    }
}

impl<B: RangeBackend> RangeReader<B> {
    pub fn with_backend(backend: B) -> Self {
        Self::with_buffer_size(backend, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(backend: B, buffer_size: u64) -> Self {
        assert!(buffer_size > 0, "buffer size must be nonzero");
        Self {
            backend,
            buffer_size,
            offset: 0,
            length: None,
            validators: None,
            buffer: Bytes::new(),
            buffer_offset: 0,
        }
    }

    /// Current logical offset. Independent of the buffer.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Validators seen on the first successful fetch, if any yet.
    pub fn validators(&self) -> Option<&Validators> {
        self.validators.as_ref()
    }

    /// Total resource length, probing the backend once if it is not
    /// known yet.
    pub fn len(&mut self) -> Result<u64, FetchError> {
        if let Some(length) = self.length {
            return Ok(length);
        }
        let info = self.backend.probe()?;
        self.accept_validators(&info.validators)?;
        self.length = Some(info.length);
        Ok(info.length)
    }

    /// Read `size` bytes from the current offset, or the rest of the
    /// resource when `size` is `None`. Returns fewer bytes only at end
    /// of file.
    pub fn read(&mut self, size: Option<usize>) -> Result<Bytes, FetchError> {
        match size {
            Some(size) => self.read_sized(size as u64),
            None => match self.length {
                // Length still unknown: one open-ended request both
                // discovers it and returns the remainder, with a window
                // before the offset kept for backward probes.
                None => self.read_to_end_unsized(),
                Some(length) => {
                    let remaining = length.saturating_sub(self.offset);
                    self.read_sized(remaining)
                }
            },
        }
    }

    /// Adjust the logical offset. Never touches the buffer and performs
    /// no transfer; an end-relative seek may trigger the one-time length
    /// probe. Offsets that would land before zero clamp to zero.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, FetchError> {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.offset as i128 + delta as i128,
            SeekFrom::End(delta) => self.len()? as i128 + delta as i128,
        };
        self.offset = target.max(0).min(u64::MAX as i128) as u64;
        Ok(self.offset)
    }

    fn read_sized(&mut self, size: u64) -> Result<Bytes, FetchError> {
        if size == 0 {
            return Ok(Bytes::new());
        }
        let length = self.len()?;
        let start = self.offset;
        if start >= length {
            return Ok(Bytes::new());
        }
        let end = (start + size).min(length);
        let buf_start = self.buffer_offset;
        let buf_end = self.buffer_offset + self.buffer.len() as u64;

        let data = if start >= buf_start && end <= buf_end {
            // Entirely buffered: slice, no transfer.
            self.buffer
                .slice((start - buf_start) as usize..(end - buf_start) as usize)
        } else if start >= buf_start && start < buf_end {
            // Head is buffered, tail extends past the buffer: consume
            // the head and fetch the missing tail plus one read-ahead
            // window starting right after the buffer.
            let head = self.buffer.slice((start - buf_start) as usize..);
            let missing = (end - buf_end) as usize;
            let fetch_end = (end + self.buffer_size).min(length);
            let fetched = self.fetch(buf_end, Some(fetch_end))?;
            let mut out = BytesMut::with_capacity((end - start) as usize);
            out.extend_from_slice(&head);
            out.extend_from_slice(&fetched[..missing]);
            self.buffer = fetched.slice(missing..);
            self.buffer_offset = end;
            out.freeze()
        } else if start < buf_start && end > buf_start && end <= buf_end {
            // Tail is buffered, head lies before the buffer: backfill
            // one window ending where the buffer begins (further back if
            // the request starts earlier than that) and keep the grown
            // buffer.
            let fetch_start = start.min(buf_start.saturating_sub(self.buffer_size));
            let fetched = self.fetch(fetch_start, Some(buf_start))?;
            let mut combined = BytesMut::with_capacity(fetched.len() + self.buffer.len());
            combined.extend_from_slice(&fetched);
            combined.extend_from_slice(&self.buffer);
            self.buffer = combined.freeze();
            self.buffer_offset = fetch_start;
            self.buffer
                .slice((start - fetch_start) as usize..(end - fetch_start) as usize)
        } else if end >= length {
            // Read reaches end of file and the buffer is no help: pull
            // in a window before the request too, since trailer parsers
            // walk backwards from here next.
            let fetch_start = start.saturating_sub(self.buffer_size);
            let fetched = self.fetch(fetch_start, Some(end))?;
            self.buffer = fetched;
            self.buffer_offset = fetch_start;
            self.buffer.slice((start - fetch_start) as usize..)
        } else {
            // Unrelated to the buffer: fetch the request plus one
            // read-ahead window and keep the excess.
            let fetch_end = (end + self.buffer_size).min(length);
            let fetched = self.fetch(start, Some(fetch_end))?;
            let returned = (end - start) as usize;
            let out = fetched.slice(..returned);
            self.buffer = fetched.slice(returned..);
            self.buffer_offset = end;
            out
        };
        self.offset = end;
        Ok(data)
    }

    fn read_to_end_unsized(&mut self) -> Result<Bytes, FetchError> {
        let start = self.offset;
        let fetch_start = start.saturating_sub(self.buffer_size);
        let fetched = self.fetch(fetch_start, None)?;
        let rel = ((start - fetch_start) as usize).min(fetched.len());
        let out = fetched.slice(rel..);
        self.buffer = fetched.slice(..rel);
        self.buffer_offset = fetch_start;
        self.offset = fetch_start + fetched.len() as u64;
        Ok(out)
    }

    fn fetch(&mut self, start: u64, end: Option<u64>) -> Result<Bytes, FetchError> {
        let fetched = self.backend.fetch(start, end)?;
        self.accept_validators(&fetched.validators)?;
        self.accept_length(fetched.total_length)?;
        tracing::trace!(
            target: "range_fetch",
            start,
            len = fetched.data.len(),
            "fetched range"
        );
        Ok(fetched.data)
    }

    fn accept_validators(&mut self, seen: &Validators) -> Result<(), FetchError> {
        match &self.validators {
            None => {
                self.validators = Some(seen.clone());
                Ok(())
            }
            Some(first) if first == seen => Ok(()),
            Some(first) => Err(FetchError::ResourceChanged {
                detail: format!("validators were {first:?}, now {seen:?}"),
            }),
        }
    }

    fn accept_length(&mut self, total: u64) -> Result<(), FetchError> {
        match self.length {
            None => {
                self.length = Some(total);
                Ok(())
            }
            Some(known) if known == total => Ok(()),
            Some(known) => Err(FetchError::ResourceChanged {
                detail: format!("length was {known}, now {total}"),
            }),
        }
    }
}

impl<B: RangeBackend> io::Read for RangeReader<B> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let data = self.read_sized(out.len() as u64)?;
        out[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl<B: RangeBackend> io::Seek for RangeReader<B> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(RangeReader::seek(self, pos)?)
    }
}
