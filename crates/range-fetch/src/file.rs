use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;

use crate::FetchError;

/// Local-file twin of [`crate::RangeReader`]: same surface, no
/// buffering. The file is authoritative and cheap to hit, so every read
/// goes straight through. The modification time plays the role of the
/// change validator; there is no entity tag.
pub struct FileRangeReader {
    file: File,
    path: PathBuf,
    length: u64,
    modified: Option<SystemTime>,
}

impl FileRangeReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FetchError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let meta = file.metadata()?;
        Ok(Self {
            length: meta.len(),
            modified: meta.modified().ok(),
            file,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn position(&mut self) -> Result<u64, FetchError> {
        Ok(self.file.stream_position()?)
    }

    /// Read `size` bytes from the current position, or the rest of the
    /// file when `size` is `None`. Short only at end of file.
    pub fn read(&mut self, size: Option<usize>) -> Result<Bytes, FetchError> {
        match size {
            None => {
                let mut out = Vec::new();
                self.file.read_to_end(&mut out)?;
                Ok(Bytes::from(out))
            }
            Some(size) => {
                let mut out = vec![0u8; size];
                let mut filled = 0;
                while filled < size {
                    let read = self.file.read(&mut out[filled..])?;
                    if read == 0 {
                        break;
                    }
                    filled += read;
                }
                out.truncate(filled);
                Ok(Bytes::from(out))
            }
        }
    }

    /// Seek with the same clamp-at-zero contract as the remote reader.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, FetchError> {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.file.stream_position()? as i128 + delta as i128,
            SeekFrom::End(delta) => self.length as i128 + delta as i128,
        };
        let clamped = target.max(0).min(u64::MAX as i128) as u64;
        Ok(self.file.seek(SeekFrom::Start(clamped))?)
    }
}

impl io::Read for FileRangeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.file.read(out)
    }
}

impl io::Seek for FileRangeReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(FileRangeReader::seek(self, pos)?)
    }
}
