//! Read-only view of the chunked cache driver's stat directory. The
//! driver is a separate process; it exposes numeric stat files under
//! `stats/` and append-only newline-delimited index streams under
//! `streams/`. We only ever read them.

use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::session::VmEvent;
use crate::util::RangeConsolidator;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ChunkStatsDir {
    root: PathBuf,
}

impl ChunkStatsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Total number of chunks in the image.
    pub async fn total_chunks(&self) -> io::Result<u64> {
        read_numeric_stat(self.root.join("stats").join("chunks")).await
    }

    /// Follow the stream of chunk indices fetched into the cache.
    pub fn follow_fetched(&self) -> ChunkStream {
        ChunkStream::new(self.root.join("streams").join("chunk_fetched"))
    }
}

async fn read_numeric_stat(path: PathBuf) -> io::Result<u64> {
    let text = fs::read_to_string(&path).await?;
    text.trim().parse::<u64>().map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad numeric stat {}: {err}", path.display()),
        )
    })
}

/// Tails an append-only newline-delimited stream of chunk indices.
/// The file may not exist yet when the cache driver is still warming
/// up; that simply reads as "nothing new".
pub struct ChunkStream {
    path: PathBuf,
    offset: u64,
    pending: VecDeque<u64>,
}

impl ChunkStream {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            pending: VecDeque::new(),
        }
    }

    /// Next chunk index, waiting for the stream to grow if needed.
    pub async fn next_index(&mut self) -> io::Result<u64> {
        loop {
            if let Some(index) = self.pending.pop_front() {
                return Ok(index);
            }
            self.poll_file().await?;
            if self.pending.is_empty() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    async fn poll_file(&mut self) -> io::Result<()> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut text = String::new();
        file.read_to_string(&mut text).await?;

        // Only complete lines count; a partially appended line is
        // picked up on the next poll.
        let mut consumed = 0usize;
        for line in text.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break;
            }
            consumed += line.len();
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.parse::<u64>() {
                Ok(index) => self.pending.push_back(index),
                Err(_) => {
                    warn!(target: "mirage::session", line = trimmed, "unparseable chunk index")
                }
            }
        }
        self.offset += consumed as u64;
        Ok(())
    }
}

/// Report fetch progress until every chunk has been seen at least
/// once. Progress events carry the distinct-chunk count against the
/// total.
pub async fn watch_startup(
    dir: &ChunkStatsDir,
    events: &broadcast::Sender<VmEvent>,
) -> io::Result<()> {
    let total = dir.total_chunks().await?;
    if total == 0 {
        return Ok(());
    }
    let mut stream = dir.follow_fetched();
    let mut seen = RangeConsolidator::new();
    while seen.count() < total {
        let index = stream.next_index().await?;
        let before = seen.count();
        seen.add(index);
        if seen.count() != before {
            let _ = events.send(VmEvent::StartupProgress {
                count: seen.count(),
                total,
            });
        }
    }
    debug!(target: "mirage::session", spans = %seen.summarize(), "image fully populated");
    Ok(())
}
