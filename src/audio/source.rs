use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A byte source that may still be growing while it is read
///
/// Implementations:
/// - File: a capture file a recorder is still appending to
/// - Memory: an in-process buffer fed by a capture callback
///
/// Lengths must never decrease.
#[async_trait::async_trait]
pub trait GrowingSource: Send + Sync {
    /// Number of bytes currently available
    async fn current_length(&self) -> io::Result<u64>;

    /// Read exactly `length` bytes starting at `offset`
    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Vec<u8>>;

    /// Whether the capture is still producing bytes
    async fn is_still_producing(&self) -> bool;

    /// Source name for logging
    fn name(&self) -> &str;
}

/// Capture file on disk
pub struct FileSource {
    path: PathBuf,
    name: String,
    producing: Arc<AtomicBool>,
}

impl FileSource {
    /// Source whose recorder clears `producing` when it stops writing
    pub fn new(path: impl AsRef<Path>, producing: Arc<AtomicBool>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            producing,
        }
    }

    /// Source for a file that is already complete
    pub fn complete(path: impl AsRef<Path>) -> Self {
        Self::new(path, Arc::new(AtomicBool::new(false)))
    }
}

#[async_trait::async_trait]
impl GrowingSource for FileSource {
    async fn current_length(&self) -> io::Result<u64> {
        // The recorder may not have created the file yet
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; buffer_len(length)?];

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buffer).await?;

        Ok(buffer)
    }

    async fn is_still_producing(&self) -> bool {
        self.producing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// In-memory capture buffer
///
/// Clones share the same buffer, so a capture callback can `append` while
/// the streamer reads.
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    buffer: Mutex<Vec<u8>>,
    finished: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source holding `bytes` with capture already finished
    pub fn finished_with(bytes: &[u8]) -> Self {
        let source = Self::new();
        source.append(bytes);
        source.finish();
        source
    }

    pub fn append(&self, bytes: &[u8]) {
        self.buffer().extend_from_slice(bytes);
    }

    /// Mark the capture as no longer producing
    pub fn finish(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl GrowingSource for MemorySource {
    async fn current_length(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let buffer = self.buffer();
        let start = buffer_len(offset)?;
        let end = start
            .checked_add(buffer_len(length)?)
            .filter(|end| *end <= buffer.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "range {}+{} beyond buffered {} bytes",
                        offset,
                        length,
                        buffer.len()
                    ),
                )
            })?;

        Ok(buffer[start..end].to_vec())
    }

    async fn is_still_producing(&self) -> bool {
        !self.inner.finished.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

fn buffer_len(length: u64) -> io::Result<usize> {
    usize::try_from(length).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} bytes does not fit in memory", length),
        )
    })
}
