use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::RangeReader;
use crate::error::IoError;

/// RangeReader over any caller-supplied `Read + Seek` stream.
///
/// The stream keeps its cursor position across reads: every read seeks to the
/// requested offset and seeks back before returning, so the owner can keep
/// using the stream after images built on it are dropped. The stream is
/// guarded by a mutex, which allows at most one seek/read sequence at a time.
/// Reads run on tokio's blocking pool.
#[derive(Debug)]
pub struct SeekableReader<R> {
    inner: Arc<Mutex<R>>,
    size: u64,
    identifier: String,
}

impl<R: Read + Seek + Send + 'static> SeekableReader<R> {
    /// Wrap `stream`, measuring its length once.
    ///
    /// The stream's current position is preserved.
    pub fn new(mut stream: R, identifier: impl Into<String>) -> Result<Self, IoError> {
        let identifier = identifier.into();
        let size = measure(&mut stream).map_err(|e| read_error(&identifier, e))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(stream)),
            size,
            identifier,
        })
    }

    /// Unwrap the stream, returning it to the caller.
    ///
    /// `None` while a read whose future was dropped is still running on the
    /// blocking pool.
    pub fn into_inner(self) -> Option<R> {
        let mutex = Arc::try_unwrap(self.inner).ok()?;
        Some(match mutex.into_inner() {
            Ok(stream) => stream,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    async fn read_restoring(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let inner = Arc::clone(&self.inner);
        let task = tokio::task::spawn_blocking(move || {
            let mut stream = inner
                .lock()
                .map_err(|_| "stream lock poisoned".to_string())?;
            read_at(&mut *stream, offset, len).map_err(|e| e.to_string())
        });

        match task.await {
            Ok(result) => result.map_err(|message| read_error(&self.identifier, message)),
            Err(join) => Err(read_error(&self.identifier, join)),
        }
    }
}

impl SeekableReader<File> {
    /// Open a local file as a stream source.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref();
        let identifier = path.display().to_string();
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IoError::NotFound(identifier.clone())
            } else {
                read_error(&identifier, e)
            }
        })?;
        debug!(path = %identifier, "opened file source");
        Self::new(file, identifier)
    }
}

#[async_trait]
impl<R: Read + Seek + Send + 'static> RangeReader for SeekableReader<R> {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.size,
            });
        }

        if len == 0 {
            return Ok(Bytes::new());
        }

        self.read_restoring(offset, len).await
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// Stream length, leaving the cursor where it was.
fn measure<R: Seek>(stream: &mut R) -> std::io::Result<u64> {
    let position = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(position))?;
    Ok(end)
}

fn read_at<R: Read + Seek>(stream: &mut R, offset: u64, len: usize) -> std::io::Result<Bytes> {
    let position = stream.stream_position()?;
    stream.seek(SeekFrom::Start(offset))?;

    let mut buf = vec![0u8; len];
    let read = stream.read_exact(&mut buf);

    // Restore even when the read failed
    stream.seek(SeekFrom::Start(position))?;
    read?;

    Ok(Bytes::from(buf))
}

fn read_error(identifier: &str, e: impl ToString) -> IoError {
    IoError::Read {
        source_id: identifier.to_string(),
        message: e.to_string(),
    }
}
