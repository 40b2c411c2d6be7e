//! Byte-stream access to the input container.
//!
//! Demuxers never touch files directly; they read through a [`ByteSource`],
//! which can be backed by a file, an in-memory buffer, or anything else the
//! embedding application provides. Sources are read-only.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

use crate::error::OutOfMemory;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Writing to an input source is not supported")]
    WriteUnsupported,
    #[error("Seek to negative offset {0}")]
    NegativeSeek(i64),
    /// A unit could not be buffered. The source skipped past it.
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
}

/// Seek origin. `Size` is the "tell me the total length" request some
/// demuxers issue through the seek call; it never moves the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
    Size,
}

pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes. Returns 0 at end of input.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError>;

    /// Move the read position. Returns the new absolute offset, or the total
    /// size for [`Whence::Size`].
    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, SourceError>;

    /// Total length in bytes
    fn size(&mut self) -> Result<u64, SourceError>;

    fn write(&mut self, _buf: &[u8]) -> Result<usize, SourceError> {
        tracing::warn!("Rejected write to a read-only input source");
        Err(SourceError::WriteUnsupported)
    }
}

// ============================================================================
// Reader-backed sources
// ============================================================================

/// A [`ByteSource`] over any seekable reader
pub struct ReaderSource<R> {
    inner: R,
}

pub type FileSource = ReaderSource<BufReader<File>>;
pub type MemorySource = ReaderSource<Cursor<Vec<u8>>>;

impl<R: Read + Seek + Send> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        tracing::debug!("Opened input source {}", path.display());
        Ok(Self::new(BufReader::new(file)))
    }
}

impl MemorySource {
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Cursor::new(data.into()))
    }
}

impl<R: Read + Seek + Send> ByteSource for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, SourceError> {
        let target = match whence {
            Whence::Size => return self.size(),
            Whence::Start => {
                let start = u64::try_from(offset).map_err(|_| SourceError::NegativeSeek(offset))?;
                SeekFrom::Start(start)
            }
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        Ok(self.inner.seek(target)?)
    }

    fn size(&mut self) -> Result<u64, SourceError> {
        let position = self.inner.stream_position()?;
        let size = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(position))?;
        Ok(size)
    }
}

// ============================================================================
// std::io bridge
// ============================================================================

/// Exposes a [`ByteSource`] as `std::io::Read + Seek` for parsers that
/// expect the standard traits.
pub struct SourceReader<S> {
    source: S,
}

impl<S: ByteSource> SourceReader<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

fn to_io(err: SourceError) -> io::Error {
    match err {
        SourceError::Io(e) => e,
        SourceError::WriteUnsupported => io::Error::new(io::ErrorKind::Unsupported, err),
        SourceError::NegativeSeek(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
        SourceError::OutOfMemory(_) => io::Error::new(io::ErrorKind::OutOfMemory, err),
    }
}

impl<S: ByteSource> Read for SourceReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf).map_err(to_io)
    }
}

impl<S: ByteSource> Seek for SourceReader<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(n) => {
                let n = i64::try_from(n).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
                (n, Whence::Start)
            }
            SeekFrom::Current(n) => (n, Whence::Current),
            SeekFrom::End(n) => (n, Whence::End),
        };
        self.source.seek(offset, whence).map_err(to_io)
    }
}
