//! Object storage transfer primitives.
//!
//! - [`ByteStream`]: a seekable byte source with a known size
//! - [`slice::StreamSlice`]: a bounded read window over a seekable stream
//! - [`upload::ResumableUpload`]: the resumable chunked upload protocol
//! - [`content_type`]: upload content types from object names

pub mod content_type;
pub mod slice;
pub mod upload;

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

pub use content_type::content_type_for;
pub use slice::StreamSlice;
pub use upload::{ResumableUpload, DEFAULT_CHUNK_SIZE};

/// Readable, seekable, and shareable between threads.
pub trait SeekRead: Read + Seek + Send + Sync {}

impl<T: Read + Seek + Send + Sync> SeekRead for T {}

/// A seekable byte source whose total size is known up front.
pub struct ByteStream {
    inner: Box<dyn SeekRead>,
    size: u64,
}

impl ByteStream {
    /// An in-memory stream.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let size = bytes.len() as u64;
        Self {
            inner: Box::new(Cursor::new(bytes)),
            size,
        }
    }

    /// Wraps any seekable reader, measuring its size and rewinding it.
    pub fn from_reader<R: SeekRead + 'static>(mut reader: R) -> io::Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        reader.rewind()?;
        Ok(Self {
            inner: Box::new(reader),
            size,
        })
    }

    /// Opens a file as a stream.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    /// Total size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads the whole stream from the start and leaves it rewound.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.inner.rewind()?;
        let mut buf = Vec::with_capacity(self.size as usize);
        self.inner.read_to_end(&mut buf)?;
        self.inner.rewind()?;
        Ok(buf)
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for ByteStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream").field("size", &self.size).finish()
    }
}
