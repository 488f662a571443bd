//! Bounded byte stream views
//!
//! A [`ByteStream`] is a window over a shared [`ByteSource`]. Cloning a
//! stream or taking a sub-range with [`ByteStream::slice`] never copies the
//! underlying data, so a parsed image can hand out views of its children
//! without reading them.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result, ResultExt};

/// Shared immutable byte buffer
pub type Blob = Arc<[u8]>;

/// Something that can be read at arbitrary offsets
pub trait ByteSource: fmt::Debug + Send + Sync {
    /// Total size of the source in bytes
    fn size(&self) -> io::Result<u64>;

    /// Read up to `buf.len()` bytes at `offset`, returning the count read
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// The whole source, if it is already in memory
    fn as_blob(&self) -> Option<&Blob> {
        None
    }
}

#[derive(Debug)]
struct MemorySource(Blob);

impl ByteSource for MemorySource {
    fn size(&self) -> io::Result<u64> {
        Ok(self.0.len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.0.len());
        let n = buf.len().min(self.0.len() - start);
        buf[..n].copy_from_slice(&self.0[start..start + n]);
        Ok(n)
    }

    fn as_blob(&self) -> Option<&Blob> {
        Some(&self.0)
    }
}

/// A file read lazily through a seek and read
#[derive(Debug)]
pub struct FileSource {
    file: Mutex<File>,
}

impl FileSource {
    /// Wrap an open file
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> io::Result<u64> {
        let file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("file lock poisoned"))?;
        Ok(file.metadata()?.len())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("file lock poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

/// A bounded, cheaply clonable view over a byte source
#[derive(Debug, Clone)]
pub struct ByteStream {
    source: Arc<dyn ByteSource>,
    base: u64,
    /// `None` means "until the end of the source"
    len: Option<u64>,
}

impl ByteStream {
    /// Stream over an owned buffer
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::from_blob(Blob::from(data.into()))
    }

    /// Stream over a shared buffer
    pub fn from_blob(blob: Blob) -> Self {
        Self::from_source(Arc::new(MemorySource(blob)))
    }

    /// Stream over any source
    pub fn from_source(source: Arc<dyn ByteSource>) -> Self {
        Self {
            source,
            base: 0,
            len: None,
        }
    }

    /// Stream over a file on disk, read on demand
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self::from_source(Arc::new(FileSource::new(file))))
    }

    /// Size of the view in bytes
    pub fn size(&self) -> io::Result<u64> {
        match self.len {
            Some(len) => Ok(len),
            None => Ok(self.source.size()?.saturating_sub(self.base)),
        }
    }

    /// Fill `buf` from `offset`, failing if the view is too short
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let size = self.size()?;
        let end = offset.checked_add(buf.len() as u64);
        if end.map_or(true, |end| end > size) {
            return Err(Error::InvalidData(format!(
                "read of 0x{:x} bytes at 0x{:x} outside of stream size 0x{:x}",
                buf.len(),
                offset,
                size
            )));
        }
        let mut total = 0;
        while total < buf.len() {
            let n = self
                .source
                .read_at(self.base + offset + total as u64, &mut buf[total..])?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended at 0x{:x}", self.base + offset + total as u64),
                )));
            }
            total += n;
        }
        Ok(())
    }

    /// Read `len` bytes at `offset` into a new buffer
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if let Some(blob) = self.source.as_blob() {
            let size = self.size()?;
            let start = self.base + offset;
            if offset.checked_add(len as u64).map_or(true, |end| end > size) {
                return Err(Error::InvalidData(format!(
                    "read of 0x{:x} bytes at 0x{:x} outside of stream size 0x{:x}",
                    len, offset, size
                )));
            }
            let start = start as usize;
            return Ok(blob[start..start + len].to_vec());
        }
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read one byte
    pub fn read_u8(&self, offset: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_at(offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Read a little-endian u32
    pub fn read_u32_le(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Narrower view without copying; `(0, size)` returns a clone
    pub fn slice(&self, offset: u64, len: u64) -> Result<Self> {
        let size = self.size()?;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(Error::Internal(format!(
                "cannot cut 0x{:x} bytes at 0x{:x} from stream of size 0x{:x}",
                len, offset, size
            )));
        }
        if offset == 0 && len == size {
            return Ok(self.clone());
        }
        Ok(Self {
            source: Arc::clone(&self.source),
            base: self.base + offset,
            len: Some(len),
        })
    }

    /// Read the whole view into a buffer
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let size = usize::try_from(self.size()?)
            .map_err(|_| Error::InvalidData("stream too large for memory".into()))?;
        self.read_bytes(0, size)
    }

    /// Equivalent view whose source lives in memory
    pub fn to_memory(&self) -> Result<Self> {
        if self.source.as_blob().is_some() {
            return Ok(self.clone());
        }
        Ok(Self::from_bytes(self.to_vec()?))
    }
}

impl From<Vec<u8>> for ByteStream {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Blob> for ByteStream {
    fn from(blob: Blob) -> Self {
        Self::from_blob(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_slice_is_view() {
        let stream = ByteStream::from_bytes(b"0123456789".to_vec());
        let sub = stream.slice(2, 4).unwrap();
        assert_eq!(sub.size().unwrap(), 4);
        assert_eq!(sub.to_vec().unwrap(), b"2345");

        let subsub = sub.slice(1, 2).unwrap();
        assert_eq!(subsub.to_vec().unwrap(), b"34");
    }

    #[test]
    fn test_slice_out_of_range() {
        let stream = ByteStream::from_bytes(vec![0u8; 4]);
        assert!(stream.slice(2, 3).is_err());
        assert!(stream.slice(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_read_past_end() {
        let stream = ByteStream::from_bytes(vec![1, 2, 3]);
        let mut buf = [0u8; 2];
        assert!(stream.read_at(2, &mut buf).is_err());
        stream.read_at(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let stream = ByteStream::from_file(file.path()).unwrap();
        assert_eq!(stream.size().unwrap(), 11);
        let sub = stream.slice(6, 5).unwrap();
        assert_eq!(sub.to_vec().unwrap(), b"world");
        assert_eq!(sub.read_u8(0).unwrap(), b'w');

        let mem = sub.to_memory().unwrap();
        assert_eq!(mem.to_vec().unwrap(), b"world");
    }
}
