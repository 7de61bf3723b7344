#![forbid(unsafe_code)]

use std::{
    fs::File,
    io::{self, ErrorKind},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{Result, StoreError};

mod channel;

pub use channel::{BlockIo, FileChannel};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(unix)]
mod stdio_unix {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio_win {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Creates a new StdFileIo from an existing File handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(StoreError::from)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_unix::read_exact(self.file(), off, dst)
    }

    #[cfg(windows)]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        stdio_win::read_exact(self.file(), off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(self.file(), off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(self.file(), off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_exact(&self, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        trace!(off, len = dst.len(), "io.read_at");
        self.read_exact(off, dst).map_err(StoreError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write_at");
        self.write_all(off, src).map_err(StoreError::from)
    }

    fn sync_all(&self) -> Result<()> {
        let result = self.file().sync_all().map_err(StoreError::from);
        if let Err(err) = &result {
            trace!(error = %err, "io.sync_all.failed");
        }
        result
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(StoreError::from)?.len())
    }
}

/// In-memory file used by tests and by stores that do not need persistence.
///
/// Writes and syncs can be made to fail on demand to exercise error propagation.
#[derive(Clone, Default)]
pub struct MemFileIo {
    inner: Arc<MemInner>,
}

#[derive(Default)]
struct MemInner {
    bytes: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    fail_syncs: AtomicBool,
    syncs: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent syncs fail (or succeed again).
    pub fn fail_syncs(&self, fail: bool) {
        self.inner.fail_syncs.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `sync_all` calls.
    pub fn sync_count(&self) -> u64 {
        self.inner.syncs.load(Ordering::SeqCst)
    }

    /// Number of successful `write_at` calls.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of successful `read_at` calls.
    pub fn read_count(&self) -> u64 {
        self.inner.reads.load(Ordering::SeqCst)
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.inner.bytes.lock();
        let start = off as usize;
        let end = start + dst.len();
        if end > bytes.len() {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of in-memory file",
            )));
        }
        dst.copy_from_slice(&bytes[start..end]);
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "injected write failure",
            )));
        }
        let mut bytes = self.inner.bytes.lock();
        let start = off as usize;
        let end = start + src.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        if self.inner.fail_syncs.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "injected sync failure",
            )));
        }
        self.inner.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.bytes.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let io = StdFileIo::open(&path).unwrap();

        let payload = b"hello mundo";
        io.write_at(0, payload).unwrap();
        io.sync_all().unwrap();

        let mut buf = vec![0u8; payload.len()];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, payload);
        assert!(io.len().unwrap() >= payload.len() as u64);
    }

    #[test]
    fn read_past_eof_returns_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let io = StdFileIo::open(&path).unwrap();
        let mut buf = [0u8; 8];
        let err = io.read_at(0, &mut buf).unwrap_err();
        match err {
            StoreError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reopen_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io_roundtrip.bin");
        {
            let io = StdFileIo::open(&path).unwrap();
            let buf = vec![42u8; 8192];
            io.write_at(0, &buf).unwrap();
            io.sync_all().unwrap();
        }
        let reopen = StdFileIo::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap(),
        );
        let mut buf = vec![0u8; 8192];
        reopen.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 42));
    }

    #[test]
    fn mem_file_injects_failures() {
        let io = MemFileIo::new();
        io.write_at(4, b"abcd").unwrap();
        assert_eq!(io.len().unwrap(), 8);
        io.fail_writes(true);
        assert!(matches!(io.write_at(0, b"x"), Err(StoreError::Io(_))));
        io.fail_syncs(true);
        assert!(io.sync_all().is_err());
        io.fail_syncs(false);
        io.sync_all().unwrap();
        assert_eq!(io.sync_count(), 1);
        let mut buf = [0u8; 4];
        io.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
