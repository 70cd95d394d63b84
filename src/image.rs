// Random-access byte windows over disk images.
//
// A `ByteWindow` is a (base, length) view into a shared backing store, either
// a file on disk (accessed with positioned reads, so no seek state is shared)
// or an in-memory buffer. Windows are cheap to clone and to sub-slice; every
// window derived from the same image shares one reference-counted backing
// store, so a window may outlive the `DiskImage` it was cut from.

use std::error;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
pub enum WindowError {
    /// A read extended past the end of the window.
    OutOfRange { offset: u64, len: u64, window: u64 },
    Io(io::Error),
}

impl error::Error for WindowError {}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WindowError::OutOfRange { offset, len, window } => write!(
                f,
                "read of {len} bytes at offset {offset} is outside window of {window} bytes"
            ),
            WindowError::Io(e) => write!(f, "image I/O error: {e}"),
        }
    }
}

impl From<io::Error> for WindowError {
    fn from(e: io::Error) -> Self {
        WindowError::Io(e)
    }
}

#[derive(Debug)]
enum Backing {
    File(File),
    Mem(Vec<u8>),
}

impl Backing {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Backing::File(f) => f.read_exact_at(buf, offset),
            Backing::Mem(v) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > v.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "read past end of buffer",
                    ));
                }
                buf.copy_from_slice(&v[start..end]);
                Ok(())
            }
        }
    }
}

/// A byte-addressable region of a disk image.
#[derive(Debug, Clone)]
pub struct ByteWindow {
    backing: Arc<Backing>,
    base: u64,
    len: u64,
}

impl ByteWindow {
    /// Opens the file at *path* read-only and returns a window covering all
    /// of it.
    pub fn open(path: &Path) -> io::Result<ByteWindow> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(ByteWindow {
            backing: Arc::new(Backing::File(file)),
            base: 0,
            len,
        })
    }

    /// Wraps an in-memory buffer. Used by the test-suite, and useful for
    /// callers that already hold an image in memory.
    pub fn from_vec(data: Vec<u8>) -> ByteWindow {
        let len = data.len() as u64;
        ByteWindow {
            backing: Arc::new(Backing::Mem(data)),
            base: 0,
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fills *buf* from the window starting at *offset*. The read is exact;
    /// a request reaching past the end of the window fails without reading.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), WindowError> {
        let len = buf.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(WindowError::OutOfRange {
                offset,
                len,
                window: self.len,
            });
        }
        self.backing.read_at(self.base + offset, buf)?;
        Ok(())
    }

    /// Reads *len* bytes at *offset* into a fresh buffer.
    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>, WindowError> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Returns a new window covering `[offset, offset + len)` of this one.
    /// The backing store is shared, not copied.
    pub fn subwindow(&self, offset: u64, len: u64) -> Result<ByteWindow, WindowError> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(WindowError::OutOfRange {
                offset,
                len,
                window: self.len,
            });
        }
        Ok(ByteWindow {
            backing: Arc::clone(&self.backing),
            base: self.base + offset,
            len,
        })
    }
}
