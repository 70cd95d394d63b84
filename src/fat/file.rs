// Read-only file streams over cluster chains.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::fat::{FatError, FatFileSystem};

/// An open file (or the byte stream backing a sub-directory) within a
/// `FatFileSystem`. The cluster chain is resolved once at open time, so
/// positioned reads are a direct lookup plus one window copy; corrupt chains
/// are rejected before the first byte is served.
///
/// Implements `Read` and `Seek`; reading past the recorded size yields EOF.
#[derive(Debug)]
pub struct FatFile {
    fs: Arc<FatFileSystem>,
    chain: Vec<u32>,
    size: u64,
    pos: u64,
}

impl FatFile {
    /// Opens the chain starting at *start*. With a known *size* (from a
    /// directory entry) the stream is exactly that long; without one the
    /// stream covers every cluster in the chain, which is how directory
    /// contents are sized.
    pub(crate) fn new(
        fs: &Arc<FatFileSystem>,
        start: u32,
        size: Option<u64>,
    ) -> Result<FatFile, FatError> {
        let cluster_size = u64::from(fs.cluster_size());
        if size == Some(0) {
            // A zero-length file carries no chain, whatever its
            // first-cluster field claims.
            return Ok(FatFile {
                fs: Arc::clone(fs),
                chain: Vec::new(),
                size: 0,
                pos: 0,
            });
        }
        let chain = if start == 0 {
            Vec::new()
        } else {
            fs.table().chain(start).collect::<Result<Vec<u32>, _>>()?
        };
        let chain_bytes = chain.len() as u64 * cluster_size;
        let size = match size {
            Some(s) => {
                if s > chain_bytes {
                    return Err(FatError::Damaged(format!(
                        "cluster chain holds {chain_bytes} bytes but the \
                         directory entry claims {s}"
                    )));
                }
                s
            }
            None => chain_bytes,
        };
        Ok(FatFile {
            fs: Arc::clone(fs),
            chain,
            size,
            pos: 0,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads the whole stream; used for directory contents.
    pub(crate) fn read_to_vec(&mut self) -> Result<Vec<u8>, FatError> {
        let mut buf = vec![0u8; self.size.saturating_sub(self.pos) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .read(&mut buf[filled..])
                .map_err(|e| FatError::Damaged(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl Read for FatFile {
    // Serves at most one cluster per call: the read never crosses a cluster
    // boundary, so it is a single window copy.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let cs = u64::from(self.fs.cluster_size());
        let index = (self.pos / cs) as usize;
        let within = self.pos % cs;
        let take = (cs - within)
            .min(buf.len() as u64)
            .min(self.size - self.pos) as usize;
        let cluster = self.chain[index];
        let offset = self.fs.cluster_offset(cluster) + within;
        self.fs
            .window()
            .read_at(offset, &mut buf[..take])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.pos += take as u64;
        Ok(take)
    }
}

impl Seek for FatFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.size.checked_add_signed(d),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            )),
        }
    }
}
