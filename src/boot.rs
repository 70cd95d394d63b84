// Boot-server policy: mapping a requested path onto a file inside a board's
// image.
//
// The Pi bootloader requests `<serial>/<path>`, where the serial is the
// board's hex serial number. The leading segment selects a configured board;
// its image's boot partition is mounted (and cached) and the rest of the
// path resolved inside that FAT file-system.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};

use crate::conf::{parse_serial, Board};
use crate::disk::DiskImage;
use crate::fat::{FatError, FatFileSystem};

/// Why a request could not be resolved, in terms the TFTP layer can map
/// straight onto error packets.
#[derive(Debug)]
pub enum ResolveError {
    /// Unknown serial, unknown path, or a path through a non-directory.
    NotFound(String),
    /// The source address failed the board's IP check, or the path names a
    /// directory.
    NotPermitted(String),
    /// The image or file-system underneath is unusable.
    Filesystem(String),
}

impl error::Error for ResolveError {}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolveError::NotFound(msg) => write!(f, "not found: {msg}"),
            ResolveError::NotPermitted(msg) => write!(f, "not permitted: {msg}"),
            ResolveError::Filesystem(msg) => write!(f, "filesystem error: {msg}"),
        }
    }
}

impl From<FatError> for ResolveError {
    fn from(e: FatError) -> Self {
        match e {
            FatError::NotFound(p) => ResolveError::NotFound(p),
            FatError::NotADirectory(p) => ResolveError::NotFound(p),
            FatError::IsADirectory(p) => ResolveError::NotPermitted(p),
            other => ResolveError::Filesystem(other.to_string()),
        }
    }
}

/// An opened file, ready to stream.
pub struct Source {
    pub reader: Box<dyn Read + Send>,
    pub size: u64,
}

/// The single capability a transfer needs from the world: turn a requested
/// filename and peer address into a byte stream.
pub trait Resolver: Send + Sync {
    fn resolve(&self, filename: &str, peer: SocketAddr) -> Result<Source, ResolveError>;
}

/// `Resolver` over the frozen board registry. The registry is swapped
/// atomically on reload; transfers in flight keep whatever `Arc` they
/// captured.
pub struct BootResolver {
    boards: RwLock<Arc<HashMap<u32, Board>>>,
    filesystems: Mutex<HashMap<u32, Arc<FatFileSystem>>>,
}

impl BootResolver {
    pub fn new(boards: HashMap<u32, Board>) -> BootResolver {
        BootResolver {
            boards: RwLock::new(Arc::new(boards)),
            filesystems: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the board registry (SIGHUP). Cached file-systems are
    /// dropped so new transfers see the new configuration; in-flight
    /// transfers keep their captured references alive.
    pub fn replace_boards(&self, boards: HashMap<u32, Board>) {
        *self.boards.write().unwrap() = Arc::new(boards);
        self.filesystems.lock().unwrap().clear();
    }

    pub fn boards(&self) -> Arc<HashMap<u32, Board>> {
        Arc::clone(&self.boards.read().unwrap())
    }

    fn filesystem(&self, serial: u32, board: &Board) -> Result<Arc<FatFileSystem>, ResolveError> {
        if let Some(fs) = self.filesystems.lock().unwrap().get(&serial) {
            return Ok(Arc::clone(fs));
        }
        let image = DiskImage::open(&board.image)
            .map_err(|e| ResolveError::Filesystem(format!("{}: {e}", board.image.display())))?;
        let window = image
            .partition(board.partition)
            .map_err(|e| ResolveError::Filesystem(format!("{}: {e}", board.image.display())))?;
        let fs = Arc::new(
            FatFileSystem::new(window)
                .map_err(|e| ResolveError::Filesystem(format!("{}: {e}", board.image.display())))?,
        );
        info!(
            "mounted {} partition {} ({}, label {:?}) for {serial:x}",
            board.image.display(),
            board.partition,
            fs.fat_type().name(),
            fs.label(),
        );
        self.filesystems
            .lock()
            .unwrap()
            .insert(serial, Arc::clone(&fs));
        Ok(fs)
    }

    fn open(&self, serial: u32, board: &Board, path: &str) -> Result<Source, ResolveError> {
        let fs = self.filesystem(serial, board)?;
        let file = fs.open(path).map_err(|e| {
            // A chain defect is a property of the volume, not of this one
            // request; remember it.
            if matches!(
                e,
                FatError::BadCluster(_) | FatError::ChainCycle(_) | FatError::ChainOutOfRange(_)
            ) {
                warn!("marking {} degraded: {e}", board.image.display());
                fs.mark_damaged();
            }
            ResolveError::from(e)
        })?;
        let size = file.size();
        Ok(Source {
            reader: Box::new(file),
            size,
        })
    }
}

/// IPv4-mapped IPv6 peers must compare equal to their plain IPv4 form.
fn canonical_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        v4 => v4,
    }
}

impl Resolver for BootResolver {
    fn resolve(&self, filename: &str, peer: SocketAddr) -> Result<Source, ResolveError> {
        let boards = self.boards();
        let trimmed = filename.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(ResolveError::NotFound(filename.to_string()));
        }
        let (prefix, rest) = match trimmed.split_once('/') {
            Some((prefix, rest)) => (prefix, Some(rest)),
            None => (trimmed, None),
        };
        let known = parse_serial(prefix)
            .ok()
            .and_then(|serial| boards.get(&serial).map(|board| (serial, board)));
        let (serial, board, path) = match (known, rest) {
            (Some((serial, board)), Some(rest)) => (serial, board, rest),
            (Some((serial, board)), None) => (serial, board, ""),
            // A board that has already fetched its bootcode falls back to
            // requesting bare paths with no serial prefix. That can only be
            // honored when a single board is configured.
            (None, None) if boards.len() == 1 => {
                let (serial, board) = boards.iter().next().unwrap();
                (*serial, board, trimmed)
            }
            _ => return Err(ResolveError::NotFound(filename.to_string())),
        };
        if let Some(acl) = board.ip {
            if canonical_ip(peer.ip()) != canonical_ip(acl) {
                return Err(ResolveError::NotPermitted(format!(
                    "request for {serial:x} from {}, expected {acl}",
                    peer.ip()
                )));
            }
        }
        if path.is_empty() {
            return Err(ResolveError::NotFound(filename.to_string()));
        }
        self.open(serial, board, path)
    }
}
