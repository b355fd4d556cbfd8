//! Boot-server policy (§4.6): serial-prefix → board → partition → FAT path,
//! with per-board IP ACL enforcement and a cache of opened images and
//! mounted filesystems so a repeat RRQ never re-reads a BPB or re-mmaps an
//! image it has already opened.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use nobodd_fat::{FatFileSystem, FatPath, RandomRead, Window};

use crate::config::{Board, BoardRegistry};
use crate::error::ResolutionError;
use crate::image::DiskImage;
use crate::partition;

/// A successfully resolved RRQ: the mounted filesystem it landed on plus
/// the path within it. Kept separate rather than opening the file here so
/// the dispatcher can reopen it a second time for netascii `tsize`
/// precomputation without re-walking board/ACL/mount resolution.
pub struct Resolved {
    pub fs: Arc<FatFileSystem>,
    pub path: FatPath,
    pub size: u64,
}

/// Ties the frozen board registry to the per-(image, partition) cache of
/// mounted filesystems. One instance lives for the life of the process;
/// `reload` swaps the registry root on `SIGHUP` without disturbing the
/// cache (the images on disk haven't changed, only which boards point at
/// them).
pub struct BootServer {
    boards: ArcSwap<BoardRegistry>,
    images: RefCell<HashMap<PathBuf, Arc<DiskImage>>>,
    filesystems: RefCell<HashMap<(PathBuf, u32), Result<Arc<FatFileSystem>, String>>>,
}

impl BootServer {
    pub fn new(boards: Arc<BoardRegistry>) -> BootServer {
        BootServer {
            boards: ArcSwap::new(boards),
            images: RefCell::new(HashMap::new()),
            filesystems: RefCell::new(HashMap::new()),
        }
    }

    /// Atomically replace the board registry (SIGHUP). In-flight transfers
    /// hold their own `Arc<FatFileSystem>` captured at resolution time, so
    /// this never disturbs them.
    pub fn reload(&self, boards: Arc<BoardRegistry>) {
        self.boards.store(boards);
    }

    fn image_for(&self, path: &Path) -> anyhow::Result<Arc<DiskImage>> {
        if let Some(image) = self.images.borrow().get(path) {
            return Ok(Arc::clone(image));
        }
        let image = Arc::new(DiskImage::open(path)?);
        self.images
            .borrow_mut()
            .insert(path.to_path_buf(), Arc::clone(&image));
        Ok(image)
    }

    fn mount(&self, board: &Board) -> Result<Arc<FatFileSystem>, String> {
        let image = self.image_for(&board.image).map_err(|e| e.to_string())?;
        let whole: Arc<dyn RandomRead> = image;
        let device = Window::whole(whole);
        let partition_window =
            partition::locate(&device, board.partition).map_err(|e| e.to_string())?;
        let fs = FatFileSystem::open(partition_window, None).map_err(|e| e.to_string())?;
        Ok(Arc::new(fs))
    }

    /// Mount (or fetch the cached mount of) the filesystem for `board`'s
    /// image and partition. A mount failure is cached too: a damaged image
    /// doesn't re-parse its BPB on every subsequent RRQ (§7, scenario 8).
    fn filesystem_for(&self, board: &Board) -> Result<Arc<FatFileSystem>, ResolutionError> {
        let key = (board.image.clone(), board.partition);
        if let Some(cached) = self.filesystems.borrow().get(&key) {
            return cached.clone().map_err(ResolutionError::Damaged);
        }
        let result = self.mount(board);
        self.filesystems.borrow_mut().insert(key, result.clone());
        result.map_err(ResolutionError::Damaged)
    }

    /// Resolve a client's raw RRQ filename to a mounted filesystem and
    /// in-volume path, after serial lookup and IP ACL enforcement.
    ///
    /// Filenames are split on their first `/`: the leading segment is the
    /// serial prefix, looked up (case-insensitively, `10000000`-stripped)
    /// in the board registry. A filename with no `/` at all -- the
    /// documented firmware fallback when local serial lookup fails -- is
    /// served from the sole configured board, if there is exactly one.
    pub fn resolve(&self, filename: &str, peer: SocketAddr) -> Result<Resolved, ResolutionError> {
        let registry = self.boards.load();
        let trimmed = filename.strip_prefix('/').unwrap_or(filename);

        let (board, rest) = match trimmed.split_once('/') {
            Some((serial, rest)) => {
                let board = registry
                    .get(serial)
                    .cloned()
                    .ok_or_else(|| ResolutionError::UnknownSerial(serial.to_string()))?;
                (board, rest)
            }
            None => {
                let board = registry
                    .default_board()
                    .cloned()
                    .ok_or_else(|| ResolutionError::UnknownSerial(trimmed.to_string()))?;
                (board, trimmed)
            }
        };

        if let Some(acl) = board.ip {
            let peer_ip = peer.ip().to_canonical();
            if peer_ip != acl {
                return Err(ResolutionError::IpAclMismatch { addr: peer_ip });
            }
        }

        let fs = self.filesystem_for(&board)?;
        let path = FatPath::new(rest.to_string());
        let entry = fs.resolve(&path)?;
        if entry.is_directory() {
            return Err(ResolutionError::Fat(nobodd_fat::Error::NotADirectory(
                path.display().to_string(),
            )));
        }
        Ok(Resolved {
            fs,
            size: u64::from(entry.size),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardRegistry;
    use std::collections::HashMap as StdHashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn registry_with(boards: Vec<Board>) -> Arc<BoardRegistry> {
        let mut map: StdHashMap<String, Board> = StdHashMap::new();
        for board in boards {
            map.insert(board.serial.clone(), board);
        }
        Arc::new(BoardRegistry::from_map(map))
    }

    fn peer(ip: [u8; 4]) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), 12345)
    }

    #[test]
    fn unknown_serial_with_prefix_is_rejected() {
        let server = BootServer::new(registry_with(vec![]));
        let err = server.resolve("deadbeef/config.txt", peer([10, 0, 0, 1]));
        assert!(matches!(err, Err(ResolutionError::UnknownSerial(s)) if s == "deadbeef"));
    }

    #[test]
    fn no_prefix_falls_back_to_sole_default_board() {
        let server = BootServer::new(registry_with(vec![Board {
            serial: "abc".to_string(),
            image: PathBuf::from("/nonexistent.img"),
            partition: 1,
            ip: None,
        }]));
        // No image on disk, so this fails downstream at the mount step, but
        // the important thing here is that it is *not* UnknownSerial: the
        // fallback board was found.
        let err = server.resolve("config.txt", peer([10, 0, 0, 1]));
        assert!(!matches!(err, Err(ResolutionError::UnknownSerial(_))));
    }

    #[test]
    fn ip_acl_mismatch_is_rejected_before_touching_the_image() {
        let server = BootServer::new(registry_with(vec![Board {
            serial: "abc".to_string(),
            image: PathBuf::from("/nonexistent.img"),
            partition: 1,
            ip: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))),
        }]));
        let err = server.resolve("abc/config.txt", peer([192, 0, 2, 6]));
        assert!(matches!(err, Err(ResolutionError::IpAclMismatch { .. })));
    }
}
