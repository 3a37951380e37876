use crate::block::BlockId;
use crate::buffer::slots::SLOT_SIZE_BYTES;
use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Extension of block files on disk.
const BLOCK_FILE_EXTENSION: &str = "qb";

/// Persistence boundary of the buffer pool: blocks and blobs travel
/// across it as whole byte images, always a multiple of
/// [`SLOT_SIZE_BYTES`] long.
///
/// Implementations are keyed by [`BlockId`] alone and must be safe to
/// call from many threads; the buffer pool serializes conflicting
/// operations on a single block, but distinct blocks proceed in
/// parallel.
pub trait FileManager: Send + Sync {
    /// Number of slots the stored image of `block` occupies.
    fn num_slots(&self, block: BlockId) -> Result<usize>;

    /// Read the whole stored image of `block` into `buffer`, whose
    /// length must equal the stored size.
    fn read_block_or_blob(&self, block: BlockId, buffer: &mut [u8]) -> Result<()>;

    /// Write the whole image of `block`, replacing any previous one.
    fn write_block_or_blob(&self, block: BlockId, buffer: &[u8]) -> Result<()>;

    /// Remove the stored image of `block`. Removing a block that has no
    /// stored image succeeds, so a dropped never-saved block and a
    /// saved one are deleted identically.
    fn delete_block_or_blob(&self, block: BlockId) -> Result<()>;

    /// Highest block counter in use for `domain`, 0 if none. Used to
    /// seed the id allocator so restarts never reissue an id.
    fn max_used_block_counter(&self, domain: u16) -> u64;
}

/// Stores each block as one file, `blk_<domain>_<counter>.qb`, under a
/// single directory.
pub struct LocalFileManager {
    storage_dir: PathBuf,
}

impl LocalFileManager {
    /// Open (creating if needed) the storage directory.
    pub fn new<P: AsRef<Path>>(storage_dir: P) -> Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        fs::create_dir_all(&storage_dir).map_err(|e| {
            Error::UnableToOpenFile(format!(
                "storage directory {}: {}",
                storage_dir.display(),
                e
            ))
        })?;
        Ok(LocalFileManager { storage_dir })
    }

    #[inline]
    fn block_path(&self, block: BlockId) -> PathBuf {
        self.storage_dir.join(format!(
            "blk_{:05}_{}.{}",
            block.domain(),
            block.counter(),
            BLOCK_FILE_EXTENSION
        ))
    }
}

impl FileManager for LocalFileManager {
    fn num_slots(&self, block: BlockId) -> Result<usize> {
        let path = self.block_path(block);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::BlockNotFoundInPersistentStorage(block));
            }
            Err(e) => {
                return Err(Error::FileReadError(format!("{}: {}", path.display(), e)));
            }
        };
        let len = meta.len() as usize;
        if len == 0 || len % SLOT_SIZE_BYTES != 0 {
            return Err(Error::CorruptPersistentStorage(format!(
                "block file {} has size {} which is not a positive multiple of the slot size",
                path.display(),
                len
            )));
        }
        Ok(len / SLOT_SIZE_BYTES)
    }

    fn read_block_or_blob(&self, block: BlockId, buffer: &mut [u8]) -> Result<()> {
        let path = self.block_path(block);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::BlockNotFoundInPersistentStorage(block));
            }
            Err(e) => {
                return Err(Error::UnableToOpenFile(format!(
                    "{}: {}",
                    path.display(),
                    e
                )));
            }
        };
        file.read_exact(buffer)
            .map_err(|e| Error::FileReadError(format!("{}: {}", path.display(), e)))
    }

    fn write_block_or_blob(&self, block: BlockId, buffer: &[u8]) -> Result<()> {
        debug_assert!(!buffer.is_empty() && buffer.len() % SLOT_SIZE_BYTES == 0);
        let path = self.block_path(block);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::UnableToOpenFile(format!("{}: {}", path.display(), e)))?;
        file.write_all(buffer)
            .and_then(|_| file.sync_data())
            .map_err(|e| Error::FileWriteError(format!("{}: {}", path.display(), e)))
    }

    fn delete_block_or_blob(&self, block: BlockId) -> Result<()> {
        let path = self.block_path(block);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::FileWriteError(format!("{}: {}", path.display(), e))),
        }
    }

    fn max_used_block_counter(&self, domain: u16) -> u64 {
        let pattern = self
            .storage_dir
            .join(format!("blk_{:05}_*.{}", domain, BLOCK_FILE_EXTENSION));
        let paths = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                log::warn!("block file scan failed for domain {}: {}", domain, e);
                return 0;
            }
        };
        let mut max_counter = 0u64;
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    log::warn!("unreadable entry during block file scan: {}", e);
                    continue;
                }
            };
            let counter = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.rsplit('_').next())
                .and_then(|counter| counter.parse::<u64>().ok());
            match counter {
                Some(counter) => max_counter = max_counter.max(counter),
                None => log::warn!("ignoring oddly named block file {}", path.display()),
            }
        }
        max_counter
    }
}
