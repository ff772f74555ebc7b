//! Buffer backed by a memory-mapped temporary file
//!
//! The file lives in the configured temp directory and is deleted on close.
//! Growing extends the file and maps the larger region; the file keeps the
//! bytes, so no explicit copy is needed.

use super::{move_within, BackingBuffer, MoveGuard, StorageKind};
use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Backing buffer stored in a memory-mapped temp file
#[derive(Debug)]
pub struct MappedFileBuffer {
    file: Option<NamedTempFile>,
    map: Option<MmapMut>,
    moves: MoveGuard,
}

impl MappedFileBuffer {
    /// Create the temp file in `dir` (or the OS temp dir)
    pub fn new(dir: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("blockstore-").suffix(".blocks");
        let file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        info!(path = ?file.path(), "Created mapped buffer file");
        Ok(Self {
            file: Some(file),
            map: None,
            moves: MoveGuard::default(),
        })
    }

    /// Location of the backing file, if still open
    pub fn path(&self) -> Option<PathBuf> {
        self.file.as_ref().map(|f| f.path().to_path_buf())
    }

    fn file(&self) -> Result<&NamedTempFile> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::Storage("mapped buffer file already closed".to_string()))
    }

    fn map_file(&self, size: usize) -> Result<Option<MmapMut>> {
        if size == 0 {
            return Ok(None);
        }
        let file = self.file()?;
        // SAFETY: the temp file is owned by this buffer and never truncated
        // below `size` while the mapping is alive.
        let map = unsafe { MmapOptions::new().len(size).map_mut(file.as_file()) }
            .map_err(|e| Error::Storage(format!("Failed to map {} bytes: {}", size, e)))?;
        Ok(Some(map))
    }
}

impl BackingBuffer for MappedFileBuffer {
    fn kind(&self) -> StorageKind {
        StorageKind::MappedFile
    }

    fn allocate(&mut self, size: usize) -> Result<()> {
        self.map = None;
        let file = self.file()?.as_file();
        // Truncate first so the fresh region reads as zeros
        file.set_len(0)?;
        file.set_len(size as u64)?;
        self.map = self.map_file(size)?;
        self.moves.reset();
        debug!(size, "Allocated mapped buffer");
        Ok(())
    }

    fn grow(&mut self, new_size: usize, _copy_through: usize) -> Result<()> {
        let old_size = self.capacity();
        self.file()?.as_file().set_len(new_size as u64)?;
        let map = self.map_file(new_size)?;
        self.map = map;
        self.moves.reset();
        debug!(old_size, new_size, "Remapped buffer file");
        Ok(())
    }

    fn current(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn current_mut(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }

    fn move_bytes(&mut self, old_start: usize, length: usize, new_start: usize) -> Result<()> {
        self.moves.check(old_start, new_start);
        move_within(self.current_mut(), old_start, length, new_start)
    }

    fn reset_move_guard(&mut self) {
        self.moves.reset();
    }

    fn close(&mut self) -> Result<()> {
        self.map = None;
        self.moves.reset();
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            file.close()?;
            info!(path = ?path, "Deleted mapped buffer file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_grow_keeps_contents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut buf = MappedFileBuffer::new(Some(dir.path()))?;
        buf.allocate(4096)?;
        buf.current_mut()[100..105].copy_from_slice(b"hello");

        buf.grow(3 * 4096, 4096)?;
        assert_eq!(buf.capacity(), 3 * 4096);
        assert_eq!(&buf.current()[100..105], b"hello");
        Ok(())
    }

    #[test]
    fn test_mapped_allocate_is_fresh() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut buf = MappedFileBuffer::new(Some(dir.path()))?;
        buf.allocate(4096)?;
        buf.current_mut().fill(7);
        buf.allocate(4096)?;
        assert!(buf.current().iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_mapped_close_deletes_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut buf = MappedFileBuffer::new(Some(dir.path()))?;
        buf.allocate(4096)?;
        let path = buf.path().expect("file should exist");
        assert!(path.exists());

        buf.close()?;
        assert!(!path.exists());
        assert!(buf.current().is_empty());
        assert!(buf.allocate(4096).is_err());
        Ok(())
    }

    #[test]
    fn test_mapped_missing_dir_is_medium_failure() {
        let result = MappedFileBuffer::new(Some(Path::new("/nonexistent/blockstore/dir")));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
