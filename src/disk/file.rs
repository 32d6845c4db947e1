use fnv::FnvHashMap;
use std::collections::hash_map::Entry;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::disk::Storage;
use crate::error::{Error, Result};

/// One file of the torrent's layout.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FileEntry {
    /// the path of the file relative to the storage root
    pub path: PathBuf,
    /// the offset of this file inside the torrent, i.e. the sum of the sizes of
    /// all files before it
    pub offset: u64,
    /// the size of the file in bytes
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// The part of a single file touched by a logical range.
#[derive(Debug, Clone, Eq, Copy, PartialEq, Hash)]
pub struct FileWindow {
    /// byte offset in the file where the range starts
    pub offset: u64,
    /// number of bytes this range is
    pub length: u64,
}

impl FileWindow {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }
}

/// Storage that maps the torrent onto files below a root directory.
///
/// A range crossing a file boundary is split into one access per file.
/// Files and missing parent directories are created on first use.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    files: Vec<FileEntry>,
    total_length: u64,
    file_ops: OpenOptions,
    /// open handles by position in `files`
    handles: FnvHashMap<usize, File>,
}

impl FileStorage {
    /// `files` must be ordered by offset and contiguous, as produced by the
    /// torrent's metadata.
    pub fn new(root: impl AsRef<Path>, files: Vec<FileEntry>) -> Self {
        let mut file_ops = OpenOptions::new();
        file_ops.read(true).write(true).create(true);
        let total_length = files.last().map(FileEntry::end).unwrap_or_default();
        Self {
            root: root.as_ref().to_path_buf(),
            files,
            total_length,
            file_ops,
            handles: Default::default(),
        }
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// All files related to the targeted range, each with the window of the
    /// file the range covers.
    pub fn files_for_range(&self, offset: u64, length: u64) -> Result<Vec<(usize, FileWindow)>> {
        let end = offset + length;
        if end > self.total_length {
            return Err(Error::OutOfBounds {
                offset,
                length,
                total: self.total_length,
            });
        }
        Ok(self
            .files
            .iter()
            .enumerate()
            .filter(|(_, file)| file.length > 0 && file.offset < end && file.end() > offset)
            .map(|(id, file)| {
                let start = offset.max(file.offset);
                let stop = end.min(file.end());
                (id, FileWindow::new(start - file.offset, stop - start))
            })
            .collect())
    }

    fn open(&mut self, id: usize) -> Result<&mut File> {
        let file = match self.handles.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.root.join(&self.files[id].path);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                trace!("Opening {}", path.display());
                entry.insert(self.file_ops.open(&path)?)
            }
        };
        Ok(file)
    }
}

impl Storage for FileStorage {
    fn total_length(&self) -> u64 {
        self.total_length
    }

    fn read_block(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; length];
        let mut pos = 0;
        for (id, window) in self.files_for_range(offset, length as u64)? {
            let file = self.open(id)?;
            file.seek(SeekFrom::Start(window.offset))?;
            let next = pos + window.length as usize;
            file.read_exact(&mut buf[pos..next])?;
            pos = next;
        }
        Ok(buf)
    }

    fn write_block(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        for (id, window) in self.files_for_range(offset, data.len() as u64)? {
            let file = self.open(id)?;
            file.seek(SeekFrom::Start(window.offset))?;
            let next = pos + window.length as usize;
            file.write_all(&data[pos..next])?;
            pos = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Vec<FileEntry> {
        vec![
            FileEntry::new("a.txt", 0, 10),
            FileEntry::new("empty", 10, 0),
            FileEntry::new("sub/b.txt", 10, 5),
            FileEntry::new("sub/c.txt", 15, 20),
        ]
    }

    #[test]
    fn split_range_over_files() {
        let storage = FileStorage::new("/nonexistent", layout());
        assert_eq!(storage.total_length(), 35);
        assert_eq!(
            storage.files_for_range(2, 4).unwrap(),
            vec![(0, FileWindow::new(2, 4))]
        );
        assert_eq!(
            storage.files_for_range(8, 10).unwrap(),
            vec![
                (0, FileWindow::new(8, 2)),
                (2, FileWindow::new(0, 5)),
                (3, FileWindow::new(0, 3)),
            ]
        );
        assert!(matches!(
            storage.files_for_range(30, 6),
            Err(Error::OutOfBounds { total: 35, .. })
        ));
    }

    #[test]
    fn write_and_read_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path(), layout());
        let data: Vec<u8> = (0..35).collect();

        storage.write_block(0, &data[..12]).unwrap();
        storage.write_block(12, &data[12..]).unwrap();

        assert_eq!(storage.read_block(0, 35).unwrap(), data);
        assert_eq!(storage.read_block(9, 8).unwrap(), &data[9..17]);
        assert_eq!(fs::read(dir.path().join("sub/b.txt")).unwrap(), &data[10..15]);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), &data[..10]);
    }

    #[test]
    fn reading_unwritten_data_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path(), layout());
        assert!(storage.read_block(20, 5).is_err());
    }
}
