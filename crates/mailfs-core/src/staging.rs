//! Local-disk staging of file content between flushes
//!
//! Staged copies live below the staging root in a tree that mirrors the
//! virtual hierarchy. Directory segments get a `.d` suffix and every copy is
//! named `<name>.<id>.staged`, so a copy never shares a local path with a
//! directory or with another copy, whatever renames happen meanwhile.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{FsError, FsResult};

const DIR_SUFFIX: &str = ".d";
const COPY_SUFFIX: &str = ".staged";

/// Maps virtual paths onto files below a local staging root
#[derive(Debug)]
pub struct StagingStore {
    root: PathBuf,
    next_id: AtomicU64,
}

impl StagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local location of copy `id` of `virtual_path`, creating its parent
    /// directories.
    pub fn locate(&self, virtual_path: &str, id: u64) -> FsResult<PathBuf> {
        let segments: Vec<&str> = virtual_path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.iter().any(|s| *s == "." || *s == "..") {
            return Err(FsError::invalid_path(virtual_path));
        }
        let Some((name, dirs)) = segments.split_last() else {
            return Err(FsError::invalid_path(virtual_path));
        };

        let mut local = self.root.clone();
        for segment in dirs {
            local.push(format!("{}{}", segment, DIR_SUFFIX));
        }
        fs::create_dir_all(&local)?;
        local.push(format!("{}.{}{}", name, id, COPY_SUFFIX));
        Ok(local)
    }

    /// Spools `content` into a fresh staging location for `virtual_path`.
    pub fn stage(&self, virtual_path: &str, content: impl Read) -> FsResult<StagedCopy> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let local = self.locate(virtual_path, id)?;
        StagedCopy::spool(local, content)
    }
}

/// Random-access local copy of one file's content. The local file is
/// removed when the copy is dropped.
#[derive(Debug)]
pub struct StagedCopy {
    local: PathBuf,
    file: File,
    len: u64,
}

impl StagedCopy {
    /// Creates (or truncates) `local` and fills it from `content`.
    pub fn spool(local: PathBuf, mut content: impl Read) -> FsResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&local)?;
        let len = io::copy(&mut content, &mut file)?;
        debug!(local = %local.display(), len, "Spooled content to staging");
        Ok(Self { local, file, len })
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads at `offset`, clipped to the staged length; past the end reads nothing.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len() as u64, self.len - offset) as usize;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf[..n])?;
        Ok(n)
    }

    /// Writes at `offset`, growing the copy; a gap before `offset` reads as zeros.
    pub fn write_at(&mut self, data: &[u8], offset: u64) -> FsResult<usize> {
        if offset > self.len {
            self.file.set_len(offset)?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.len = std::cmp::max(self.len, offset + data.len() as u64);
        Ok(data.len())
    }

    pub fn set_len(&mut self, len: u64) -> FsResult<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    /// The whole staged content.
    pub fn contents(&mut self) -> FsResult<Vec<u8>> {
        let mut data = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        (&mut self.file).take(self.len).read_to_end(&mut data)?;
        Ok(data)
    }
}

impl Drop for StagedCopy {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.local) {
            debug!(local = %self.local.display(), error = %err, "Could not remove staged copy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_locate_mirrors_virtual_hierarchy() {
        let dir = TempDir::new().unwrap();
        let store = StagingStore::new(dir.path());

        let local = store.locate("/photos/2009/x.bin", 7).unwrap();
        assert_eq!(
            local,
            dir.path().join("photos.d").join("2009.d").join("x.bin.7.staged")
        );
        assert!(dir.path().join("photos.d").join("2009.d").is_dir());
        assert!(!local.exists());

        // Deterministic
        assert_eq!(store.locate("/photos/2009/x.bin", 7).unwrap(), local);
        assert_ne!(store.locate("/photos/2009/x.bin", 8).unwrap(), local);
    }

    #[test]
    fn test_locate_rejects_root_and_dot_segments() {
        let dir = TempDir::new().unwrap();
        let store = StagingStore::new(dir.path());
        assert!(matches!(store.locate("/", 1), Err(FsError::InvalidPath(_))));
        assert!(matches!(store.locate("/a/../b", 1), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn test_file_and_directory_at_same_path_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let store = StagingStore::new(dir.path());
        let file_copy = store.stage("/x", &b"file"[..]).unwrap();
        let mut nested = store.stage("/x/y", &b"nested"[..]).unwrap();

        assert_ne!(file_copy.local_path(), nested.local_path());
        assert_eq!(nested.contents().unwrap(), b"nested");
    }

    #[test]
    fn test_dropped_copy_is_removed() {
        let dir = TempDir::new().unwrap();
        let store = StagingStore::new(dir.path());
        let staged = store.stage("/a.txt", &b"bytes"[..]).unwrap();
        let local = staged.local_path().to_path_buf();
        assert!(local.exists());

        drop(staged);
        assert!(!local.exists());
    }

    #[test]
    fn test_staged_read_write() {
        let dir = TempDir::new().unwrap();
        let store = StagingStore::new(dir.path());
        let mut staged = store.stage("/notes.txt", &b"hello world"[..]).unwrap();
        assert_eq!(staged.len(), 11);

        let mut buf = [0u8; 5];
        assert_eq!(staged.read_at(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        staged.write_at(b"MailFS", 6).unwrap();
        assert_eq!(staged.len(), 12);
        assert_eq!(staged.contents().unwrap(), b"hello MailFS");

        let mut buf = [0u8; 10];
        assert_eq!(staged.read_at(&mut buf, 8).unwrap(), 4);
        assert_eq!(&buf[..4], b"ilFS");
        assert_eq!(staged.read_at(&mut buf, 12).unwrap(), 0);
        assert_eq!(staged.read_at(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_write_past_end_zero_fills_gap() {
        let dir = TempDir::new().unwrap();
        let store = StagingStore::new(dir.path());
        let mut staged = store.stage("/gap.bin", io::empty()).unwrap();

        staged.write_at(&[7, 8], 5).unwrap();
        assert_eq!(staged.len(), 7);
        assert_eq!(staged.contents().unwrap(), vec![0, 0, 0, 0, 0, 7, 8]);
    }

    #[test]
    fn test_set_len_shrinks_and_grows() {
        let dir = TempDir::new().unwrap();
        let store = StagingStore::new(dir.path());
        let mut staged = store.stage("/t.bin", &[1u8, 2, 3, 4][..]).unwrap();

        staged.set_len(2).unwrap();
        assert_eq!(staged.contents().unwrap(), vec![1, 2]);
        staged.set_len(4).unwrap();
        assert_eq!(staged.contents().unwrap(), vec![1, 2, 0, 0]);
    }

    #[test]
    fn test_restaging_same_path_keeps_earlier_copy() {
        let dir = TempDir::new().unwrap();
        let store = StagingStore::new(dir.path());
        let mut first = store.stage("/a.txt", &b"longer content"[..]).unwrap();
        let mut second = store.stage("/a.txt", &b"short"[..]).unwrap();
        assert_eq!(second.contents().unwrap(), b"short");
        assert_eq!(fs::metadata(second.local_path()).unwrap().len(), 5);
        assert_eq!(first.contents().unwrap(), b"longer content");
    }
}
