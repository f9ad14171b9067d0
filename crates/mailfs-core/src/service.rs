//! Path-based filesystem operations over the entry tree
//!
//! Every operation takes an absolute path, resolves it from the root and
//! delegates to the entry. This is the surface a platform adapter calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::FsConfig;
use crate::entry::{lock, Directory, Entry, File};
use crate::error::{FsError, FsResult};
use crate::mailbox::MailStore;
use crate::path;
use crate::staging::StagingStore;
use crate::types::{Attributes, DirEntry, FileKind, HandleId, StatFs};

/// A mailbox mounted as a filesystem
pub struct MailFs {
    config: FsConfig,
    store: Arc<dyn MailStore>,
    root: Arc<Directory>,
    statfs: Mutex<Option<StatFs>>,
    next_handle_id: AtomicU64,
}

impl MailFs {
    /// Connects the tree to `root_folder`, creating the folder if missing.
    pub fn new(store: Arc<dyn MailStore>, root_folder: &str, config: FsConfig) -> FsResult<Self> {
        let staging = Arc::new(StagingStore::new(config.staging_dir.clone()));
        let root = Directory::open_root(store.clone(), staging, root_folder)?;
        info!(folder = root_folder, staging = %config.staging_dir.display(), "Mailbox filesystem ready");

        Ok(Self {
            config,
            store,
            root,
            statfs: Mutex::new(None),
            next_handle_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn root(&self) -> &Arc<Directory> {
        &self.root
    }

    /// Resolves an absolute path, normalizing `.` and `..`.
    pub fn lookup(&self, path: &str) -> FsResult<Option<Entry>> {
        let normalized = path::join("/", path)?;
        self.root.resolve(&normalized)
    }

    fn find(&self, path: &str) -> FsResult<Entry> {
        match self.lookup(path)? {
            Some(entry) => Ok(entry),
            None => {
                debug!(path, "Not found");
                Err(FsError::NotFound)
            }
        }
    }

    fn find_dir(&self, path: &str) -> FsResult<Arc<Directory>> {
        self.find(path)?.into_directory()
    }

    fn find_file(&self, path: &str) -> FsResult<Arc<File>> {
        self.find(path)?.into_file()
    }

    fn allocate_handle_id(&self) -> HandleId {
        HandleId::new(self.next_handle_id.fetch_add(1, Ordering::SeqCst))
    }

    fn touch(&self) {
        *lock(&self.statfs) = None;
    }

    pub fn getattr(&self, path: &str) -> FsResult<Attributes> {
        debug!(path, "getattr");
        let entry = self.find(path)?;
        self.attributes(&entry)
    }

    pub fn attributes(&self, entry: &Entry) -> FsResult<Attributes> {
        let attrs = &self.config.attrs;
        Ok(match entry {
            Entry::Directory(_) => Attributes {
                kind: FileKind::Directory,
                size: 0,
                blocks: 0,
                mtime: 0,
                perm: attrs.dir_perm,
                nlink: 1,
                uid: attrs.uid,
                gid: attrs.gid,
            },
            Entry::File(file) => {
                let size = file.size()?;
                Attributes {
                    kind: FileKind::File,
                    size,
                    blocks: size.div_ceil(512),
                    mtime: file.modified_time()?,
                    perm: attrs.file_perm,
                    nlink: 1,
                    uid: attrs.uid,
                    gid: attrs.gid,
                }
            }
        })
    }

    pub fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        debug!(path, "readdir");
        let dir = self.find_dir(path)?;
        Ok(dir
            .list_children(false)?
            .into_iter()
            .map(|child| DirEntry {
                name: child.name(),
                kind: if child.is_dir() {
                    FileKind::Directory
                } else {
                    FileKind::File
                },
            })
            .collect())
    }

    pub fn open(&self, path: &str, flags: i32) -> FsResult<HandleId> {
        debug!(path, flags, "open");
        self.find_file(path)?;
        Ok(self.allocate_handle_id())
    }

    pub fn read(&self, path: &str, fh: HandleId, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        debug!(path, fh = fh.get(), len = buf.len(), offset, "read");
        self.find_file(path)?.read_data(buf, offset)
    }

    /// Writes are staged locally; `writepage` writes are refused.
    pub fn write(
        &self,
        path: &str,
        fh: HandleId,
        writepage: bool,
        data: &[u8],
        offset: u64,
    ) -> FsResult<usize> {
        debug!(path, fh = fh.get(), writepage, len = data.len(), offset, "write");
        if writepage {
            return Err(FsError::Unsupported);
        }
        let written = self.find_file(path)?.write_data(data, offset)?;
        self.touch();
        Ok(written)
    }

    pub fn create(&self, path: &str, mode: u32) -> FsResult<()> {
        debug!(path, mode, "create");
        let (parent, name) = path::split(path)?;
        self.find_dir(parent)?.create_child_file(name)?;
        self.touch();
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        debug!(path, mode, "mkdir");
        let (parent, name) = path::split(path)?;
        self.find_dir(parent)?.create_child_directory(name)?;
        self.touch();
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        debug!(path, "unlink");
        self.find_file(path)?.delete()?;
        self.touch();
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        debug!(path, "rmdir");
        self.find_dir(path)?.delete()?;
        self.touch();
        Ok(())
    }

    /// Renames or moves `from` to `to`. An existing file at `to` is replaced.
    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        debug!(from, to, "rename");
        let from = path::join("/", from)?;
        let to = path::join("/", to)?;
        let (to_parent, to_name) = path::split(&to)?;
        path::split(&from)?;

        let source = self.find(&from)?;
        let destination_dir = self.find_dir(to_parent)?;

        match source {
            Entry::Directory(dir) => {
                let from_prefix = format!("{}/", from.trim_end_matches('/'));
                if to.starts_with(&from_prefix) {
                    return Err(FsError::invalid_path(to));
                }
                if self.lookup(&to)?.is_some() {
                    return Err(FsError::AlreadyExists);
                }
                dir.rename_to(&destination_dir, to_name)?;
            }
            Entry::File(file) => {
                match self.lookup(&to)? {
                    Some(Entry::File(existing)) if !Arc::ptr_eq(&existing, &file) => {
                        existing.delete()?
                    }
                    Some(Entry::File(_)) => return Ok(()),
                    Some(Entry::Directory(_)) => return Err(FsError::NotAFile),
                    None => {}
                }

                if file.name() != to_name {
                    file.rename(to_name)?;
                } else {
                    file.flush()?;
                }
                let source_dir = file.parent()?;
                if !Arc::ptr_eq(&source_dir, &destination_dir) {
                    file.move_to(&destination_dir)?;
                }
            }
        }

        self.touch();
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        debug!(path, size, "truncate");
        self.find_file(path)?.truncate(size)?;
        self.touch();
        Ok(())
    }

    /// Only the modification time is stored; `atime` is accepted and dropped.
    pub fn utimens(&self, path: &str, atime: Option<i64>, mtime: Option<i64>) -> FsResult<()> {
        debug!(path, ?atime, ?mtime, "utimens");
        let entry = self.find(path)?;
        if let (Entry::File(file), Some(mtime)) = (entry, mtime) {
            file.set_modified_time(mtime)?;
            self.touch();
        }
        Ok(())
    }

    pub fn flush(&self, path: &str, fh: HandleId) -> FsResult<()> {
        debug!(path, fh = fh.get(), "flush");
        self.find_file(path)?.flush()?;
        self.touch();
        Ok(())
    }

    pub fn fsync(&self, path: &str, fh: HandleId, datasync: bool) -> FsResult<()> {
        debug!(path, fh = fh.get(), datasync, "fsync");
        self.find_file(path)?.flush()?;
        self.touch();
        Ok(())
    }

    pub fn release(&self, path: &str, fh: HandleId, flags: i32) -> FsResult<()> {
        debug!(path, fh = fh.get(), flags, "release");
        // Releasing a handle whose file was unlinked meanwhile is fine
        let file = match self.find_file(path) {
            Ok(file) => file,
            Err(FsError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        file.flush()?;
        self.touch();
        Ok(())
    }

    /// Statistics derived from the root folder's STORAGE quota, cached until
    /// the next mutating call.
    pub fn statfs(&self) -> FsResult<StatFs> {
        debug!("statfs");
        let mut cached = lock(&self.statfs);
        if let Some(stats) = *cached {
            return Ok(stats);
        }

        let policy = &self.config.statfs;
        let block_size = u64::from(policy.block_size.max(1));
        let (blocks, blocks_free) = match self.store.quota(&self.root.folder()?)? {
            Some(quota) => match quota.storage() {
                Some(storage) => {
                    let blocks = storage.limit * 1024 / block_size;
                    let used = storage.usage * 1024 / block_size;
                    (blocks, blocks.saturating_sub(used))
                }
                None => (policy.synthetic_blocks, policy.synthetic_blocks),
            },
            None => (policy.synthetic_blocks, policy.synthetic_blocks),
        };

        let stats = StatFs {
            block_size: policy.block_size,
            blocks,
            blocks_free,
            blocks_available: blocks_free,
            files: policy.files,
            files_free: policy.files_free,
            name_len: policy.name_len,
        };
        *cached = Some(stats);
        Ok(stats)
    }

    /// Links are not supported, so every path reads back as itself.
    pub fn readlink(&self, path: &str) -> FsResult<String> {
        debug!(path, "readlink");
        Ok(path.to_string())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        debug!(path, mode, "chmod");
        Err(FsError::Unsupported)
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        debug!(path, ?uid, ?gid, "chown");
        Err(FsError::Unsupported)
    }

    pub fn link(&self, from: &str, to: &str) -> FsResult<()> {
        debug!(from, to, "link");
        Err(FsError::Unsupported)
    }

    pub fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        debug!(target, link, "symlink");
        Err(FsError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{Quota, QuotaResource};
    use crate::memory::InMemoryMailStore;
    use tempfile::TempDir;

    fn mount() -> (TempDir, Arc<InMemoryMailStore>, MailFs) {
        let staging = TempDir::new().unwrap();
        let store = Arc::new(InMemoryMailStore::new());
        let config = FsConfig {
            staging_dir: staging.path().to_path_buf(),
            ..FsConfig::default()
        };
        let fs = MailFs::new(store.clone(), "INBOX", config).unwrap();
        (staging, store, fs)
    }

    #[test]
    fn test_root_folder_is_created() {
        let (_staging, store, fs) = mount();
        assert!(store.folder_exists("INBOX").unwrap());
        assert!(fs.getattr("/").unwrap().is_dir());
        assert!(fs.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn test_handles_increase() {
        let (_staging, _store, fs) = mount();
        fs.create("/a.txt", 0o644).unwrap();
        let first = fs.open("/a.txt", 0).unwrap();
        let second = fs.open("/a.txt", 0).unwrap();
        assert!(second.get() > first.get());
    }

    #[test]
    fn test_open_directory_is_not_a_file() {
        let (_staging, _store, fs) = mount();
        fs.mkdir("/d", 0o755).unwrap();
        assert!(matches!(fs.open("/d", 0), Err(FsError::NotAFile)));
        assert!(matches!(fs.readdir("/missing"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_writepage_is_unsupported() {
        let (_staging, _store, fs) = mount();
        fs.create("/a", 0o644).unwrap();
        let fh = fs.open("/a", 0).unwrap();
        assert!(matches!(
            fs.write("/a", fh, true, b"x", 0),
            Err(FsError::Unsupported)
        ));
    }

    #[test]
    fn test_unsupported_operations() {
        let (_staging, _store, fs) = mount();
        assert!(matches!(fs.chmod("/", 0o700), Err(FsError::Unsupported)));
        assert!(matches!(fs.chown("/", Some(1), None), Err(FsError::Unsupported)));
        assert!(matches!(fs.link("/a", "/b"), Err(FsError::Unsupported)));
        assert!(matches!(fs.symlink("/a", "/b"), Err(FsError::Unsupported)));
        assert_eq!(fs.readlink("/a/b").unwrap(), "/a/b");
    }

    #[test]
    fn test_statfs_synthetic_without_quota() {
        let (_staging, _store, fs) = mount();
        let stats = fs.statfs().unwrap();
        assert_eq!(stats.block_size, 512);
        assert_eq!(stats.blocks, 1_000_000_000);
        assert_eq!(stats.blocks_free, 1_000_000_000);
        assert_eq!(stats.name_len, 2048);
    }

    #[test]
    fn test_statfs_from_quota_is_cached_until_mutation() {
        let (_staging, store, fs) = mount();
        store.set_quota(Some(Quota {
            resources: vec![QuotaResource {
                name: "STORAGE".into(),
                usage: 1024,
                limit: 4096,
            }],
        }));
        let stats = fs.statfs().unwrap();
        assert_eq!(stats.blocks, 8192);
        assert_eq!(stats.blocks_free, 6144);

        store.set_quota(None);
        assert_eq!(fs.statfs().unwrap().blocks, 8192);

        fs.mkdir("/d", 0o755).unwrap();
        assert_eq!(fs.statfs().unwrap().blocks, 1_000_000_000);
    }

    #[test]
    fn test_getattr_reports_configured_owner() {
        let (_staging, _store, fs) = mount();
        fs.create("/f", 0o644).unwrap();
        let attrs = fs.getattr("/f").unwrap();
        assert_eq!(attrs.kind, FileKind::File);
        assert_eq!(attrs.size, 0);
        assert_eq!(attrs.perm, 0o777);
        assert_eq!((attrs.uid, attrs.gid), (1000, 1000));
    }

    #[test]
    fn test_rename_directory_into_itself_is_rejected() {
        let (_staging, _store, fs) = mount();
        fs.mkdir("/a", 0o755).unwrap();
        assert!(matches!(
            fs.rename("/a", "/a/b"),
            Err(FsError::InvalidPath(_))
        ));
    }
}
