//! MailFS FUSE adapter implementation
//!
//! Maps FUSE operations to path-based [`MailFs`] calls. Inodes are allocated
//! on lookup and live in an [`InodeTable`].

#[cfg(not(feature = "fuse"))]
compile_error!("This module requires the 'fuse' feature to be enabled");

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, EINVAL, ENOENT};
use mailfs_core::{Attributes, FileKind, FsError, HandleId, MailFs};
use tracing::{debug, info, warn};

use crate::inodes::InodeTable;

/// `FUSE_WRITE_CACHE`: the write comes from the page cache
const WRITE_FLAG_PAGE: u32 = 1;

/// MailFS FUSE filesystem adapter
pub struct MailFsFuse {
    fs: Arc<MailFs>,
    inodes: InodeTable,
    ttl: Duration,
}

impl MailFsFuse {
    pub fn new(fs: Arc<MailFs>) -> Self {
        let ttl = Duration::from_millis(u64::from(fs.config().attrs.attr_ttl_ms));
        Self {
            fs,
            inodes: InodeTable::new(),
            ttl,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes.path(ino).map(str::to_string).ok_or(ENOENT)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(EINVAL)?;
        self.inodes.child_path(parent, name).ok_or(ENOENT)
    }

    fn attr_to_fuse(&self, attr: &Attributes, ino: u64) -> FileAttr {
        let kind = match attr.kind {
            FileKind::File => FileType::RegularFile,
            FileKind::Directory => FileType::Directory,
        };
        let mtime = if attr.mtime > 0 {
            UNIX_EPOCH + Duration::from_secs(attr.mtime as u64)
        } else {
            UNIX_EPOCH
        };

        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    /// Attributes for `path`, allocating its inode.
    fn entry_attr(&mut self, path: &str) -> Result<FileAttr, FsError> {
        let attrs = self.fs.getattr(path)?;
        let ino = self.inodes.ino_for(path);
        Ok(self.attr_to_fuse(&attrs, ino))
    }

    fn reply_entry(&mut self, path: &str, reply: ReplyEntry) {
        match self.entry_attr(path) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }
}

fn seconds(time: TimeOrNow) -> i64 {
    let at = match time {
        TimeOrNow::SpecificTime(at) => at,
        TimeOrNow::Now => SystemTime::now(),
    };
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl fuser::Filesystem for MailFsFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        info!("MailFS FUSE adapter initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("MailFS FUSE adapter destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        self.reply_entry(&path, reply);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.getattr(&path) {
            Ok(attrs) => reply.attr(&self.ttl, &self.attr_to_fuse(&attrs, ino)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };

        let result = (|| {
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.chown(&path, uid, gid)?;
            }
            if let Some(size) = size {
                self.fs.truncate(&path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.fs
                    .utimens(&path, atime.map(seconds), mtime.map(seconds))?;
            }
            self.fs.getattr(&path)
        })();

        match result {
            Ok(attrs) => reply.attr(&self.ttl, &self.attr_to_fuse(&attrs, ino)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.create(&path, mode) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.mkdir(&path, mode) {
            Ok(()) => self.reply_entry(&path, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.forget(&path);
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.forget(&path);
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let link = match self.child_of(parent, link_name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.symlink(&target.to_string_lossy(), &link) {
            Ok(()) => self.reply_entry(&link, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let paths = self
            .child_of(parent, name)
            .and_then(|from| Ok((from, self.child_of(newparent, newname)?)));
        let (from, to) = match paths {
            Ok(paths) => paths,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok()
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let paths = self
            .path_of(ino)
            .and_then(|from| Ok((from, self.child_of(newparent, newname)?)));
        let (from, to) = match paths {
            Ok(paths) => paths,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.link(&from, &to) {
            Ok(()) => self.reply_entry(&to, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.open(&path, flags) {
            Ok(handle) => reply.opened(handle.get(), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let mut buf = vec![0u8; size as usize];
        match self
            .fs
            .read(&path, HandleId::new(fh), &mut buf, offset.max(0) as u64)
        {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let writepage = write_flags & WRITE_FLAG_PAGE != 0;
        match self.fs.write(
            &path,
            HandleId::new(fh),
            writepage,
            data,
            offset.max(0) as u64,
        ) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.flush(&path, HandleId::new(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // The inode may already be forgotten after an unlink
        let Some(path) = self.inodes.path(ino).map(str::to_string) else {
            return reply.ok();
        };
        match self.fs.release(&path, HandleId::new(fh), flags) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(path, error = %e, "Flush on release failed");
                reply.error(e.errno())
            }
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.fsync(&path, HandleId::new(fh), datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.getattr(&path) {
            Ok(attrs) if attrs.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(FsError::NotADirectory.errno()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let children = match self.fs.readdir(&path) {
            Ok(children) => children,
            Err(e) => return reply.error(e.errno()),
        };

        let parent_ino = match mailfs_core::path::parent_of(&path) {
            Some(parent) => self.inodes.ino_for(parent),
            None => FUSE_ROOT_ID,
        };
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let child_path = match self.inodes.child_path(ino, &child.name) {
                Some(p) => p,
                None => continue,
            };
            let kind = match child.kind {
                FileKind::Directory => FileType::Directory,
                FileKind::File => FileType::RegularFile,
            };
            entries.push((self.inodes.ino_for(&child_path), kind, child.name));
        }

        debug!(path, count = entries.len(), offset, "readdir");
        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(s) => reply.statfs(
                s.blocks,
                s.blocks_free,
                s.blocks_available,
                s.files,
                s.files_free,
                s.block_size,
                s.name_len,
                s.block_size,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let result = self
            .fs
            .create(&path, mode)
            .and_then(|()| self.fs.open(&path, flags))
            .and_then(|handle| Ok((handle, self.entry_attr(&path)?)));
        match result {
            Ok((handle, attr)) => reply.created(&self.ttl, &attr, 0, handle.get(), 0),
            Err(e) => reply.error(e.errno()),
        }
    }
}
