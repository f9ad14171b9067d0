use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, error};

use super::{child_path, lock, now, read, write, Directory, MailContext};
use crate::error::{FsError, FsResult};
use crate::mailbox::Uid;
use crate::message::{content_type_for, Message};
use crate::path;
use crate::rewrite::ContentRewriter;
use crate::staging::StagedCopy;

/// Where a file stands relative to its backing message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilePhase {
    /// Local view equals the stored message.
    Clean,
    /// Local writes not yet pushed to the store.
    Staged,
    /// The old message is gone and the replacement has not been appended yet.
    FlushPending,
}

#[derive(Default)]
struct FileState {
    /// Last known message; while pending, the replacement awaiting append.
    message: Option<Arc<Message>>,
    staged: Option<StagedCopy>,
    dirty: bool,
}

/// A file backed by a single message
pub struct File {
    ctx: MailContext,
    parent: Weak<Directory>,
    name: RwLock<String>,
    /// Zero while no stored message backs the file.
    uid: AtomicU32,
    pending: AtomicBool,
    detached: AtomicBool,
    state: Mutex<FileState>,
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("name", &*read(&self.name))
            .field("uid", &self.uid())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl File {
    pub(crate) fn wrap(ctx: &MailContext, parent: &Arc<Directory>, uid: Uid, name: &str) -> Arc<Self> {
        Arc::new(Self {
            ctx: ctx.clone(),
            parent: Arc::downgrade(parent),
            name: RwLock::new(name.to_string()),
            uid: AtomicU32::new(uid.0),
            pending: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            state: Mutex::new(FileState::default()),
        })
    }

    pub(crate) fn created(
        ctx: &MailContext,
        parent: &Arc<Directory>,
        uid: Uid,
        name: &str,
        message: Message,
    ) -> Arc<Self> {
        let file = Self::wrap(ctx, parent, uid, name);
        lock(&file.state).message = Some(Arc::new(message));
        file
    }

    pub fn name(&self) -> String {
        read(&self.name).clone()
    }

    /// Identifier of the backing message, if one is currently stored.
    pub fn uid(&self) -> Option<Uid> {
        match self.uid.load(Ordering::SeqCst) {
            0 => None,
            uid => Some(Uid(uid)),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// True once the file was deleted or moved away.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> FilePhase {
        if self.is_pending() {
            FilePhase::FlushPending
        } else if lock(&self.state).dirty {
            FilePhase::Staged
        } else {
            FilePhase::Clean
        }
    }

    pub fn parent(&self) -> FsResult<Arc<Directory>> {
        if self.is_detached() {
            return Err(FsError::NotFound);
        }
        self.parent.upgrade().ok_or(FsError::NotFound)
    }

    pub fn absolute_path(&self) -> FsResult<String> {
        Ok(child_path(&self.parent()?.absolute_path()?, &self.name()))
    }

    /// Byte length: the staged copy when present, else the size header,
    /// else the attachment length.
    pub fn size(&self) -> FsResult<u64> {
        let mut state = lock(&self.state);
        if let Some(staged) = &state.staged {
            return Ok(staged.len());
        }
        let message = self.message(&mut state)?;
        Ok(stored_size(&message))
    }

    /// Sent date of the backing message, in seconds since the epoch.
    pub fn modified_time(&self) -> FsResult<i64> {
        let mut state = lock(&self.state);
        Ok(self.message(&mut state)?.sent_date())
    }

    pub fn read_data(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut state = lock(&self.state);
        self.staged(&mut state)?.read_at(buf, offset)
    }

    /// Writes into the staged copy only; nothing reaches the store until flush.
    pub fn write_data(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        let mut state = lock(&self.state);
        if state.staged.is_none() && !self.is_detached() {
            let message = self.message(&mut state)?;
            let size = stored_size(&message);
            if offset <= size {
                // First write goes into the copy while it is spooled
                let original = Read::take(message.content(), size);
                let content = ContentRewriter::new(original, data.to_vec(), offset);
                state.staged = Some(self.ctx.staging.stage(&self.absolute_path()?, content)?);
                state.dirty = true;
                return Ok(data.len());
            }
        }
        let written = self.staged(&mut state)?.write_at(data, offset)?;
        state.dirty = true;
        Ok(written)
    }

    /// Pushes local writes to the store. Does nothing when there are none.
    pub fn flush(&self) -> FsResult<()> {
        let mut state = lock(&self.state);
        self.flush_locked(&mut state)
    }

    pub fn rename(&self, new_name: &str) -> FsResult<()> {
        let mut state = lock(&self.state);
        let message = self.derive(&mut state, new_name, |m| m.set_subject(new_name))?;
        self.replace(&mut state, message)
    }

    pub fn set_modified_time(&self, timestamp: i64) -> FsResult<()> {
        let mut state = lock(&self.state);
        let message = self.derive(&mut state, &self.name(), |m| m.set_sent_date(timestamp))?;
        self.replace(&mut state, message)
    }

    /// Shrinks or zero-extends the content to `new_len` bytes.
    pub fn truncate(&self, new_len: u64) -> FsResult<()> {
        let mut state = lock(&self.state);
        if self.is_detached() {
            return Err(FsError::NotFound);
        }

        if state.staged.is_none() {
            // Only the kept prefix is spooled; growth extends the copy sparsely
            let current = self.message(&mut state)?;
            let kept = std::cmp::min(stored_size(&current), new_len);
            let content = Read::take(current.content(), kept);
            state.staged = Some(self.ctx.staging.stage(&self.absolute_path()?, content)?);
        }
        if let Some(staged) = state.staged.as_mut() {
            staged.set_len(new_len)?;
        }
        state.dirty = true;
        self.flush_locked(&mut state)
    }

    /// Copies the message into `destination`, then removes it here. A crash
    /// between the two steps leaves a duplicate behind.
    pub fn move_to(&self, destination: &Arc<Directory>) -> FsResult<()> {
        let mut state = lock(&self.state);
        self.flush_locked(&mut state)?;

        let uid = self.uid().ok_or(FsError::NotFound)?;
        let parent = self.parent()?;
        let folder = parent.open_folder()?;
        let target = destination.open_folder()?;

        self.ctx.store.copy_message(&folder, uid, &target)?;
        destination.invalidate();
        self.ctx.store.mark_deleted(&folder, uid)?;
        parent.expunge()?;
        debug!(from = %folder, to = %target, %uid, "Moved message");

        self.detach(&mut state);
        Ok(())
    }

    pub fn delete(&self) -> FsResult<()> {
        let mut state = lock(&self.state);
        let parent = self.parent()?;
        match self.uid() {
            Some(uid) => {
                let folder = parent.open_folder()?;
                self.ctx.store.mark_deleted(&folder, uid)?;
                parent.expunge()?;
            }
            None => parent.invalidate(),
        }
        self.detach(&mut state);
        Ok(())
    }

    fn detach(&self, state: &mut FileState) {
        self.uid.store(0, Ordering::SeqCst);
        self.pending.store(false, Ordering::SeqCst);
        self.detached.store(true, Ordering::SeqCst);
        state.staged = None;
        state.dirty = false;
    }

    fn flush_locked(&self, state: &mut FileState) -> FsResult<()> {
        if self.is_detached() {
            return Err(FsError::NotFound);
        }
        if state.dirty {
            let message = self.derive(state, &self.name(), |_| {})?;
            self.replace(state, message)
        } else if self.is_pending() {
            let parent = self.parent()?;
            self.append_pending(state, &parent)
        } else {
            Ok(())
        }
    }

    /// The backing message, fetched once and cached.
    fn message(&self, state: &mut FileState) -> FsResult<Arc<Message>> {
        if let Some(message) = &state.message {
            return Ok(message.clone());
        }
        let uid = self.uid().ok_or(FsError::NotFound)?;
        let folder = self.parent()?.open_folder()?;
        let message = Arc::new(self.ctx.store.fetch_message(&folder, uid)?);
        state.message = Some(message.clone());
        Ok(message)
    }

    fn staged<'a>(&self, state: &'a mut FileState) -> FsResult<&'a mut StagedCopy> {
        if self.is_detached() {
            return Err(FsError::NotFound);
        }
        let staged = match state.staged.take() {
            Some(staged) => staged,
            None => {
                let message = self.message(state)?;
                let content = Read::take(message.content(), stored_size(&message));
                self.ctx.staging.stage(&self.absolute_path()?, content)?
            }
        };
        Ok(state.staged.insert(staged))
    }

    /// Copy of the current message carrying any local writes, then `mutate`d.
    fn derive(
        &self,
        state: &mut FileState,
        name: &str,
        mutate: impl FnOnce(&mut Message),
    ) -> FsResult<Message> {
        if self.is_detached() {
            return Err(FsError::NotFound);
        }
        let mut message = (*self.message(state)?).clone();
        if state.dirty {
            if let Some(staged) = state.staged.as_mut() {
                message.set_content(staged.contents()?, content_type_for(name));
                message.set_sent_date(now());
            }
        }
        mutate(&mut message);
        Ok(message)
    }

    /// Removes the current message and stores `message` in its place. The
    /// uid only changes once the append succeeded; on failure the file stays
    /// pending with its local copy and the next flush retries the append.
    fn replace(&self, state: &mut FileState, message: Message) -> FsResult<()> {
        let parent = self.parent()?;

        if let Some(uid) = self.uid() {
            // Pending keeps the slot in the parent's listing while no message backs it
            self.pending.store(true, Ordering::SeqCst);
            let removed = parent.open_folder().and_then(|folder| {
                self.ctx.store.mark_deleted(&folder, uid)?;
                parent.expunge()
            });
            if let Err(err) = removed {
                self.pending.store(false, Ordering::SeqCst);
                return Err(err);
            }
            self.uid.store(0, Ordering::SeqCst);
            debug!(%uid, file = %self.name(), "Expunged superseded message");
        }

        state.message = Some(Arc::new(message));
        self.append_pending(state, &parent)
    }

    fn append_pending(&self, state: &mut FileState, parent: &Directory) -> FsResult<()> {
        let message = state.message.clone().ok_or(FsError::NotFound)?;

        // Appending under the parent's lock keeps a concurrent rebuild from
        // seeing the new uid before this file claims it
        let uid = parent.with_open_folder(|folder| {
            let uid = match self.ctx.store.append_message(folder, &message) {
                Ok(uid) => uid,
                Err(err) => {
                    error!(folder, file = %self.name(), error = %err, "Append failed, keeping local copy");
                    return Err(err.into());
                }
            };
            *write(&self.name) = path::name_of(message.subject()).to_string();
            self.uid.store(uid.0, Ordering::SeqCst);
            self.pending.store(false, Ordering::SeqCst);
            Ok(uid)
        })?;

        state.staged = None;
        state.dirty = false;
        debug!(%uid, subject = message.subject(), "Stored replacement message");
        Ok(())
    }
}

fn stored_size(message: &Message) -> u64 {
    message
        .declared_size()
        .unwrap_or(message.content().len() as u64)
}
