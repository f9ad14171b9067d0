use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, info, warn};

use super::{child_path, lock, now, read, write, Entry, File, MailContext};
use crate::error::{FsError, FsResult};
use crate::mailbox::{child_folder, MailStore, Uid};
use crate::message::Message;
use crate::path;
use crate::staging::StagingStore;

#[derive(Default)]
struct DirState {
    children: HashMap<String, Entry>,
    valid: bool,
    opened: bool,
}

/// A directory backed by a mail folder
pub struct Directory {
    ctx: MailContext,
    /// Set only on the root, which is pinned to a configured folder.
    root_folder: Option<String>,
    parent: RwLock<Weak<Directory>>,
    name: RwLock<String>,
    this: Weak<Directory>,
    defunct: AtomicBool,
    state: Mutex<DirState>,
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("name", &*read(&self.name))
            .field("root_folder", &self.root_folder)
            .finish()
    }
}

impl Directory {
    /// Opens `folder` as the root of a tree, creating the folder if needed.
    pub fn open_root(
        store: Arc<dyn MailStore>,
        staging: Arc<StagingStore>,
        folder: &str,
    ) -> FsResult<Arc<Self>> {
        if !store.folder_exists(folder)? {
            if !store.create_folder(folder)? {
                return Err(FsError::WriteRejected(format!(
                    "server refused to create root folder {}",
                    folder
                )));
            }
            info!(folder, "Created root folder");
        }
        store.open_folder(folder)?;

        Ok(Arc::new_cyclic(|this| Self {
            ctx: MailContext { store, staging },
            root_folder: Some(folder.to_string()),
            parent: RwLock::new(Weak::new()),
            name: RwLock::new(String::new()),
            this: this.clone(),
            defunct: AtomicBool::new(false),
            state: Mutex::new(DirState {
                opened: true,
                ..DirState::default()
            }),
        }))
    }

    fn wrap(ctx: &MailContext, parent: &Arc<Directory>, name: &str, opened: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx: ctx.clone(),
            root_folder: None,
            parent: RwLock::new(Arc::downgrade(parent)),
            name: RwLock::new(name.to_string()),
            this: this.clone(),
            defunct: AtomicBool::new(false),
            state: Mutex::new(DirState {
                opened,
                ..DirState::default()
            }),
        })
    }

    /// Empty for the root.
    pub fn name(&self) -> String {
        read(&self.name).clone()
    }

    pub fn is_root(&self) -> bool {
        self.root_folder.is_some()
    }

    pub fn parent(&self) -> Option<Arc<Directory>> {
        read(&self.parent).upgrade()
    }

    pub fn absolute_path(&self) -> FsResult<String> {
        if self.is_root() {
            return Ok("/".to_string());
        }
        let parent = self.parent().ok_or(FsError::NotFound)?;
        Ok(child_path(&parent.absolute_path()?, &self.name()))
    }

    /// Full name of the backing folder.
    pub fn folder(&self) -> FsResult<String> {
        match &self.root_folder {
            Some(folder) => Ok(folder.clone()),
            None => {
                let parent = self.parent().ok_or(FsError::NotFound)?;
                Ok(child_folder(&parent.folder()?, &self.name()))
            }
        }
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::SeqCst)
    }

    fn arc(&self) -> FsResult<Arc<Directory>> {
        self.this.upgrade().ok_or(FsError::NotFound)
    }

    /// Resolves a `/`-separated path relative to this directory.
    pub fn resolve(&self, relative: &str) -> FsResult<Option<Entry>> {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            return Ok(Some(Entry::Directory(self.arc()?)));
        }

        match relative.split_once('/') {
            Some((first, rest)) => match self.child(first)? {
                None => Ok(None),
                Some(Entry::Directory(dir)) => dir.resolve(rest),
                Some(Entry::File(_)) => Err(FsError::NotADirectory),
            },
            None => self.child(relative),
        }
    }

    pub fn child(&self, name: &str) -> FsResult<Option<Entry>> {
        let mut state = lock(&self.state);
        self.refresh(&mut state, false)?;
        Ok(state.children.get(name).cloned())
    }

    /// Children sorted by name, rebuilding the cache when stale or forced.
    pub fn list_children(&self, force_refresh: bool) -> FsResult<Vec<Entry>> {
        let mut state = lock(&self.state);
        self.refresh(&mut state, force_refresh)?;
        let mut names: Vec<&String> = state.children.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .filter_map(|name| state.children.get(name).cloned())
            .collect())
    }

    pub fn create_child_directory(&self, name: &str) -> FsResult<Arc<Directory>> {
        let mut state = lock(&self.state);
        if self.is_defunct() {
            return Err(FsError::NotFound);
        }

        let folder = child_folder(&self.folder()?, name);
        if self.ctx.store.folder_exists(&folder)? {
            return Err(FsError::AlreadyExists);
        }
        if !self.ctx.store.create_folder(&folder)? {
            return Err(FsError::WriteRejected(format!(
                "server refused to create folder {}",
                folder
            )));
        }
        self.ctx.store.open_folder(&folder)?;
        info!(folder = %folder, "Created directory");

        let dir = Directory::wrap(&self.ctx, &self.arc()?, name, true);
        state
            .children
            .insert(name.to_string(), Entry::Directory(dir.clone()));
        state.valid = false;
        Ok(dir)
    }

    pub fn create_child_file(&self, name: &str) -> FsResult<Arc<File>> {
        let mut state = lock(&self.state);
        if self.is_defunct() {
            return Err(FsError::NotFound);
        }

        let folder = self.folder()?;
        self.ensure_open(&mut state, &folder)?;
        if !self.ctx.store.search_subject(&folder, name)?.is_empty() {
            return Err(FsError::AlreadyExists);
        }

        let message = Message::new_file(name, now());
        let uid = self.ctx.store.append_message(&folder, &message)?;
        debug!(folder = %folder, %uid, name, "Created file");

        let file = File::created(&self.ctx, &self.arc()?, uid, name, message);
        state
            .children
            .insert(name.to_string(), Entry::File(file.clone()));
        state.valid = false;
        Ok(file)
    }

    /// Closes, expunges and deletes the backing folder. The directory is
    /// defunct afterwards and can no longer be resolved.
    pub fn delete(&self) -> FsResult<()> {
        if self.is_root() {
            return Err(FsError::invalid_path("/"));
        }
        let parent = self.parent().ok_or(FsError::NotFound)?;

        {
            let mut state = lock(&self.state);
            if self.is_defunct() {
                return Err(FsError::NotFound);
            }
            let folder = self.folder()?;
            if state.opened {
                self.ctx.store.close_folder(&folder, true)?;
                state.opened = false;
            }
            self.ctx.store.delete_folder(&folder)?;
            self.defunct.store(true, Ordering::SeqCst);
            state.valid = false;
            state.children.clear();
            info!(folder = %folder, "Deleted directory");
        }

        parent.invalidate();
        Ok(())
    }

    /// Moves the backing folder to `new_name` below `new_parent`.
    pub fn rename_to(&self, new_parent: &Arc<Directory>, new_name: &str) -> FsResult<()> {
        if self.is_root() {
            return Err(FsError::invalid_path("/"));
        }
        let old_parent = self.parent().ok_or(FsError::NotFound)?;

        {
            let mut state = lock(&self.state);
            if self.is_defunct() {
                return Err(FsError::NotFound);
            }

            let from = self.folder()?;
            let to = child_folder(&new_parent.folder()?, new_name);
            if state.opened {
                self.ctx.store.close_folder(&from, false)?;
                state.opened = false;
            }

            if !self.ctx.store.rename_folder(&from, &to)? {
                match self.ctx.store.open_folder(&from) {
                    Ok(()) => state.opened = true,
                    Err(err) => warn!(folder = %from, error = %err, "Could not reopen folder"),
                }
                return Err(FsError::RenameFailed(format!("{} -> {}", from, to)));
            }

            *write(&self.name) = new_name.to_string();
            *write(&self.parent) = Arc::downgrade(new_parent);
            self.ctx.store.open_folder(&to)?;
            state.opened = true;
            info!(from = %from, to = %to, "Renamed directory");
        }

        old_parent.invalidate();
        new_parent.adopt(new_name, Entry::Directory(self.arc()?));
        Ok(())
    }

    /// Commits pending deletions on the backing folder.
    pub fn expunge(&self) -> FsResult<()> {
        let mut state = lock(&self.state);
        let folder = self.folder()?;
        self.ensure_open(&mut state, &folder)?;
        self.ctx.store.expunge(&folder)?;
        state.valid = false;
        Ok(())
    }

    pub fn invalidate(&self) {
        lock(&self.state).valid = false;
    }

    /// Indented listing of this subtree, one entry per line.
    pub fn tree_lines(&self) -> FsResult<Vec<String>> {
        let mut lines = Vec::new();
        self.collect_tree(0, &mut lines)?;
        Ok(lines)
    }

    fn collect_tree(&self, depth: usize, lines: &mut Vec<String>) -> FsResult<()> {
        let indent = "  ".repeat(depth);
        if self.is_root() {
            lines.push(format!("{}/", indent));
        } else {
            lines.push(format!("{}{}/", indent, self.name()));
        }

        for child in self.list_children(false)? {
            match child {
                Entry::Directory(dir) => dir.collect_tree(depth + 1, lines)?,
                Entry::File(file) => lines.push(format!(
                    "{}  {} ({} bytes)",
                    indent,
                    file.name(),
                    file.size()?
                )),
            }
        }
        Ok(())
    }

    /// Name of the backing folder, opened if it was not already.
    pub(crate) fn open_folder(&self) -> FsResult<String> {
        let mut state = lock(&self.state);
        if self.is_defunct() {
            return Err(FsError::NotFound);
        }
        let folder = self.folder()?;
        self.ensure_open(&mut state, &folder)?;
        Ok(folder)
    }

    /// Runs `f` on the opened backing folder with the cache locked, then
    /// marks the cache stale.
    pub(crate) fn with_open_folder<T>(&self, f: impl FnOnce(&str) -> FsResult<T>) -> FsResult<T> {
        let mut state = lock(&self.state);
        if self.is_defunct() {
            return Err(FsError::NotFound);
        }
        let folder = self.folder()?;
        self.ensure_open(&mut state, &folder)?;
        let result = f(&folder);
        state.valid = false;
        result
    }

    /// Places `entry` in the (stale) cache so the next rebuild reuses it.
    pub(crate) fn adopt(&self, name: &str, entry: Entry) {
        let mut state = lock(&self.state);
        state.children.insert(name.to_string(), entry);
        state.valid = false;
    }

    fn ensure_open(&self, state: &mut DirState, folder: &str) -> FsResult<()> {
        if !state.opened {
            self.ctx.store.open_folder(folder)?;
            state.opened = true;
        }
        Ok(())
    }

    /// Re-enumerates the folder. Existing nodes are reused, directories by
    /// name and files by uid, so local state survives invalidation.
    fn refresh(&self, state: &mut DirState, force: bool) -> FsResult<()> {
        if self.is_defunct() {
            return Err(FsError::NotFound);
        }
        if state.valid && !force {
            return Ok(());
        }

        let folder = self.folder()?;
        self.ensure_open(state, &folder)?;
        let subfolders = self.ctx.store.list_folders(&folder)?;
        let messages = self.ctx.store.list_messages(&folder)?;
        let this = self.arc()?;

        let previous = std::mem::take(&mut state.children);
        let mut files_by_uid: HashMap<Uid, Arc<File>> = previous
            .values()
            .filter_map(|entry| match entry {
                Entry::File(file) => file.uid().map(|uid| (uid, file.clone())),
                Entry::Directory(_) => None,
            })
            .collect();

        let mut children = HashMap::with_capacity(subfolders.len() + messages.len());
        for name in subfolders {
            let dir = match previous.get(&name) {
                Some(Entry::Directory(dir)) if !dir.is_defunct() => dir.clone(),
                _ => Directory::wrap(&self.ctx, &this, &name, false),
            };
            children.insert(name, Entry::Directory(dir));
        }

        for summary in messages {
            let name = path::name_of(&summary.subject);
            if name.is_empty() {
                continue;
            }
            let file = files_by_uid
                .remove(&summary.uid)
                .unwrap_or_else(|| File::wrap(&self.ctx, &this, summary.uid, name));
            children.insert(name.to_string(), Entry::File(file));
        }

        // A file between expunge and append keeps its slot until it lands
        for (name, entry) in previous {
            if let Entry::File(file) = entry {
                if file.is_pending() {
                    children.entry(name).or_insert(Entry::File(file));
                }
            }
        }

        state.children = children;
        state.valid = true;
        debug!(folder = %folder, entries = state.children.len(), "Rebuilt directory cache");
        Ok(())
    }
}
