//! In-memory mailbox store
//!
//! Backs the `memory://` target and every test. Messages are kept parsed;
//! nothing is ever serialized.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::mailbox::{MailError, MailResult, MailStore, MessageSummary, Quota, Uid, FOLDER_DELIMITER};
use crate::message::Message;

#[derive(Debug)]
struct StoredMessage {
    message: Message,
    deleted: bool,
}

#[derive(Debug)]
struct FolderState {
    open: bool,
    next_uid: u32,
    messages: BTreeMap<Uid, StoredMessage>,
}

impl FolderState {
    fn new() -> Self {
        Self {
            open: false,
            next_uid: 1,
            messages: BTreeMap::new(),
        }
    }

    fn insert(&mut self, message: Message) -> Uid {
        let uid = Uid(self.next_uid);
        self.next_uid += 1;
        self.messages.insert(
            uid,
            StoredMessage {
                message,
                deleted: false,
            },
        );
        uid
    }
}

#[derive(Debug, Default)]
struct StoreState {
    folders: HashMap<String, FolderState>,
    quota: Option<Quota>,
    fail_next_append: bool,
    reject_renames: bool,
}

/// Mail store held entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryMailStore {
    state: Mutex<StoreState>,
}

impl InMemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already contains the (empty) folder `name`.
    pub fn with_folder(name: &str) -> Self {
        let store = Self::new();
        store.lock().folders.insert(name.to_string(), FolderState::new());
        store
    }

    /// Makes the next `append_message` fail with a protocol error.
    pub fn fail_next_append(&self) {
        self.lock().fail_next_append = true;
    }

    /// Makes every folder rename report refusal.
    pub fn reject_renames(&self, reject: bool) {
        self.lock().reject_renames = reject;
    }

    pub fn set_quota(&self, quota: Option<Quota>) {
        self.lock().quota = quota;
    }

    /// Number of messages in `folder`, counting ones flagged deleted.
    pub fn message_count(&self, folder: &str) -> usize {
        self.lock()
            .folders
            .get(folder)
            .map(|f| f.messages.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn folder<'a>(state: &'a StoreState, name: &str) -> MailResult<&'a FolderState> {
    state
        .folders
        .get(name)
        .ok_or_else(|| MailError::NoSuchFolder(name.to_string()))
}

fn open_folder_mut<'a>(state: &'a mut StoreState, name: &str) -> MailResult<&'a mut FolderState> {
    let folder = state
        .folders
        .get_mut(name)
        .ok_or_else(|| MailError::NoSuchFolder(name.to_string()))?;
    if !folder.open {
        return Err(MailError::FolderClosed(name.to_string()));
    }
    Ok(folder)
}

fn is_descendant(candidate: &str, ancestor: &str) -> bool {
    candidate
        .strip_prefix(ancestor)
        .map_or(false, |rest| rest.starts_with(FOLDER_DELIMITER))
}

impl MailStore for InMemoryMailStore {
    fn list_folders(&self, name: &str) -> MailResult<Vec<String>> {
        let state = self.lock();
        folder(&state, name)?;
        let mut children: Vec<String> = state
            .folders
            .keys()
            .filter_map(|candidate| {
                let rest = if name.is_empty() {
                    candidate.as_str()
                } else {
                    candidate.strip_prefix(name)?.strip_prefix(FOLDER_DELIMITER)?
                };
                (!rest.is_empty() && !rest.contains(FOLDER_DELIMITER)).then(|| rest.to_string())
            })
            .collect();
        children.sort();
        Ok(children)
    }

    fn folder_exists(&self, name: &str) -> MailResult<bool> {
        Ok(self.lock().folders.contains_key(name))
    }

    fn create_folder(&self, name: &str) -> MailResult<bool> {
        let mut state = self.lock();
        if state.folders.contains_key(name) {
            return Ok(false);
        }
        state.folders.insert(name.to_string(), FolderState::new());
        debug!(folder = name, "Created folder");
        Ok(true)
    }

    fn delete_folder(&self, name: &str) -> MailResult<()> {
        let mut state = self.lock();
        folder(&state, name)?;
        state
            .folders
            .retain(|candidate, _| candidate != name && !is_descendant(candidate, name));
        Ok(())
    }

    fn rename_folder(&self, from: &str, to: &str) -> MailResult<bool> {
        let mut state = self.lock();
        folder(&state, from)?;
        if state.reject_renames || state.folders.contains_key(to) || is_descendant(to, from) {
            return Ok(false);
        }

        let moved: Vec<String> = state
            .folders
            .keys()
            .filter(|candidate| candidate.as_str() == from || is_descendant(candidate, from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(folder_state) = state.folders.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                state.folders.insert(new, folder_state);
            }
        }
        Ok(true)
    }

    fn open_folder(&self, name: &str) -> MailResult<()> {
        let mut state = self.lock();
        let folder = state
            .folders
            .get_mut(name)
            .ok_or_else(|| MailError::NoSuchFolder(name.to_string()))?;
        folder.open = true;
        Ok(())
    }

    fn close_folder(&self, name: &str, expunge: bool) -> MailResult<()> {
        let mut state = self.lock();
        let folder = open_folder_mut(&mut state, name)?;
        if expunge {
            folder.messages.retain(|_, m| !m.deleted);
        }
        folder.open = false;
        Ok(())
    }

    fn list_messages(&self, name: &str) -> MailResult<Vec<MessageSummary>> {
        let mut state = self.lock();
        let folder = open_folder_mut(&mut state, name)?;
        Ok(folder
            .messages
            .iter()
            .filter(|(_, stored)| !stored.deleted)
            .map(|(uid, stored)| MessageSummary {
                uid: *uid,
                subject: stored.message.subject().to_string(),
            })
            .collect())
    }

    fn fetch_message(&self, name: &str, uid: Uid) -> MailResult<Message> {
        let mut state = self.lock();
        let folder = open_folder_mut(&mut state, name)?;
        folder
            .messages
            .get(&uid)
            .map(|stored| stored.message.clone())
            .ok_or_else(|| MailError::NoSuchMessage {
                folder: name.to_string(),
                uid,
            })
    }

    fn append_message(&self, name: &str, message: &Message) -> MailResult<Uid> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_append) {
            return Err(MailError::protocol("APPEND refused"));
        }
        let folder = state
            .folders
            .get_mut(name)
            .ok_or_else(|| MailError::NoSuchFolder(name.to_string()))?;
        let uid = folder.insert(message.clone());
        debug!(folder = name, %uid, subject = message.subject(), "Appended message");
        Ok(uid)
    }

    fn copy_message(&self, name: &str, uid: Uid, destination: &str) -> MailResult<()> {
        let mut state = self.lock();
        let message = open_folder_mut(&mut state, name)?
            .messages
            .get(&uid)
            .map(|stored| stored.message.clone())
            .ok_or_else(|| MailError::NoSuchMessage {
                folder: name.to_string(),
                uid,
            })?;
        state
            .folders
            .get_mut(destination)
            .ok_or_else(|| MailError::NoSuchFolder(destination.to_string()))?
            .insert(message);
        Ok(())
    }

    fn mark_deleted(&self, name: &str, uid: Uid) -> MailResult<()> {
        let mut state = self.lock();
        let stored = open_folder_mut(&mut state, name)?
            .messages
            .get_mut(&uid)
            .ok_or_else(|| MailError::NoSuchMessage {
                folder: name.to_string(),
                uid,
            })?;
        stored.deleted = true;
        Ok(())
    }

    fn expunge(&self, name: &str) -> MailResult<()> {
        let mut state = self.lock();
        open_folder_mut(&mut state, name)?
            .messages
            .retain(|_, m| !m.deleted);
        Ok(())
    }

    fn search_subject(&self, name: &str, subject: &str) -> MailResult<Vec<Uid>> {
        let mut state = self.lock();
        Ok(open_folder_mut(&mut state, name)?
            .messages
            .iter()
            .filter(|(_, stored)| !stored.deleted && stored.message.subject() == subject)
            .map(|(uid, _)| *uid)
            .collect())
    }

    fn quota(&self, name: &str) -> MailResult<Option<Quota>> {
        let state = self.lock();
        folder(&state, name)?;
        Ok(state.quota.clone())
    }
}
