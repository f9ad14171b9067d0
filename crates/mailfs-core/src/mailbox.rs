//! Mailbox client capability consumed by the entry tree
//!
//! Folder names are full paths joined with `/` (for example `INBOX/photos`).
//! Transports that use another hierarchy delimiter translate at their edge.

use std::fmt;

use crate::message::Message;

/// Folder hierarchy separator used in folder names handed to a [`MailStore`].
pub const FOLDER_DELIMITER: char = '/';

/// Mailbox transport failure
#[derive(thiserror::Error, Debug)]
pub enum MailError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no such folder: {0}")]
    NoSuchFolder(String),
    #[error("no such message {uid} in {folder}")]
    NoSuchMessage { folder: String, uid: Uid },
    #[error("folder {0} is not open")]
    FolderClosed(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl MailError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect(message.into())
    }
}

pub type MailResult<T> = Result<T, MailError>;

/// Per-folder message identifier, stable across expunges of other messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lightweight listing record for a stored message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageSummary {
    pub uid: Uid,
    pub subject: String,
}

/// A single quota resource as reported by the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaResource {
    pub name: String,
    pub usage: u64,
    pub limit: u64,
}

/// Quota root information for a folder
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Quota {
    pub resources: Vec<QuotaResource>,
}

impl Quota {
    /// The `STORAGE` resource, in KiB, if the server reports one.
    pub fn storage(&self) -> Option<&QuotaResource> {
        self.resources
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case("STORAGE"))
    }
}

/// Blocking mailbox store operations used by the entry tree.
///
/// Every call may block on the network; none of them retry.
pub trait MailStore: Send + Sync {
    /// Leaf names of the direct subfolders of `folder`.
    fn list_folders(&self, folder: &str) -> MailResult<Vec<String>>;
    fn folder_exists(&self, folder: &str) -> MailResult<bool>;
    /// Returns `false` when the server refuses to create the folder.
    fn create_folder(&self, folder: &str) -> MailResult<bool>;
    fn delete_folder(&self, folder: &str) -> MailResult<()>;
    /// Returns `false` when the server refuses the rename (e.g. destination exists).
    fn rename_folder(&self, from: &str, to: &str) -> MailResult<bool>;
    fn open_folder(&self, folder: &str) -> MailResult<()>;
    /// Closes the folder, expunging deleted messages first when `expunge` is set.
    fn close_folder(&self, folder: &str, expunge: bool) -> MailResult<()>;

    fn list_messages(&self, folder: &str) -> MailResult<Vec<MessageSummary>>;
    fn fetch_message(&self, folder: &str, uid: Uid) -> MailResult<Message>;
    /// Appends a message and returns the identifier it was stored under.
    fn append_message(&self, folder: &str, message: &Message) -> MailResult<Uid>;
    fn copy_message(&self, folder: &str, uid: Uid, destination: &str) -> MailResult<()>;
    fn mark_deleted(&self, folder: &str, uid: Uid) -> MailResult<()>;
    fn expunge(&self, folder: &str) -> MailResult<()>;
    /// Messages whose subject equals `subject` exactly.
    fn search_subject(&self, folder: &str, subject: &str) -> MailResult<Vec<Uid>>;
    fn quota(&self, folder: &str) -> MailResult<Option<Quota>>;
}

/// Full name of the child `name` under `folder`.
pub fn child_folder(folder: &str, name: &str) -> String {
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", folder, FOLDER_DELIMITER, name)
    }
}
