//! MailFS Core: a mail folder tree exposed as a filesystem
//!
//! Directories are folders, files are messages whose subject is the file
//! name and whose first attachment holds the content. Edits are staged on
//! local disk and pushed by replacing the backing message.

pub mod config;
pub mod entry;
pub mod error;
pub mod mailbox;
pub mod memory;
pub mod message;
pub mod path;
pub mod rewrite;
pub mod service;
pub mod staging;
pub mod types;

// Re-export key types for convenience
pub use config::{AttrPolicy, FsConfig, MailboxTarget, StatfsPolicy};
pub use entry::{Directory, Entry, File, FilePhase};
pub use error::{FsError, FsResult};
pub use mailbox::{MailError, MailStore, Uid};
pub use memory::InMemoryMailStore;
pub use message::Message;
pub use service::MailFs;
pub use types::*;
