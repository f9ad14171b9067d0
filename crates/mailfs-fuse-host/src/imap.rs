//! IMAP transport for the mail store
//!
//! Wraps an async-imap session in a private current-thread runtime so the
//! blocking [`MailStore`] calls from FUSE worker threads can drive it.

#[cfg(not(feature = "imap"))]
compile_error!("This module requires the 'imap' feature to be enabled");

use std::io;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_imap::error::Error as ImapError;
use async_imap::types::QuotaResourceName;
use async_imap::Session;
use async_native_tls::TlsStream;
use futures::io::{AsyncRead, AsyncWrite};
use futures::TryStreamExt;
use mailfs_core::mailbox::{
    MailResult, MessageSummary, Quota, QuotaResource, FOLDER_DELIMITER,
};
use mailfs_core::{MailError, MailStore, MailboxTarget, Message, Uid};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

const IMAPS_PORT: u16 = 993;
const IMAP_PORT: u16 = 143;

/// Plain or TLS-wrapped connection, so one session type serves both schemes
#[derive(Debug)]
enum ImapStream {
    Plain(Compat<TcpStream>),
    Tls(TlsStream<Compat<TcpStream>>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ImapStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_close(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_close(cx),
        }
    }
}

type ImapSession = Session<ImapStream>;

struct Connection {
    session: ImapSession,
    /// Folder currently selected on the server, in local notation
    selected: Option<String>,
}

/// [`MailStore`] backed by a live IMAP session
pub struct ImapMailStore {
    runtime: Runtime,
    connection: Mutex<Connection>,
    /// Server hierarchy delimiter
    delimiter: String,
}

impl std::fmt::Debug for ImapMailStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapMailStore")
            .field("delimiter", &self.delimiter)
            .finish()
    }
}

fn protocol(context: &str, err: ImapError) -> MailError {
    MailError::protocol(format!("{} failed: {}", context, err))
}

/// RFC 2087 name of a quota resource.
fn resource_name(name: &QuotaResourceName) -> String {
    match name {
        QuotaResourceName::Storage => "STORAGE".to_string(),
        QuotaResourceName::Message => "MESSAGE".to_string(),
        QuotaResourceName::Atom(atom) => atom.to_string(),
    }
}

/// Quotes an IMAP string argument.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

impl ImapMailStore {
    /// Connects and logs in. Credentials must already be resolved.
    pub fn connect(target: &MailboxTarget) -> MailResult<Self> {
        let username = target
            .username
            .as_deref()
            .ok_or_else(|| MailError::connect("no username given"))?;
        let password = target
            .password
            .as_deref()
            .ok_or_else(|| MailError::connect("no password given"))?;
        let port = target
            .port
            .unwrap_or(if target.is_tls() { IMAPS_PORT } else { IMAP_PORT });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| MailError::connect(format!("runtime setup failed: {}", e)))?;

        let (session, delimiter) = runtime.block_on(async {
            info!(host = %target.host, port, tls = target.is_tls(), "Connecting to IMAP server");
            let tcp = TcpStream::connect((target.host.as_str(), port))
                .await
                .map_err(|e| MailError::connect(format!("TCP connection failed: {}", e)))?
                .compat();

            let stream = if target.is_tls() {
                let tls = async_native_tls::TlsConnector::new()
                    .connect(target.host.as_str(), tcp)
                    .await
                    .map_err(|e| MailError::connect(format!("TLS handshake failed: {}", e)))?;
                ImapStream::Tls(tls)
            } else {
                ImapStream::Plain(tcp)
            };

            let mut session = async_imap::Client::new(stream)
                .login(username, password)
                .await
                .map_err(|(e, _)| MailError::connect(format!("login failed: {}", e)))?;

            // LIST "" "" reports the hierarchy delimiter without listing anything
            let names: Vec<_> = session
                .list(Some(""), Some(""))
                .await
                .map_err(|e| protocol("LIST", e))?
                .try_collect()
                .await
                .map_err(|e| protocol("LIST", e))?;
            let delimiter = names
                .first()
                .and_then(|n| n.delimiter())
                .unwrap_or("/")
                .to_string();

            Ok::<_, MailError>((session, delimiter))
        })?;

        debug!(delimiter, "IMAP session established");
        Ok(Self {
            runtime,
            connection: Mutex::new(Connection {
                session,
                selected: None,
            }),
            delimiter,
        })
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // TODO: encode non-ASCII folder names as modified UTF-7
    fn remote(&self, folder: &str) -> String {
        folder.replace(FOLDER_DELIMITER, &self.delimiter)
    }

    fn local(&self, folder: &str) -> String {
        folder.replace(self.delimiter.as_str(), &FOLDER_DELIMITER.to_string())
    }

    async fn select(&self, conn: &mut Connection, folder: &str) -> MailResult<u32> {
        let mailbox = conn
            .session
            .select(self.remote(folder))
            .await
            .map_err(|e| match e {
                ImapError::No(_) => MailError::NoSuchFolder(folder.to_string()),
                other => protocol("SELECT", other),
            })?;
        conn.selected = Some(folder.to_string());
        Ok(mailbox.exists)
    }

    async fn ensure_selected(&self, conn: &mut Connection, folder: &str) -> MailResult<()> {
        if conn.selected.as_deref() != Some(folder) {
            self.select(conn, folder).await?;
        }
        Ok(())
    }

    /// Subjects of `uid_set`, skipping messages flagged `\Deleted`.
    async fn subjects(
        &self,
        conn: &mut Connection,
        uid_set: &str,
    ) -> MailResult<Vec<MessageSummary>> {
        let fetches: Vec<_> = conn
            .session
            .uid_fetch(uid_set, "(UID FLAGS RFC822.HEADER)")
            .await
            .map_err(|e| protocol("UID FETCH", e))?
            .try_collect()
            .await
            .map_err(|e| protocol("UID FETCH", e))?;

        let mut summaries = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let Some(uid) = fetch.uid else { continue };
            if fetch
                .flags()
                .any(|flag| matches!(flag, async_imap::types::Flag::Deleted))
            {
                continue;
            }
            let header = Message::from_rfc822(fetch.header().unwrap_or(&[]))?;
            summaries.push(MessageSummary {
                uid: Uid(uid),
                subject: header.subject().to_string(),
            });
        }
        Ok(summaries)
    }
}

impl MailStore for ImapMailStore {
    fn list_folders(&self, folder: &str) -> MailResult<Vec<String>> {
        let mut conn = self.connection();
        let pattern = format!("{}{}%", self.remote(folder), self.delimiter);
        let names: Vec<_> = self.runtime.block_on(async {
            conn.session
                .list(Some(""), Some(pattern.as_str()))
                .await
                .map_err(|e| protocol("LIST", e))?
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| protocol("LIST", e))
        })?;

        let prefix = format!("{}{}", folder, FOLDER_DELIMITER);
        Ok(names
            .iter()
            .filter_map(|n| {
                self.local(n.name())
                    .strip_prefix(&prefix)
                    .map(str::to_string)
            })
            .filter(|leaf| !leaf.is_empty() && !leaf.contains(FOLDER_DELIMITER))
            .collect())
    }

    fn folder_exists(&self, folder: &str) -> MailResult<bool> {
        let mut conn = self.connection();
        let remote = self.remote(folder);
        let names: Vec<_> = self.runtime.block_on(async {
            conn.session
                .list(Some(""), Some(remote.as_str()))
                .await
                .map_err(|e| protocol("LIST", e))?
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| protocol("LIST", e))
        })?;
        Ok(!names.is_empty())
    }

    fn create_folder(&self, folder: &str) -> MailResult<bool> {
        let mut conn = self.connection();
        match self.runtime.block_on(conn.session.create(self.remote(folder))) {
            Ok(()) => Ok(true),
            Err(ImapError::No(reason)) => {
                debug!(folder, reason, "CREATE refused");
                Ok(false)
            }
            Err(e) => Err(protocol("CREATE", e)),
        }
    }

    fn delete_folder(&self, folder: &str) -> MailResult<()> {
        let mut conn = self.connection();
        let conn = &mut *conn;
        let prefix = format!("{}{}", folder, FOLDER_DELIMITER);
        if conn
            .selected
            .as_deref()
            .is_some_and(|s| s == folder || s.starts_with(&prefix))
        {
            conn.selected = None;
            self.runtime
                .block_on(conn.session.close())
                .map_err(|e| protocol("CLOSE", e))?;
        }

        // Subfolders first; servers refuse to delete a folder with children
        let pattern = format!("{}{}*", self.remote(folder), self.delimiter);
        let mut names: Vec<String> = self.runtime.block_on(async {
            let names: Vec<_> = conn
                .session
                .list(Some(""), Some(pattern.as_str()))
                .await
                .map_err(|e| protocol("LIST", e))?
                .try_collect()
                .await
                .map_err(|e| protocol("LIST", e))?;
            Ok::<_, MailError>(names.iter().map(|n| n.name().to_string()).collect())
        })?;
        names.sort_by_key(|n| std::cmp::Reverse(n.len()));
        names.push(self.remote(folder));

        for name in names {
            self.runtime
                .block_on(conn.session.delete(&name))
                .map_err(|e| protocol("DELETE", e))?;
        }
        Ok(())
    }

    fn rename_folder(&self, from: &str, to: &str) -> MailResult<bool> {
        let mut conn = self.connection();
        if conn.selected.as_deref() == Some(from) {
            conn.selected = None;
        }
        match self
            .runtime
            .block_on(conn.session.rename(self.remote(from), self.remote(to)))
        {
            Ok(()) => Ok(true),
            Err(ImapError::No(reason)) => {
                debug!(from, to, reason, "RENAME refused");
                Ok(false)
            }
            Err(e) => Err(protocol("RENAME", e)),
        }
    }

    fn open_folder(&self, folder: &str) -> MailResult<()> {
        let mut conn = self.connection();
        self.runtime.block_on(self.select(&mut conn, folder))?;
        Ok(())
    }

    fn close_folder(&self, folder: &str, expunge: bool) -> MailResult<()> {
        let mut conn = self.connection();
        if !expunge {
            if conn.selected.as_deref() == Some(folder) {
                conn.selected = None;
            }
            return Ok(());
        }
        self.runtime.block_on(async {
            self.ensure_selected(&mut conn, folder).await?;
            conn.selected = None;
            // CLOSE expunges the selected folder
            conn.session.close().await.map_err(|e| protocol("CLOSE", e))
        })
    }

    fn list_messages(&self, folder: &str) -> MailResult<Vec<MessageSummary>> {
        let mut conn = self.connection();
        self.runtime.block_on(async {
            if self.select(&mut conn, folder).await? == 0 {
                return Ok(Vec::new());
            }
            self.subjects(&mut conn, "1:*").await
        })
    }

    fn fetch_message(&self, folder: &str, uid: Uid) -> MailResult<Message> {
        let mut conn = self.connection();
        let raw = self.runtime.block_on(async {
            self.ensure_selected(&mut conn, folder).await?;
            let fetches: Vec<_> = conn
                .session
                .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
                .await
                .map_err(|e| protocol("UID FETCH", e))?
                .try_collect()
                .await
                .map_err(|e| protocol("UID FETCH", e))?;
            fetches
                .iter()
                .find(|f| f.uid == Some(uid.0))
                .and_then(|f| f.body().map(<[u8]>::to_vec))
                .ok_or_else(|| MailError::NoSuchMessage {
                    folder: folder.to_string(),
                    uid,
                })
        })?;
        Message::from_rfc822(&raw)
    }

    fn append_message(&self, folder: &str, message: &Message) -> MailResult<Uid> {
        let raw = message.to_rfc822()?;
        let mut conn = self.connection();
        self.runtime.block_on(async {
            let remote = self.remote(folder);
            conn.session
                .append(&remote, None, None, &raw)
                .await
                .map_err(|e| protocol("APPEND", e))?;

            // APPEND does not report the uid; the newest match is ours
            self.select(&mut conn, folder).await?;
            let query = format!("UNDELETED SUBJECT {}", quote(message.subject()));
            let uids = conn
                .session
                .uid_search(&query)
                .await
                .map_err(|e| protocol("UID SEARCH", e))?;
            let newest = uids
                .into_iter()
                .max()
                .ok_or_else(|| MailError::protocol("appended message not found"))?;
            Ok(Uid(newest))
        })
    }

    fn copy_message(&self, folder: &str, uid: Uid, destination: &str) -> MailResult<()> {
        let mut conn = self.connection();
        self.runtime.block_on(async {
            self.ensure_selected(&mut conn, folder).await?;
            conn.session
                .uid_copy(uid.to_string(), self.remote(destination))
                .await
                .map_err(|e| protocol("UID COPY", e))
        })
    }

    fn mark_deleted(&self, folder: &str, uid: Uid) -> MailResult<()> {
        let mut conn = self.connection();
        self.runtime.block_on(async {
            self.ensure_selected(&mut conn, folder).await?;
            let _: Vec<_> = conn
                .session
                .uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)")
                .await
                .map_err(|e| protocol("UID STORE", e))?
                .try_collect()
                .await
                .map_err(|e| protocol("UID STORE", e))?;
            Ok(())
        })
    }

    fn expunge(&self, folder: &str) -> MailResult<()> {
        let mut conn = self.connection();
        self.runtime.block_on(async {
            self.ensure_selected(&mut conn, folder).await?;
            let _: Vec<_> = conn
                .session
                .expunge()
                .await
                .map_err(|e| protocol("EXPUNGE", e))?
                .try_collect()
                .await
                .map_err(|e| protocol("EXPUNGE", e))?;
            Ok(())
        })
    }

    fn search_subject(&self, folder: &str, subject: &str) -> MailResult<Vec<Uid>> {
        let mut conn = self.connection();
        self.runtime.block_on(async {
            self.ensure_selected(&mut conn, folder).await?;
            let query = format!("UNDELETED SUBJECT {}", quote(subject));
            let uids = conn
                .session
                .uid_search(&query)
                .await
                .map_err(|e| protocol("UID SEARCH", e))?;
            if uids.is_empty() {
                return Ok(Vec::new());
            }

            // SUBJECT matches substrings; keep exact matches only
            let uid_set = uids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let mut exact: Vec<Uid> = self
                .subjects(&mut conn, &uid_set)
                .await?
                .into_iter()
                .filter(|s| s.subject == subject)
                .map(|s| s.uid)
                .collect();
            exact.sort();
            Ok(exact)
        })
    }

    fn quota(&self, folder: &str) -> MailResult<Option<Quota>> {
        let mut conn = self.connection();
        let result = self
            .runtime
            .block_on(conn.session.get_quota_root(&self.remote(folder)));
        match result {
            Ok((_roots, quotas)) => Ok(quotas.into_iter().next().map(|quota| Quota {
                resources: quota
                    .resources
                    .into_iter()
                    .map(|r| QuotaResource {
                        name: resource_name(&r.name),
                        usage: r.usage,
                        limit: r.limit,
                    })
                    .collect(),
            })),
            // Servers without the QUOTA extension refuse the command
            Err(ImapError::No(_)) | Err(ImapError::Bad(_)) => Ok(None),
            Err(e) => Err(protocol("GETQUOTAROOT", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_resource_names() {
        assert_eq!(resource_name(&QuotaResourceName::Storage), "STORAGE");
        assert_eq!(resource_name(&QuotaResourceName::Message), "MESSAGE");
        let quota = Quota {
            resources: vec![QuotaResource {
                name: resource_name(&QuotaResourceName::Storage),
                usage: 1,
                limit: 2,
            }],
        };
        assert_eq!(quota.storage().map(|r| r.limit), Some(2));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote("a\\b"), "\"a\\\\b\"");
    }

    #[test]
    fn test_connect_requires_credentials() {
        let target = MailboxTarget::parse("imaps://imap.example.com/Files").unwrap();
        let err = ImapMailStore::connect(&target).unwrap_err();
        assert!(matches!(err, MailError::Connect(_)));
    }
}
