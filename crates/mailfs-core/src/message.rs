//! Message model and the header conventions MailFS stores on it
//!
//! A file is a message whose subject is the file name, whose sent date is the
//! modification time and whose first attachment is the file content. The
//! logical length is recorded in the `X-Filesize` header.

use mail_builder::headers::date::Date;
use mail_builder::headers::raw::Raw;
use mail_builder::MessageBuilder;
use mail_parser::{MessageParser, MimeHeaders};
use tracing::warn;

use crate::mailbox::{MailError, MailResult};
use crate::path;

/// Header carrying the authoritative byte length of the file content.
pub const SIZE_HEADER: &str = "X-Filesize";

/// File name given to the attachment that holds the file content.
pub const ATTACHMENT_NAME: &str = "_mailfsdata.bin";

/// Headers the codec regenerates itself and therefore never carries forward.
const MANAGED_HEADERS: &[&str] = &[
    "subject",
    "date",
    "message-id",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
    "content-disposition",
];

/// The body part holding a file's content
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// An in-memory message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    subject: String,
    sent_date: i64,
    headers: Vec<(String, String)>,
    attachment: Option<Attachment>,
}

impl Message {
    /// A fresh message for an empty file named `name`.
    pub fn new_file(name: &str, sent_date: i64) -> Self {
        let mut message = Self {
            subject: name.to_string(),
            sent_date,
            ..Self::default()
        };
        message.set_header(SIZE_HEADER, "0");
        message
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn set_subject(&mut self, subject: &str) {
        self.subject = subject.to_string();
    }

    /// Sent date in seconds since the Unix epoch.
    pub fn sent_date(&self) -> i64 {
        self.sent_date
    }

    pub fn set_sent_date(&mut self, sent_date: i64) {
        self.sent_date = sent_date;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// Content of the first attachment; empty when the message has none.
    pub fn content(&self) -> &[u8] {
        self.attachment
            .as_ref()
            .map(|a| a.data.as_slice())
            .unwrap_or(&[])
    }

    /// Value of the size header, if present and well formed.
    pub fn declared_size(&self) -> Option<u64> {
        let raw = self.header(SIZE_HEADER)?;
        match raw.trim().parse() {
            Ok(size) => Some(size),
            Err(_) => {
                warn!(subject = %self.subject, value = raw, "Ignoring malformed size header");
                None
            }
        }
    }

    /// Replaces the attachment and records its length in the size header.
    pub fn set_content(&mut self, data: Vec<u8>, content_type: Option<&str>) {
        self.set_header(SIZE_HEADER, &data.len().to_string());
        self.attachment = Some(Attachment {
            filename: ATTACHMENT_NAME.to_string(),
            content_type: content_type.map(str::to_string),
            data,
        });
    }

    /// Serializes the message as RFC 5322 text.
    pub fn to_rfc822(&self) -> MailResult<Vec<u8>> {
        let mut builder = MessageBuilder::new()
            .subject(self.subject.as_str())
            .date(Date::new(self.sent_date));

        for (name, value) in &self.headers {
            if is_managed(name) {
                continue;
            }
            builder = builder.header(name.as_str(), Raw::new(value.as_str()));
        }

        builder = builder.text_body("");
        if let Some(attachment) = &self.attachment {
            let content_type = attachment
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            builder = builder.attachment(
                content_type,
                attachment.filename.as_str(),
                attachment.data.as_slice(),
            );
        }

        builder
            .write_to_vec()
            .map_err(|e| MailError::Malformed(e.to_string()))
    }

    /// Parses RFC 5322 text produced by this crate or by any other mail agent.
    pub fn from_rfc822(raw: &[u8]) -> MailResult<Self> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| MailError::Malformed("unparseable message".to_string()))?;

        let headers = top_level_headers(raw)
            .into_iter()
            .filter(|(name, _)| !is_managed(name))
            .collect();

        let attachment = parsed.attachment(0).map(|part| Attachment {
            filename: part
                .attachment_name()
                .unwrap_or(ATTACHMENT_NAME)
                .to_string(),
            content_type: part.content_type().map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            }),
            data: part.contents().to_vec(),
        });

        Ok(Self {
            subject: parsed.subject().unwrap_or_default().to_string(),
            sent_date: parsed.date().map(|d| d.to_timestamp()).unwrap_or(0),
            headers,
            attachment,
        })
    }
}

/// MIME type registered for the extension of `name`, if any.
pub fn content_type_for(name: &str) -> Option<&'static str> {
    let extension = path::extension_of(name)?;
    mime_guess::from_ext(extension).first_raw()
}

fn is_managed(name: &str) -> bool {
    MANAGED_HEADERS.iter().any(|m| m.eq_ignore_ascii_case(name))
}

/// Unfolded `(name, value)` pairs of the message header block.
fn top_level_headers(raw: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(raw);
    let mut headers: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    headers
}
