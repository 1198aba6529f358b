//! Message header data used for storage and threading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::account::AccountId;
use super::folder::FolderId;

/// Unique identifier for a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// Message headers as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedMessage {
    /// Server UID.
    pub uid: u32,
    /// `Message-ID` header.
    pub msgid: Option<String>,
    /// `References` header, in header order.
    pub references: Vec<String>,
    /// `In-Reply-To` header.
    pub in_reply_to: Option<String>,
    /// Provider thread id (e.g. `gmail:1234`).
    pub native_thread_id: Option<String>,
    /// Sender address.
    pub from: Option<String>,
    /// Subject.
    pub subject: Option<String>,
    /// Server receive time.
    pub received: DateTime<Utc>,
    /// Raw header block.
    pub headers: String,
}

impl FetchedMessage {
    /// Hex SHA-256 of the raw header block.
    #[must_use]
    pub fn content_hash(&self) -> String {
        content_hash(&self.headers)
    }

    /// `Message-ID`, or a stable local id derived from the content hash.
    #[must_use]
    pub fn effective_msgid(&self) -> String {
        self.msgid
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("<{}.{}@local>", &self.content_hash()[..16], self.uid))
    }
}

/// Known message as seen by the thread resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    /// Row id.
    pub id: MessageId,
    /// Owning account.
    pub account: AccountId,
    /// Folder holding the message.
    pub folder: FolderId,
    /// Server UID.
    pub uid: u32,
    /// `Message-ID`.
    pub msgid: String,
    /// Normalized references (in-reply-to included).
    pub references: Vec<String>,
    /// `In-Reply-To`.
    pub in_reply_to: Option<String>,
    /// Content hash.
    pub hash: String,
    /// Resolved thread id.
    pub thread: String,
    /// Sender address.
    pub sender: Option<String>,
    /// Subject.
    pub subject: Option<String>,
    /// Server receive time.
    pub received: DateTime<Utc>,
}

/// Message about to be stored with its resolved thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Owning account.
    pub account: AccountId,
    /// Folder holding the message.
    pub folder: FolderId,
    /// Server UID.
    pub uid: u32,
    /// `Message-ID`.
    pub msgid: String,
    /// Normalized references.
    pub references: Vec<String>,
    /// `In-Reply-To`.
    pub in_reply_to: Option<String>,
    /// Content hash.
    pub hash: String,
    /// Resolved thread id.
    pub thread: String,
    /// Sender address.
    pub sender: Option<String>,
    /// Subject.
    pub subject: Option<String>,
    /// Server receive time.
    pub received: DateTime<Utc>,
}

/// Rewrite of one thread id into another, applied with the message insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMerge {
    /// Thread id being replaced.
    pub from: String,
    /// Thread id replacing it.
    pub to: String,
    /// Only rewrite messages received at or after this time.
    pub since: Option<DateTime<Utc>>,
}

/// Hex SHA-256 of a header block.
#[must_use]
pub fn content_hash(headers: &str) -> String {
    hex::encode(Sha256::digest(headers.as_bytes()))
}

/// Deduplicate references preserving order and append `In-Reply-To` when
/// missing. Blank entries are dropped.
#[must_use]
pub fn normalize_references(references: &[String], in_reply_to: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(references.len() + 1);
    for reference in references
        .iter()
        .map(String::as_str)
        .chain(in_reply_to)
        .map(str::trim)
    {
        if !reference.is_empty() && !out.iter().any(|r| r == reference) {
            out.push(reference.to_string());
        }
    }
    out
}

/// Subject with reply/forward prefixes removed, trimmed and lowercased.
#[must_use]
pub fn normalize_subject(subject: &str) -> String {
    const PREFIXES: [&str; 5] = ["re:", "fwd:", "fw:", "aw:", "wg:"];

    let mut rest = subject.trim();
    loop {
        let lower = rest.to_lowercase();
        let Some(prefix) = PREFIXES.iter().find(|p| lower.starts_with(*p)) else {
            break;
        };
        rest = rest[prefix.len()..].trim_start();
    }
    rest.to_lowercase()
}
