//! Mail transport collaborator: the already-parsed view of the remote
//! mailbox. Wire-protocol framing and response parsing live behind this
//! trait; the sync tasks only ever see structured envelope/flag/label data.

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ConvId, FolderId, Uid};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("list failed in {folder}: {reason}")]
    ListFailed { folder: FolderId, reason: String },
    #[error("search failed in {folder}: {reason}")]
    SearchFailed { folder: FolderId, reason: String },
}

/// Mailbox-level counters reported alongside every listing; the sync cursor
/// is advanced from these, never from the message set itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct MailboxInfo {
    pub uid_next: Uid,
    pub highest_modseq: u64,
}

/// One message as reported by the remote. Envelope and body structure are
/// only populated when the field list asks for them.
#[derive(Clone, Debug)]
pub struct RemoteMessage {
    pub uid: Uid,
    pub internal_date_ts: i64,
    pub conv_id: ConvId,
    pub flags: Vec<String>,
    pub labels: Vec<String>,
    pub envelope: Option<RemoteEnvelope>,
    pub body_structure_json: Option<String>,
    pub snippet: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct RemoteEnvelope {
    pub message_id: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
}

#[derive(Clone, Debug)]
pub enum UidSelector {
    /// `1:*` — every message in the folder.
    All,
    Uids(Vec<Uid>),
}

/// Fetch field list, the closed equivalent of the IMAP attribute strings
/// the tasks would otherwise pass around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchField {
    Uid,
    InternalDate,
    ThreadId,
    Labels,
    Flags,
    Envelope,
    BodyStructure,
}

/// The flag/label/thread-id delta listing used by `sync_refresh`.
pub const REFRESH_FETCH_FIELDS: &[FetchField] = &[
    FetchField::Uid,
    FetchField::InternalDate,
    FetchField::ThreadId,
    FetchField::Labels,
    // New messages don't need FLAGS, but asking in one go is kinder to the
    // server than a second round trip.
    FetchField::Flags,
];

/// The full-envelope fetch used by `sync_conv` when materializing headers
/// and bodies.
pub const CONV_FETCH_FIELDS: &[FetchField] = &[
    FetchField::Uid,
    FetchField::InternalDate,
    FetchField::ThreadId,
    FetchField::Labels,
    FetchField::Flags,
    FetchField::Envelope,
    FetchField::BodyStructure,
];

#[derive(Clone, Copy, Debug, Default)]
pub struct ListOptions {
    pub by_uid: bool,
    /// CONDSTORE-style incremental listing: only messages whose modseq is
    /// strictly greater than this are returned.
    pub changed_since: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct SearchSpec {
    pub thread_id: Option<ConvId>,
    pub since_ts: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SearchOptions {
    pub by_uid: bool,
}

#[derive(Clone, Debug)]
pub struct ListResult {
    pub mailbox: MailboxInfo,
    pub messages: Vec<RemoteMessage>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn list_messages(
        &self,
        folder: &FolderId,
        selector: &UidSelector,
        fields: &[FetchField],
        opts: ListOptions,
    ) -> Result<ListResult, TransportError>;

    async fn search(
        &self,
        folder: &FolderId,
        spec: &SearchSpec,
        opts: SearchOptions,
    ) -> Result<Vec<Uid>, TransportError>;
}
