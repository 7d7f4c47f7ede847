use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Stable account identifier, assigned at onboarding by the embedder.
pub type AccountId = String;

/// Conversation (Gmail thread) identifier, provider-assigned.
pub type ConvId = String;

/// Per-message identifier. For Gmail this is the X-GM-MSGID; when the
/// provider does not supply one we synthesize `account:folder:uid`.
pub type MessageId = String;

/// Folder reference understood by the transport collaborator.
pub type FolderId = String;

/// Server-assigned per-folder message id, monotonically increasing.
pub type Uid = u64;

pub type TaskId = i64;

/// Per-message envelope projection. Immutable once created except for
/// `flags` and `label_folder_ids`, which the modify-conversation flow
/// rewrites in place.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderInfo {
    pub id: MessageId,
    pub conv_id: ConvId,
    pub uid: Uid,
    pub date_ts: i64,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub flags: Vec<String>,
    pub label_folder_ids: Vec<String>,
}

/// Per-message body-structure projection, derived from the same fetch as
/// the header and never touched afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BodyInfo {
    pub message_id: MessageId,
    pub body_structure_json: Option<String>,
    pub snippet: Option<String>,
}

/// Derived aggregate over a conversation's full header set. Always
/// recomputed whole by the churn collaborator, never patched.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationInfo {
    pub conv_id: ConvId,
    pub account_id: AccountId,
    pub subject: Option<String>,
    pub participants: Vec<String>,
    pub date_oldest_ts: i64,
    pub date_newest_ts: i64,
    pub message_count: u32,
    pub unread_count: u32,
    pub has_starred: bool,
}

/// Revised flag/label state for an already-known uid, as observed by
/// `sync_refresh` and applied by the modify-conversation flow.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UidState {
    pub flags: Vec<String>,
    pub label_folder_ids: Vec<String>,
}

/// Persisted per-account sync state: the cursor pair plus the interest
/// tiers. "Yay" uids currently meet the sync criteria; "meh" uids belong to
/// a conversation of interest without meeting the criteria themselves, and
/// are tracked so later refreshes don't treat them as novel.
///
/// Invariants: `yay_uids` and `meh_uids` are disjoint; `last_high_uid` never
/// decreases within an account's lifetime; every tracked uid maps to exactly
/// one conversation in `uid_conv`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawSyncState {
    pub last_high_uid: Uid,
    pub modseq: u64,
    pub yay_uids: std::collections::BTreeSet<Uid>,
    pub meh_uids: std::collections::BTreeSet<Uid>,
    pub uid_conv: std::collections::BTreeMap<Uid, ConvId>,
    /// Removals queued during a scan and applied by the finalize step, so a
    /// mid-scan crash cannot lose a uid that was also being re-classified.
    pub pending_removals: std::collections::BTreeSet<Uid>,
}

/// Canonical ordering of messages within a conversation: date, then uid,
/// then id as a final tiebreak so the order is total.
pub fn conversation_message_cmp(a: &HeaderInfo, b: &HeaderInfo) -> std::cmp::Ordering {
    a.date_ts
        .cmp(&b.date_ts)
        .then(a.uid.cmp(&b.uid))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
