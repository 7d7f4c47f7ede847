//! Scripted transport for tests: seed it with messages per folder, it
//! answers `list_messages`/`search` from memory and records the calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::types::{FolderId, Uid};

use super::{
    FetchField, ListOptions, ListResult, MailTransport, MailboxInfo, RemoteMessage, SearchOptions,
    SearchSpec, TransportError, UidSelector,
};

#[derive(Debug, Default)]
struct MockInner {
    mailboxes: HashMap<FolderId, MailboxInfo>,
    /// uid -> (message, modseq it last changed at)
    messages: HashMap<FolderId, Vec<(RemoteMessage, u64)>>,
    list_calls: Vec<(FolderId, Option<u64>)>,
    search_calls: Vec<(FolderId, SearchSpec)>,
    fail_next_list: Option<String>,
    fail_next_search: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mailbox(&self, folder: &str, uid_next: Uid, highest_modseq: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.mailboxes.insert(
            folder.to_string(),
            MailboxInfo {
                uid_next,
                highest_modseq,
            },
        );
    }

    /// Add a message visible to listings whose `changed_since` is below
    /// `modseq`.
    pub fn add_message(&self, folder: &str, message: RemoteMessage, modseq: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .messages
            .entry(folder.to_string())
            .or_default()
            .push((message, modseq));
    }

    pub fn fail_next_list(&self, reason: &str) {
        self.inner.lock().unwrap().fail_next_list = Some(reason.to_string());
    }

    pub fn fail_next_search(&self, reason: &str) {
        self.inner.lock().unwrap().fail_next_search = Some(reason.to_string());
    }

    pub fn list_calls(&self) -> Vec<(FolderId, Option<u64>)> {
        self.inner.lock().unwrap().list_calls.clone()
    }

    pub fn search_calls(&self) -> Vec<(FolderId, SearchSpec)> {
        self.inner.lock().unwrap().search_calls.clone()
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn list_messages(
        &self,
        folder: &FolderId,
        selector: &UidSelector,
        _fields: &[FetchField],
        opts: ListOptions,
    ) -> Result<ListResult, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_next_list.take() {
            return Err(TransportError::ListFailed {
                folder: folder.clone(),
                reason,
            });
        }
        inner
            .list_calls
            .push((folder.clone(), opts.changed_since));

        let mailbox = inner
            .mailboxes
            .get(folder)
            .copied()
            .unwrap_or_default();
        let messages = inner
            .messages
            .get(folder)
            .map(|msgs| {
                msgs.iter()
                    .filter(|(msg, modseq)| {
                        let selected = match selector {
                            UidSelector::All => true,
                            UidSelector::Uids(uids) => uids.contains(&msg.uid),
                        };
                        let changed = opts
                            .changed_since
                            .map(|since| *modseq > since)
                            .unwrap_or(true);
                        selected && changed
                    })
                    .map(|(msg, _)| msg.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(ListResult { mailbox, messages })
    }

    async fn search(
        &self,
        folder: &FolderId,
        spec: &SearchSpec,
        _opts: SearchOptions,
    ) -> Result<Vec<Uid>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_next_search.take() {
            return Err(TransportError::SearchFailed {
                folder: folder.clone(),
                reason,
            });
        }
        inner.search_calls.push((folder.clone(), spec.clone()));

        let mut uids: Vec<Uid> = inner
            .messages
            .get(folder)
            .map(|msgs| {
                msgs.iter()
                    .filter(|(msg, _)| {
                        let thread_ok = spec
                            .thread_id
                            .as_ref()
                            .map(|t| &msg.conv_id == t)
                            .unwrap_or(true);
                        let since_ok = spec
                            .since_ts
                            .map(|ts| msg.internal_date_ts >= ts)
                            .unwrap_or(true);
                        thread_ok && since_ok
                    })
                    .map(|(msg, _)| msg.uid)
                    .collect()
            })
            .unwrap_or_default();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }
}
