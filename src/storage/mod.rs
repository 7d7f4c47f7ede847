//! Storage transaction collaborator: named-entity reads, exclusive
//! mutate-loads, and the single atomic commit that lands a task's
//! mutations, new records, and task bookkeeping together.

mod db;

pub use db::Database;

use std::collections::HashMap;

use crate::task::{TaskSpec, WrappedTask};
use crate::types::{
    AccountId, BodyInfo, ConvId, ConversationInfo, HeaderInfo, MessageId, RawSyncState, TaskId,
};

/// Entities named by a `read`/`begin_mutate` call, grouped by kind.
#[derive(Clone, Debug, Default)]
pub struct Selectors {
    pub sync_states: Vec<AccountId>,
    pub conversations: Vec<ConvId>,
    pub headers_by_conversation: Vec<ConvId>,
}

impl Selectors {
    pub fn sync_state(account_id: &AccountId) -> Self {
        Self {
            sync_states: vec![account_id.clone()],
            ..Default::default()
        }
    }

    pub fn conversation(conv_id: &ConvId) -> Self {
        Self {
            conversations: vec![conv_id.clone()],
            ..Default::default()
        }
    }

    pub fn conversation_with_headers(conv_id: &ConvId) -> Self {
        Self {
            conversations: vec![conv_id.clone()],
            headers_by_conversation: vec![conv_id.clone()],
            ..Default::default()
        }
    }
}

/// Values loaded for a selector set. Requested keys are always present;
/// `None` means the entity does not exist (the distinction matters — an
/// absent sync state triggers the bootstrap path).
#[derive(Clone, Debug, Default)]
pub struct Loaded {
    pub sync_states: HashMap<AccountId, Option<RawSyncState>>,
    pub conversations: HashMap<ConvId, Option<ConversationInfo>>,
    pub headers_by_conversation: HashMap<ConvId, Vec<HeaderInfo>>,
}

/// Revisions to entities loaded by the matching `begin_mutate`. A `None`
/// value deletes the entity; deleting a conversation cascades to its
/// headers and bodies.
#[derive(Clone, Debug, Default)]
pub struct Mutations {
    pub sync_states: HashMap<AccountId, Option<RawSyncState>>,
    pub conversations: HashMap<ConvId, Option<ConversationInfo>>,
    pub headers: HashMap<MessageId, Option<HeaderInfo>>,
}

/// Brand-new records registered as durable byproducts of a task. Task
/// specs travel in their own channel; they are wrapped into task rows by
/// the manager, never smuggled through an entity kind.
#[derive(Clone, Debug, Default)]
pub struct NewData {
    pub conversations: Vec<ConversationInfo>,
    pub headers: Vec<HeaderInfo>,
    pub bodies: Vec<BodyInfo>,
    pub tasks: Vec<TaskSpec>,
}

impl NewData {
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
            && self.headers.is_empty()
            && self.bodies.is_empty()
            && self.tasks.is_empty()
    }
}

/// Task-table bookkeeping committed alongside the mutations.
#[derive(Clone, Debug, Default)]
pub struct TaskBookkeeping {
    /// The finishing task's own revised row; a `None` value deletes it
    /// (terminal completion).
    pub revised_task: Option<(TaskId, Option<WrappedTask>)>,
    /// Byproduct tasks, already wrapped with ids by the manager.
    pub wrapped_tasks: Vec<WrappedTask>,
}

/// Key of one exclusively lockable entity. `headers_by_conversation` locks
/// under its conversation's key so header and summary revisions serialize
/// together.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockKey {
    SyncState(AccountId),
    Conversation(ConvId),
}

impl Selectors {
    pub(crate) fn lock_keys(&self) -> Vec<LockKey> {
        let mut keys: Vec<LockKey> = Vec::new();
        for account_id in &self.sync_states {
            keys.push(LockKey::SyncState(account_id.clone()));
        }
        for conv_id in self
            .conversations
            .iter()
            .chain(self.headers_by_conversation.iter())
        {
            let key = LockKey::Conversation(conv_id.clone());
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_data_is_empty_until_a_record_arrives() {
        let mut new_data = NewData::default();
        assert!(new_data.is_empty());

        new_data.tasks.push(TaskSpec::SyncRefresh {
            account_id: "a1".into(),
            folder_id: None,
        });
        assert!(!new_data.is_empty());
    }

    #[test]
    fn lock_keys_dedupe_conversation_and_header_selectors() {
        let selectors = Selectors::conversation_with_headers(&"c1".to_string());
        assert_eq!(
            selectors.lock_keys(),
            vec![LockKey::Conversation("c1".to_string())]
        );
    }
}
