//! The generic task framework: durable task records, coalescing markers,
//! and the plan/execute lifecycle shapes shared by every concrete task.

pub mod context;
pub mod manager;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::storage::{Mutations, NewData};
use crate::types::{AccountId, ConvId, FolderId, TaskId, Uid, UidState};

/// Closed set of task kinds. Replaces string-keyed dispatch: an unknown
/// kind is unrepresentable, and a persisted payload that fails to decode is
/// a reported error rather than a missed lookup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    /// Steady-state incremental sync for one account, optionally focused on
    /// a folder.
    SyncRefresh {
        account_id: AccountId,
        folder_id: Option<FolderId>,
    },
    /// First-sync bootstrap: establish a sync-state baseline for a folder.
    SyncGrow {
        account_id: AccountId,
        folder_id: FolderId,
    },
    /// Conversation-level reconciliation; the work variant selects one of
    /// the three execution modes.
    SyncConv {
        account_id: AccountId,
        conv_id: ConvId,
        work: ConvWork,
    },
    /// Offline label mutation request; complex (marker-coalesced).
    StoreLabels {
        account_id: AccountId,
        conv_id: ConvId,
        add: BTreeSet<String>,
        remove: BTreeSet<String>,
    },
}

/// Exactly one of new/remove/modify per `sync_conv` invocation. All three
/// share one task type because they operate on the same exclusive target
/// and the fetch/chew logic.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConvWork {
    NewConv,
    DelConv,
    Modify {
        new_uids: BTreeSet<Uid>,
        removed_uids: BTreeSet<Uid>,
        revised_uid_state: BTreeMap<Uid, UidState>,
    },
}

impl TaskSpec {
    pub fn account_id(&self) -> &AccountId {
        match self {
            TaskSpec::SyncRefresh { account_id, .. }
            | TaskSpec::SyncGrow { account_id, .. }
            | TaskSpec::SyncConv { account_id, .. }
            | TaskSpec::StoreLabels { account_id, .. } => account_id,
        }
    }

    /// Serialization domains this task must hold exclusively while running.
    /// Refresh/grow/conv all contend on the account's sync state; only one
    /// may be active per account at a time.
    pub fn exclusive_resources(&self) -> Vec<String> {
        match self {
            TaskSpec::SyncRefresh { account_id, .. }
            | TaskSpec::SyncGrow { account_id, .. }
            | TaskSpec::SyncConv { account_id, .. } => {
                vec![format!("sync:{account_id}")]
            }
            TaskSpec::StoreLabels {
                account_id,
                conv_id,
                ..
            } => vec![format!("labels:{account_id}:{conv_id}")],
        }
    }

    /// Scheduling-affinity tags; tasks touching a currently-focused view
    /// run ahead of the rest of their resource domain.
    pub fn priority_tags(&self) -> Vec<String> {
        match self {
            TaskSpec::SyncConv { conv_id, .. } | TaskSpec::StoreLabels { conv_id, .. } => {
                vec![format!("view:conv:{conv_id}")]
            }
            _ => Vec::new(),
        }
    }

    /// Complex tasks coalesce into markers instead of running one row per
    /// request.
    pub fn is_complex(&self) -> bool {
        matches!(self, TaskSpec::StoreLabels { .. })
    }

    pub fn marker_key(&self) -> Option<MarkerKey> {
        match self {
            TaskSpec::StoreLabels {
                account_id,
                conv_id,
                ..
            } => Some(MarkerKey {
                name: "store_labels",
                account_id: account_id.clone(),
                conv_id: conv_id.clone(),
            }),
            _ => None,
        }
    }
}

/// Task lifecycle: a freshly enqueued task needs planning (`state` is null
/// in the persisted row); planning re-arms it as planned with a payload;
/// execution either concludes it (row deleted) or re-plans it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    NeedsPlanning,
    Planned,
}

/// One row of the durable task table, plus its in-arena form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WrappedTask {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub planned: Option<TaskSpec>,
}

impl WrappedTask {
    pub fn new(id: TaskId, spec: TaskSpec) -> Self {
        Self {
            id,
            spec,
            state: TaskState::NeedsPlanning,
            planned: None,
        }
    }
}

/// Identity of one coalesced complex-task unit: name plus naming arguments,
/// never a database row.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MarkerKey {
    pub name: &'static str,
    pub account_id: AccountId,
    pub conv_id: ConvId,
}

/// Pending label mutation accumulated under a `store_labels` marker.
/// Repeated requests merge here; a later remove cancels an earlier add and
/// vice versa.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelDelta {
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
}

impl LabelDelta {
    pub fn merge(&mut self, add: &BTreeSet<String>, remove: &BTreeSet<String>) {
        for label in add {
            self.remove.remove(label);
            self.add.insert(label.clone());
        }
        for label in remove {
            self.add.remove(label);
            self.remove.insert(label.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Overlay this pending intent onto an observed label set. Used when a
    /// server delta races a not-yet-applied local mutation: local intent
    /// wins.
    pub fn apply_to(&self, labels: &mut Vec<String>) {
        labels.retain(|l| !self.remove.contains(l));
        for label in &self.add {
            if !labels.iter().any(|l| l == label) {
                labels.push(label.clone());
            }
        }
    }
}

/// Terminal payload handed to `TaskContext::finish_task`. The mutation set,
/// new records, byproduct tasks, and the task's own revised state commit as
/// one atomic unit.
#[derive(Debug, Default)]
pub struct FinishData {
    pub mutations: Mutations,
    pub new_data: NewData,
    /// Present re-arms the task as planned with this payload; absent is
    /// terminal.
    pub task_state: Option<TaskSpec>,
    /// Markers to re-prioritize rather than persist.
    pub task_markers: Vec<MarkerKey>,
}

/// Synchronous cross-task queries: a sync task asking a complex task about
/// state it has queued but not yet applied. Must answer from memory only —
/// no storage or transport I/O behind this.
#[derive(Clone, Debug)]
pub enum Consult {
    PendingLabels {
        account_id: AccountId,
        conv_id: ConvId,
    },
}

#[derive(Clone, Debug)]
pub enum ConsultReply {
    PendingLabels(Option<LabelDelta>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_roundtrips_through_json() {
        let spec = TaskSpec::SyncConv {
            account_id: "a1".into(),
            conv_id: "c9".into(),
            work: ConvWork::Modify {
                new_uids: [7].into(),
                removed_uids: [3].into(),
                revised_uid_state: BTreeMap::new(),
            },
        };
        let raw = serde_json::to_string(&spec).unwrap();
        let back: TaskSpec = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn refresh_and_conv_share_the_sync_resource() {
        let refresh = TaskSpec::SyncRefresh {
            account_id: "a1".into(),
            folder_id: None,
        };
        let conv = TaskSpec::SyncConv {
            account_id: "a1".into(),
            conv_id: "c1".into(),
            work: ConvWork::NewConv,
        };
        assert_eq!(refresh.exclusive_resources(), conv.exclusive_resources());
    }

    #[test]
    fn label_delta_remove_cancels_add() {
        let mut delta = LabelDelta::default();
        delta.merge(&["\\Starred".to_string()].into(), &BTreeSet::new());
        delta.merge(&BTreeSet::new(), &["\\Starred".to_string()].into());
        assert!(delta.add.is_empty());
        assert!(delta.remove.contains("\\Starred"));
    }
}
