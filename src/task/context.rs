//! Per-invocation task handle: binds one task (or marker) to the storage
//! collaborator, tracked resource acquisition, and the owning manager.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::churn::ConversationChurn;
use crate::config::SyncDefaults;
use crate::errors::TaskError;
use crate::storage::{Database, Loaded, Selectors, TaskBookkeeping};
use crate::sync::AccountHandle;
use crate::task::manager::ManagerShared;
use crate::task::{Consult, ConsultReply, FinishData, MarkerKey, TaskId, TaskState, WrappedTask};
use crate::types::AccountId;

/// A scoped resource the context tracks: acquired up front, released
/// unconditionally at teardown whether the task succeeded or not.
#[async_trait]
pub trait Acquireable: Send + Sync {
    async fn acquire(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
    fn describe(&self) -> String;
}

/// Linear invocation state machine; no backtracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CtxState {
    Prep,
    Mutate,
    Finishing,
}

impl CtxState {
    fn name(self) -> &'static str {
        match self {
            CtxState::Prep => "prep",
            CtxState::Mutate => "mutate",
            CtxState::Finishing => "finishing",
        }
    }
}

/// What this invocation is bound to: a durable task row, or a coalesced
/// complex-task marker (which has identity but no row).
#[derive(Clone, Debug)]
pub enum Binding {
    Task(WrappedTask),
    Marker(MarkerKey),
}

pub struct TaskContext {
    id: TaskId,
    binding: Binding,
    db: Arc<Database>,
    /// Non-owning handle back to the manager; the manager never holds the
    /// context, so there is no cycle to break.
    mgr: Arc<ManagerShared>,
    state: CtxState,
    stuff_to_release: Vec<Arc<dyn Acquireable>>,
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        binding: Binding,
        db: Arc<Database>,
        mgr: Arc<ManagerShared>,
    ) -> Self {
        Self {
            id,
            binding,
            db,
            mgr,
            state: CtxState::Prep,
            stuff_to_release: Vec::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn defaults(&self) -> &SyncDefaults {
        self.mgr.defaults()
    }

    pub fn churn(&self) -> &dyn ConversationChurn {
        self.mgr.churn()
    }

    /// Non-exclusive read of named entities; valid while still in prep.
    pub async fn read(&self, selectors: &Selectors) -> Result<Loaded> {
        if self.state != CtxState::Prep {
            return Err(TaskError::InvalidStateTransition {
                current: self.state.name(),
                wanted: "prep",
            }
            .into());
        }
        self.db.read(selectors).await
    }

    /// Exclusively load current state of the named entities for a later
    /// atomic update. Calling this outside prep is a caller bug and fatal
    /// to the task.
    pub async fn begin_mutate(&mut self, selectors: &Selectors) -> Result<Loaded> {
        if self.state != CtxState::Prep {
            return Err(TaskError::InvalidStateTransition {
                current: self.state.name(),
                wanted: "mutate",
            }
            .into());
        }
        self.state = CtxState::Mutate;
        self.db.begin_mutate(self.id, selectors).await
    }

    /// Track and acquire a scoped resource. Everything acquired here is
    /// released at teardown, success or failure.
    pub async fn acquire(&mut self, resource: Arc<dyn Acquireable>) -> Result<()> {
        self.stuff_to_release.push(resource.clone());
        resource.acquire().await
    }

    /// Look up and acquire the account handle registered with the manager.
    pub async fn acquire_account(&mut self, account_id: &AccountId) -> Result<Arc<AccountHandle>> {
        let handle = self.mgr.account(account_id)?;
        self.acquire(handle.clone()).await?;
        Ok(handle)
    }

    /// Synchronous cross-task query: ask a complex task about state it has
    /// queued but not yet applied. Answers from memory only — by contract
    /// there is no I/O behind this call.
    pub fn consult_other_task(&self, consult: &Consult) -> ConsultReply {
        match consult {
            Consult::PendingLabels {
                account_id,
                conv_id,
            } => ConsultReply::PendingLabels(self.mgr.pending_labels(account_id, conv_id)),
        }
    }

    /// Merge a label request into this marker's pending delta. Only
    /// meaningful from a complex task's planning step.
    pub fn merge_marker(
        &self,
        key: &MarkerKey,
        add: &std::collections::BTreeSet<String>,
        remove: &std::collections::BTreeSet<String>,
    ) {
        self.mgr.merge_marker(key, add, remove);
    }

    /// Terminal call: commit the mutation set, new records, byproduct task
    /// rows, and this task's own revised state as one atomic unit, then
    /// hand byproducts and markers back to the manager.
    pub async fn finish_task(&mut self, finish: FinishData) -> Result<()> {
        if self.state == CtxState::Finishing {
            return Err(TaskError::InvalidStateTransition {
                current: self.state.name(),
                wanted: "finishing",
            }
            .into());
        }
        self.state = CtxState::Finishing;

        let revised_task = match &self.binding {
            Binding::Task(task) => {
                if let Some(planned) = &finish.task_state {
                    // Still planned, either because this was the planning
                    // stage or because execution re-armed itself.
                    let mut revised = task.clone();
                    revised.state = TaskState::Planned;
                    revised.planned = Some(planned.clone());
                    Some((task.id, Some(revised)))
                } else {
                    Some((task.id, None))
                }
            }
            // Markers have no row to revise.
            Binding::Marker(_) => None,
        };

        let wrapped_tasks = self.mgr.wrap_tasks(&finish.new_data.tasks);
        let bookkeeping = TaskBookkeeping {
            revised_task: revised_task.clone(),
            wrapped_tasks: wrapped_tasks.clone(),
        };

        self.db
            .finish_mutate(&finish.mutations, &finish.new_data, &bookkeeping)
            .await?;

        // Only after the commit does anything become schedulable.
        if let Some((_, Some(revised))) = revised_task {
            self.mgr.prioritize_task(revised);
        } else if let Binding::Task(task) = &self.binding {
            self.mgr.conclude_task(task.id);
        }
        self.mgr.enqueue_persisted_for_planning(wrapped_tasks);
        for key in &finish.task_markers {
            self.mgr.prioritize_marker(key);
        }
        Ok(())
    }

    /// Best-effort release of everything acquired; failures are logged and
    /// suppressed so they can never mask the task's primary outcome.
    pub(crate) fn teardown(&mut self) {
        for resource in self.stuff_to_release.drain(..) {
            if let Err(err) = resource.release() {
                warn!(task = self.id, what = %resource.describe(), error = %err, "problem releasing");
            }
        }
        self.db.release_locks(self.id);
    }
}
