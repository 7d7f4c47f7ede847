//! Durable task/marker queue: plans freshly enqueued tasks, serializes
//! execution within exclusive-resource domains, and prefers work relevant
//! to the currently focused views.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::churn::ConversationChurn;
use crate::config::SyncDefaults;
use crate::errors::TaskError;
use crate::storage::Database;
use crate::sync::AccountHandle;
use crate::task::context::{Binding, TaskContext};
use crate::task::{LabelDelta, MarkerKey, TaskId, TaskSpec, TaskState, WrappedTask};
use crate::types::AccountId;

/// The plan/execute entry points the manager drives. The default
/// implementation is [`crate::sync::tasks::SyncExecutor`]; tests substitute
/// instrumented ones.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Planning step for a freshly enqueued task. Must end in
    /// `finish_task`: re-arming as planned, merging into a marker, or
    /// concluding as moot.
    async fn plan(&self, ctx: &mut TaskContext, spec: &TaskSpec) -> Result<()>;

    /// Execution step for a planned task, running its planned payload.
    async fn execute(&self, ctx: &mut TaskContext, planned: &TaskSpec) -> Result<()>;

    /// Execution step for a coalesced complex-task marker.
    async fn execute_marker(
        &self,
        ctx: &mut TaskContext,
        key: &MarkerKey,
        delta: LabelDelta,
    ) -> Result<()>;
}

#[derive(Clone, Debug)]
enum Work {
    Task(TaskId),
    Marker(MarkerKey),
}

#[derive(Clone, Debug)]
struct QueueEntry {
    work: Work,
    resources: Vec<String>,
    priority_tags: Vec<String>,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    arena: HashMap<TaskId, WrappedTask>,
    queue: VecDeque<QueueEntry>,
    markers: HashMap<MarkerKey, LabelDelta>,
    queued_markers: HashSet<MarkerKey>,
    /// Exclusive-resource tags held by currently running work.
    held: HashSet<String>,
    focused_tags: HashSet<String>,
    seq: u64,
}

pub struct ManagerShared {
    db: Arc<Database>,
    defaults: SyncDefaults,
    churn: Arc<dyn ConversationChurn>,
    accounts: StdMutex<HashMap<AccountId, Arc<AccountHandle>>>,
    state: StdMutex<QueueState>,
    next_id: AtomicI64,
}

impl ManagerShared {
    pub(crate) fn defaults(&self) -> &SyncDefaults {
        &self.defaults
    }

    pub(crate) fn churn(&self) -> &dyn ConversationChurn {
        self.churn.as_ref()
    }

    pub(crate) fn account(&self, account_id: &AccountId) -> Result<Arc<AccountHandle>> {
        self.accounts
            .lock()
            .unwrap()
            .get(account_id)
            .cloned()
            .with_context(|| format!("no account handle registered for {account_id}"))
    }

    fn next_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Assign ids and wrap raw byproduct specs into unplanned task records.
    pub(crate) fn wrap_tasks(&self, specs: &[TaskSpec]) -> Vec<WrappedTask> {
        specs
            .iter()
            .map(|spec| WrappedTask::new(self.next_id(), spec.clone()))
            .collect()
    }

    /// A task finished still-planned: put the revised record back in the
    /// arena and queue it for execution.
    pub(crate) fn prioritize_task(&self, task: WrappedTask) {
        let mut state = self.state.lock().unwrap();
        let entry = QueueEntry {
            work: Work::Task(task.id),
            resources: task.spec.exclusive_resources(),
            priority_tags: task.spec.priority_tags(),
            seq: bump_seq(&mut state),
        };
        state.arena.insert(task.id, task);
        state.queue.push_back(entry);
    }

    /// Terminal completion: the row is gone, drop the arena entry.
    pub(crate) fn conclude_task(&self, task_id: TaskId) {
        let mut state = self.state.lock().unwrap();
        state.arena.remove(&task_id);
    }

    /// Byproducts were durably persisted as part of their parent's commit;
    /// now hand them to planning.
    pub(crate) fn enqueue_persisted_for_planning(&self, tasks: Vec<WrappedTask>) {
        if tasks.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        for task in tasks {
            let entry = QueueEntry {
                work: Work::Task(task.id),
                resources: task.spec.exclusive_resources(),
                priority_tags: task.spec.priority_tags(),
                seq: bump_seq(&mut state),
            };
            debug!(task = task.id, spec = ?task.spec, "byproduct task queued for planning");
            state.arena.insert(task.id, task);
            state.queue.push_back(entry);
        }
    }

    pub(crate) fn merge_marker(
        &self,
        key: &MarkerKey,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) {
        let mut state = self.state.lock().unwrap();
        state
            .markers
            .entry(key.clone())
            .or_default()
            .merge(add, remove);
    }

    /// Re-prioritize a marker: make sure exactly one queue entry exists for
    /// it while its pending delta is non-empty.
    pub(crate) fn prioritize_marker(&self, key: &MarkerKey) {
        let mut state = self.state.lock().unwrap();
        let pending = state
            .markers
            .get(key)
            .map(|d| !d.is_empty())
            .unwrap_or(false);
        if !pending || state.queued_markers.contains(key) {
            return;
        }
        let entry = QueueEntry {
            work: Work::Marker(key.clone()),
            resources: vec![format!("labels:{}:{}", key.account_id, key.conv_id)],
            priority_tags: vec![format!("view:conv:{}", key.conv_id)],
            seq: bump_seq(&mut state),
        };
        state.queued_markers.insert(key.clone());
        state.queue.push_back(entry);
    }

    pub(crate) fn pending_labels(
        &self,
        account_id: &AccountId,
        conv_id: &str,
    ) -> Option<LabelDelta> {
        let state = self.state.lock().unwrap();
        let key = MarkerKey {
            name: "store_labels",
            account_id: account_id.clone(),
            conv_id: conv_id.to_string(),
        };
        state.markers.get(&key).filter(|d| !d.is_empty()).cloned()
    }

    /// Pick the next runnable entry: skip anything whose resource set
    /// intersects the held set, prefer entries with a focused priority tag,
    /// FIFO within a tier. Taking an entry holds its resources.
    fn take_runnable(&self) -> Option<QueueEntry> {
        let mut state = self.state.lock().unwrap();
        let mut best: Option<(bool, u64, usize)> = None;
        for (idx, entry) in state.queue.iter().enumerate() {
            if entry.resources.iter().any(|r| state.held.contains(r)) {
                continue;
            }
            let relevant = entry
                .priority_tags
                .iter()
                .any(|t| state.focused_tags.contains(t));
            let candidate = (relevant, entry.seq, idx);
            let better = match best {
                None => true,
                Some((best_rel, best_seq, _)) => {
                    (relevant && !best_rel) || (relevant == best_rel && entry.seq < best_seq)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        let (_, _, idx) = best?;
        let entry = state.queue.remove(idx).unwrap();
        for resource in &entry.resources {
            state.held.insert(resource.clone());
        }
        if let Work::Marker(key) = &entry.work {
            state.queued_markers.remove(key);
        }
        Some(entry)
    }

    fn release_resources(&self, resources: &[String]) {
        let mut state = self.state.lock().unwrap();
        for resource in resources {
            state.held.remove(resource);
        }
    }

    fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    async fn run_one(self: Arc<Self>, executor: Arc<dyn TaskExecutor>, entry: QueueEntry) {
        let outcome = match &entry.work {
            Work::Task(task_id) => self.clone().run_task(executor, *task_id).await,
            Work::Marker(key) => self.clone().run_marker(executor, key).await,
        };
        self.release_resources(&entry.resources);
        if let Err(err) = outcome {
            warn!(error = ?err, work = ?entry.work, "task failed");
        }
    }

    async fn run_task(
        self: Arc<Self>,
        executor: Arc<dyn TaskExecutor>,
        task_id: TaskId,
    ) -> Result<()> {
        let task = {
            let state = self.state.lock().unwrap();
            state
                .arena
                .get(&task_id)
                .cloned()
                .ok_or(TaskError::UnknownTask(task_id))?
        };

        let mut ctx = TaskContext::new(
            task.id,
            Binding::Task(task.clone()),
            self.db.clone(),
            self.clone(),
        );
        let result = match task.state {
            TaskState::NeedsPlanning => executor.plan(&mut ctx, &task.spec).await,
            TaskState::Planned => {
                let planned = task.planned.clone().unwrap_or_else(|| task.spec.clone());
                executor.execute(&mut ctx, &planned).await
            }
        };
        ctx.teardown();
        result
    }

    async fn run_marker(
        self: Arc<Self>,
        executor: Arc<dyn TaskExecutor>,
        key: &MarkerKey,
    ) -> Result<()> {
        // Take the pending delta; requests arriving from here on open a
        // fresh marker and re-queue.
        let delta = {
            let mut state = self.state.lock().unwrap();
            state.markers.remove(key)
        };
        let Some(delta) = delta.filter(|d| !d.is_empty()) else {
            return Ok(());
        };

        let mut ctx = TaskContext::new(
            self.next_id(),
            Binding::Marker(key.clone()),
            self.db.clone(),
            self.clone(),
        );
        let result = executor.execute_marker(&mut ctx, key, delta).await;
        ctx.teardown();
        result
    }
}

fn bump_seq(state: &mut QueueState) -> u64 {
    state.seq += 1;
    state.seq
}

/// Public face of the pipeline. Owns shared queue state by `Arc`; contexts
/// hold the same shared state as a handle, not the manager itself.
pub struct TaskManager {
    shared: Arc<ManagerShared>,
    executor: Arc<dyn TaskExecutor>,
}

impl TaskManager {
    pub fn new(
        db: Arc<Database>,
        defaults: SyncDefaults,
        churn: Arc<dyn ConversationChurn>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                db,
                defaults,
                churn,
                accounts: StdMutex::new(HashMap::new()),
                state: StdMutex::new(QueueState::default()),
                next_id: AtomicI64::new(0),
            }),
            executor,
        }
    }

    pub fn register_account(&self, handle: Arc<AccountHandle>) {
        self.shared
            .accounts
            .lock()
            .unwrap()
            .insert(handle.account_id.clone(), handle);
    }

    /// Mark which views the user is looking at; queued work tagged for
    /// those views runs ahead of the rest of its resource domain.
    pub fn set_focused_tags(&self, tags: Vec<String>) {
        let mut state = self.shared.state.lock().unwrap();
        state.focused_tags = tags.into_iter().collect();
    }

    /// Rebuild the arena and queue from the persistent task table. Call
    /// once at startup, before scheduling anything new.
    pub async fn restore(&self) -> Result<()> {
        let tasks = self.shared.db.load_tasks().await?;
        let max_id = self.shared.db.max_task_id().await?;
        self.shared.next_id.fetch_max(max_id, Ordering::SeqCst);

        let count = tasks.len();
        let mut state = self.shared.state.lock().unwrap();
        for task in tasks {
            let entry = QueueEntry {
                work: Work::Task(task.id),
                resources: task.spec.exclusive_resources(),
                priority_tags: task.spec.priority_tags(),
                seq: bump_seq(&mut state),
            };
            state.arena.insert(task.id, task);
            state.queue.push_back(entry);
        }
        drop(state);
        if count > 0 {
            info!(count, "restored persisted tasks");
        }
        Ok(())
    }

    /// Durably enqueue a new task: persist the unplanned row, then queue it
    /// for planning.
    pub async fn schedule(&self, spec: TaskSpec) -> Result<TaskId> {
        let task = WrappedTask::new(self.shared.next_id(), spec);
        self.shared.db.insert_task(&task).await?;
        let id = task.id;
        self.shared.enqueue_persisted_for_planning(vec![task]);
        Ok(id)
    }

    /// Pending coalesced label delta for a conversation, if any — the same
    /// view `consult_other_task` answers from.
    pub fn pending_labels(&self, account_id: &AccountId, conv_id: &str) -> Option<LabelDelta> {
        self.shared.pending_labels(account_id, conv_id)
    }

    /// Drive the pipeline until the queue drains and every spawned task has
    /// completed. Work in disjoint resource domains runs concurrently;
    /// intersecting domains serialize.
    pub async fn run_until_idle(&self) -> Result<()> {
        let mut running: JoinSet<()> = JoinSet::new();
        loop {
            while let Some(entry) = self.shared.take_runnable() {
                let shared = self.shared.clone();
                let executor = self.executor.clone();
                running.spawn(async move {
                    shared.run_one(executor, entry).await;
                });
            }
            if running.is_empty() {
                if self.shared.queue_len() == 0 {
                    return Ok(());
                }
                // Queue non-empty with nothing running means a resource was
                // leaked; surface it rather than spin.
                anyhow::bail!("task queue stalled with no running work");
            }
            if let Some(joined) = running.join_next().await {
                if let Err(err) = joined {
                    warn!(error = %err, "task panicked");
                }
            }
        }
    }
}
