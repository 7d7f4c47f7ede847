use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::TempDir;

use tern::churn::BasicChurn;
use tern::config::SyncDefaults;
use tern::storage::{Database, Mutations, NewData, Selectors, TaskBookkeeping};
use tern::task::context::TaskContext;
use tern::task::manager::{TaskExecutor, TaskManager};
use tern::task::{ConvWork, FinishData, LabelDelta, MarkerKey, TaskSpec};
use tern::types::{AccountId, ConversationInfo, HeaderInfo, RawSyncState};

fn defaults() -> SyncDefaults {
    SyncDefaults::with_cutoff(
        NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date"),
        vec!["INBOX".into()],
    )
}

fn work_label(spec: &TaskSpec) -> String {
    match spec {
        TaskSpec::SyncRefresh { account_id, .. } => format!("refresh:{account_id}"),
        TaskSpec::SyncGrow { account_id, .. } => format!("grow:{account_id}"),
        TaskSpec::SyncConv { conv_id, .. } => format!("conv:{conv_id}"),
        TaskSpec::StoreLabels { conv_id, .. } => format!("labels:{conv_id}"),
    }
}

/// Domain-free executor that records when each execution ran, with a sleep
/// in the middle so overlap would actually be observable.
struct ProbeExecutor {
    delay: Duration,
    executions: Arc<Mutex<Vec<(String, Instant, Instant)>>>,
}

#[async_trait]
impl TaskExecutor for ProbeExecutor {
    async fn plan(&self, ctx: &mut TaskContext, spec: &TaskSpec) -> Result<()> {
        ctx.finish_task(FinishData {
            task_state: Some(spec.clone()),
            ..Default::default()
        })
        .await
    }

    async fn execute(&self, ctx: &mut TaskContext, planned: &TaskSpec) -> Result<()> {
        let start = Instant::now();
        tokio::time::sleep(self.delay).await;
        let end = Instant::now();
        self.executions
            .lock()
            .unwrap()
            .push((work_label(planned), start, end));
        ctx.finish_task(FinishData::default()).await
    }

    async fn execute_marker(
        &self,
        _ctx: &mut TaskContext,
        _key: &MarkerKey,
        _delta: LabelDelta,
    ) -> Result<()> {
        Ok(())
    }
}

async fn probe_manager(
    dir: &TempDir,
    delay: Duration,
) -> (TaskManager, Arc<Mutex<Vec<(String, Instant, Instant)>>>) {
    let db = Arc::new(
        Database::open(&dir.path().join("tern.db"))
            .await
            .expect("open db"),
    );
    let executions = Arc::new(Mutex::new(Vec::new()));
    let manager = TaskManager::new(
        db,
        defaults(),
        Arc::new(BasicChurn),
        Arc::new(ProbeExecutor {
            delay,
            executions: executions.clone(),
        }),
    );
    (manager, executions)
}

fn refresh(account: &str) -> TaskSpec {
    TaskSpec::SyncRefresh {
        account_id: account.to_string(),
        folder_id: None,
    }
}

#[tokio::test]
async fn same_account_sync_tasks_never_overlap() {
    let dir = TempDir::new().expect("tempdir");
    let (manager, executions) = probe_manager(&dir, Duration::from_millis(25)).await;

    manager.schedule(refresh("a1")).await.expect("schedule");
    manager.schedule(refresh("a1")).await.expect("schedule");
    manager.schedule(refresh("a2")).await.expect("schedule");
    manager.run_until_idle().await.expect("run");

    let executions = executions.lock().unwrap();
    assert_eq!(executions.len(), 3);
    let windows: Vec<_> = executions
        .iter()
        .filter(|(label, _, _)| label == "refresh:a1")
        .collect();
    assert_eq!(windows.len(), 2);
    let (_, start_a, end_a) = windows[0];
    let (_, start_b, end_b) = windows[1];
    assert!(
        *end_a <= *start_b || *end_b <= *start_a,
        "executions in the same sync domain overlapped"
    );
}

#[tokio::test]
async fn focused_view_work_runs_ahead_of_its_domain() {
    let dir = TempDir::new().expect("tempdir");
    let (manager, executions) = probe_manager(&dir, Duration::from_millis(1)).await;

    for conv in ["c1", "c2", "c3"] {
        manager
            .schedule(TaskSpec::SyncConv {
                account_id: "a1".to_string(),
                conv_id: conv.to_string(),
                work: ConvWork::NewConv,
            })
            .await
            .expect("schedule");
    }
    manager.set_focused_tags(vec!["view:conv:c3".to_string()]);
    manager.run_until_idle().await.expect("run");

    let order: Vec<String> = executions
        .lock()
        .unwrap()
        .iter()
        .map(|(label, _, _)| label.clone())
        .collect();
    assert_eq!(order, vec!["conv:c3", "conv:c1", "conv:c2"]);
}

fn conv_info(conv_id: &str) -> ConversationInfo {
    ConversationInfo {
        conv_id: conv_id.to_string(),
        account_id: "a1".to_string(),
        subject: Some("subject".to_string()),
        participants: vec!["someone@example.com".to_string()],
        date_oldest_ts: 1_000,
        date_newest_ts: 2_000,
        message_count: 1,
        unread_count: 1,
        has_starred: false,
    }
}

fn header(id: &str, conv_id: &str, uid: u64) -> HeaderInfo {
    HeaderInfo {
        id: id.to_string(),
        conv_id: conv_id.to_string(),
        uid,
        date_ts: 1_000,
        author: Some("someone@example.com".to_string()),
        subject: Some("subject".to_string()),
        flags: vec![],
        label_folder_ids: vec!["INBOX".to_string()],
    }
}

fn state_with_high_uid(last_high_uid: u64) -> RawSyncState {
    RawSyncState {
        last_high_uid,
        ..Default::default()
    }
}

#[tokio::test]
async fn failed_commit_leaves_no_partial_writes() {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::open(&dir.path().join("tern.db"))
        .await
        .expect("open db");
    let acct: AccountId = "a1".to_string();

    let mut mutations = Mutations::default();
    mutations
        .sync_states
        .insert(acct.clone(), Some(state_with_high_uid(2)));
    let new_data = NewData {
        conversations: vec![conv_info("c1")],
        headers: vec![header("m1", "c1", 1)],
        ..Default::default()
    };
    db.finish_mutate(&mutations, &new_data, &TaskBookkeeping::default())
        .await
        .expect("baseline commit");

    // Second commit advances the cursor and adds a conversation, but also
    // re-registers header m1. The duplicate key must take the whole
    // transaction down with it.
    let mut mutations = Mutations::default();
    mutations
        .sync_states
        .insert(acct.clone(), Some(state_with_high_uid(5)));
    let new_data = NewData {
        conversations: vec![conv_info("c2")],
        headers: vec![header("m1", "c2", 2)],
        ..Default::default()
    };
    let result = db
        .finish_mutate(&mutations, &new_data, &TaskBookkeeping::default())
        .await;
    assert!(result.is_err());

    let raw = db
        .read(&Selectors::sync_state(&acct))
        .await
        .expect("read sync state")
        .sync_states
        .get(&acct)
        .cloned()
        .flatten()
        .expect("sync state exists");
    assert_eq!(raw.last_high_uid, 2, "cursor advanced despite the abort");
    assert!(db
        .load_conversation(&"c2".to_string())
        .await
        .expect("load conversation")
        .is_none());
}
