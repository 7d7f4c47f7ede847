//! `sync_grow`: first-sync bootstrap. Searches the folder for messages
//! inside the date window, classifies every hit against a fresh state, and
//! seeds the account's sync baseline.

use anyhow::{Context, Result};
use tracing::info;

use crate::storage::{Mutations, NewData, Selectors};
use crate::sync::chew;
use crate::sync::state::{SyncReason, SyncStateHelper};
use crate::task::context::TaskContext;
use crate::task::FinishData;
use crate::transport::{ListOptions, SearchOptions, SearchSpec, UidSelector, REFRESH_FETCH_FIELDS};
use crate::types::{AccountId, FolderId, RawSyncState};

pub async fn execute(
    ctx: &mut TaskContext,
    account_id: &AccountId,
    folder_id: &FolderId,
) -> Result<()> {
    let loaded = ctx.begin_mutate(&Selectors::sync_state(account_id)).await?;
    let existing = loaded.sync_states.get(account_id).cloned().flatten();

    // A refresh already established state while we were queued; we're moot.
    if existing.is_some() {
        return ctx.finish_task(FinishData::default()).await;
    }

    let account = ctx.acquire_account(account_id).await?;

    let uids = account
        .transport
        .search(
            folder_id,
            &SearchSpec {
                thread_id: None,
                since_ts: Some(ctx.defaults().cutoff_ts()),
            },
            SearchOptions { by_uid: true },
        )
        .await
        .context("searching bootstrap window")?;

    let list = account
        .transport
        .list_messages(
            folder_id,
            &UidSelector::Uids(uids),
            REFRESH_FETCH_FIELDS,
            ListOptions {
                by_uid: true,
                changed_since: None,
            },
        )
        .await
        .context("listing bootstrap messages")?;

    let mut sync_state = SyncStateHelper::new(
        RawSyncState::default(),
        account_id.clone(),
        ctx.defaults().clone(),
        SyncReason::Grow,
    );
    for msg in &list.messages {
        let meta = chew::message_meta(msg, &account.labels);
        sync_state.classify(&meta);
    }
    sync_state.set_cursor(list.mailbox.uid_next, list.mailbox.highest_modseq);
    sync_state.finalize_pending_removals();
    let tasks = sync_state.drain_tasks();

    info!(
        account = %account_id,
        folder = %folder_id,
        seeded = list.messages.len(),
        byproducts = tasks.len(),
        "bootstrap sync state established"
    );

    let mut mutations = Mutations::default();
    mutations
        .sync_states
        .insert(account_id.clone(), Some(sync_state.into_raw()));

    ctx.finish_task(FinishData {
        mutations,
        new_data: NewData {
            tasks,
            ..Default::default()
        },
        ..Default::default()
    })
    .await
}
