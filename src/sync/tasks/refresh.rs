//! `sync_refresh`: the steady-state task driving all Gmail sync. Pulls the
//! folder's flag/label/thread-id delta since the stored modseq, classifies
//! every changed uid, and commits the revised sync state together with the
//! conversation byproduct tasks that fell out.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::storage::{Mutations, NewData, Selectors};
use crate::sync::chew;
use crate::sync::state::{SyncReason, SyncStateHelper};
use crate::task::context::TaskContext;
use crate::task::{FinishData, TaskSpec};
use crate::transport::{ListOptions, UidSelector, REFRESH_FETCH_FIELDS};
use crate::types::{AccountId, FolderId};

pub async fn execute(
    ctx: &mut TaskContext,
    account_id: &AccountId,
    folder_id: Option<&FolderId>,
) -> Result<()> {
    // Exclusively acquire the account's sync state.
    let loaded = ctx.begin_mutate(&Selectors::sync_state(account_id)).await?;
    let raw = loaded
        .sync_states
        .get(account_id)
        .cloned()
        .flatten();

    let account = ctx.acquire_account(account_id).await?;

    // No baseline yet: first-sync is a different task type. Conclude this
    // one and spin off the bootstrap as a durable byproduct.
    let Some(raw) = raw else {
        let grow_folder = folder_id.cloned().unwrap_or_else(|| account.inbox_folder.clone());
        info!(account = %account_id, folder = %grow_folder, "no sync state; spinning off sync_grow");
        return ctx
            .finish_task(FinishData {
                new_data: NewData {
                    tasks: vec![TaskSpec::SyncGrow {
                        account_id: account_id.clone(),
                        folder_id: grow_folder,
                    }],
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;
    };

    let mut sync_state = SyncStateHelper::new(
        raw,
        account_id.clone(),
        ctx.defaults().clone(),
        SyncReason::Refresh,
    );

    let folder = folder_id
        .cloned()
        .unwrap_or_else(|| account.all_mail_folder.clone());
    let list = account
        .transport
        .list_messages(
            &folder,
            &UidSelector::All,
            REFRESH_FETCH_FIELDS,
            ListOptions {
                by_uid: true,
                changed_since: Some(sync_state.modseq()),
            },
        )
        .await
        .context("listing changed messages")?;

    debug!(
        account = %account_id,
        folder = %folder,
        changed = list.messages.len(),
        since_modseq = sync_state.modseq(),
        "incremental listing complete"
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
        folder = %folder,
        changed = list.messages.len(),
        byproducts = tasks.len(),
        "refresh classified"
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
