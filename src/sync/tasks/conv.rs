//! `sync_conv`: conversation-level reconciliation. One task type, three
//! modes — backfill a newly-interesting conversation, delete one that left
//! the sync window, or apply a refresh's per-uid delta.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::storage::{Mutations, NewData, Selectors};
use crate::sync::state::{SyncReason, SyncStateHelper};
use crate::sync::tasks::fetch_and_chew_uids;
use crate::task::context::TaskContext;
use crate::task::{Consult, ConsultReply, ConvWork, FinishData, LabelDelta};
use crate::transport::{SearchOptions, SearchSpec};
use crate::types::{conversation_message_cmp, AccountId, ConvId, Uid, UidState};

pub async fn execute(
    ctx: &mut TaskContext,
    account_id: &AccountId,
    conv_id: &ConvId,
    work: &ConvWork,
) -> Result<()> {
    match work {
        ConvWork::NewConv => exec_new_conv(ctx, account_id, conv_id).await,
        ConvWork::DelConv => exec_del_conv(ctx, conv_id).await,
        ConvWork::Modify {
            new_uids,
            removed_uids,
            revised_uid_state,
        } => {
            exec_modify_conv(
                ctx,
                account_id,
                conv_id,
                new_uids,
                removed_uids,
                revised_uid_state,
            )
            .await
        }
    }
}

/// Backfill: a refresh saw the conversation's first yay message; pull the
/// whole thread, record the rest of its uids as meh, and create the local
/// conversation with its full header set.
async fn exec_new_conv(
    ctx: &mut TaskContext,
    account_id: &AccountId,
    conv_id: &ConvId,
) -> Result<()> {
    let selectors = Selectors {
        sync_states: vec![account_id.clone()],
        conversations: vec![conv_id.clone()],
        ..Default::default()
    };
    let loaded = ctx.begin_mutate(&selectors).await?;

    // Already materialized by an earlier run; nothing left to do.
    if matches!(loaded.conversations.get(conv_id), Some(Some(_))) {
        debug!(conv = %conv_id, "conversation already exists, moot");
        return ctx.finish_task(FinishData::default()).await;
    }

    let raw = loaded
        .sync_states
        .get(account_id)
        .cloned()
        .flatten()
        .unwrap_or_default();
    let mut sync_state = SyncStateHelper::new(
        raw,
        account_id.clone(),
        ctx.defaults().clone(),
        SyncReason::Conv,
    );

    let account = ctx.acquire_account(account_id).await?;

    let uids = account
        .transport
        .search(
            &account.all_mail_folder,
            &SearchSpec {
                thread_id: Some(conv_id.clone()),
                since_ts: None,
            },
            SearchOptions { by_uid: true },
        )
        .await
        .context("searching conversation thread")?;

    // Thread members the refresh never saw get tracked as meh so a later
    // refresh doesn't mistake them for novel messages.
    for &uid in &uids {
        if !sync_state.is_yay(uid) && !sync_state.is_meh(uid) {
            sync_state.note_meh_uid(uid, conv_id);
        }
    }

    let (mut headers, bodies) = fetch_and_chew_uids(&account, &uids).await?;
    headers.sort_by(conversation_message_cmp);
    let summary = ctx.churn().churn(account_id, conv_id, None, &headers);

    let mut mutations = Mutations::default();
    mutations
        .sync_states
        .insert(account_id.clone(), Some(sync_state.into_raw()));

    ctx.finish_task(FinishData {
        mutations,
        new_data: NewData {
            conversations: vec![summary],
            headers,
            bodies,
            ..Default::default()
        },
        ..Default::default()
    })
    .await
}

/// Removal: every yay message left the window; drop the conversation and
/// let storage cascade to its headers and bodies.
async fn exec_del_conv(ctx: &mut TaskContext, conv_id: &ConvId) -> Result<()> {
    ctx.begin_mutate(&Selectors::conversation(conv_id)).await?;

    let mut mutations = Mutations::default();
    mutations.conversations.insert(conv_id.clone(), None);

    ctx.finish_task(FinishData {
        mutations,
        ..Default::default()
    })
    .await
}

/// Delta application: drop removed uids, rewrite revised flag/label state,
/// fetch-and-chew genuinely new uids, and recompute the summary from the
/// resulting header set.
async fn exec_modify_conv(
    ctx: &mut TaskContext,
    account_id: &AccountId,
    conv_id: &ConvId,
    new_uids: &BTreeSet<Uid>,
    removed_uids: &BTreeSet<Uid>,
    revised_uid_state: &BTreeMap<Uid, UidState>,
) -> Result<()> {
    let account = ctx.acquire_account(account_id).await?;

    let loaded = ctx
        .begin_mutate(&Selectors::conversation_with_headers(conv_id))
        .await?;
    let old = loaded.conversations.get(conv_id).cloned().flatten();
    if old.is_none() {
        warn!(conv = %conv_id, "modify for a conversation we never stored");
    }
    let existing = loaded
        .headers_by_conversation
        .get(conv_id)
        .cloned()
        .unwrap_or_default();

    // Label intent queued offline but not yet applied wins over whatever
    // the server reported for the raced uids.
    let ConsultReply::PendingLabels(pending) = ctx.consult_other_task(&Consult::PendingLabels {
        account_id: account_id.clone(),
        conv_id: conv_id.clone(),
    });
    let pending = pending.unwrap_or_else(LabelDelta::default);

    let mut mutations = Mutations::default();
    let mut headers = Vec::with_capacity(existing.len() + new_uids.len());
    for mut header in existing {
        if removed_uids.contains(&header.uid) {
            mutations.headers.insert(header.id.clone(), None);
            continue;
        }
        if let Some(state) = revised_uid_state.get(&header.uid) {
            header.flags = state.flags.clone();
            header.label_folder_ids = state.label_folder_ids.clone();
            pending.apply_to(&mut header.label_folder_ids);
            mutations
                .headers
                .insert(header.id.clone(), Some(header.clone()));
        }
        headers.push(header);
    }

    let fetch_uids: Vec<Uid> = new_uids.iter().copied().collect();
    let (mut new_headers, bodies) = fetch_and_chew_uids(&account, &fetch_uids).await?;
    for header in &mut new_headers {
        pending.apply_to(&mut header.label_folder_ids);
    }
    headers.extend(new_headers.iter().cloned());
    headers.sort_by(conversation_message_cmp);

    if headers.is_empty() {
        // Everything is gone; delete instead of writing an empty summary.
        let mut mutations = Mutations::default();
        mutations.conversations.insert(conv_id.clone(), None);
        return ctx
            .finish_task(FinishData {
                mutations,
                ..Default::default()
            })
            .await;
    }

    let summary = ctx
        .churn()
        .churn(account_id, conv_id, old.as_ref(), &headers);
    mutations.conversations.insert(conv_id.clone(), Some(summary));

    ctx.finish_task(FinishData {
        mutations,
        new_data: NewData {
            headers: new_headers,
            bodies,
            ..Default::default()
        },
        ..Default::default()
    })
    .await
}
