//! `store_labels`: offline label mutation, the one complex task. Requests
//! coalesce into a per-conversation marker at planning time; the marker
//! executes once with the net delta.

use anyhow::Result;
use tracing::warn;

use crate::storage::{Mutations, Selectors};
use crate::task::context::TaskContext;
use crate::task::{FinishData, LabelDelta, MarkerKey, TaskSpec};

/// Planning folds the request into the marker's pending delta and deletes
/// the request's own row; the pending delta lives in the manager's memory
/// until the marker runs.
pub async fn plan(ctx: &mut TaskContext, spec: &TaskSpec) -> Result<()> {
    let TaskSpec::StoreLabels { add, remove, .. } = spec else {
        anyhow::bail!("store_labels planner handed a different task kind");
    };
    let key = spec
        .marker_key()
        .ok_or_else(|| anyhow::anyhow!("store_labels spec without a marker key"))?;

    ctx.merge_marker(&key, add, remove);

    ctx.finish_task(FinishData {
        task_markers: vec![key],
        ..Default::default()
    })
    .await
}

/// Marker execution: apply the accumulated delta to every header of the
/// conversation and recompute the summary. The delta was taken out of the
/// marker map when this run started, so requests arriving mid-run open a
/// fresh marker and queue behind us.
pub async fn execute(ctx: &mut TaskContext, key: &MarkerKey, delta: LabelDelta) -> Result<()> {
    if delta.is_empty() {
        return ctx.finish_task(FinishData::default()).await;
    }

    let loaded = ctx
        .begin_mutate(&Selectors::conversation_with_headers(&key.conv_id))
        .await?;
    let Some(old) = loaded.conversations.get(&key.conv_id).cloned().flatten() else {
        // The conversation left local storage between request and run.
        warn!(conv = %key.conv_id, "label delta for a conversation we no longer store");
        return ctx.finish_task(FinishData::default()).await;
    };
    let mut headers = loaded
        .headers_by_conversation
        .get(&key.conv_id)
        .cloned()
        .unwrap_or_default();

    let mut mutations = Mutations::default();
    for header in &mut headers {
        let before = header.label_folder_ids.clone();
        delta.apply_to(&mut header.label_folder_ids);
        if header.label_folder_ids != before {
            mutations
                .headers
                .insert(header.id.clone(), Some(header.clone()));
        }
    }

    let summary = ctx
        .churn()
        .churn(&key.account_id, &key.conv_id, Some(&old), &headers);
    mutations
        .conversations
        .insert(key.conv_id.clone(), Some(summary));

    ctx.finish_task(FinishData {
        mutations,
        ..Default::default()
    })
    .await
}
