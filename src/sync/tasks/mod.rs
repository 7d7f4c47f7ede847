//! Concrete task definitions and the executor that dispatches them.

pub mod conv;
pub mod grow;
pub mod refresh;
pub mod store_labels;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::sync::chew;
use crate::sync::AccountHandle;
use crate::task::context::TaskContext;
use crate::task::manager::TaskExecutor;
use crate::task::{FinishData, LabelDelta, MarkerKey, TaskSpec};
use crate::transport::{ListOptions, UidSelector, CONV_FETCH_FIELDS};
use crate::types::{BodyInfo, HeaderInfo, Uid};

/// Routes the closed set of task kinds to their plan/execute logic.
pub struct SyncExecutor;

#[async_trait]
impl TaskExecutor for SyncExecutor {
    async fn plan(&self, ctx: &mut TaskContext, spec: &TaskSpec) -> Result<()> {
        match spec {
            // Complex: fold the request into its marker instead of keeping
            // a row per request.
            TaskSpec::StoreLabels { .. } => store_labels::plan(ctx, spec).await,
            // Simple: the planned payload is the spec itself.
            _ => {
                ctx.finish_task(FinishData {
                    task_state: Some(spec.clone()),
                    ..Default::default()
                })
                .await
            }
        }
    }

    async fn execute(&self, ctx: &mut TaskContext, planned: &TaskSpec) -> Result<()> {
        match planned {
            TaskSpec::SyncRefresh {
                account_id,
                folder_id,
            } => refresh::execute(ctx, account_id, folder_id.as_ref()).await,
            TaskSpec::SyncGrow {
                account_id,
                folder_id,
            } => grow::execute(ctx, account_id, folder_id).await,
            TaskSpec::SyncConv {
                account_id,
                conv_id,
                work,
            } => conv::execute(ctx, account_id, conv_id, work).await,
            TaskSpec::StoreLabels { .. } => {
                anyhow::bail!("store_labels runs as a marker, never as a planned row")
            }
        }
    }

    async fn execute_marker(
        &self,
        ctx: &mut TaskContext,
        key: &MarkerKey,
        delta: LabelDelta,
    ) -> Result<()> {
        match key.name {
            "store_labels" => store_labels::execute(ctx, key, delta).await,
            other => anyhow::bail!("unknown marker kind {other}"),
        }
    }
}

/// Shared fetch-and-chew step: pull full envelopes for a uid set from the
/// all-mail folder and project them into header/body records.
pub(crate) async fn fetch_and_chew_uids(
    account: &AccountHandle,
    uids: &[Uid],
) -> Result<(Vec<HeaderInfo>, Vec<BodyInfo>)> {
    if uids.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let list = account
        .transport
        .list_messages(
            &account.all_mail_folder,
            &UidSelector::Uids(uids.to_vec()),
            CONV_FETCH_FIELDS,
            ListOptions {
                by_uid: true,
                changed_since: None,
            },
        )
        .await
        .context("fetching envelopes")?;

    let mut headers = Vec::with_capacity(list.messages.len());
    let mut bodies = Vec::with_capacity(list.messages.len());
    for msg in &list.messages {
        let (header, body) = chew::chew_header_and_body(
            &account.account_id,
            &account.all_mail_folder,
            msg,
            &account.labels,
        );
        headers.push(header);
        bodies.push(body);
    }
    Ok((headers, bodies))
}
