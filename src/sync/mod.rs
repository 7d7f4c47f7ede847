//! Gmail-flavored incremental sync built on the task pipeline.

pub mod chew;
pub mod state;
pub mod tasks;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::task::context::Acquireable;
use crate::transport::MailTransport;
use crate::types::{AccountId, FolderId};

use chew::LabelMap;

/// Per-account runtime handle: the transport connection plus the label/
/// folder mapping the chew step needs. Registered with the manager by the
/// embedder and acquired by tasks through their context so teardown always
/// releases it.
pub struct AccountHandle {
    pub account_id: AccountId,
    pub transport: Arc<dyn MailTransport>,
    pub labels: LabelMap,
    /// The all-mail folder is where Gmail conversation searches and
    /// envelope fetches run; label membership distinguishes everything
    /// else.
    pub all_mail_folder: FolderId,
    pub inbox_folder: FolderId,
    uses: AtomicUsize,
}

impl AccountHandle {
    pub fn new(
        account_id: AccountId,
        transport: Arc<dyn MailTransport>,
        labels: LabelMap,
        all_mail_folder: FolderId,
        inbox_folder: FolderId,
    ) -> Arc<Self> {
        Arc::new(Self {
            account_id,
            transport,
            labels,
            all_mail_folder,
            inbox_folder,
            uses: AtomicUsize::new(0),
        })
    }

    pub fn active_uses(&self) -> usize {
        self.uses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Acquireable for AccountHandle {
    async fn acquire(&self) -> Result<()> {
        self.uses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let prev = self.uses.fetch_sub(1, Ordering::SeqCst);
        anyhow::ensure!(prev > 0, "account handle released more than acquired");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("account:{}", self.account_id)
    }
}
