//! Per-account sync-state classification: sorts each remote uid into the
//! yay/meh/moot interest tiers and accumulates the conversation-level
//! byproduct tasks that fall out of the decisions.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::config::SyncDefaults;
use crate::task::{ConvWork, TaskSpec};
use crate::types::{AccountId, ConvId, RawSyncState, Uid, UidState};

/// Why this helper instance exists; only used for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncReason {
    Refresh,
    Grow,
    Conv,
}

/// What one classification call decided. Returned so callers can log it and
/// tests can assert the table row taken; the state changes happen inside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    NewYayInExistingConv,
    NewYayInNewConv,
    NewMehInExistingConv,
    NewMoot,
    ExistingUpdated,
    ExistingMehNowYay,
    ExistingIgnoredNowYayInNewConv,
    ExistingYayNowMeh,
    ExistingMoot,
}

/// One fetched message reduced to what classification needs.
#[derive(Clone, Debug)]
pub struct MsgMeta {
    pub uid: Uid,
    pub date_ts: i64,
    pub conv_id: ConvId,
    pub flags: Vec<String>,
    pub label_folder_ids: Vec<String>,
}

impl MsgMeta {
    fn uid_state(&self) -> UidState {
        UidState {
            flags: self.flags.clone(),
            label_folder_ids: self.label_folder_ids.clone(),
        }
    }
}

/// Pending conversation-level consequences of a scan, drained into
/// `sync_conv` byproduct tasks at finish time.
#[derive(Debug, Default)]
struct ConvDelta {
    new_conv: bool,
    removed: bool,
    new_uids: BTreeSet<Uid>,
    revised: BTreeMap<Uid, UidState>,
}

pub struct SyncStateHelper {
    account_id: AccountId,
    reason: SyncReason,
    defaults: SyncDefaults,
    raw: RawSyncState,
    conv_deltas: HashMap<ConvId, ConvDelta>,
}

impl SyncStateHelper {
    pub fn new(
        raw: RawSyncState,
        account_id: AccountId,
        defaults: SyncDefaults,
        reason: SyncReason,
    ) -> Self {
        Self {
            account_id,
            reason,
            defaults,
            raw,
            conv_deltas: HashMap::new(),
        }
    }

    pub fn modseq(&self) -> u64 {
        self.raw.modseq
    }

    pub fn last_high_uid(&self) -> Uid {
        self.raw.last_high_uid
    }

    pub fn is_yay(&self, uid: Uid) -> bool {
        self.raw.yay_uids.contains(&uid)
    }

    pub fn is_meh(&self, uid: Uid) -> bool {
        self.raw.meh_uids.contains(&uid)
    }

    /// A conversation is known when any tracked uid (yay or meh) maps to it.
    pub fn is_known_conversation(&self, conv_id: &ConvId) -> bool {
        self.raw.uid_conv.values().any(|c| c == conv_id)
    }

    /// Run one message through the transition table. Predicates: is-new
    /// (uid above the high-water mark), meets-criteria (date window and
    /// label membership), conv-known.
    pub fn classify(&mut self, msg: &MsgMeta) -> Classification {
        let meets = self
            .defaults
            .message_meets_sync_criteria(msg.date_ts, &msg.label_folder_ids);
        let is_new = msg.uid > self.raw.last_high_uid;

        let outcome = if is_new {
            if meets {
                if self.is_known_conversation(&msg.conv_id) {
                    self.new_yay_message_in_existing_conv(msg);
                    Classification::NewYayInExistingConv
                } else {
                    self.new_yay_message_in_new_conv(msg);
                    Classification::NewYayInNewConv
                }
            } else if self.is_known_conversation(&msg.conv_id) {
                self.new_meh_message_in_existing_conv(msg);
                Classification::NewMehInExistingConv
            } else {
                // Not interesting on its own, conversation unknown: discard.
                Classification::NewMoot
            }
        } else if meets {
            if self.raw.yay_uids.contains(&msg.uid) {
                self.existing_message_updated(msg);
                Classification::ExistingUpdated
            } else if self.raw.meh_uids.contains(&msg.uid) {
                self.existing_meh_message_is_now_yay(msg);
                Classification::ExistingMehNowYay
            } else {
                // Untracked but now interesting; inductively the whole
                // conversation is new to us.
                self.existing_ignored_message_is_now_yay_in_new_conv(msg);
                Classification::ExistingIgnoredNowYayInNewConv
            }
        } else if self.raw.yay_uids.contains(&msg.uid) {
            self.existing_yay_message_is_now_meh(msg);
            Classification::ExistingYayNowMeh
        } else if self.raw.meh_uids.contains(&msg.uid) {
            self.existing_message_updated(msg);
            Classification::ExistingUpdated
        } else {
            Classification::ExistingMoot
        };

        debug!(
            account = %self.account_id,
            reason = ?self.reason,
            uid = msg.uid,
            conv = %msg.conv_id,
            outcome = ?outcome,
            "classified message"
        );
        outcome
    }

    fn delta(&mut self, conv_id: &ConvId) -> &mut ConvDelta {
        self.conv_deltas.entry(conv_id.clone()).or_default()
    }

    fn new_yay_message_in_existing_conv(&mut self, msg: &MsgMeta) {
        self.raw.yay_uids.insert(msg.uid);
        self.raw.uid_conv.insert(msg.uid, msg.conv_id.clone());
        self.delta(&msg.conv_id).new_uids.insert(msg.uid);
    }

    fn new_yay_message_in_new_conv(&mut self, msg: &MsgMeta) {
        self.raw.yay_uids.insert(msg.uid);
        self.raw.uid_conv.insert(msg.uid, msg.conv_id.clone());
        let delta = self.delta(&msg.conv_id);
        delta.new_conv = true;
        delta.new_uids.insert(msg.uid);
    }

    fn new_meh_message_in_existing_conv(&mut self, msg: &MsgMeta) {
        self.raw.meh_uids.insert(msg.uid);
        self.raw.uid_conv.insert(msg.uid, msg.conv_id.clone());
        self.delta(&msg.conv_id).new_uids.insert(msg.uid);
    }

    fn existing_message_updated(&mut self, msg: &MsgMeta) {
        self.delta(&msg.conv_id).revised.insert(msg.uid, msg.uid_state());
    }

    fn existing_meh_message_is_now_yay(&mut self, msg: &MsgMeta) {
        self.raw.meh_uids.remove(&msg.uid);
        self.raw.yay_uids.insert(msg.uid);
        self.delta(&msg.conv_id).revised.insert(msg.uid, msg.uid_state());
    }

    fn existing_ignored_message_is_now_yay_in_new_conv(&mut self, msg: &MsgMeta) {
        self.raw.yay_uids.insert(msg.uid);
        self.raw.uid_conv.insert(msg.uid, msg.conv_id.clone());
        let delta = self.delta(&msg.conv_id);
        delta.new_conv = true;
        delta.new_uids.insert(msg.uid);
    }

    fn existing_yay_message_is_now_meh(&mut self, msg: &MsgMeta) {
        self.raw.yay_uids.remove(&msg.uid);
        self.raw.meh_uids.insert(msg.uid);

        let conv_still_yay = self
            .raw
            .uid_conv
            .iter()
            .any(|(uid, conv)| conv == &msg.conv_id && self.raw.yay_uids.contains(uid));
        if conv_still_yay {
            self.delta(&msg.conv_id).revised.insert(msg.uid, msg.uid_state());
        } else {
            // Last interesting message left; the conversation as a whole
            // loses sync interest. Queue every tracked uid for the deferred
            // removal pass and emit a delete.
            let uids: Vec<Uid> = self
                .raw
                .uid_conv
                .iter()
                .filter(|(_, conv)| *conv == &msg.conv_id)
                .map(|(uid, _)| *uid)
                .collect();
            self.raw.pending_removals.extend(uids);
            self.delta(&msg.conv_id).removed = true;
        }
    }

    /// Track a uid discovered out-of-band (conversation membership search)
    /// as meh, without emitting a byproduct: the caller is already the task
    /// handling that conversation.
    pub fn note_meh_uid(&mut self, uid: Uid, conv_id: &ConvId) {
        if !self.raw.yay_uids.contains(&uid) {
            self.raw.meh_uids.insert(uid);
        }
        self.raw.uid_conv.insert(uid, conv_id.clone());
    }

    /// Advance the cursor from the mailbox counters reported by the
    /// listing. The high-water mark never moves backwards.
    pub fn set_cursor(&mut self, uid_next: Uid, highest_modseq: u64) {
        let new_high = uid_next.saturating_sub(1);
        if new_high > self.raw.last_high_uid {
            self.raw.last_high_uid = new_high;
        }
        self.raw.modseq = highest_modseq;
    }

    /// Apply the removals queued during the scan. Deferred so a mid-scan
    /// crash cannot lose a uid that was simultaneously being re-classified.
    pub fn finalize_pending_removals(&mut self) {
        let pending = std::mem::take(&mut self.raw.pending_removals);
        for uid in pending {
            self.raw.yay_uids.remove(&uid);
            self.raw.meh_uids.remove(&uid);
            self.raw.uid_conv.remove(&uid);
        }
    }

    /// Convert the accumulated conversation deltas into `sync_conv`
    /// byproduct task specs.
    pub fn drain_tasks(&mut self) -> Vec<TaskSpec> {
        let mut tasks: Vec<TaskSpec> = Vec::new();
        for (conv_id, delta) in std::mem::take(&mut self.conv_deltas) {
            let work = if delta.removed {
                ConvWork::DelConv
            } else if delta.new_conv {
                ConvWork::NewConv
            } else if !delta.new_uids.is_empty() || !delta.revised.is_empty() {
                ConvWork::Modify {
                    new_uids: delta.new_uids,
                    removed_uids: BTreeSet::new(),
                    revised_uid_state: delta.revised,
                }
            } else {
                continue;
            };
            tasks.push(TaskSpec::SyncConv {
                account_id: self.account_id.clone(),
                conv_id,
                work,
            });
        }
        // Deterministic byproduct order regardless of hash iteration.
        tasks.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        tasks
    }

    pub fn into_raw(self) -> RawSyncState {
        self.raw
    }

    pub fn raw(&self) -> &RawSyncState {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn defaults() -> SyncDefaults {
        SyncDefaults::with_cutoff(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            vec!["INBOX".into()],
        )
    }

    fn in_window() -> i64 {
        defaults().cutoff_ts() + 86_400
    }

    fn msg(uid: Uid, conv: &str, labels: &[&str], date_ts: i64) -> MsgMeta {
        MsgMeta {
            uid,
            date_ts,
            conv_id: conv.into(),
            flags: vec![],
            label_folder_ids: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn helper(raw: RawSyncState) -> SyncStateHelper {
        SyncStateHelper::new(raw, "a1".into(), defaults(), SyncReason::Refresh)
    }

    fn assert_disjoint(h: &SyncStateHelper) {
        assert!(
            h.raw().yay_uids.is_disjoint(&h.raw().meh_uids),
            "yay and meh must stay disjoint: {:?}",
            h.raw()
        );
    }

    #[test]
    fn new_yay_in_new_conv_tracks_uid_and_conv() {
        let mut h = helper(RawSyncState {
            last_high_uid: 10,
            yay_uids: [1, 2].into(),
            uid_conv: [(1, "cA".into()), (2, "cA".into())].into(),
            ..Default::default()
        });

        let outcome = h.classify(&msg(11, "cB", &["INBOX"], in_window()));
        assert_eq!(outcome, Classification::NewYayInNewConv);
        assert!(h.raw().yay_uids.is_superset(&[1, 2, 11].into()));
        // Cursor only moves at the finalize step, from uid_next.
        assert_eq!(h.last_high_uid(), 10);
        assert_disjoint(&h);

        let tasks = h.drain_tasks();
        assert_eq!(tasks.len(), 1);
        match &tasks[0] {
            TaskSpec::SyncConv { conv_id, work, .. } => {
                assert_eq!(conv_id, "cB");
                assert_eq!(*work, ConvWork::NewConv);
            }
            other => panic!("unexpected byproduct: {other:?}"),
        }
    }

    #[test]
    fn every_transition_preserves_disjointness() {
        let mut h = helper(RawSyncState {
            last_high_uid: 100,
            yay_uids: [5, 6].into(),
            meh_uids: [7].into(),
            uid_conv: [(5, "c1".into()), (6, "c2".into()), (7, "c2".into())].into(),
            ..Default::default()
        });

        let calls = vec![
            msg(101, "c1", &["INBOX"], in_window()),   // new yay, existing conv
            msg(102, "cX", &["INBOX"], in_window()),   // new yay, new conv
            msg(103, "c2", &["\\Trash"], in_window()), // new meh, existing conv
            msg(104, "cZ", &["\\Trash"], in_window()), // new moot
            msg(5, "c1", &["INBOX"], in_window()),     // updated
            msg(7, "c2", &["INBOX"], in_window()),     // meh -> yay
            msg(9, "cY", &["INBOX"], in_window()),     // ignored -> yay, new conv
            msg(6, "c2", &["\\Trash"], in_window()),   // yay -> meh
            msg(50, "cQ", &["\\Trash"], in_window()),  // existing moot
        ];
        for m in calls {
            h.classify(&m);
            assert_disjoint(&h);
        }
        h.finalize_pending_removals();
        assert_disjoint(&h);
    }

    #[test]
    fn yay_to_meh_moves_uid_between_tiers() {
        let mut h = helper(RawSyncState {
            last_high_uid: 10,
            yay_uids: [5, 6].into(),
            uid_conv: [(5, "c1".into()), (6, "c1".into())].into(),
            ..Default::default()
        });

        let outcome = h.classify(&msg(5, "c1", &["\\Archive"], in_window()));
        assert_eq!(outcome, Classification::ExistingYayNowMeh);
        assert!(!h.raw().yay_uids.contains(&5));
        assert!(h.raw().meh_uids.contains(&5));
        assert_disjoint(&h);
        // conv c1 still has yay uid 6, so no delete was queued
        assert!(h.raw().pending_removals.is_empty());
    }

    #[test]
    fn losing_the_last_yay_uid_deletes_the_conversation() {
        let mut h = helper(RawSyncState {
            last_high_uid: 10,
            yay_uids: [5].into(),
            meh_uids: [6].into(),
            uid_conv: [(5, "c1".into()), (6, "c1".into())].into(),
            ..Default::default()
        });

        h.classify(&msg(5, "c1", &["\\Archive"], in_window()));
        assert_eq!(h.raw().pending_removals, [5, 6].into());

        let tasks = h.drain_tasks();
        assert!(matches!(
            tasks.as_slice(),
            [TaskSpec::SyncConv {
                work: ConvWork::DelConv,
                ..
            }]
        ));

        h.finalize_pending_removals();
        assert!(h.raw().yay_uids.is_empty());
        assert!(h.raw().meh_uids.is_empty());
        assert!(h.raw().uid_conv.is_empty());
    }

    #[test]
    fn date_outside_window_is_moot_even_with_sync_label() {
        let mut h = helper(RawSyncState {
            last_high_uid: 10,
            ..Default::default()
        });
        let outcome = h.classify(&msg(11, "cB", &["INBOX"], defaults().cutoff_ts() - 1));
        assert_eq!(outcome, Classification::NewMoot);
        assert!(h.raw().yay_uids.is_empty());
        assert!(h.drain_tasks().is_empty());
    }

    #[test]
    fn cursor_is_monotone_across_refreshes() {
        let mut h = helper(RawSyncState {
            last_high_uid: 40,
            ..Default::default()
        });
        h.set_cursor(51, 900);
        assert_eq!(h.last_high_uid(), 50);
        // A server reporting a smaller uid_next must not move us backwards.
        h.set_cursor(45, 950);
        assert_eq!(h.last_high_uid(), 50);
        assert_eq!(h.modseq(), 950);
    }

    #[test]
    fn updates_become_modify_byproducts_with_revised_state() {
        let mut h = helper(RawSyncState {
            last_high_uid: 10,
            yay_uids: [3].into(),
            uid_conv: [(3, "c1".into())].into(),
            ..Default::default()
        });
        let mut m = msg(3, "c1", &["INBOX"], in_window());
        m.flags = vec!["\\Seen".into()];
        h.classify(&m);

        let tasks = h.drain_tasks();
        match tasks.as_slice() {
            [TaskSpec::SyncConv {
                work:
                    ConvWork::Modify {
                        new_uids,
                        revised_uid_state,
                        ..
                    },
                ..
            }] => {
                assert!(new_uids.is_empty());
                assert_eq!(
                    revised_uid_state.get(&3).unwrap().flags,
                    vec!["\\Seen".to_string()]
                );
            }
            other => panic!("unexpected byproducts: {other:?}"),
        }
    }
}
