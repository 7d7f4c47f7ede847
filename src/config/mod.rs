use anyhow::Result;
use chrono::NaiveDate;
use std::env;

/// Sync-interest defaults. These can be overridden by env vars but do not
/// require any user-authored config files. A message "meets sync criteria"
/// when it is inside the date window and carries at least one of the sync
/// label folder ids.
#[derive(Debug, Clone)]
pub struct SyncDefaults {
    pub cutoff_since: NaiveDate,
    pub sync_label_ids: Vec<String>,
}

impl SyncDefaults {
    pub fn load() -> Result<Self> {
        let cutoff =
            cutoff_from_env().unwrap_or_else(|| NaiveDate::from_ymd_opt(2025, 12, 1).unwrap());

        let sync_label_ids = env::var("TERN_SYNC_LABELS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(default_sync_labels);

        Ok(Self {
            cutoff_since: cutoff,
            sync_label_ids,
        })
    }

    pub fn with_cutoff(cutoff_since: NaiveDate, sync_label_ids: Vec<String>) -> Self {
        Self {
            cutoff_since,
            sync_label_ids,
        }
    }

    /// Seconds-since-epoch form of the cutoff, midnight UTC.
    pub fn cutoff_ts(&self) -> i64 {
        self.cutoff_since
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0)
    }

    /// The per-message interest predicate: date window and label membership.
    pub fn message_meets_sync_criteria(&self, date_ts: i64, label_folder_ids: &[String]) -> bool {
        date_ts >= self.cutoff_ts()
            && label_folder_ids
                .iter()
                .any(|l| self.sync_label_ids.iter().any(|s| s == l))
    }
}

fn cutoff_from_env() -> Option<NaiveDate> {
    let raw = env::var("TERN_CUTOFF_SINCE").ok()?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").ok()
}

fn default_sync_labels() -> Vec<String> {
    vec!["INBOX".to_string(), "\\Sent".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_requires_both_window_and_label() {
        let defaults = SyncDefaults::with_cutoff(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            vec!["INBOX".into()],
        );
        let inside = defaults.cutoff_ts() + 3600;
        let outside = defaults.cutoff_ts() - 3600;

        assert!(defaults.message_meets_sync_criteria(inside, &["INBOX".into()]));
        assert!(!defaults.message_meets_sync_criteria(outside, &["INBOX".into()]));
        assert!(!defaults.message_meets_sync_criteria(inside, &["\\Trash".into()]));
        assert!(!defaults.message_meets_sync_criteria(inside, &[]));
    }
}
