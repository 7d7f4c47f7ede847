use crate::types::{AccountId, ConvId, ConversationInfo, HeaderInfo};

/// Conversation-summary derivation, consumed as a pure function: given the
/// prior summary (if any) and the full canonical-ordered header set, return
/// a recomputed summary. Implementations must not touch storage or the
/// network; the sync tasks call this inside their commit step.
pub trait ConversationChurn: Send + Sync {
    fn churn(
        &self,
        account_id: &AccountId,
        conv_id: &ConvId,
        old: Option<&ConversationInfo>,
        headers: &[HeaderInfo],
    ) -> ConversationInfo;
}

/// Default churner: subject from the oldest message, participant union in
/// first-seen order, date range, message/unread counts.
#[derive(Debug, Default)]
pub struct BasicChurn;

impl ConversationChurn for BasicChurn {
    fn churn(
        &self,
        account_id: &AccountId,
        conv_id: &ConvId,
        _old: Option<&ConversationInfo>,
        headers: &[HeaderInfo],
    ) -> ConversationInfo {
        let subject = headers.iter().find_map(|h| h.subject.clone());

        let mut participants: Vec<String> = Vec::new();
        for header in headers {
            if let Some(author) = &header.author {
                if !participants.iter().any(|p| p == author) {
                    participants.push(author.clone());
                }
            }
        }

        let date_oldest_ts = headers.iter().map(|h| h.date_ts).min().unwrap_or(0);
        let date_newest_ts = headers.iter().map(|h| h.date_ts).max().unwrap_or(0);
        let unread_count = headers
            .iter()
            .filter(|h| !h.flags.iter().any(|f| f == "\\Seen"))
            .count() as u32;
        let has_starred = headers
            .iter()
            .any(|h| h.flags.iter().any(|f| f == "\\Flagged"));

        ConversationInfo {
            conv_id: conv_id.clone(),
            account_id: account_id.clone(),
            subject,
            participants,
            date_oldest_ts,
            date_newest_ts,
            message_count: headers.len() as u32,
            unread_count,
            has_starred,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(id: &str, uid: u64, date_ts: i64, author: &str, seen: bool) -> HeaderInfo {
        HeaderInfo {
            id: id.into(),
            conv_id: "c1".into(),
            uid,
            date_ts,
            author: Some(author.into()),
            subject: Some(format!("subj-{id}")),
            flags: if seen { vec!["\\Seen".into()] } else { vec![] },
            label_folder_ids: vec!["INBOX".into()],
        }
    }

    #[test]
    fn churn_derives_counts_and_range() {
        let headers = vec![
            header("m1", 1, 100, "ana@example.com", true),
            header("m2", 2, 200, "bo@example.com", false),
            header("m3", 3, 300, "ana@example.com", false),
        ];
        let info = BasicChurn.churn(&"a1".into(), &"c1".into(), None, &headers);

        assert_eq!(info.message_count, 3);
        assert_eq!(info.unread_count, 2);
        assert_eq!(info.date_oldest_ts, 100);
        assert_eq!(info.date_newest_ts, 300);
        assert_eq!(info.subject.as_deref(), Some("subj-m1"));
        assert_eq!(info.participants.len(), 2);
    }
}
