//! "Chewing": reduce one raw transport message to the local header/body
//! projections. MIME parsing already happened on the far side of the
//! transport; this is the record-building half.

use std::collections::HashMap;

use crate::transport::RemoteMessage;
use crate::types::{AccountId, BodyInfo, FolderId, HeaderInfo, Uid};

/// Gmail label string <-> local folder id mapping. Labels the account has
/// no folder for pass through unchanged so nothing silently disappears.
#[derive(Clone, Debug, Default)]
pub struct LabelMap {
    by_label: HashMap<String, String>,
}

impl LabelMap {
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            by_label: pairs.into_iter().collect(),
        }
    }

    pub fn labels_to_folder_ids(&self, labels: &[String]) -> Vec<String> {
        labels
            .iter()
            .map(|label| {
                self.by_label
                    .get(label)
                    .cloned()
                    .unwrap_or_else(|| label.clone())
            })
            .collect()
    }
}

/// Reduce a message to just what classification needs.
pub fn message_meta(msg: &RemoteMessage, labels: &LabelMap) -> super::state::MsgMeta {
    super::state::MsgMeta {
        uid: msg.uid,
        date_ts: msg.internal_date_ts,
        conv_id: msg.conv_id.clone(),
        flags: msg.flags.clone(),
        label_folder_ids: labels.labels_to_folder_ids(&msg.labels),
    }
}

/// Build the header and body records from a full envelope fetch. The
/// message id prefers the provider's; the `account:folder:uid` fallback
/// keeps ids stable when the provider omits one.
pub fn chew_header_and_body(
    account_id: &AccountId,
    folder: &FolderId,
    msg: &RemoteMessage,
    labels: &LabelMap,
) -> (HeaderInfo, BodyInfo) {
    let envelope = msg.envelope.clone().unwrap_or_default();
    let message_id = envelope
        .message_id
        .unwrap_or_else(|| fallback_message_id(account_id, folder, msg.uid));

    let header = HeaderInfo {
        id: message_id.clone(),
        conv_id: msg.conv_id.clone(),
        uid: msg.uid,
        date_ts: msg.internal_date_ts,
        author: envelope.author,
        subject: envelope.subject,
        flags: msg.flags.clone(),
        label_folder_ids: labels.labels_to_folder_ids(&msg.labels),
    };
    let body = BodyInfo {
        message_id,
        body_structure_json: msg.body_structure_json.clone(),
        snippet: msg.snippet.clone(),
    };
    (header, body)
}

fn fallback_message_id(account_id: &AccountId, folder: &FolderId, uid: Uid) -> String {
    format!("{account_id}:{folder}:{uid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RemoteEnvelope;

    #[test]
    fn missing_provider_id_gets_stable_fallback() {
        let msg = RemoteMessage {
            uid: 42,
            internal_date_ts: 1_000,
            conv_id: "c1".into(),
            flags: vec![],
            labels: vec!["\\Inbox".into()],
            envelope: Some(RemoteEnvelope::default()),
            body_structure_json: None,
            snippet: None,
        };
        let labels = LabelMap::new([("\\Inbox".to_string(), "INBOX".to_string())]);
        let (header, body) = chew_header_and_body(&"a1".into(), &"All Mail".into(), &msg, &labels);
        assert_eq!(header.id, "a1:All Mail:42");
        assert_eq!(body.message_id, header.id);
        assert_eq!(header.label_folder_ids, vec!["INBOX".to_string()]);
    }
}
