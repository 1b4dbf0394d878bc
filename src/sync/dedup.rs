//! Dedupe keys: the identity of one attachment within one message.
//!
//! The same rule is used when processing attachments and when replaying the
//! ledger; changing it silently re-downloads everything.

use crate::model::Attachment;

/// `"{message_id}:{attachment_id}"`, or `"{message_id}:{name}:{size}"` when
/// the API gave no attachment id.
pub fn dedupe_key(message_id: &str, attachment: &Attachment) -> String {
    if let Some(id) = attachment.id() {
        return format!("{message_id}:{id}");
    }
    let name = attachment.name.as_deref().unwrap_or("attachment");
    match attachment.size {
        Some(size) => format!("{message_id}:{name}:{size}"),
        None => format!("{message_id}:{name}:unknown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_uses_attachment_id() {
        let att = Attachment {
            id: Some(" a1 ".into()),
            name: Some("x.pdf".into()),
            size: Some(10),
            ..Default::default()
        };
        assert_eq!(dedupe_key("m1", &att), "m1:a1");
    }

    #[test]
    fn test_key_ignores_field_order() {
        let a: Attachment =
            serde_json::from_str(r#"{"id":"a1","name":"x.pdf","size":3}"#).unwrap();
        let b: Attachment =
            serde_json::from_str(r#"{"size":99,"name":"other.doc","id":"a1"}"#).unwrap();
        assert_eq!(dedupe_key("m1", &a), dedupe_key("m1", &b));
    }

    #[test]
    fn test_fallback_without_id() {
        let att = Attachment {
            id: Some("   ".into()),
            name: Some("scan.png".into()),
            size: Some(2048),
            ..Default::default()
        };
        assert_eq!(dedupe_key("m1", &att), "m1:scan.png:2048");
        assert_eq!(dedupe_key("m1", &Attachment::default()), "m1:attachment:unknown");
    }
}
