//! Chat display-name resolution.
//!
//! Evaluated in order, first non-empty result wins:
//!
//! 1. name already cached in the store
//! 2. groups: display name / name from supplied history metadata
//! 3. groups: live group subject from the protocol client
//! 4. groups: `Group {user}`
//! 5. others: contact full name, else the event's sender, else the raw user
//!
//! The result is written back so step 1 hits next time. Lookup failures
//! only move resolution to the next step; this never fails.

use crate::protocol::{ChatProtocol, GroupMetadata, Jid};
use crate::storage::Database;

/// Resolve and cache the display name for `chat`.
///
/// `sender` is the already-known sender of the event being processed, or
/// empty when there is none (history sync).
pub async fn resolve_chat_name(
    db: &Database,
    protocol: &dyn ChatProtocol,
    chat: &Jid,
    metadata: Option<&GroupMetadata>,
    sender: &str,
) -> String {
    let chat_jid = chat.to_string();

    match db.get_chat_name(&chat_jid) {
        Ok(Some(name)) => return name,
        Ok(None) => {}
        Err(e) => tracing::warn!(chat_jid = %chat_jid, error = %e, "Chat name cache lookup failed"),
    }

    let name = if chat.is_group() {
        group_name(protocol, chat, metadata).await
    } else {
        contact_name(protocol, chat, sender).await
    };

    if let Err(e) = db.store_chat_name(&chat_jid, &name) {
        tracing::warn!(chat_jid = %chat_jid, error = %e, "Failed to cache chat name");
    }
    tracing::debug!(chat_jid = %chat_jid, name = %name, "Resolved chat name");
    name
}

async fn group_name(
    protocol: &dyn ChatProtocol,
    chat: &Jid,
    metadata: Option<&GroupMetadata>,
) -> String {
    if let Some(name) = metadata.and_then(GroupMetadata::best_name) {
        return name.to_string();
    }

    match protocol.group_name(chat).await {
        Ok(Some(name)) if !name.is_empty() => return name,
        Ok(_) => {}
        Err(e) => tracing::debug!(chat_jid = %chat, error = %e, "Group info lookup failed"),
    }

    format!("Group {}", chat.user)
}

async fn contact_name(protocol: &dyn ChatProtocol, chat: &Jid, sender: &str) -> String {
    match protocol.contact_full_name(chat).await {
        Ok(Some(name)) if !name.is_empty() => return name,
        Ok(_) => {}
        Err(e) => tracing::debug!(chat_jid = %chat, error = %e, "Contact lookup failed"),
    }

    if !sender.is_empty() {
        return sender.to_string();
    }
    chat.user.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InMemoryProtocol;
    use crate::time::from_millis;

    fn group() -> Jid {
        Jid::new("120363041234", "g.us")
    }

    fn setup() -> (Database, InMemoryProtocol) {
        (
            Database::open(None).unwrap(),
            InMemoryProtocol::new(Jid::phone("15559990000")),
        )
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits() {
        let (db, protocol) = setup();
        db.upsert_chat(&group().to_string(), "Cached", from_millis(1)).unwrap();
        protocol.add_group(group(), "Live");

        let name = resolve_chat_name(&db, &protocol, &group(), None, "").await;
        assert_eq!(name, "Cached");
    }

    #[tokio::test]
    async fn test_group_metadata_wins_over_live_lookup() {
        let (db, protocol) = setup();
        protocol.add_group(group(), "Live");
        let metadata = GroupMetadata {
            display_name: None,
            name: Some("From History".into()),
        };

        let name = resolve_chat_name(&db, &protocol, &group(), Some(&metadata), "").await;
        assert_eq!(name, "From History");
    }

    #[tokio::test]
    async fn test_empty_metadata_falls_through_to_live_lookup() {
        let (db, protocol) = setup();
        protocol.add_group(group(), "Live");

        let name =
            resolve_chat_name(&db, &protocol, &group(), Some(&GroupMetadata::default()), "").await;
        assert_eq!(name, "Live");
    }

    #[tokio::test]
    async fn test_failing_group_lookup_uses_synthetic_name() {
        let (db, protocol) = setup();
        protocol.fail_group_lookups(true);

        let name = resolve_chat_name(&db, &protocol, &group(), None, "someone").await;
        assert_eq!(name, "Group 120363041234");

        // Written back: a later lookup hits the cache even once live info exists
        protocol.fail_group_lookups(false);
        protocol.add_group(group(), "Live");
        let again = resolve_chat_name(&db, &protocol, &group(), None, "").await;
        assert_eq!(again, "Group 120363041234");
        assert_eq!(
            db.get_chat_name(&group().to_string()).unwrap().as_deref(),
            Some("Group 120363041234")
        );
    }

    #[tokio::test]
    async fn test_contact_fallback_order() {
        let (db, protocol) = setup();

        let known = Jid::phone("15551111111");
        protocol.add_contact(known.clone(), "Alice Smith");
        assert_eq!(
            resolve_chat_name(&db, &protocol, &known, None, "ignored").await,
            "Alice Smith"
        );

        let unknown = Jid::phone("15552222222");
        assert_eq!(resolve_chat_name(&db, &protocol, &unknown, None, "Bob").await, "Bob");

        let anonymous = Jid::phone("15553333333");
        assert_eq!(
            resolve_chat_name(&db, &protocol, &anonymous, None, "").await,
            "15553333333"
        );
    }
}
