//! Property-based conversation store tests.
//!
//! Uses proptest to verify, for arbitrary message sequences with colliding
//! ids and timestamps:
//! 1. Every conversation stays sorted, duplicate-free and within its cap.
//! 2. Repeating an upsert leaves the store unchanged.
//! 3. `build_index` files messages under their peer and keeps the last copy
//!    of each id.
//! 4. Acks never turn a delivered message back into a pending one.
//! 5. The peer limit holds after any sequence of upserts.

use std::collections::HashSet;

use chatsync::chat::store::{ConversationStore, StoreLimits, build_index};
use chatsync::chat::{ChatMessage, Direction};
use chatsync_proto::message::{MessageId, Timestamp};
use proptest::prelude::*;

/// Strategy for messages drawn from small id, peer and timestamp pools so
/// that collisions are common.
fn arb_message() -> impl Strategy<Value = ChatMessage> {
    ("m[0-9]", "u[1-4]", 0u64..20, any::<bool>(), "[a-z]{0,8}").prop_map(
        |(id, peer, ts, outbound, text)| {
            let (direction, acknowledged) = if outbound {
                (Direction::Outbound, Some(false))
            } else {
                (Direction::Inbound, None)
            };
            ChatMessage {
                id: MessageId::new(id),
                text,
                direction,
                acknowledged,
                peer_id: peer,
                sender_timestamp: Timestamp::from_millis(ts),
            }
        },
    )
}

fn check_list(list: &[ChatMessage], cap: usize) -> Result<(), TestCaseError> {
    prop_assert!(list.len() <= cap, "len {} over cap {}", list.len(), cap);
    prop_assert!(
        list.windows(2)
            .all(|w| w[0].sender_timestamp <= w[1].sender_timestamp),
        "list not sorted"
    );
    let ids: HashSet<&MessageId> = list.iter().map(|m| &m.id).collect();
    prop_assert_eq!(ids.len(), list.len(), "duplicate ids");
    Ok(())
}

proptest! {
    /// Conversations stay sorted, unique and capped under any upsert order.
    #[test]
    fn upserts_keep_lists_sorted_unique_and_capped(
        messages in prop::collection::vec(arb_message(), 0..64),
        cap in 1usize..8,
    ) {
        let mut store = ConversationStore::new(StoreLimits {
            max_messages_per_peer: cap,
            max_peers: None,
        });
        for message in messages {
            let peer = message.peer_id.clone();
            store.upsert(&peer, message);
        }
        for list in store.snapshot().values() {
            check_list(list, cap)?;
        }
    }

    /// Upserting the same message twice is the same as upserting it once.
    #[test]
    fn upsert_is_idempotent(
        messages in prop::collection::vec(arb_message(), 1..32),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut store = ConversationStore::new(StoreLimits::default());
        for message in &messages {
            store.upsert(&message.peer_id, message.clone());
        }
        let repeated = messages[pick.index(messages.len())].clone();
        store.upsert(&repeated.peer_id, repeated.clone());
        let before = store.snapshot();
        store.upsert(&repeated.peer_id, repeated.clone());
        prop_assert_eq!(store.snapshot(), before);
    }

    /// Indexed messages sit under their own peer and carry the last copy of
    /// their id.
    #[test]
    fn build_index_groups_by_peer_last_copy_wins(
        messages in prop::collection::vec(arb_message(), 0..64),
        cap in 1usize..16,
    ) {
        let index = build_index(messages.clone(), cap);
        for (peer, list) in &index {
            check_list(list, cap)?;
            for message in list {
                prop_assert_eq!(&message.peer_id, peer);
                let last = messages
                    .iter()
                    .rev()
                    .find(|m| m.id == message.id && &m.peer_id == peer)
                    .unwrap();
                prop_assert_eq!(message, last);
            }
        }
    }

    /// Acks only ever move outbound messages from pending to delivered.
    #[test]
    fn acks_are_monotonic(
        messages in prop::collection::vec(arb_message(), 0..32),
        acks in prop::collection::vec("m[0-9]", 0..16),
    ) {
        let mut store = ConversationStore::new(StoreLimits::default());
        for message in messages {
            let peer = message.peer_id.clone();
            store.upsert(&peer, message);
        }
        let mut delivered: HashSet<(String, MessageId)> = HashSet::new();
        for ack in acks {
            store.apply_ack(&MessageId::new(ack));
            for (peer, list) in store.snapshot() {
                for message in list {
                    let key = (peer.clone(), message.id.clone());
                    if delivered.contains(&key) {
                        prop_assert_eq!(message.acknowledged, Some(true));
                    }
                    if message.acknowledged == Some(true) {
                        prop_assert_eq!(message.direction, Direction::Outbound);
                        delivered.insert(key);
                    }
                }
            }
        }
    }

    /// The number of tracked peers never exceeds the configured maximum.
    #[test]
    fn peer_limit_holds(
        messages in prop::collection::vec(arb_message(), 0..64),
        max_peers in 1usize..4,
    ) {
        let mut store = ConversationStore::new(StoreLimits {
            max_messages_per_peer: 10,
            max_peers: Some(max_peers),
        });
        for message in messages {
            let peer = message.peer_id.clone();
            store.upsert(&peer, message);
            prop_assert!(store.peer_count() <= max_peers);
            prop_assert!(store.get(&peer).is_some(), "touched peer was evicted");
        }
    }
}
