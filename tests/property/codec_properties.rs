//! Property-based codec tests.
//!
//! Uses proptest to verify:
//! 1. Any chat envelope survives an encode → decode round-trip.
//! 2. Arbitrary text never causes a panic in `decode_inbound`.
//! 3. Arbitrary presence bodies are either decoded or rejected as malformed,
//!    never misclassified.

use chatsync_proto::codec::{self, CodecError};
use chatsync_proto::message::{Content, Envelope, MessageId, MessageKind, Payload, Timestamp};
use proptest::prelude::*;

/// Strategy for generating chat envelopes with arbitrary ids and bodies.
fn arb_chat_envelope() -> impl Strategy<Value = Envelope> {
    (
        "[a-z0-9-]{1,36}",
        proptest::option::of("[a-z0-9-]{1,36}"),
        "[a-z0-9]{1,12}",
        "[a-z0-9]{1,12}",
        ".{0,256}",
        any::<u64>(),
        proptest::option::of("[A-Za-z/_]{1,24}"),
    )
        .prop_map(
            |(id, correlation, sender, recipient, body, ts, tz)| Envelope {
                message_id: MessageId::new(id),
                correlation_id: correlation.map(MessageId::new),
                sender_id: sender,
                recipient_id: recipient,
                kind: MessageKind::Chat,
                payload: Payload::text(body),
                sender_timestamp: Timestamp::from_millis(ts),
                sender_timezone: tz,
                conversation_id: None,
            },
        )
}

proptest! {
    /// Any chat envelope survives an encode → decode round-trip.
    #[test]
    fn chat_envelope_round_trip(envelope in arb_chat_envelope()) {
        let text = codec::encode(&envelope).expect("encode should succeed");
        let inbound = codec::decode_inbound(&text).expect("decode should succeed");
        prop_assert_eq!(&inbound.content, &Content::Text(envelope.payload.body.clone()));
        prop_assert_eq!(inbound.envelope, envelope);
    }

    /// Arbitrary text never causes a panic when decoded.
    #[test]
    fn random_text_decode_no_panic(text in ".{0,512}") {
        let _ = codec::decode_inbound(&text);
    }

    /// Presence bodies either decode or are reported as malformed presence payloads.
    #[test]
    fn presence_body_never_misclassified(body in ".{0,128}") {
        let envelope = Envelope {
            message_id: MessageId::default(),
            correlation_id: None,
            sender_id: "server".into(),
            recipient_id: "BROADCAST".into(),
            kind: MessageKind::PresenceJoin,
            payload: Payload { kind: "presence".into(), body },
            sender_timestamp: Timestamp::default(),
            sender_timezone: None,
            conversation_id: None,
        };
        match codec::decode_content(&envelope) {
            Ok(Content::Presence(_)) => {}
            Err(CodecError::MalformedPayload { kind, .. }) => {
                prop_assert_eq!(kind, MessageKind::PresenceJoin);
            }
            other => prop_assert!(false, "unexpected result: {:?}", other),
        }
    }
}
