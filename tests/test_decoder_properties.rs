//! Property tests for topic routing and payload decoding

use iot_ingest_bridge::processing::{decode, DecodeError};
use iot_ingest_bridge::protocol::InboundMessage;
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        (-100_000i32..100_000).prop_map(|n| json!(f64::from(n) / 4.0)),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
    ]
}

fn json_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-zA-Z_]{1,12}", json_leaf(), 1..8)
        .prop_map(|map| Value::Object(map.into_iter().collect::<Map<_, _>>()))
}

proptest! {
    #[test]
    fn prop_valid_readings_pass_through_unchanged(
        token in "[a-zA-Z0-9-]{1,40}",
        data in json_object(),
        qos in 0u8..=2,
        retain in any::<bool>(),
    ) {
        let topic = format!("iot/{token}/data");
        let message = InboundMessage::new(topic.clone(), data.to_string(), qos, retain);

        let reading = decode(&message).unwrap();
        prop_assert_eq!(&reading.device_token, &token);
        prop_assert_eq!(&reading.topic, &topic);
        prop_assert_eq!(&reading.data, &data);
        prop_assert_eq!(reading.metadata.qos, qos);
        prop_assert_eq!(reading.metadata.retain, retain);
        prop_assert_eq!(reading.timestamp, message.received_at);
    }

    #[test]
    fn prop_other_topics_are_rejected(
        root in "[a-z]{1,8}",
        token in "[a-zA-Z0-9-]{1,20}",
        leaf in "[a-z]{1,8}",
    ) {
        prop_assume!(root != "iot" || leaf != "data");
        let message = InboundMessage::new(format!("{root}/{token}/{leaf}"), "{}", 1, false);
        let is_invalid_topic = matches!(decode(&message), Err(DecodeError::InvalidTopic { .. }));
        prop_assert!(is_invalid_topic);
    }

    #[test]
    fn prop_extra_segments_are_rejected(
        token in "[a-zA-Z0-9-]{1,20}",
        extra in "[a-z]{1,8}",
    ) {
        let message = InboundMessage::new(format!("iot/{token}/data/{extra}"), "{}", 1, false);
        let is_invalid_topic = matches!(decode(&message), Err(DecodeError::InvalidTopic { .. }));
        prop_assert!(is_invalid_topic);
    }

    #[test]
    fn prop_non_json_payloads_are_rejected(garbage in "[a-zA-Z][a-zA-Z ]{0,200}") {
        // Leading letter rules out numbers; the literals are excluded explicitly
        prop_assume!(!["true", "false", "null"].contains(&garbage.trim()));

        let message = InboundMessage::new("iot/device-1/data", garbage, 1, false);
        match decode(&message) {
            Err(DecodeError::InvalidPayload { preview, .. }) => {
                prop_assert!(preview.chars().count() <= 100);
            }
            other => prop_assert!(false, "expected invalid payload, got {:?}", other),
        }
    }
}
