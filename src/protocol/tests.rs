//! Tests for the JSON and MessagePack hub protocols.

use std::collections::HashMap;

use proptest::prelude::*;
use rstest::rstest;

use super::*;
use crate::{
    binder::{ArgumentBindingError, UntypedBinder},
    message::{
        CancelInvocationMessage,
        CloseMessage,
        CompletionMessage,
        Headers,
        InvocationMessage,
        StreamInvocationMessage,
        StreamItemMessage,
    },
    value::{BindError, Shape, Value},
};

#[derive(Default)]
struct TestBinder {
    parameters: HashMap<String, Vec<Shape>>,
    results: HashMap<String, Shape>,
}

impl TestBinder {
    fn with_target(mut self, target: &str, shapes: Vec<Shape>) -> Self {
        self.parameters.insert(target.to_owned(), shapes);
        self
    }

    fn with_result(mut self, id: &str, shape: Shape) -> Self {
        self.results.insert(id.to_owned(), shape);
        self
    }
}

impl InvocationBinder for TestBinder {
    fn parameter_shapes(&self, target: &str) -> Option<Vec<Shape>> {
        self.parameters.get(target).cloned()
    }

    fn result_shape(&self, invocation_id: &str) -> Option<Shape> {
        self.results.get(invocation_id).cloned()
    }
}

fn invocation(target: &str, arguments: Vec<Value>) -> HubMessage {
    HubMessage::Invocation(InvocationMessage::new(target, arguments))
}

fn expect_binding_failure(message: &HubMessage) -> &ArgumentBindingError {
    match message {
        HubMessage::InvocationBindingFailure(failure) => &failure.cause,
        other => panic!("expected a binding failure, got {other:?}"),
    }
}

#[rstest]
#[case::invocation(
    invocation("test", vec![Value::from("42")]),
    "{\"type\":1,\"target\":\"test\",\"arguments\":[\"42\"]}\u{1e}"
)]
#[case::invocation_with_id(
    HubMessage::Invocation(InvocationMessage {
        invocation_id: Some("1".into()),
        ..InvocationMessage::new("test", vec![Value::from("message")])
    }),
    "{\"type\":1,\"invocationId\":\"1\",\"target\":\"test\",\"arguments\":[\"message\"]}\u{1e}"
)]
#[case::stream_ids(
    HubMessage::Invocation(InvocationMessage {
        stream_ids: Some(vec!["2".into()]),
        ..InvocationMessage::new("upload", vec![])
    }),
    "{\"type\":1,\"target\":\"upload\",\"arguments\":[],\"streamIds\":[\"2\"]}\u{1e}"
)]
#[case::cancel(
    HubMessage::CancelInvocation(CancelInvocationMessage { headers: None, invocation_id: "1".into() }),
    "{\"type\":5,\"invocationId\":\"1\"}\u{1e}"
)]
#[case::ping(HubMessage::Ping, "{\"type\":6}\u{1e}")]
#[case::close(
    HubMessage::Close(CloseMessage { error: Some("Error".into()), allow_reconnect: false }),
    "{\"type\":7,\"error\":\"Error\"}\u{1e}"
)]
#[case::completion_error(
    HubMessage::Completion(CompletionMessage::with_error("1", "boom")),
    "{\"type\":3,\"invocationId\":\"1\",\"error\":\"boom\"}\u{1e}"
)]
#[case::bytes_as_base64(
    invocation("bytes", vec![Value::Bytes(vec![1, 2, 3])]),
    "{\"type\":1,\"target\":\"bytes\",\"arguments\":[\"AQID\"]}\u{1e}"
)]
fn json_writes_fields_in_wire_order(#[case] message: HubMessage, #[case] expected: &str) {
    let bytes = JsonHubProtocol.write_message(&message).expect("encode");
    assert_eq!(std::str::from_utf8(&bytes).expect("utf8"), expected);
}

#[test]
fn json_parses_concatenated_messages() {
    let payload = b"{\"type\":6}\x1e{\"type\":1,\"target\":\"test\",\"arguments\":[42]}\x1e";
    let messages = JsonHubProtocol
        .parse_messages(payload, &UntypedBinder)
        .expect("decode");
    assert_eq!(messages, vec![
        HubMessage::Ping,
        invocation("test", vec![Value::Int(42)])
    ]);
}

#[test]
fn json_field_order_is_not_significant() {
    let payload = b"{\"arguments\":[\"a\"],\"target\":\"t\",\"invocationId\":\"3\",\"type\":1}\x1e";
    let messages = JsonHubProtocol
        .parse_messages(payload, &UntypedBinder)
        .expect("decode");
    let HubMessage::Invocation(message) = &messages[0] else {
        panic!("expected an invocation");
    };
    assert_eq!(message.invocation_id.as_deref(), Some("3"));
    assert_eq!(message.target, "t");
}

#[test]
fn json_requires_trailing_record_separator() {
    let err = JsonHubProtocol
        .parse_messages(b"{\"type\":6}", &UntypedBinder)
        .expect_err("unterminated record");
    assert_eq!(err, ProtocolError::IncompleteMessage);
}

#[test]
fn json_completion_with_result_and_error_is_rejected() {
    let payload = b"{\"type\":3,\"invocationId\":\"1\",\"result\":42,\"error\":\"boom\"}\x1e";
    let err = JsonHubProtocol
        .parse_messages(payload, &UntypedBinder)
        .expect_err("both outcomes present");
    assert_eq!(
        err.to_string(),
        "Expected either 'error' or 'result' to be provided, but not both."
    );
}

#[test]
fn json_arity_failure_does_not_stop_next_message() {
    let binder = TestBinder::default()
        .with_target("test", vec![Shape::Int])
        .with_target("two", vec![Shape::Int]);
    let payload = b"{\"type\":1,\"target\":\"test\",\"arguments\":[42,24]}\x1e\
                    {\"type\":1,\"target\":\"two\",\"arguments\":[43]}\x1e";
    let messages = JsonHubProtocol.parse_messages(payload, &binder).expect("decode");
    assert_eq!(messages.len(), 2);
    assert_eq!(
        expect_binding_failure(&messages[0]).to_string(),
        "Invocation provides 2 argument(s) but target expects 1."
    );
    assert_eq!(messages[1], invocation("two", vec![Value::Int(43)]));
}

#[test]
fn json_binds_results_for_known_invocations() {
    let binder = TestBinder::default().with_result("1", Shape::Float);
    let payload = b"{\"type\":3,\"invocationId\":\"1\",\"result\":42}\x1e";
    let messages = JsonHubProtocol.parse_messages(payload, &binder).expect("decode");
    assert_eq!(messages, vec![HubMessage::Completion(
        CompletionMessage::with_result("1", Value::Float(42.0))
    )]);
}

#[test]
fn json_unknown_message_types_are_skipped() {
    let payload = b"{\"type\":99}\x1e{\"type\":6}\x1e";
    let messages = JsonHubProtocol
        .parse_messages(payload, &UntypedBinder)
        .expect("decode");
    assert_eq!(messages, vec![HubMessage::Ping]);
}

const INVOCATION_42: &[u8] = &[
    0x0C, 0x96, 0x01, 0x80, 0xC0, 0xA4, 0x74, 0x65, 0x73, 0x74, 0x91, 0x2A, 0x90,
];

fn headers_ab_cd() -> Headers {
    Headers::from([("a".to_owned(), "b".to_owned()), ("c".to_owned(), "d".to_owned())])
}

#[rstest]
#[case::invocation(invocation("test", vec![Value::Int(42)]), INVOCATION_42.to_vec())]
#[case::invocation_headers(
    HubMessage::Invocation(InvocationMessage {
        headers: Some(headers_ab_cd()),
        ..InvocationMessage::new("test", vec![Value::Int(42)])
    }),
    vec![0x14, 0x96, 0x01, 0x82, 0xA1, 0x61, 0xA1, 0x62, 0xA1, 0x63, 0xA1, 0x64, 0xC0, 0xA4,
         0x74, 0x65, 0x73, 0x74, 0x91, 0x2A, 0x90]
)]
#[case::stream_item(
    HubMessage::StreamItem(StreamItemMessage { headers: None, invocation_id: "id".into(), item: Value::Int(42) }),
    vec![0x07, 0x94, 0x02, 0x80, 0xA2, 0x69, 0x64, 0x2A]
)]
#[case::completion_result(
    HubMessage::Completion(CompletionMessage::with_result("id", Value::Int(42))),
    vec![0x08, 0x95, 0x03, 0x80, 0xA2, 0x69, 0x64, 0x03, 0x2A]
)]
#[case::completion_void(
    HubMessage::Completion(CompletionMessage::void("id")),
    vec![0x07, 0x94, 0x03, 0x80, 0xA2, 0x69, 0x64, 0x02]
)]
#[case::completion_error(
    HubMessage::Completion(CompletionMessage::with_error("id", "error")),
    vec![0x0D, 0x95, 0x03, 0x80, 0xA2, 0x69, 0x64, 0x01, 0xA5, 0x65, 0x72, 0x72, 0x6F, 0x72]
)]
#[case::stream_invocation(
    HubMessage::StreamInvocation(StreamInvocationMessage {
        headers: None,
        invocation_id: "id".into(),
        target: "test".into(),
        arguments: vec![Value::Int(42)],
        stream_ids: Some(vec!["stream".into()]),
    }),
    vec![0x15, 0x96, 0x04, 0x80, 0xA2, 0x69, 0x64, 0xA4, 0x74, 0x65, 0x73, 0x74, 0x91, 0x2A,
         0x91, 0xA6, 0x73, 0x74, 0x72, 0x65, 0x61, 0x6D]
)]
#[case::cancel(
    HubMessage::CancelInvocation(CancelInvocationMessage { headers: None, invocation_id: "id".into() }),
    vec![0x06, 0x93, 0x05, 0x80, 0xA2, 0x69, 0x64]
)]
#[case::ping(HubMessage::Ping, vec![0x02, 0x91, 0x06])]
#[case::close(HubMessage::Close(CloseMessage::default()), vec![0x04, 0x93, 0x07, 0xC0, 0xC2])]
#[case::close_error(
    HubMessage::Close(CloseMessage { error: Some("Error".into()), allow_reconnect: false }),
    vec![0x09, 0x93, 0x07, 0xA5, 0x45, 0x72, 0x72, 0x6F, 0x72, 0xC2]
)]
fn msgpack_encodes_and_decodes_reference_bytes(#[case] message: HubMessage, #[case] bytes: Vec<u8>) {
    let written = MessagePackHubProtocol.write_message(&message).expect("encode");
    assert_eq!(&written[..], &bytes[..]);
    let parsed = MessagePackHubProtocol
        .parse_messages(&bytes, &UntypedBinder)
        .expect("decode");
    assert_eq!(parsed, vec![message]);
}

#[test]
fn msgpack_rejects_short_payload() {
    let err = MessagePackHubProtocol
        .parse_messages(&INVOCATION_42[..12], &UntypedBinder)
        .expect_err("truncated message");
    assert_eq!(
        err.to_string(),
        "MessagePack message was length 11 but claimed to be length 12."
    );
}

#[test]
fn msgpack_type_failure_does_not_stop_next_message() {
    let binder = TestBinder::default()
        .with_target("test", vec![Shape::Int])
        .with_target("two", vec![Shape::Int]);
    let payload = [
        0x0C, 0x96, 0x01, 0x80, 0xC0, 0xA4, 0x74, 0x65, 0x73, 0x74, 0x91, 0xC3, 0x90, 0x0B, 0x96,
        0x01, 0x80, 0xC0, 0xA3, 0x74, 0x77, 0x6F, 0x91, 0x2B, 0x90,
    ];
    let messages = MessagePackHubProtocol
        .parse_messages(&payload, &binder)
        .expect("decode");
    assert_eq!(
        expect_binding_failure(&messages[0]),
        &ArgumentBindingError::Argument {
            index: 0,
            source: BindError::Mismatch {
                expected: "integer",
                found: "bool",
            },
        }
    );
    assert_eq!(messages[1], invocation("two", vec![Value::Int(43)]));
}

#[test]
fn msgpack_arity_failure_reports_counts() {
    let binder = TestBinder::default().with_target("test", vec![Shape::Int]);
    let payload = [
        0x0F, 0x96, 0x01, 0x80, 0xC0, 0xA4, 0x74, 0x65, 0x73, 0x74, 0x92, 0x2A, 0xA2, 0x34, 0x32,
        0x90,
    ];
    let messages = MessagePackHubProtocol
        .parse_messages(&payload, &binder)
        .expect("decode");
    assert_eq!(
        expect_binding_failure(&messages[0]).to_string(),
        "Invocation provides 2 argument(s) but target expects 1."
    );
}

#[test]
fn msgpack_tolerates_missing_stream_ids() {
    let payload = [
        0x0B, 0x95, 0x01, 0x80, 0xC0, 0xA4, 0x74, 0x65, 0x73, 0x74, 0x91, 0x2A,
    ];
    let messages = MessagePackHubProtocol
        .parse_messages(&payload, &UntypedBinder)
        .expect("decode");
    assert_eq!(messages, vec![invocation("test", vec![Value::Int(42)])]);
}

#[test]
fn binding_failures_are_never_written() {
    let message = HubMessage::InvocationBindingFailure(crate::message::InvocationBindingFailureMessage {
        invocation_id: None,
        target: "t".into(),
        cause: ArgumentBindingError::Arity {
            provided: 0,
            expected: 1,
        },
    });
    assert!(JsonHubProtocol.write_message(&message).is_err());
    assert!(MessagePackHubProtocol.write_message(&message).is_err());
}

/// Values both formats carry losslessly; bytes only survive the binary one.
fn arb_value(with_bytes: bool) -> BoxedStrategy<Value> {
    let mut leaves = vec![
        Just(Value::Nil).boxed(),
        any::<bool>().prop_map(Value::Bool).boxed(),
        any::<i64>().prop_map(Value::Int).boxed(),
        (-4000_i32..4000)
            .prop_map(|n| Value::Float(f64::from(n) / 4.0))
            .boxed(),
        "[a-z]{0,8}".prop_map(Value::String).boxed(),
    ];
    if with_bytes {
        leaves.push(
            prop::collection::vec(any::<u8>(), 0..6)
                .prop_map(Value::Bytes)
                .boxed(),
        );
    }
    proptest::strategy::Union::new(leaves)
        .prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..3)
                    .prop_map(|entries| Value::Map(entries.into_iter().collect())),
            ]
        })
        .boxed()
}

fn arb_headers() -> impl Strategy<Value = Option<Headers>> {
    proptest::option::of(prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 1..3))
}

fn arb_stream_ids() -> impl Strategy<Value = Option<Vec<String>>> {
    proptest::option::of(prop::collection::vec("[0-9]{1,3}", 1..3))
}

fn arb_message(value: BoxedStrategy<Value>) -> impl Strategy<Value = HubMessage> {
    const ID: &str = "[0-9]{1,4}";
    const TARGET: &str = "[a-zA-Z]{1,12}";
    const TEXT: &str = "[a-z ]{1,10}";
    let arguments = prop::collection::vec(value.clone(), 0..4);
    prop_oneof![
        (arb_headers(), proptest::option::of(ID), TARGET, arguments.clone(), arb_stream_ids())
            .prop_map(|(headers, invocation_id, target, arguments, stream_ids)| {
                HubMessage::Invocation(InvocationMessage {
                    headers,
                    invocation_id,
                    target,
                    arguments,
                    stream_ids,
                })
            }),
        (arb_headers(), ID, TARGET, arguments, arb_stream_ids()).prop_map(
            |(headers, invocation_id, target, arguments, stream_ids)| {
                HubMessage::StreamInvocation(StreamInvocationMessage {
                    headers,
                    invocation_id,
                    target,
                    arguments,
                    stream_ids,
                })
            }
        ),
        (arb_headers(), ID, value.clone()).prop_map(|(headers, invocation_id, item)| {
            HubMessage::StreamItem(StreamItemMessage {
                headers,
                invocation_id,
                item,
            })
        }),
        (
            arb_headers(),
            ID,
            proptest::option::of(value),
            proptest::option::of(TEXT)
        )
            .prop_map(|(headers, id, result, error)| {
                let completion = match (result, error) {
                    (Some(result), _) => CompletionMessage::with_result(id, result),
                    (None, Some(error)) => CompletionMessage::with_error(id, error),
                    (None, None) => CompletionMessage::void(id),
                };
                HubMessage::Completion(completion.headers(headers))
            }),
        (arb_headers(), ID).prop_map(|(headers, invocation_id)| {
            HubMessage::CancelInvocation(CancelInvocationMessage {
                headers,
                invocation_id,
            })
        }),
        Just(HubMessage::Ping),
        (proptest::option::of(TEXT), any::<bool>()).prop_map(|(error, allow_reconnect)| {
            HubMessage::Close(CloseMessage {
                error,
                allow_reconnect,
            })
        }),
    ]
}

fn round_trip(protocol: &dyn HubProtocol, message: &HubMessage) -> Vec<HubMessage> {
    let bytes = protocol.write_message(message).expect("encode");
    protocol.parse_messages(&bytes, &UntypedBinder).expect("decode")
}

proptest! {
    #[test]
    fn text_messages_survive_a_round_trip(message in arb_message(arb_value(false))) {
        prop_assert_eq!(round_trip(&JsonHubProtocol, &message), vec![message]);
    }

    #[test]
    fn binary_messages_survive_a_round_trip(message in arb_message(arb_value(true))) {
        prop_assert_eq!(round_trip(&MessagePackHubProtocol, &message), vec![message]);
    }
}
