//! MessagePack hub protocol.
//!
//! Each message is a MessagePack array preceded by its byte length encoded
//! as a little-endian base-128 varint of at most five bytes.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{
    Serialize,
    Serializer,
    ser::{Error as _, SerializeSeq},
};

use super::{HubProtocol, ProtocolError, TransferFormat};
use crate::{
    binder::{ArgumentBindingError, InvocationBinder, bind_arguments, bind_result},
    message::{
        CancelInvocationMessage,
        CloseMessage,
        CompletionMessage,
        Headers,
        HubMessage,
        InvocationBindingFailureMessage,
        InvocationMessage,
        MessageType,
        StreamInvocationMessage,
        StreamItemMessage,
    },
    value::Value,
};

const MAX_PREFIX_BYTES: usize = 5;

const COMPLETION_ERROR: i64 = 1;
const COMPLETION_VOID: i64 = 2;
const COMPLETION_RESULT: i64 = 3;

/// Binary protocol: length-prefixed positional MessagePack arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackHubProtocol;

impl HubProtocol for MessagePackHubProtocol {
    fn name(&self) -> &str { "messagepack" }

    fn version(&self) -> u32 { 1 }

    fn transfer_format(&self) -> TransferFormat { TransferFormat::Binary }

    fn parse_messages(
        &self,
        payload: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Vec<HubMessage>, ProtocolError> {
        let mut messages = Vec::new();
        let mut rest = payload;
        while !rest.is_empty() {
            let (claimed, prefix_len) = read_length_prefix(rest)?;
            let body = &rest[prefix_len..];
            if body.len() < claimed {
                return Err(ProtocolError::LengthMismatch {
                    actual: body.len(),
                    claimed,
                });
            }
            let (frame, remaining) = body.split_at(claimed);
            if let Some(message) = parse_frame(frame, binder)? {
                messages.push(message);
            }
            rest = remaining;
        }
        Ok(messages)
    }

    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let body = rmp_serde::to_vec(&BinaryMessage(message))
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        let mut buf = BytesMut::with_capacity(body.len() + MAX_PREFIX_BYTES);
        write_length_prefix(&mut buf, body.len());
        buf.put_slice(&body);
        Ok(buf.freeze())
    }
}

fn read_length_prefix(payload: &[u8]) -> Result<(usize, usize), ProtocolError> {
    let mut length = 0usize;
    for (index, byte) in payload.iter().take(MAX_PREFIX_BYTES).enumerate() {
        length |= usize::from(byte & 0x7f) << (index * 7);
        if byte & 0x80 == 0 {
            return Ok((length, index + 1));
        }
    }
    Err(ProtocolError::InvalidLengthPrefix)
}

fn write_length_prefix(buf: &mut BytesMut, mut length: usize) {
    loop {
        #[expect(clippy::cast_possible_truncation, reason = "masked to seven bits")]
        let mut byte = (length & 0x7f) as u8;
        length >>= 7;
        if length > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if length == 0 {
            break;
        }
    }
}

/// Positional fields of one decoded message array.
struct Positional(std::vec::IntoIter<Value>);

impl Positional {
    fn next(&mut self, name: &'static str) -> Result<Value, ProtocolError> {
        self.0.next().ok_or(ProtocolError::MissingField(name))
    }

    fn string(&mut self, name: &'static str) -> Result<String, ProtocolError> {
        match self.next(name)? {
            Value::String(s) => Ok(s),
            _ => Err(ProtocolError::InvalidField {
                field: name,
                expected: "string",
            }),
        }
    }

    fn optional_string(&mut self, name: &'static str) -> Result<Option<String>, ProtocolError> {
        match self.next(name)? {
            Value::Nil => Ok(None),
            Value::String(s) => Ok(Some(s)),
            _ => Err(ProtocolError::InvalidField {
                field: name,
                expected: "string or nil",
            }),
        }
    }

    fn headers(&mut self) -> Result<Option<Headers>, ProtocolError> {
        let invalid = ProtocolError::InvalidField {
            field: "headers",
            expected: "map of strings",
        };
        match self.next("headers")? {
            Value::Nil => Ok(None),
            Value::Map(entries) if entries.is_empty() => Ok(None),
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k, s)),
                    _ => Err(invalid.clone()),
                })
                .collect::<Result<Headers, _>>()
                .map(Some),
            _ => Err(invalid),
        }
    }

    /// Stream ids are trailing and optional for older servers.
    fn stream_ids(&mut self) -> Result<Option<Vec<String>>, ProtocolError> {
        let invalid = ProtocolError::InvalidField {
            field: "streamIds",
            expected: "array of strings",
        };
        match self.0.next() {
            None | Some(Value::Nil) => Ok(None),
            Some(Value::Array(items)) if items.is_empty() => Ok(None),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s),
                    _ => Err(invalid.clone()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(invalid),
        }
    }
}

fn parse_frame(
    frame: &[u8],
    binder: &dyn InvocationBinder,
) -> Result<Option<HubMessage>, ProtocolError> {
    let items: Vec<Value> =
        rmp_serde::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let mut fields = Positional(items.into_iter());
    let code = fields.next("type")?.as_i64().ok_or(ProtocolError::InvalidField {
        field: "type",
        expected: "integer",
    })?;
    let Some(message_type) = MessageType::from_code(code) else {
        tracing::debug!(message_type = code, "ignoring message of unknown type");
        return Ok(None);
    };

    let message = match message_type {
        MessageType::Invocation => {
            let headers = fields.headers()?;
            let invocation_id = fields.optional_string("invocationId")?;
            let target = fields.string("target")?;
            let arguments = fields.next("arguments")?;
            let stream_ids = fields.stream_ids()?;
            match bind_invocation_arguments(arguments, &target, binder) {
                Ok(arguments) => HubMessage::Invocation(InvocationMessage {
                    headers,
                    invocation_id,
                    target,
                    arguments,
                    stream_ids,
                }),
                Err(cause) => binding_failure(invocation_id, target, cause),
            }
        }
        MessageType::StreamInvocation => {
            let headers = fields.headers()?;
            let invocation_id = fields.string("invocationId")?;
            let target = fields.string("target")?;
            let arguments = fields.next("arguments")?;
            let stream_ids = fields.stream_ids()?;
            match bind_invocation_arguments(arguments, &target, binder) {
                Ok(arguments) => HubMessage::StreamInvocation(StreamInvocationMessage {
                    headers,
                    invocation_id,
                    target,
                    arguments,
                    stream_ids,
                }),
                Err(cause) => binding_failure(Some(invocation_id), target, cause),
            }
        }
        MessageType::StreamItem => {
            let headers = fields.headers()?;
            let invocation_id = fields.string("invocationId")?;
            let item = bind_result(binder, &invocation_id, fields.next("item")?);
            HubMessage::StreamItem(StreamItemMessage {
                headers,
                invocation_id,
                item,
            })
        }
        MessageType::Completion => {
            let headers = fields.headers()?;
            let invocation_id = fields.string("invocationId")?;
            let kind = fields.next("resultKind")?.as_i64();
            let completion = match kind {
                Some(COMPLETION_ERROR) => {
                    let error = fields.string("error")?;
                    CompletionMessage::with_error(invocation_id, error)
                }
                Some(COMPLETION_VOID) => CompletionMessage::void(invocation_id),
                Some(COMPLETION_RESULT) => {
                    let result = bind_result(binder, &invocation_id, fields.next("result")?);
                    CompletionMessage::with_result(invocation_id, result)
                }
                _ => {
                    return Err(ProtocolError::Malformed(
                        "invalid invocation result kind".into(),
                    ));
                }
            };
            HubMessage::Completion(completion.headers(headers))
        }
        MessageType::CancelInvocation => HubMessage::CancelInvocation(CancelInvocationMessage {
            headers: fields.headers()?,
            invocation_id: fields.string("invocationId")?,
        }),
        MessageType::Ping => HubMessage::Ping,
        MessageType::Close => {
            let error = fields.optional_string("error")?;
            let allow_reconnect = match fields.0.next() {
                None | Some(Value::Nil) => false,
                Some(Value::Bool(b)) => b,
                Some(_) => {
                    return Err(ProtocolError::InvalidField {
                        field: "allowReconnect",
                        expected: "bool",
                    });
                }
            };
            HubMessage::Close(CloseMessage {
                error,
                allow_reconnect,
            })
        }
    };
    Ok(Some(message))
}

fn bind_invocation_arguments(
    arguments: Value,
    target: &str,
    binder: &dyn InvocationBinder,
) -> Result<Vec<Value>, ArgumentBindingError> {
    let arguments = match arguments {
        Value::Array(items) => items,
        other => {
            return Err(ArgumentBindingError::Malformed(format!(
                "expected an array of arguments, found {}",
                other.kind()
            )));
        }
    };
    let shapes = binder.parameter_shapes(target);
    bind_arguments(shapes.as_deref(), arguments)
}

fn binding_failure(
    invocation_id: Option<String>,
    target: String,
    cause: ArgumentBindingError,
) -> HubMessage {
    HubMessage::InvocationBindingFailure(InvocationBindingFailureMessage {
        invocation_id,
        target,
        cause,
    })
}

/// Header map written as an empty map when absent.
struct BinaryHeaders<'a>(Option<&'a Headers>);

impl Serialize for BinaryHeaders<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Some(headers) => serializer.collect_map(headers),
            None => serializer.collect_map(std::iter::empty::<(&str, &str)>()),
        }
    }
}

struct BinaryStreamIds<'a>(Option<&'a Vec<String>>);

impl Serialize for BinaryStreamIds<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.into_iter().flatten())
    }
}

struct BinaryMessage<'a>(&'a HubMessage);

impl Serialize for BinaryMessage<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(message_type) = self.0.message_type() else {
            return Err(S::Error::custom("binding failures are never written"));
        };
        let code = message_type.code();
        match self.0 {
            HubMessage::Invocation(m) => {
                let mut seq = serializer.serialize_seq(Some(6))?;
                seq.serialize_element(&code)?;
                seq.serialize_element(&BinaryHeaders(m.headers.as_ref()))?;
                seq.serialize_element(&m.invocation_id)?;
                seq.serialize_element(&m.target)?;
                seq.serialize_element(&m.arguments)?;
                seq.serialize_element(&BinaryStreamIds(m.stream_ids.as_ref()))?;
                seq.end()
            }
            HubMessage::StreamInvocation(m) => {
                let mut seq = serializer.serialize_seq(Some(6))?;
                seq.serialize_element(&code)?;
                seq.serialize_element(&BinaryHeaders(m.headers.as_ref()))?;
                seq.serialize_element(&m.invocation_id)?;
                seq.serialize_element(&m.target)?;
                seq.serialize_element(&m.arguments)?;
                seq.serialize_element(&BinaryStreamIds(m.stream_ids.as_ref()))?;
                seq.end()
            }
            HubMessage::StreamItem(m) => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(&code)?;
                seq.serialize_element(&BinaryHeaders(m.headers.as_ref()))?;
                seq.serialize_element(&m.invocation_id)?;
                seq.serialize_element(&m.item)?;
                seq.end()
            }
            HubMessage::Completion(m) => {
                let len = if m.result().is_some() || m.error().is_some() { 5 } else { 4 };
                let mut seq = serializer.serialize_seq(Some(len))?;
                seq.serialize_element(&code)?;
                seq.serialize_element(&BinaryHeaders(m.header_map()))?;
                seq.serialize_element(m.invocation_id())?;
                match (m.result(), m.error()) {
                    (_, Some(error)) => {
                        seq.serialize_element(&COMPLETION_ERROR)?;
                        seq.serialize_element(error)?;
                    }
                    (Some(result), None) => {
                        seq.serialize_element(&COMPLETION_RESULT)?;
                        seq.serialize_element(result)?;
                    }
                    (None, None) => seq.serialize_element(&COMPLETION_VOID)?,
                }
                seq.end()
            }
            HubMessage::CancelInvocation(m) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&code)?;
                seq.serialize_element(&BinaryHeaders(m.headers.as_ref()))?;
                seq.serialize_element(&m.invocation_id)?;
                seq.end()
            }
            HubMessage::Ping => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(&code)?;
                seq.end()
            }
            HubMessage::Close(m) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&code)?;
                seq.serialize_element(&m.error)?;
                seq.serialize_element(&m.allow_reconnect)?;
                seq.end()
            }
            HubMessage::InvocationBindingFailure(_) => {
                Err(S::Error::custom("binding failures are never written"))
            }
        }
    }
}
