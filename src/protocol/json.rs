//! JSON hub protocol.

use bytes::Bytes;
use serde::{
    Serialize,
    Serializer,
    ser::{Error as _, SerializeMap},
};

use super::{HubProtocol, ProtocolError, RECORD_SEPARATOR, TransferFormat};
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
    value::{TextValue, Value},
};

/// Text protocol: one JSON object per record, terminated by `0x1E`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHubProtocol;

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str { "json" }

    fn version(&self) -> u32 { 1 }

    fn transfer_format(&self) -> TransferFormat { TransferFormat::Text }

    fn parse_messages(
        &self,
        payload: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Vec<HubMessage>, ProtocolError> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        if payload.last() != Some(&RECORD_SEPARATOR) {
            return Err(ProtocolError::IncompleteMessage);
        }
        let mut messages = Vec::new();
        for record in payload[..payload.len() - 1].split(|b| *b == RECORD_SEPARATOR) {
            if let Some(message) = parse_record(record, binder)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let mut buf = serde_json::to_vec(&JsonMessage(message))
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        buf.push(RECORD_SEPARATOR);
        Ok(Bytes::from(buf))
    }
}

/// Named fields of one decoded JSON object.
struct Fields(Vec<(String, Value)>);

impl Fields {
    fn take(&mut self, name: &str) -> Option<Value> {
        let index = self.0.iter().position(|(k, _)| k == name)?;
        Some(self.0.swap_remove(index).1)
    }

    fn optional_string(&mut self, name: &'static str) -> Result<Option<String>, ProtocolError> {
        match self.take(name) {
            None | Some(Value::Nil) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(ProtocolError::InvalidField {
                field: name,
                expected: "string",
            }),
        }
    }

    fn string(&mut self, name: &'static str) -> Result<String, ProtocolError> {
        self.optional_string(name)?
            .ok_or(ProtocolError::MissingField(name))
    }

    fn headers(&mut self) -> Result<Option<Headers>, ProtocolError> {
        let invalid = ProtocolError::InvalidField {
            field: "headers",
            expected: "object of strings",
        };
        match self.take("headers") {
            None | Some(Value::Nil) => Ok(None),
            Some(Value::Map(entries)) if entries.is_empty() => Ok(None),
            Some(Value::Map(entries)) => entries
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k, s)),
                    _ => Err(invalid.clone()),
                })
                .collect::<Result<Headers, _>>()
                .map(Some),
            Some(_) => Err(invalid),
        }
    }

    fn stream_ids(&mut self) -> Result<Option<Vec<String>>, ProtocolError> {
        let invalid = ProtocolError::InvalidField {
            field: "streamIds",
            expected: "array of strings",
        };
        match self.take("streamIds") {
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

fn parse_record(
    record: &[u8],
    binder: &dyn InvocationBinder,
) -> Result<Option<HubMessage>, ProtocolError> {
    let value: Value =
        serde_json::from_slice(record).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Value::Map(entries) = value else {
        return Err(ProtocolError::Malformed("expected a JSON object".into()));
    };
    let mut fields = Fields(entries);
    let code = fields
        .take("type")
        .ok_or(ProtocolError::MissingField("type"))?
        .as_i64()
        .ok_or(ProtocolError::InvalidField {
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
            let stream_ids = fields.stream_ids()?;
            match bind_invocation_arguments(&mut fields, &target, binder) {
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
            let stream_ids = fields.stream_ids()?;
            match bind_invocation_arguments(&mut fields, &target, binder) {
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
            let item = fields.take("item").unwrap_or_default();
            let item = bind_result(binder, &invocation_id, item);
            HubMessage::StreamItem(StreamItemMessage {
                headers,
                invocation_id,
                item,
            })
        }
        MessageType::Completion => {
            let headers = fields.headers()?;
            let invocation_id = fields.string("invocationId")?;
            let error = fields.optional_string("error")?;
            let result = fields.take("result");
            if result.is_some() && error.is_some() {
                return Err(ProtocolError::ResultAndError);
            }
            let result = result.map(|r| bind_result(binder, &invocation_id, r));
            let completion = match (result, error) {
                (Some(result), _) => CompletionMessage::with_result(invocation_id, result),
                (None, Some(error)) => CompletionMessage::with_error(invocation_id, error),
                (None, None) => CompletionMessage::void(invocation_id),
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
            let allow_reconnect = match fields.take("allowReconnect") {
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
    fields: &mut Fields,
    target: &str,
    binder: &dyn InvocationBinder,
) -> Result<Vec<Value>, ArgumentBindingError> {
    let arguments = match fields.take("arguments") {
        None | Some(Value::Nil) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => {
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

/// Writes fields in wire order; `serde_json::Map` would sort them.
struct JsonMessage<'a>(&'a HubMessage);

struct TextArguments<'a>(&'a [Value]);

impl Serialize for TextArguments<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(TextValue))
    }
}

fn write_headers<M: SerializeMap>(map: &mut M, headers: Option<&Headers>) -> Result<(), M::Error> {
    match headers {
        Some(headers) if !headers.is_empty() => map.serialize_entry("headers", headers),
        _ => Ok(()),
    }
}

fn write_stream_ids<M: SerializeMap>(
    map: &mut M,
    stream_ids: Option<&Vec<String>>,
) -> Result<(), M::Error> {
    match stream_ids {
        Some(ids) if !ids.is_empty() => map.serialize_entry("streamIds", ids),
        _ => Ok(()),
    }
}

impl Serialize for JsonMessage<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(message_type) = self.0.message_type() else {
            return Err(S::Error::custom("binding failures are never written"));
        };
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &message_type.code())?;
        match self.0 {
            HubMessage::Invocation(m) => {
                write_headers(&mut map, m.headers.as_ref())?;
                if let Some(id) = &m.invocation_id {
                    map.serialize_entry("invocationId", id)?;
                }
                map.serialize_entry("target", &m.target)?;
                map.serialize_entry("arguments", &TextArguments(&m.arguments))?;
                write_stream_ids(&mut map, m.stream_ids.as_ref())?;
            }
            HubMessage::StreamInvocation(m) => {
                write_headers(&mut map, m.headers.as_ref())?;
                map.serialize_entry("invocationId", &m.invocation_id)?;
                map.serialize_entry("target", &m.target)?;
                map.serialize_entry("arguments", &TextArguments(&m.arguments))?;
                write_stream_ids(&mut map, m.stream_ids.as_ref())?;
            }
            HubMessage::StreamItem(m) => {
                write_headers(&mut map, m.headers.as_ref())?;
                map.serialize_entry("invocationId", &m.invocation_id)?;
                map.serialize_entry("item", &TextValue(&m.item))?;
            }
            HubMessage::Completion(m) => {
                write_headers(&mut map, m.header_map())?;
                map.serialize_entry("invocationId", m.invocation_id())?;
                if let Some(result) = m.result() {
                    map.serialize_entry("result", &TextValue(result))?;
                }
                if let Some(error) = m.error() {
                    map.serialize_entry("error", error)?;
                }
            }
            HubMessage::CancelInvocation(m) => {
                write_headers(&mut map, m.headers.as_ref())?;
                map.serialize_entry("invocationId", &m.invocation_id)?;
            }
            HubMessage::Ping | HubMessage::InvocationBindingFailure(_) => {}
            HubMessage::Close(m) => {
                if let Some(error) = &m.error {
                    map.serialize_entry("error", error)?;
                }
                if m.allow_reconnect {
                    map.serialize_entry("allowReconnect", &true)?;
                }
            }
        }
        map.end()
    }
}
