//! Frame codec: JSON positional arrays and the compact binary form.

use bytes::Bytes;
use serde_json::{json, Value};

use super::{event, Frame, Payload, WireMessage};

const KIND_PUSH: u8 = 0;
const KIND_REPLY: u8 = 1;
const KIND_BROADCAST: u8 = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown binary frame kind: {0}")]
    UnknownKind(u8),
    #[error("declared length reads past end of buffer")]
    Truncated,
    #[error("text frame is not a well-formed frame: {0}")]
    MalformedText(String),
    #[error("frame field exceeds 255 bytes: {0}")]
    FieldTooLong(&'static str),
    #[error("binary payload requires a join_ref for push frames")]
    MissingJoinRef,
    #[error("binary reply requires join_ref and ref")]
    MissingReplyRefs,
}

/// Encodes a frame for the transport. Binary payloads select the binary
/// form; everything else is the JSON 5-tuple
/// `[join_ref, ref, topic, event, payload]`.
pub fn encode(frame: &Frame) -> Result<WireMessage, WireError> {
    match &frame.payload {
        Payload::Json(value) => {
            let tuple = json!([
                frame.join_ref,
                frame.reference,
                frame.topic,
                frame.event,
                value,
            ]);
            Ok(WireMessage::Text(tuple.to_string()))
        }
        Payload::Binary(payload) => {
            if frame.join_ref.is_some() {
                encode_push(frame, payload)
            } else {
                encode_broadcast(frame, payload)
            }
        }
        Payload::BinaryReply { status, response } => encode_reply(frame, status, response),
    }
}

fn push_len(buf: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), WireError> {
    let len = value.len();
    if len > u8::MAX as usize {
        return Err(WireError::FieldTooLong(field));
    }
    buf.push(len as u8);
    Ok(())
}

fn encode_push(frame: &Frame, payload: &[u8]) -> Result<WireMessage, WireError> {
    let join_ref = frame.join_ref.as_deref().ok_or(WireError::MissingJoinRef)?;
    let mut buf = Vec::with_capacity(4 + join_ref.len() + frame.topic.len() + frame.event.len() + payload.len());
    buf.push(KIND_PUSH);
    push_len(&mut buf, "join_ref", join_ref)?;
    push_len(&mut buf, "topic", &frame.topic)?;
    push_len(&mut buf, "event", &frame.event)?;
    buf.extend_from_slice(join_ref.as_bytes());
    buf.extend_from_slice(frame.topic.as_bytes());
    buf.extend_from_slice(frame.event.as_bytes());
    buf.extend_from_slice(payload);
    Ok(WireMessage::Binary(buf))
}

fn encode_reply(frame: &Frame, status: &str, response: &[u8]) -> Result<WireMessage, WireError> {
    let (join_ref, reference) = match (&frame.join_ref, &frame.reference) {
        (Some(j), Some(r)) => (j.as_str(), r.as_str()),
        _ => return Err(WireError::MissingReplyRefs),
    };
    let mut buf = Vec::with_capacity(5 + join_ref.len() + reference.len() + frame.topic.len() + status.len() + response.len());
    buf.push(KIND_REPLY);
    push_len(&mut buf, "join_ref", join_ref)?;
    push_len(&mut buf, "ref", reference)?;
    push_len(&mut buf, "topic", &frame.topic)?;
    push_len(&mut buf, "status", status)?;
    buf.extend_from_slice(join_ref.as_bytes());
    buf.extend_from_slice(reference.as_bytes());
    buf.extend_from_slice(frame.topic.as_bytes());
    buf.extend_from_slice(status.as_bytes());
    buf.extend_from_slice(response);
    Ok(WireMessage::Binary(buf))
}

fn encode_broadcast(frame: &Frame, payload: &[u8]) -> Result<WireMessage, WireError> {
    let mut buf = Vec::with_capacity(3 + frame.topic.len() + frame.event.len() + payload.len());
    buf.push(KIND_BROADCAST);
    push_len(&mut buf, "topic", &frame.topic)?;
    push_len(&mut buf, "event", &frame.event)?;
    buf.extend_from_slice(frame.topic.as_bytes());
    buf.extend_from_slice(frame.event.as_bytes());
    buf.extend_from_slice(payload);
    Ok(WireMessage::Binary(buf))
}

/// Decodes an inbound transport message, dispatching on text vs binary.
pub fn decode(message: &WireMessage) -> Result<Frame, WireError> {
    match message {
        WireMessage::Text(text) => decode_text(text),
        WireMessage::Binary(bytes) => decode_binary(bytes),
    }
}

fn decode_text(text: &str) -> Result<Frame, WireError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| WireError::MalformedText(err.to_string()))?;
    match value {
        Value::Array(mut items) if items.len() == 5 => {
            let payload = items.pop().expect("len checked");
            let event = take_string(items.pop().expect("len checked"), "event")?;
            let topic = take_string(items.pop().expect("len checked"), "topic")?;
            let reference = take_opt_string(items.pop().expect("len checked"), "ref")?;
            let join_ref = take_opt_string(items.pop().expect("len checked"), "join_ref")?;
            Ok(Frame {
                join_ref,
                reference,
                topic,
                event,
                payload: Payload::Json(payload),
            })
        }
        Value::Object(map) => {
            let topic = field_string(&map, "topic")?;
            let event = field_string(&map, "event")?;
            let payload = map
                .get("payload")
                .cloned()
                .unwrap_or(Value::Object(Default::default()));
            let reference = opt_field_string(&map, "ref");
            let join_ref = opt_field_string(&map, "join_ref");
            Ok(Frame {
                join_ref,
                reference,
                topic,
                event,
                payload: Payload::Json(payload),
            })
        }
        other => Err(WireError::MalformedText(format!(
            "expected a 5-element array or an object, got {other}"
        ))),
    }
}

fn take_string(value: Value, field: &str) -> Result<String, WireError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(WireError::MalformedText(format!(
            "{field} must be a string, got {other}"
        ))),
    }
}

fn take_opt_string(value: Value, field: &str) -> Result<Option<String>, WireError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(WireError::MalformedText(format!(
            "{field} must be a string or null, got {other}"
        ))),
    }
}

fn field_string(map: &serde_json::Map<String, Value>, field: &str) -> Result<String, WireError> {
    map.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| WireError::MalformedText(format!("missing string field {field}")))
}

fn opt_field_string(map: &serde_json::Map<String, Value>, field: &str) -> Option<String> {
    map.get(field).and_then(Value::as_str).map(str::to_string)
}

fn decode_binary(bytes: &[u8]) -> Result<Frame, WireError> {
    let mut cursor = Cursor::new(bytes);
    match cursor.read_u8()? {
        KIND_PUSH => {
            let join_ref_len = cursor.read_u8()? as usize;
            let topic_len = cursor.read_u8()? as usize;
            let event_len = cursor.read_u8()? as usize;
            let join_ref = cursor.read_str(join_ref_len)?;
            let topic = cursor.read_str(topic_len)?;
            let event = cursor.read_str(event_len)?;
            Ok(Frame {
                join_ref: Some(join_ref),
                reference: None,
                topic,
                event,
                payload: Payload::Binary(Bytes::copy_from_slice(cursor.rest())),
            })
        }
        KIND_REPLY => {
            let join_ref_len = cursor.read_u8()? as usize;
            let ref_len = cursor.read_u8()? as usize;
            let topic_len = cursor.read_u8()? as usize;
            let status_len = cursor.read_u8()? as usize;
            let join_ref = cursor.read_str(join_ref_len)?;
            let reference = cursor.read_str(ref_len)?;
            let topic = cursor.read_str(topic_len)?;
            let status = cursor.read_str(status_len)?;
            Ok(Frame {
                join_ref: Some(join_ref),
                reference: Some(reference),
                topic,
                event: event::REPLY.to_string(),
                payload: Payload::BinaryReply {
                    status,
                    response: Bytes::copy_from_slice(cursor.rest()),
                },
            })
        }
        KIND_BROADCAST => {
            let topic_len = cursor.read_u8()? as usize;
            let event_len = cursor.read_u8()? as usize;
            let topic = cursor.read_str(topic_len)?;
            let event = cursor.read_str(event_len)?;
            Ok(Frame {
                join_ref: None,
                reference: None,
                topic,
                event,
                payload: Payload::Binary(Bytes::copy_from_slice(cursor.rest())),
            })
        }
        other => Err(WireError::UnknownKind(other)),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::Truncated);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_str(&mut self, len: usize) -> Result<String, WireError> {
        if self.pos + len > self.bytes.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        String::from_utf8(slice.to_vec()).map_err(|_| WireError::Truncated)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_json_frame() {
        let frame = Frame::new(
            Some("1".into()),
            Some("2".into()),
            "room:lobby",
            "phx_join",
            Payload::Json(json!({"config": {"private": false}})),
        );
        let encoded = encode(&frame).expect("encode");
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(frame, decoded);
    }

    #[test]
    fn json_frame_with_absent_refs() {
        let frame = Frame::new(
            None,
            None,
            "t",
            "broadcast",
            Payload::Json(json!({"event": "hi"})),
        );
        let encoded = encode(&frame).expect("encode");
        match &encoded {
            WireMessage::Text(text) => assert!(text.starts_with("[null,null,")),
            WireMessage::Binary(_) => panic!("json payload must encode as text"),
        }
        assert_eq!(decode(&encoded).expect("decode"), frame);
    }

    #[test]
    fn decode_object_form() {
        let text = r#"{"ref":"1","event":"phx_reply","topic":"t1","payload":{"status":"ok","response":{}}}"#;
        let frame = decode(&WireMessage::Text(text.into())).expect("decode");
        assert_eq!(frame.reference.as_deref(), Some("1"));
        assert_eq!(frame.event, "phx_reply");
        let (status, _) = frame.reply().expect("reply payload");
        assert_eq!(status, "ok");
    }

    #[test]
    fn encode_decode_binary_push() {
        let frame = Frame::new(
            Some("7".into()),
            None,
            "topic",
            "event",
            Payload::Binary(Bytes::from_static(&[1, 2, 3, 4])),
        );
        let encoded = encode(&frame).expect("encode");
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(frame, decoded);
        assert_eq!(encode(&decoded).expect("re-encode"), encoded);
    }

    #[test]
    fn encode_decode_binary_reply() {
        let frame = Frame::new(
            Some("3".into()),
            Some("12".into()),
            "topic",
            "phx_reply",
            Payload::BinaryReply {
                status: "ok".into(),
                response: Bytes::from_static(b"\xde\xad"),
            },
        );
        let encoded = encode(&frame).expect("encode");
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(frame, decoded);
        assert_eq!(encode(&decoded).expect("re-encode"), encoded);
    }

    #[test]
    fn encode_decode_binary_broadcast() {
        let frame = Frame::new(
            None,
            None,
            "topic",
            "event",
            Payload::Binary(Bytes::from_static(b"payload")),
        );
        let encoded = encode(&frame).expect("encode");
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(frame, decoded);
        assert_eq!(encode(&decoded).expect("re-encode"), encoded);
    }

    #[test]
    fn binary_reply_decodes_to_phx_reply() {
        let frame = Frame::new(
            Some("1".into()),
            Some("2".into()),
            "t",
            "ignored",
            Payload::BinaryReply {
                status: "error".into(),
                response: Bytes::new(),
            },
        );
        let encoded = encode(&frame).expect("encode");
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(decoded.event, "phx_reply");
        let (status, _) = decoded.reply().expect("reply");
        assert_eq!(status, "error");
    }

    #[test]
    fn unknown_kind_rejected() {
        let err = decode(&WireMessage::Binary(vec![9, 0, 0, 0])).unwrap_err();
        assert_eq!(err, WireError::UnknownKind(9));
    }

    #[test]
    fn truncated_length_rejected() {
        // Declares a 10-byte topic but the buffer ends early.
        let err = decode(&WireMessage::Binary(vec![2, 10, 1, b'a'])).unwrap_err();
        assert_eq!(err, WireError::Truncated);
    }

    #[test]
    fn malformed_text_rejected() {
        assert!(matches!(
            decode(&WireMessage::Text("[1,2,3]".into())),
            Err(WireError::MalformedText(_))
        ));
        assert!(matches!(
            decode(&WireMessage::Text("not json".into())),
            Err(WireError::MalformedText(_))
        ));
    }

    #[test]
    fn overlong_field_rejected() {
        let frame = Frame::new(
            Some("x".repeat(300)),
            None,
            "t",
            "e",
            Payload::Binary(Bytes::new()),
        );
        assert_eq!(
            encode(&frame).unwrap_err(),
            WireError::FieldTooLong("join_ref")
        );
    }
}
