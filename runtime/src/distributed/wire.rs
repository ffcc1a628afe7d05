//! Wire frames for distributed host/worker mode (spec §4.10, §6).
//!
//! Frames are newline-delimited JSON, one frame per line — the plain
//! "framed JSON over a byte stream" idiom this corpus reaches for whenever
//! a duplex transport isn't gRPC. `data_bytes` carries the UTF-8 JSON
//! encoding of the payload directly rather than an opaque, codec-specific
//! blob: every payload this core moves is already a [`serde_json::Value`],
//! so there is no second encoding step to hide behind bytes.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireAgentId {
    pub r#type: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum WireSubscription {
    TypeSubscription { topic_type: String, agent_type: String },
    TypePrefixSubscription { topic_type_prefix: String, agent_type: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    RegisterAgentType {
        r#type: String,
    },
    AddSubscription {
        subscription: WireSubscription,
    },
    RpcRequest {
        request_id: String,
        source: WireAgentId,
        target: WireAgentId,
        data_type: String,
        data_bytes: Vec<u8>,
    },
    RpcResponse {
        request_id: String,
        result_type: Option<String>,
        result_bytes: Option<Vec<u8>>,
        error: Option<String>,
    },
    Event {
        topic_type: String,
        topic_source: String,
        data_type: String,
        data_bytes: Vec<u8>,
    },
}

/// Newline-delimited JSON codec over [`Frame`]. Blank lines are skipped
/// rather than treated as a parse error, so a stray keep-alive newline
/// doesn't tear down the connection.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = RuntimeError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RuntimeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(pos);
            src.advance(1);
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_slice(&line)?));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_register_frame_through_the_codec() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::RegisterAgentType { r#type: "worker".into() }, &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        matches!(decoded, Frame::RegisterAgentType { r#type } if r#type == "worker");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_returns_none_until_a_newline_arrives() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&b"{\"kind\":\"register_agent_type\""[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn blank_lines_between_frames_are_skipped() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&b"\n\n{\"kind\":\"register_agent_type\",\"type\":\"w\"}\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::RegisterAgentType { r#type } if r#type == "w"));
    }

    #[test]
    fn rpc_request_round_trips_with_data_bytes() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let frame = Frame::RpcRequest {
            request_id: "r1".into(),
            source: WireAgentId { r#type: "a".into(), key: "1".into() },
            target: WireAgentId { r#type: "b".into(), key: "2".into() },
            data_type: "json".into(),
            data_bytes: b"\"ping\"".to_vec(),
        };
        codec.encode(frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Frame::RpcRequest { request_id, data_bytes, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(data_bytes, b"\"ping\"");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
