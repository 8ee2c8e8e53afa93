//! Wire protocol.
//!
//! Every frame is `[u32 big-endian length][protobuf payload]`. Clients send
//! [`Request`]s; the broker answers each with a [`Response`] carrying the same
//! `rid` and pushes deliveries as unsolicited responses.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::message::{BasicProperties, DeliveryMode};

/// Frames larger than this close the connection.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;
const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("failed to decode frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] prost::EncodeError),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Properties {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(int32, tag = "2")]
    pub delivery_mode: i32,
    #[prost(string, tag = "3")]
    pub routing_key: String,
}

impl From<&BasicProperties> for Properties {
    fn from(p: &BasicProperties) -> Self {
        Self {
            id: p.id.clone(),
            delivery_mode: p.delivery_mode.code(),
            routing_key: p.routing_key.clone(),
        }
    }
}

impl From<Properties> for BasicProperties {
    fn from(p: Properties) -> Self {
        Self {
            id: p.id,
            delivery_mode: DeliveryMode::from_code(p.delivery_mode),
            routing_key: p.routing_key,
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OpenChannel {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CloseChannel {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeclareExchange {
    #[prost(string, tag = "1")]
    pub name: String,
    /// `ExchangeType` code.
    #[prost(int32, tag = "2")]
    pub kind: i32,
    #[prost(bool, tag = "3")]
    pub durable: bool,
    #[prost(bool, tag = "4")]
    pub auto_delete: bool,
    #[prost(btree_map = "string, string", tag = "5")]
    pub args: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteExchange {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeclareQueue {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bool, tag = "2")]
    pub durable: bool,
    #[prost(bool, tag = "3")]
    pub exclusive: bool,
    #[prost(bool, tag = "4")]
    pub auto_delete: bool,
    #[prost(btree_map = "string, string", tag = "5")]
    pub args: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteQueue {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueueBind {
    #[prost(string, tag = "1")]
    pub exchange: String,
    #[prost(string, tag = "2")]
    pub queue: String,
    #[prost(string, tag = "3")]
    pub binding_key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueueUnbind {
    #[prost(string, tag = "1")]
    pub exchange: String,
    #[prost(string, tag = "2")]
    pub queue: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BasicPublish {
    #[prost(string, tag = "1")]
    pub exchange: String,
    #[prost(message, optional, tag = "2")]
    pub properties: Option<Properties>,
    #[prost(bytes = "bytes", tag = "3")]
    pub body: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BasicAck {
    #[prost(string, tag = "1")]
    pub queue: String,
    #[prost(string, tag = "2")]
    pub message_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BasicConsume {
    #[prost(string, tag = "1")]
    pub consumer_tag: String,
    #[prost(string, tag = "2")]
    pub queue: String,
    #[prost(bool, tag = "3")]
    pub auto_ack: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BasicCancel {
    #[prost(string, tag = "1")]
    pub consumer_tag: String,
    #[prost(string, tag = "2")]
    pub queue: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(uint64, tag = "1")]
    pub rid: u64,
    #[prost(string, tag = "2")]
    pub cid: String,
    #[prost(
        oneof = "request::Body",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21"
    )]
    pub body: Option<request::Body>,
}

pub mod request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "10")]
        OpenChannel(super::OpenChannel),
        #[prost(message, tag = "11")]
        CloseChannel(super::CloseChannel),
        #[prost(message, tag = "12")]
        DeclareExchange(super::DeclareExchange),
        #[prost(message, tag = "13")]
        DeleteExchange(super::DeleteExchange),
        #[prost(message, tag = "14")]
        DeclareQueue(super::DeclareQueue),
        #[prost(message, tag = "15")]
        DeleteQueue(super::DeleteQueue),
        #[prost(message, tag = "16")]
        QueueBind(super::QueueBind),
        #[prost(message, tag = "17")]
        QueueUnbind(super::QueueUnbind),
        #[prost(message, tag = "18")]
        BasicPublish(super::BasicPublish),
        #[prost(message, tag = "19")]
        BasicAck(super::BasicAck),
        #[prost(message, tag = "20")]
        BasicConsume(super::BasicConsume),
        #[prost(message, tag = "21")]
        BasicCancel(super::BasicCancel),
    }
}

/// Outcome of one request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommonResponse {
    #[prost(uint64, tag = "1")]
    pub rid: u64,
    #[prost(string, tag = "2")]
    pub cid: String,
    #[prost(bool, tag = "3")]
    pub ok: bool,
}

/// A message pushed to a subscribed channel.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeliverResponse {
    #[prost(string, tag = "1")]
    pub cid: String,
    #[prost(string, tag = "2")]
    pub consumer_tag: String,
    #[prost(message, optional, tag = "3")]
    pub properties: Option<Properties>,
    #[prost(bytes = "bytes", tag = "4")]
    pub body: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(oneof = "response::Body", tags = "1, 2")]
    pub body: Option<response::Body>,
}

pub mod response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Common(super::CommonResponse),
        #[prost(message, tag = "2")]
        Deliver(super::DeliverResponse),
    }
}

impl Request {
    pub fn new(rid: u64, cid: impl Into<String>, body: request::Body) -> Self {
        Self {
            rid,
            cid: cid.into(),
            body: Some(body),
        }
    }
}

impl Response {
    pub fn common(rid: u64, cid: impl Into<String>, ok: bool) -> Self {
        Self {
            body: Some(response::Body::Common(CommonResponse {
                rid,
                cid: cid.into(),
                ok,
            })),
        }
    }

    pub fn deliver(
        cid: impl Into<String>,
        consumer_tag: impl Into<String>,
        properties: &BasicProperties,
        body: Bytes,
    ) -> Self {
        Self {
            body: Some(response::Body::Deliver(DeliverResponse {
                cid: cid.into(),
                consumer_tag: consumer_tag.into(),
                properties: Some(Properties::from(properties)),
                body,
            })),
        }
    }
}

/// Appends `msg` to `dst` as one length-prefixed frame.
pub fn encode_frame<M: prost::Message>(msg: &M, dst: &mut BytesMut) -> Result<(), FrameError> {
    let len = msg.encoded_len();
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    dst.reserve(LEN_PREFIX + len);
    dst.put_u32(len as u32);
    msg.encode(dst)?;
    Ok(())
}

/// Splits one complete frame off the front of `src`. `Ok(None)` means more
/// bytes are needed.
pub fn decode_frame<M: prost::Message + Default>(
    src: &mut BytesMut,
) -> Result<Option<M>, FrameError> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if src.len() < LEN_PREFIX + len {
        return Ok(None);
    }

    src.advance(LEN_PREFIX);
    let payload = src.split_to(len).freeze();
    Ok(Some(M::decode(payload)?))
}
