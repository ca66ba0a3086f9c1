// src/rpc/codec.rs
//! Length-delimited JSON framing for RPC connections.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::utils::errors::Result;

/// A TCP stream framed with a 4-byte length prefix
pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Wrap a TCP stream in the RPC framing codec
pub fn frame(stream: TcpStream) -> FramedStream {
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// Encode a message into a single frame payload
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode a message from a received frame payload
pub fn decode<T: DeserializeOwned>(frame: &BytesMut) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}
