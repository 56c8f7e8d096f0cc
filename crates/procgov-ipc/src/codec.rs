//! Stream codec for protocol frames.
//!
//! Frames are JSON objects written back to back with no length prefix;
//! the parser's own structure marks where each frame ends. A single read
//! may therefore yield zero, one or several frames.

use std::marker::PhantomData;

use bytes::{Buf, Bytes, BytesMut};
use procgov_common::error::{ProcgovError, Result};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Frame, Wire};

/// Upper bound on a buffered, still incomplete frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Serializes a message into its wire bytes.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode_message<M: Wire>(message: &M) -> Result<Bytes> {
    let frame = message.to_frame()?;
    Ok(Bytes::from(serde_json::to_vec(&frame)?))
}

/// Codec decoding `D` messages and encoding any [`Wire`] message.
#[derive(Debug)]
pub struct WireCodec<D> {
    _decodes: PhantomData<fn() -> D>,
}

impl<D> WireCodec<D> {
    /// Creates a codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _decodes: PhantomData,
        }
    }
}

impl<D> Default for WireCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Wire> Decoder for WireCodec<D> {
    type Item = D;
    type Error = ProcgovError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>> {
        let Some(start) = src.iter().position(|b| !b.is_ascii_whitespace()) else {
            src.clear();
            return Ok(None);
        };
        src.advance(start);

        let (parsed, consumed) = {
            let mut frames = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Frame>();
            let parsed = frames.next();
            (parsed, frames.byte_offset())
        };
        match parsed {
            None => Ok(None),
            Some(Ok(frame)) => {
                src.advance(consumed);
                D::from_frame(frame).map(Some)
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > MAX_FRAME_LEN {
                    return Err(ProcgovError::protocol(format!(
                        "frame exceeds {MAX_FRAME_LEN} bytes"
                    )));
                }
                Ok(None)
            }
            Some(Err(e)) => Err(ProcgovError::protocol(format!("malformed frame: {e}"))),
        }
    }
}

impl<D, E: Wire> Encoder<E> for WireCodec<D> {
    type Error = ProcgovError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&encode_message(&item)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Notification, Request, Response, ServerMessage};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn several_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_message(&Request::GetJobName { pid: 1 }).unwrap());
        buf.extend_from_slice(&encode_message(&Request::GetJobName { pid: 2 }).unwrap());

        let mut codec = WireCodec::<Request>::new();
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::GetJobName { pid: 1 })
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::GetJobName { pid: 2 })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let bytes = encode_message(&Request::GetJobSettings { name: "job".into() }).unwrap();
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        let mut codec = WireCodec::<Request>::new();
        let mut buf = BytesMut::from(head);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(tail);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::GetJobSettings { name: "job".into() })
        );
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let mut buf = BytesMut::from(&b"{\"t\": 1, oops}"[..]);
        let err = WireCodec::<Request>::new().decode(&mut buf).unwrap_err();
        assert!(err.is_connection_scoped());
    }

    #[test]
    fn oversized_incomplete_frame_is_rejected() {
        let mut buf = BytesMut::from(&b"{\"t\":1,\"b\":\""[..]);
        buf.extend_from_slice(&vec![b'a'; MAX_FRAME_LEN]);
        assert!(WireCodec::<Request>::new().decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn framed_stream_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedWrite::new(server, WireCodec::<Request>::new());
        let mut reader = FramedRead::new(client, WireCodec::<ServerMessage>::new());

        writer
            .send(Response::MonitorJob { name: "j".into() })
            .await
            .unwrap();
        writer
            .send(Notification::NewProcess {
                name: "j".into(),
                pid: 3,
            })
            .await
            .unwrap();
        drop(writer);

        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            ServerMessage::Response(Response::MonitorJob { name: "j".into() })
        );
        assert!(matches!(
            reader.next().await.unwrap().unwrap(),
            ServerMessage::Notification(Notification::NewProcess { pid: 3, .. })
        ));
        assert!(reader.next().await.is_none());
    }
}
