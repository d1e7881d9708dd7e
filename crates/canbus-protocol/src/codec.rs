//! Fixed-size frame codecs.
//!
//! Bus frame:  std u16 | ext u32 | payload [u8; 4]               (10 bytes)
//! API frame:  timestamp u32 | std u16 | pad u16 | ext u32 | payload (16 bytes)
//!
//! A frame with a bad length or reserved type is consumed before the error is
//! returned, so a caller can log it and keep decoding.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{ExtHeader, Packet, Payload, StdHeader};
use crate::{ProtocolError, API_FRAME_SIZE, BUS_FRAME_SIZE, MAX_PAYLOAD};

/// Codec for frames as they travel on the bus (no timestamp).
#[derive(Debug, Default, Clone, Copy)]
pub struct BusFrameCodec;

/// Codec for the local API frame, which carries the receive timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApiFrameCodec;

fn take_payload(src: &mut BytesMut) -> Payload {
    let mut buf = [0u8; MAX_PAYLOAD];
    src.copy_to_slice(&mut buf);
    Payload(buf)
}

fn finish(timestamp: u32, std: StdHeader, ext_raw: u32, payload: Payload) -> Result<Packet, ProtocolError> {
    std.validate()?;
    let ext = ExtHeader::unpack(ext_raw)?;
    Ok(Packet {
        timestamp,
        std,
        ext,
        payload,
    })
}

impl Decoder for BusFrameCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < BUS_FRAME_SIZE {
            src.reserve(BUS_FRAME_SIZE - src.len());
            return Ok(None);
        }

        let std = StdHeader::unpack(src.get_u16());
        let ext_raw = src.get_u32();
        let payload = take_payload(src);
        finish(0, std, ext_raw, payload).map(Some)
    }
}

impl Encoder<Packet> for BusFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.validate()?;
        dst.reserve(BUS_FRAME_SIZE);
        dst.put_u16(item.std.pack());
        dst.put_u32(item.ext.pack());
        dst.put_slice(item.payload.bytes());
        Ok(())
    }
}

impl Decoder for ApiFrameCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < API_FRAME_SIZE {
            src.reserve(API_FRAME_SIZE - src.len());
            return Ok(None);
        }

        let timestamp = src.get_u32();
        let std = StdHeader::unpack(src.get_u16());
        src.advance(2);
        let ext_raw = src.get_u32();
        let payload = take_payload(src);
        finish(timestamp, std, ext_raw, payload).map(Some)
    }
}

impl Encoder<Packet> for ApiFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.validate()?;
        dst.reserve(API_FRAME_SIZE);
        dst.put_u32(item.timestamp);
        dst.put_u16(item.std.pack());
        dst.put_u16(0);
        dst.put_u32(item.ext.pack());
        dst.put_slice(item.payload.bytes());
        Ok(())
    }
}
