use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::config::MAX_FRAME_PAYLOAD;

pub const FRAME_HEADER_LEN: usize = 3;

const RESYNC_PREFIX: u8 = 0b1100_0000;
const RESYNC_MASK: u8 = 0b1100_0000;
const MAX_CHANNEL_ID: u8 = 3;

/// The outcome of trying to parse the next frame from the accumulated data
#[derive(Debug, Eq, PartialEq)]
pub enum Decoded {
    Frame {
        channel_id: u8,
        payload: Bytes,
    },
    /// More data is needed before the next frame can be parsed. Nothing was consumed.
    Incomplete,
    /// The data at the front of the buffer was not a valid frame. `discarded` bytes were skipped
    ///  to resynchronize on the next possible frame start.
    Corrupt {
        discarded: usize,
    },
}

/// Frames payloads for sending, and reassembles frames from raw reads on the receiving side.
///
/// Each frame starts with a three-byte header:
/// ```ascii
/// byte 0:  1 1 c c d d d d   c: channel id, d: data checksum (sum of payload bytes mod 16)
/// byte 1:  h h h h l l l l   h: header checksum, l: length bits 11..8
/// byte 2:  l l l l l l l l   l: length bits 7..0
/// ```
///
/// The header checksum is the sum of channel id and both length bytes, mod 16.
///
/// NB: The leading `0b11` bits are a resynchronization marker. When corrupt data is detected, the
///  decoder skips forward to the next byte carrying the marker and tries again from there. With
///  four-bit checksums this is a heuristic rather than a guarantee, and it relies on the channels
///  on top to detect the rare corruption that slips through.
pub struct PacketCodec {
    buf: BytesMut,
    capacity: usize,
}

impl PacketCodec {
    pub fn new(capacity: usize) -> PacketCodec {
        PacketCodec {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a complete frame for `payload` to `out`
    pub fn encode(channel_id: u8, payload: &[u8], out: &mut BytesMut) -> anyhow::Result<()> {
        if channel_id > MAX_CHANNEL_ID {
            bail!("channel id {} does not fit into a frame header", channel_id);
        }
        if payload.len() > MAX_FRAME_PAYLOAD {
            bail!("payload of {} bytes exceeds the maximum frame payload of {}", payload.len(), MAX_FRAME_PAYLOAD);
        }

        let len = payload.len() as u16;
        out.reserve(FRAME_HEADER_LEN + payload.len());
        out.put_u8(RESYNC_PREFIX | (channel_id << 4) | data_checksum(payload));
        out.put_u8((header_checksum(channel_id, len) << 4) | (len >> 8) as u8);
        out.put_u8(len as u8);
        out.put_slice(payload);
        Ok(())
    }

    pub fn encode_frame(channel_id: u8, payload: &[u8]) -> anyhow::Result<Bytes> {
        let mut out = BytesMut::new();
        Self::encode(channel_id, payload, &mut out)?;
        Ok(out.freeze())
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Adds the data of a raw read to the accumulation buffer. If it does not fit, the buffer's
    ///  content is discarded: it can not be completed in a meaningful way anyway.
    pub fn receive_raw(&mut self, data: &[u8]) {
        if self.buf.len() + data.len() > self.capacity {
            warn!("accumulation buffer overflow: discarding {} buffered bytes", self.buf.len());
            self.buf.clear();
        }
        if data.len() > self.capacity {
            warn!("read of {} bytes exceeds the accumulation buffer's capacity of {} - discarding", data.len(), self.capacity);
            return;
        }
        self.buf.extend_from_slice(data);
    }

    pub fn try_parse_next(&mut self) -> Decoded {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Decoded::Incomplete;
        }

        let b0 = self.buf[0];
        let b1 = self.buf[1];
        let b2 = self.buf[2];

        if b0 & RESYNC_MASK != RESYNC_PREFIX {
            trace!("no frame marker at start of buffer");
            return self.resync();
        }

        let channel_id = (b0 >> 4) & 0b11;
        let len = (((b1 & 0x0f) as u16) << 8) | b2 as u16;
        if b1 >> 4 != header_checksum(channel_id, len) {
            debug!("frame header checksum mismatch");
            return self.resync();
        }

        let frame_len = FRAME_HEADER_LEN + len as usize;
        if self.buf.len() < frame_len {
            return Decoded::Incomplete;
        }

        if b0 & 0x0f != data_checksum(&self.buf[FRAME_HEADER_LEN..frame_len]) {
            debug!("frame data checksum mismatch on channel {}", channel_id);
            return self.resync();
        }

        let mut frame = self.buf.split_to(frame_len);
        let payload = frame.split_off(FRAME_HEADER_LEN).freeze();
        Decoded::Frame { channel_id, payload }
    }

    /// Drops the first byte, and everything up to the next byte that could start a frame
    fn resync(&mut self) -> Decoded {
        let discarded = 1 + self.buf[1..].iter()
            .take_while(|&&b| b & RESYNC_MASK != RESYNC_PREFIX)
            .count();
        let _ = self.buf.split_to(discarded);
        Decoded::Corrupt { discarded }
    }
}

fn data_checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) & 0x0f
}

fn header_checksum(channel_id: u8, len: u16) -> u8 {
    channel_id
        .wrapping_add(len as u8)
        .wrapping_add((len >> 8) as u8)
        & 0x0f
}
