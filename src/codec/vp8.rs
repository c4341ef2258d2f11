// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VP8, as specified in [RFC 7741](https://datatracker.ietf.org/doc/html/rfc7741).
//!
//! Each packet starts with a payload descriptor:
//!
//! ```text
//!      0 1 2 3 4 5 6 7
//!     +-+-+-+-+-+-+-+-+
//!     |X|R|N|S|R| PID | (REQUIRED)
//!     +-+-+-+-+-+-+-+-+
//! X:  |I|L|T|K| RSV   | (OPTIONAL)
//!     +-+-+-+-+-+-+-+-+
//! I:  |M| PictureID   | (OPTIONAL)
//!     +-+-+-+-+-+-+-+-+
//! L:  |   TL0PICIDX   | (OPTIONAL)
//!     +-+-+-+-+-+-+-+-+
//! T/K:|TID|Y| KEYIDX  | (OPTIONAL)
//!     +-+-+-+-+-+-+-+-+
//! ```
//!
//! A frame starts at a packet with `S=1, PID=0` and ends at the RTP marker.

use bytes::{Buf, Bytes};

use crate::rtp::{RawPacketBuilder, ReceivedPacket};

use super::{CodecItem, VideoFrame};

/// An accumulated frame may not exceed this size.
const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Default)]
pub(crate) struct Depacketizer {
    /// Frame in progress; `None` when waiting for a frame start.
    frame: Option<InProgress>,
    pending: Option<VideoFrame>,
}

#[derive(Debug)]
struct InProgress {
    start_ctx: crate::PacketContext,
    timestamp: crate::Timestamp,
    stream_id: usize,
    loss: u16,
    data: Vec<u8>,
}

/// Strips the payload descriptor, returning `(start_of_partition, pid)`.
fn strip_descriptor(data: &mut Bytes) -> Result<(bool, u8), String> {
    if data.is_empty() {
        return Err("empty VP8 payload".into());
    }
    let b0 = data[0];
    let extended = (b0 & 0b1000_0000) != 0;
    let start = (b0 & 0b0001_0000) != 0;
    let pid = b0 & 0b0000_0111;
    data.advance(1);
    if extended {
        if data.is_empty() {
            return Err("VP8 descriptor truncated at extension byte".into());
        }
        let x = data[0];
        data.advance(1);
        if (x & 0b1000_0000) != 0 {
            // PictureID: one byte, or two if its M bit is set.
            if data.is_empty() {
                return Err("VP8 descriptor truncated at PictureID".into());
            }
            let wide = (data[0] & 0b1000_0000) != 0;
            data.advance(1);
            if wide {
                if data.is_empty() {
                    return Err("VP8 descriptor truncated at wide PictureID".into());
                }
                data.advance(1);
            }
        }
        if (x & 0b0100_0000) != 0 {
            // TL0PICIDX.
            if data.is_empty() {
                return Err("VP8 descriptor truncated at TL0PICIDX".into());
            }
            data.advance(1);
        }
        if (x & 0b0011_0000) != 0 {
            // TID/Y/KEYIDX.
            if data.is_empty() {
                return Err("VP8 descriptor truncated at TID/KEYIDX".into());
            }
            data.advance(1);
        }
    }
    Ok((start, pid))
}

/// Returns true iff this payload begins a key frame: frame start (`S=1`,
/// `PID=0`) and an uncompressed-header P bit of 0.
pub(crate) fn starts_keyframe(payload: &[u8]) -> bool {
    let mut data = bytes::Bytes::copy_from_slice(payload);
    match strip_descriptor(&mut data) {
        Ok((start, 0)) => start && data.first().map(|&b| (b & 1) == 0).unwrap_or(false),
        _ => false,
    }
}

impl Depacketizer {
    pub(super) fn parameters(&self) -> Option<super::ParametersRef<'_>> {
        None
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        assert!(self.pending.is_none());
        if pkt.loss() > 0 {
            self.frame = None;
        }
        let ctx = *pkt.ctx();
        let mark = pkt.mark();
        let timestamp = pkt.timestamp();
        let stream_id = pkt.stream_id();
        let loss = pkt.loss();
        let mut data = pkt.into_payload_bytes();
        let (start, pid) = strip_descriptor(&mut data)?;
        if data.is_empty() {
            return Err("VP8 packet with no frame data".into());
        }

        match &mut self.frame {
            None => {
                if !start || pid != 0 {
                    // Mid-frame packet while waiting for a start; skip it
                    // without error (common right after loss).
                    return Ok(());
                }
                self.frame = Some(InProgress {
                    start_ctx: ctx,
                    timestamp,
                    stream_id,
                    loss,
                    data: data.to_vec(),
                });
            }
            Some(f) => {
                if start && pid == 0 {
                    return Err("VP8 frame start while frame in progress".into());
                }
                if f.timestamp.timestamp() != timestamp.timestamp() {
                    self.frame = None;
                    return Err("timestamp changed mid-frame".into());
                }
                if f.data.len() + data.len() > MAX_FRAME_LEN {
                    self.frame = None;
                    return Err(format!("VP8 frame exceeds {MAX_FRAME_LEN} bytes"));
                }
                f.data.extend_from_slice(&data);
            }
        }
        if mark {
            let f = self.frame.take().expect("frame in progress at mark");
            // An uncompressed-header P bit of 0 marks a key frame.
            let is_random_access_point = (f.data[0] & 0b1) == 0;
            self.pending = Some(VideoFrame {
                start_ctx: f.start_ctx,
                end_ctx: ctx,
                has_new_parameters: false,
                loss: f.loss,
                timestamp: f.timestamp,
                stream_id: f.stream_id,
                is_random_access_point,
                is_disposable: false,
                data: f.data,
            });
        }
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take().map(CodecItem::VideoFrame)
    }
}

/// Fragments VP8 frames across packets, prefixing each with a minimal payload
/// descriptor (`S` set on the first packet of the frame).
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_type: u8,
    ssrc: u32,
    next_sequence_number: u16,
    max_payload_size: u16,
}

impl Packetizer {
    pub(crate) fn new(
        payload_type: u8,
        ssrc: u32,
        initial_sequence_number: u16,
        max_payload_size: u16,
    ) -> Self {
        Self {
            payload_type,
            ssrc,
            next_sequence_number: initial_sequence_number,
            max_payload_size,
        }
    }

    pub(crate) fn packetize(&mut self, data: &[u8], timestamp: u32) -> Result<Vec<Bytes>, String> {
        if data.is_empty() {
            return Err("empty VP8 frame".into());
        }
        let chunk_size = usize::from(self.max_payload_size) - 1;
        let nchunks = data.len().div_ceil(chunk_size);
        let mut out = Vec::with_capacity(nchunks);
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let descriptor = if i == 0 { 0b0001_0000 } else { 0 };
            let (raw, _) = RawPacketBuilder {
                sequence_number: self.next_sequence_number,
                timestamp,
                payload_type: self.payload_type,
                ssrc: self.ssrc,
                mark: i + 1 == nchunks,
            }
            .build(std::iter::once(descriptor).chain(chunk.iter().copied()))?;
            self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
            out.push(raw.0);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;
    use crate::rtp::ReceivedPacketBuilder;
    use crate::PacketContext;

    fn pkt(sequence_number: u16, mark: bool, payload: &[u8]) -> ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            sequence_number,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(90_000).unwrap(), 0).unwrap(),
            payload_type: 96,
            ssrc: 0,
            mark,
            loss: 0,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    #[test]
    fn keyframe_across_two_packets() {
        let mut d = Depacketizer::default();
        d.push(pkt(0, false, b"\x10\xf0\x00")).unwrap(); // S=1, P=0.
        assert!(d.pull().is_none());
        d.push(pkt(1, true, b"\x00\xaa\xbb")).unwrap();
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(f)) => f,
            _ => panic!(),
        };
        assert!(frame.is_random_access_point());
        assert_eq!(&frame.data()[..], b"\xf0\x00\xaa\xbb");
    }

    #[test]
    fn extended_descriptor_with_wide_picture_id() {
        let mut d = Depacketizer::default();
        // X=1 S=1, I=1, M=1 picture id (2 bytes), then frame data.
        d.push(pkt(0, true, b"\x90\x80\x81\x23\x01\xcc")).unwrap();
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(f)) => f,
            _ => panic!(),
        };
        assert!(!frame.is_random_access_point()); // P=1.
        assert_eq!(&frame.data()[..], b"\x01\xcc");
    }

    #[test]
    fn round_trip() {
        let data: Vec<u8> = std::iter::once(0)
            .chain((0..300u32).map(|i| i as u8))
            .collect();
        let mut p = Packetizer::new(96, 1, 0, 100);
        let pkts = p.packetize(&data, 0).unwrap();
        assert!(pkts.len() > 1);
        let mut d = Depacketizer::default();
        for (i, raw) in pkts.iter().enumerate() {
            let (raw_pkt, range) = crate::rtp::RawPacket::new(raw.clone()).unwrap();
            assert!(range.len() <= 100);
            d.push(pkt(
                raw_pkt.sequence_number(),
                i + 1 == pkts.len(),
                &raw[usize::from(range.start)..],
            ))
            .unwrap();
        }
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(f)) => f,
            _ => panic!(),
        };
        assert_eq!(&frame.data()[..], &data[..]);
    }
}
