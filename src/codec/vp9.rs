// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VP9, as specified in
//! [draft-ietf-payload-vp9](https://datatracker.ietf.org/doc/html/draft-ietf-payload-vp9).
//!
//! Payload descriptor (flexible and non-flexible modes):
//!
//! ```text
//!      0 1 2 3 4 5 6 7
//!     +-+-+-+-+-+-+-+-+
//!     |I|P|L|F|B|E|V|Z| (REQUIRED)
//!     +-+-+-+-+-+-+-+-+
//! I:  |M| PICTURE ID  | (RECOMMENDED)
//!     +-+-+-+-+-+-+-+-+
//! M:  | EXTENDED PID  | (RECOMMENDED)
//!     +-+-+-+-+-+-+-+-+
//! L:  | TID |U| SID |D| (CONDITIONALLY RECOMMENDED)
//!     +-+-+-+-+-+-+-+-+
//!     |   TL0PICIDX   | (non-flexible mode only)
//!     +-+-+-+-+-+-+-+-+
//! ```
//!
//! A frame begins at a packet with the `B` bit and ends at the `E` bit (which
//! coincides with the RTP marker for the final frame of a picture).

use bytes::{Buf, Bytes};

use crate::rtp::{RawPacketBuilder, ReceivedPacket};

use super::{CodecItem, VideoFrame};

const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Default)]
pub(crate) struct Depacketizer {
    frame: Option<InProgress>,
    pending: Option<VideoFrame>,
}

#[derive(Debug)]
struct InProgress {
    start_ctx: crate::PacketContext,
    timestamp: crate::Timestamp,
    stream_id: usize,
    loss: u16,
    keyframe: bool,
    data: Vec<u8>,
}

struct Descriptor {
    begin: bool,
    end: bool,
    inter_predicted: bool,
}

/// Strips the payload descriptor. Scalability structures (`V`) are accepted
/// only on frame starts and skipped without interpretation.
fn strip_descriptor(data: &mut Bytes) -> Result<Descriptor, String> {
    if data.is_empty() {
        return Err("empty VP9 payload".into());
    }
    let b0 = data[0];
    data.advance(1);
    let has_picture_id = (b0 & 0b1000_0000) != 0;
    let inter_predicted = (b0 & 0b0100_0000) != 0;
    let has_layers = (b0 & 0b0010_0000) != 0;
    let flexible = (b0 & 0b0001_0000) != 0;
    let begin = (b0 & 0b0000_1000) != 0;
    let end = (b0 & 0b0000_0100) != 0;
    let has_ss = (b0 & 0b0000_0010) != 0;
    if has_picture_id {
        if data.is_empty() {
            return Err("VP9 descriptor truncated at picture id".into());
        }
        let wide = (data[0] & 0b1000_0000) != 0;
        data.advance(1);
        if wide {
            if data.is_empty() {
                return Err("VP9 descriptor truncated at extended picture id".into());
            }
            data.advance(1);
        }
    }
    if has_layers {
        if data.is_empty() {
            return Err("VP9 descriptor truncated at layer indices".into());
        }
        data.advance(1);
        if !flexible {
            if data.is_empty() {
                return Err("VP9 descriptor truncated at TL0PICIDX".into());
            }
            data.advance(1);
        }
    }
    if flexible && inter_predicted {
        // Up to three reference indices, each with a continuation bit.
        for _ in 0..3 {
            if data.is_empty() {
                return Err("VP9 descriptor truncated at reference index".into());
            }
            let more = (data[0] & 1) != 0;
            data.advance(1);
            if !more {
                break;
            }
        }
    }
    if has_ss {
        // Scalability structure: N_S(3) Y G RSV(3), then per-layer dimensions
        // and picture group descriptions.
        if data.is_empty() {
            return Err("VP9 descriptor truncated at scalability structure".into());
        }
        let header = data[0];
        data.advance(1);
        let n_s = usize::from(header >> 5) + 1;
        let has_dims = (header & 0b0001_0000) != 0;
        let has_pg = (header & 0b0000_1000) != 0;
        if has_dims {
            if data.remaining() < n_s * 4 {
                return Err("VP9 scalability structure truncated at dimensions".into());
            }
            data.advance(n_s * 4);
        }
        if has_pg {
            if data.is_empty() {
                return Err("VP9 scalability structure truncated at picture group".into());
            }
            let n_g = usize::from(data[0]);
            data.advance(1);
            for _ in 0..n_g {
                if data.is_empty() {
                    return Err("VP9 picture group truncated".into());
                }
                let r = usize::from((data[0] >> 2) & 0b11);
                data.advance(1);
                if data.remaining() < r {
                    return Err("VP9 picture group reference list truncated".into());
                }
                data.advance(r);
            }
        }
    }
    Ok(Descriptor {
        begin,
        end,
        inter_predicted,
    })
}

/// Returns true iff this payload begins a key frame: `B` set and the
/// inter-picture-predicted bit clear.
pub(crate) fn starts_keyframe(payload: &[u8]) -> bool {
    let mut data = bytes::Bytes::copy_from_slice(payload);
    match strip_descriptor(&mut data) {
        Ok(d) => d.begin && !d.inter_predicted,
        Err(_) => false,
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
        let timestamp = pkt.timestamp();
        let stream_id = pkt.stream_id();
        let loss = pkt.loss();
        let mut data = pkt.into_payload_bytes();
        let d = strip_descriptor(&mut data)?;
        if data.is_empty() {
            return Err("VP9 packet with no frame data".into());
        }

        match &mut self.frame {
            None => {
                if !d.begin {
                    // Mid-frame while waiting for a start; common after loss.
                    return Ok(());
                }
                self.frame = Some(InProgress {
                    start_ctx: ctx,
                    timestamp,
                    stream_id,
                    loss,
                    keyframe: !d.inter_predicted,
                    data: data.to_vec(),
                });
            }
            Some(f) => {
                if d.begin {
                    self.frame = None;
                    return Err("VP9 frame begin while frame in progress".into());
                }
                if f.timestamp.timestamp() != timestamp.timestamp() {
                    self.frame = None;
                    return Err("timestamp changed mid-frame".into());
                }
                if f.data.len() + data.len() > MAX_FRAME_LEN {
                    self.frame = None;
                    return Err(format!("VP9 frame exceeds {MAX_FRAME_LEN} bytes"));
                }
                f.data.extend_from_slice(&data);
            }
        }
        if d.end {
            let f = self.frame.take().expect("frame in progress at end bit");
            self.pending = Some(VideoFrame {
                start_ctx: f.start_ctx,
                end_ctx: ctx,
                has_new_parameters: false,
                loss: f.loss,
                timestamp: f.timestamp,
                stream_id: f.stream_id,
                is_random_access_point: f.keyframe,
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

/// Fragments VP9 frames across packets with a minimal one-byte descriptor:
/// `B` on the first packet, `E` (and the RTP marker) on the last.
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
            return Err("empty VP9 frame".into());
        }
        let chunk_size = usize::from(self.max_payload_size) - 1;
        let nchunks = data.len().div_ceil(chunk_size);
        let mut out = Vec::with_capacity(nchunks);
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let begin = i == 0;
            let end = i + 1 == nchunks;
            let descriptor =
                if begin { 0b0000_1000 } else { 0 } | if end { 0b0000_0100 } else { 0 };
            let (raw, _) = RawPacketBuilder {
                sequence_number: self.next_sequence_number,
                timestamp,
                payload_type: self.payload_type,
                ssrc: self.ssrc,
                mark: end,
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
    fn keyframe_with_picture_id() {
        let mut d = Depacketizer::default();
        // I=1 B=1 E=1, wide picture id.
        d.push(pkt(0, true, b"\x8c\x80\x01\xaa\xbb")).unwrap();
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(f)) => f,
            _ => panic!(),
        };
        assert!(frame.is_random_access_point());
        assert_eq!(&frame.data()[..], b"\xaa\xbb");
    }

    #[test]
    fn round_trip() {
        let data: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let mut p = Packetizer::new(96, 1, 100, 128);
        let pkts = p.packetize(&data, 0).unwrap();
        assert!(pkts.len() > 1);
        let mut d = Depacketizer::default();
        for (i, raw) in pkts.iter().enumerate() {
            let (raw_pkt, range) = crate::rtp::RawPacket::new(raw.clone()).unwrap();
            assert!(range.len() <= 128);
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
