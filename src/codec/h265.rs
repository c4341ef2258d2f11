// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.265](https://www.itu.int/rec/T-REC-H.265)-encoded video, depacketized
//! and packetized as specified in
//! [RFC 7798](https://datatracker.ietf.org/doc/html/rfc7798).
//!
//! The H.265 RTP payload header mirrors the NAL unit header: two bytes of
//! `F(1) Type(6) LayerId(6) TID(3)`. Types 48 (aggregation packet) and
//! 49 (fragmentation unit) are payload-level structures; everything below 48
//! is a single NAL unit packet.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

use crate::format;
use crate::rtp::{RawPacketBuilder, ReceivedPacket};

use super::VideoFrame;

const NAL_AP: u8 = 48;
const NAL_FU: u8 = 49;

/// A reassembled NAL may not exceed this size; anything larger indicates a
/// broken or hostile sender.
const MAX_NAL_LEN: usize = 1 << 20;

/// NAL types 16..=21 are IRAP pictures (BLA, IDR, CRA).
fn is_irap(nal_type: u8) -> bool {
    (16..=21).contains(&nal_type)
}

fn nal_type(hdr: [u8; 2]) -> u8 {
    (hdr[0] >> 1) & 0x3f
}

/// In-progress fragmentation unit state.
#[derive(Debug)]
struct Fu {
    hdr: [u8; 2],
    data: Vec<u8>,
}

/// A [super::Depacketizer] impl which assembles access units, resetting on
/// interior packet loss.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    /// NALs of the in-progress access unit, as `(header, body)`.
    nals: Vec<(
        [u8; 2],
        Bytes,
    )>,

    /// Pieces of a fragmented NAL body, combined on the FU's end bit.
    fu: Option<Fu>,

    au_start: Option<AuStart>,
    pending: VecDeque<VideoFrame>,
}

#[derive(Debug)]
struct AuStart {
    ctx: crate::PacketContext,
    timestamp: crate::Timestamp,
    stream_id: usize,
    loss: u16,
}

impl Depacketizer {
    pub(super) fn new(_format: &format::H265) -> Result<Self, String> {
        Ok(Self {
            nals: Vec::new(),
            fu: None,
            au_start: None,
            pending: VecDeque::new(),
        })
    }

    pub(super) fn parameters(&self) -> Option<super::ParametersRef<'_>> {
        // Interpreting the H.265 SPS (to get eg pixel dimensions) requires a
        // full bitstream parser; parameters are left to the application,
        // which receives the VPS/SPS/PPS NALs in-band.
        None
    }

    fn reset(&mut self) {
        self.nals.clear();
        self.fu = None;
        self.au_start = None;
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        assert!(self.pending.is_empty(), "push with data already pending");
        let seq = pkt.sequence_number();
        if pkt.loss() > 0 {
            // Discard any partial access unit; restart at this packet.
            self.reset();
        }
        let loss = pkt.loss();
        let mark = pkt.mark();
        let ctx = *pkt.ctx();
        let timestamp = pkt.timestamp();
        let stream_id = pkt.stream_id();

        match &self.au_start {
            Some(s) if s.timestamp.timestamp() != timestamp.timestamp() => {
                if self.fu.is_some() {
                    self.reset();
                    return Err(format!(
                        "timestamp changed mid-fragment at seq {seq:04x}"
                    ));
                }
                // Flush the previous access unit (sender never set the
                // marker); start a new one.
                let frame = self.finish(ctx)?;
                self.pending.push_back(frame);
                self.au_start = Some(AuStart {
                    ctx,
                    timestamp,
                    stream_id,
                    loss,
                });
            }
            Some(_) => {}
            None => {
                self.au_start = Some(AuStart {
                    ctx,
                    timestamp,
                    stream_id,
                    loss,
                })
            }
        }

        let mut data = pkt.into_payload_bytes();
        if data.len() < 2 {
            self.reset();
            return Err(format!("H.265 payload too short at seq {seq:04x}"));
        }
        let payload_hdr = [data[0], data[1]];
        if (payload_hdr[0] & 0b1000_0000) != 0 {
            self.reset();
            return Err(format!("NAL header has F bit set at seq {seq:04x}"));
        }
        match nal_type(payload_hdr) {
            NAL_AP => {
                data.advance(2);
                if self.fu.is_some() {
                    self.reset();
                    return Err(format!("AP while fragment in progress at seq {seq:04x}"));
                }
                let mut count = 0;
                while data.has_remaining() {
                    if data.remaining() < 2 {
                        self.reset();
                        return Err(format!("AP with truncated length at seq {seq:04x}"));
                    }
                    let len = usize::from(data.get_u16());
                    if len < 2 || data.remaining() < len {
                        self.reset();
                        return Err(format!("AP with bad NAL length {len} at seq {seq:04x}"));
                    }
                    let mut nal = data.split_to(len);
                    let hdr = [nal[0], nal[1]];
                    nal.advance(2);
                    self.nals.push((hdr, nal));
                    count += 1;
                }
                if count < 2 {
                    self.reset();
                    return Err(format!("AP with fewer than two NALs at seq {seq:04x}"));
                }
            }
            NAL_FU => {
                if data.len() < 3 {
                    self.reset();
                    return Err(format!("FU too short at seq {seq:04x}"));
                }
                let fu_header = data[2];
                data.advance(3);
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let fu_type = fu_header & 0b0011_1111;
                if start && end {
                    self.reset();
                    return Err(format!("FU with both S and E bits at seq {seq:04x}"));
                }
                // The real NAL header: the payload header with the FU's type.
                let hdr = [
                    (payload_hdr[0] & 0b1000_0001) | (fu_type << 1),
                    payload_hdr[1],
                ];
                match (start, &mut self.fu) {
                    (true, Some(_)) => {
                        self.reset();
                        return Err(format!(
                            "FU with start bit while fragment in progress at seq {seq:04x}"
                        ));
                    }
                    (true, None) => {
                        self.fu = Some(Fu {
                            hdr,
                            data: data.to_vec(),
                        });
                    }
                    (false, None) => {
                        self.reset();
                        return Err(format!(
                            "FU with start bit unset while no fragment in progress at seq {seq:04x}"
                        ));
                    }
                    (false, Some(fu)) => {
                        if fu.hdr != hdr {
                            self.reset();
                            return Err(format!(
                                "FU type changed mid-fragment at seq {seq:04x}"
                            ));
                        }
                        if fu.data.len() + data.len() > MAX_NAL_LEN {
                            self.reset();
                            return Err(format!(
                                "fragmented NAL exceeds {MAX_NAL_LEN} bytes at seq {seq:04x}"
                            ));
                        }
                        fu.data.extend_from_slice(&data);
                        if end {
                            let fu = self.fu.take().expect("fu is some");
                            self.nals.push((fu.hdr, fu.data.into()));
                        } else if mark {
                            self.reset();
                            return Err(format!("FU with MARK and no E bit at seq {seq:04x}"));
                        }
                    }
                }
            }
            50..=63 => {
                self.reset();
                return Err(format!(
                    "unsupported H.265 payload type {} at seq {seq:04x}",
                    nal_type(payload_hdr)
                ));
            }
            _ => {
                if self.fu.is_some() {
                    self.reset();
                    return Err(format!(
                        "single NAL while fragment in progress at seq {seq:04x}"
                    ));
                }
                data.advance(2);
                self.nals.push((payload_hdr, data));
            }
        }
        if mark {
            if self.fu.is_some() {
                self.reset();
                return Err(format!("MARK with fragment in progress at seq {seq:04x}"));
            }
            let frame = self.finish(ctx)?;
            self.pending.push_back(frame);
        }
        Ok(())
    }

    fn finish(&mut self, end_ctx: crate::PacketContext) -> Result<VideoFrame, String> {
        let start = self.au_start.take().ok_or("finish without access unit")?;
        let mut is_random_access_point = false;
        let mut len = 0;
        for (hdr, body) in &self.nals {
            if is_irap(nal_type(*hdr)) {
                is_random_access_point = true;
            }
            len += 4 + 2 + body.len();
        }
        let mut data = Vec::with_capacity(len);
        for (hdr, body) in self.nals.drain(..) {
            data.extend_from_slice(&((body.len() + 2) as u32).to_be_bytes());
            data.extend_from_slice(&hdr);
            data.extend_from_slice(&body);
        }
        Ok(VideoFrame {
            start_ctx: start.ctx,
            end_ctx,
            has_new_parameters: false,
            loss: start.loss,
            timestamp: start.timestamp,
            stream_id: start.stream_id,
            is_random_access_point,
            is_disposable: false,
            data,
        })
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.pop_front().map(super::CodecItem::VideoFrame)
    }
}

/// Splits H.265 access units into RTP packets: single NAL unit packets,
/// aggregation packets for runs of small NALs, and fragmentation units.
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

    fn push(
        &mut self,
        out: &mut Vec<Bytes>,
        payload: Vec<u8>,
        timestamp: u32,
        mark: bool,
    ) -> Result<(), String> {
        let (raw, _) = RawPacketBuilder {
            sequence_number: self.next_sequence_number,
            timestamp,
            payload_type: self.payload_type,
            ssrc: self.ssrc,
            mark,
        }
        .build(payload)?;
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
        out.push(raw.0);
        Ok(())
    }

    pub(crate) fn packetize(
        &mut self,
        nalus: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<Bytes>, String> {
        if nalus.is_empty() {
            return Err("access unit with no NALs".into());
        }
        for nalu in nalus {
            if nalu.len() < 2 {
                return Err("NAL shorter than its header".into());
            }
            if (nalu[0] & 0b1000_0000) != 0 {
                return Err(format!("NAL header {:02x} has F bit set", nalu[0]));
            }
            if nal_type([nalu[0], nalu[1]]) >= NAL_AP {
                return Err(format!(
                    "NAL type {} is not a valid single NAL type",
                    nal_type([nalu[0], nalu[1]])
                ));
            }
        }
        let max = usize::from(self.max_payload_size);
        let mut out = Vec::new();
        let mut i = 0;
        while i < nalus.len() {
            let nalu = &nalus[i];

            // Try to aggregate this NAL with following small ones: payload
            // header (2) plus per NAL a 2-byte size prefix.
            let mut agg_len = 2 + 2 + nalu.len();
            let mut j = i + 1;
            while j < nalus.len() && agg_len + 2 + nalus[j].len() <= max {
                agg_len += 2 + nalus[j].len();
                j += 1;
            }
            if j > i + 1 && agg_len <= max {
                let mut payload = Vec::with_capacity(agg_len);
                let layer_tid = nalus[i..j]
                    .iter()
                    .map(|n| u16::from_be_bytes([n[0] & 1, n[1]]))
                    .min()
                    .expect("non-empty aggregate");
                let layer_tid = layer_tid.to_be_bytes();
                payload.push((NAL_AP << 1) | layer_tid[0]);
                payload.push(layer_tid[1]);
                for n in &nalus[i..j] {
                    payload.extend_from_slice(
                        &u16::try_from(n.len())
                            .map_err(|_| "NAL too long for AP".to_owned())?
                            .to_be_bytes(),
                    );
                    payload.extend_from_slice(&n[..]);
                }
                let mark = j == nalus.len();
                self.push(&mut out, payload, timestamp, mark)?;
                i = j;
                continue;
            }
            if nalu.len() <= max {
                let mark = i + 1 == nalus.len();
                self.push(&mut out, nalu.to_vec(), timestamp, mark)?;
                i += 1;
                continue;
            }

            // FU: 2-byte payload header (type 49) + 1-byte FU header per
            // packet; the NAL's own 2-byte header is carried in the FU type
            // field and not repeated in the body.
            let typ = nal_type([nalu[0], nalu[1]]);
            let payload_hdr = [(NAL_FU << 1) | (nalu[0] & 1), nalu[1]];
            let body = &nalu[2..];
            let chunk_size = max - 3;
            let nchunks = body.len().div_ceil(chunk_size);
            debug_assert!(nchunks >= 2);
            for (ci, chunk) in body.chunks(chunk_size).enumerate() {
                let start = ci == 0;
                let end = ci + 1 == nchunks;
                let mut payload = Vec::with_capacity(3 + chunk.len());
                payload.extend_from_slice(&payload_hdr);
                payload.push(if start { 0b1000_0000 } else { 0 }
                    | if end { 0b0100_0000 } else { 0 }
                    | typ);
                payload.extend_from_slice(chunk);
                let mark = end && i + 1 == nalus.len();
                self.push(&mut out, payload, timestamp, mark)?;
            }
            i += 1;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use bytes::Bytes;

    use super::*;
    use crate::codec::CodecItem;
    use crate::rtp::ReceivedPacketBuilder;
    use crate::PacketContext;

    fn pkt(sequence_number: u16, mark: bool, payload: &[u8]) -> ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            sequence_number,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(90_000).unwrap(), 0).unwrap(),
            payload_type: 96,
            ssrc: 0x42,
            mark,
            loss: 0,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    fn depacketizer() -> Depacketizer {
        Depacketizer::new(&format::H265::from_fmtp(96, None).unwrap()).unwrap()
    }

    #[test]
    fn single_nal() {
        let mut d = depacketizer();
        // Type 19 (IDR_W_RADL): (19 << 1) = 0x26, layer 0, tid 1.
        d.push(pkt(0, true, b"\x26\x01\xaa\xbb")).unwrap();
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(f)) => f,
            _ => panic!(),
        };
        assert!(frame.is_random_access_point());
        assert_eq!(&frame.data()[..], b"\x00\x00\x00\x04\x26\x01\xaa\xbb");
    }

    #[test]
    fn aggregation_packet() {
        let mut d = depacketizer();
        // AP header (type 48): 0x60 0x01, then two size-prefixed NALs.
        d.push(pkt(
            0,
            true,
            b"\x60\x01\x00\x03\x40\x01\xaa\x00\x04\x42\x01\xbb\xcc",
        ))
        .unwrap();
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(f)) => f,
            _ => panic!(),
        };
        assert_eq!(
            &frame.data()[..],
            b"\x00\x00\x00\x03\x40\x01\xaa\x00\x00\x00\x04\x42\x01\xbb\xcc"
        );
    }

    #[test]
    fn fu_round_trip() {
        const MAX_PAYLOAD: u16 = 64;
        let big: Bytes = [0x26, 0x01].iter().copied().chain((0..300u32).map(|i| i as u8)).collect();
        let nalus = vec![Bytes::from_static(b"\x40\x01\x0c"), big.clone()];
        let mut p = Packetizer::new(96, 0x42, 0, MAX_PAYLOAD);
        let pkts = p.packetize(&nalus, 0).unwrap();
        assert!(pkts.len() > 2);
        let mut d = depacketizer();
        for (i, raw) in pkts.iter().enumerate() {
            let (raw_pkt, range) = crate::rtp::RawPacket::new(raw.clone()).unwrap();
            assert!(range.len() <= usize::from(MAX_PAYLOAD));
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
        let mut expected = Vec::new();
        for nalu in &nalus {
            expected.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
            expected.extend_from_slice(&nalu[..]);
        }
        assert_eq!(&frame.data()[..], &expected[..]);
        assert!(frame.is_random_access_point());
    }

    #[test]
    fn fu_missing_start_rejected() {
        let mut d = depacketizer();
        // FU (type 49 -> 0x62) with E bit only.
        d.push(pkt(0, true, b"\x62\x01\x53\xaa")).unwrap_err();
    }
}
