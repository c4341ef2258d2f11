// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-size audio sample codecs as defined in
//! [RFC 3551 section 4.5](https://datatracker.ietf.org/doc/html/rfc3551#section-4.5):
//! G.711 (µ-law and A-law), G.722, L16, and friends.

use std::num::NonZeroU32;

use bytes::Bytes;

use crate::rtp::{RawPacketBuilder, ReceivedPacket};

use super::{AudioParameters, CodecItem};

#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: AudioParameters,
    pending: Option<super::AudioFrame>,
    bits_per_sample: u32,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32, bits_per_sample: u32) -> Self {
        Self {
            parameters: AudioParameters {
                rfc6381_codec: None,
                frame_length: None, // variable
                clock_rate,
                extra_data: Vec::new(),
            },
            bits_per_sample,
            pending: None,
        }
    }

    pub(super) fn parameters(&self) -> Option<super::ParametersRef<'_>> {
        Some(super::ParametersRef::Audio(&self.parameters))
    }

    fn frame_length(&self, payload_len: usize) -> Option<NonZeroU32> {
        // This calculation could be strength-reduced but it's just once per
        // frame anyway. Do it in a straightforward way.
        assert!(payload_len < usize::from(u16::MAX));
        let bits = (payload_len) as u32 * 8;
        match (bits % self.bits_per_sample) != 0 {
            true => None,
            false => NonZeroU32::new(bits / self.bits_per_sample),
        }
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        assert!(self.pending.is_none());
        let payload = pkt.payload();
        let frame_length = self.frame_length(payload.len()).ok_or_else(|| {
            format!(
                "invalid length {} for payload of {}-bit audio samples",
                payload.len(),
                self.bits_per_sample
            )
        })?;
        self.pending = Some(super::AudioFrame {
            loss: pkt.loss(),
            ctx: *pkt.ctx(),
            stream_id: pkt.stream_id(),
            timestamp: pkt.timestamp(),
            frame_length,
            data: pkt.into_payload_bytes(),
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take().map(CodecItem::AudioFrame)
    }
}

/// Chunks sample data into RTP packets on sample boundaries.
///
/// The marker bit is set on the first packet of each frame, indicating the
/// start of a talkspurt per RFC 3551 section 4.1.
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_type: u8,
    ssrc: u32,
    next_sequence_number: u16,
    max_payload_size: u16,
    bits_per_sample: u32,
    clock_rate: u32,
}

impl Packetizer {
    pub(crate) fn new(
        payload_type: u8,
        ssrc: u32,
        initial_sequence_number: u16,
        max_payload_size: u16,
        bits_per_sample: u32,
        clock_rate: u32,
    ) -> Self {
        Self {
            payload_type,
            ssrc,
            next_sequence_number: initial_sequence_number,
            max_payload_size,
            bits_per_sample,
            clock_rate,
        }
    }

    pub(crate) fn packetize(&mut self, data: &[u8], timestamp: u32) -> Result<Vec<Bytes>, String> {
        if (data.len() as u32 * 8) % self.bits_per_sample != 0 {
            return Err(format!(
                "frame of {} bytes is not a whole number of {}-bit samples",
                data.len(),
                self.bits_per_sample
            ));
        }
        let bytes_per_sample = (self.bits_per_sample / 8).max(1) as usize;
        let chunk_size =
            usize::from(self.max_payload_size) / bytes_per_sample * bytes_per_sample;
        if chunk_size == 0 {
            return Err("maximum payload size smaller than one sample".to_owned());
        }
        let mut out = Vec::with_capacity(data.len().div_ceil(chunk_size));
        let mut ts = timestamp;
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let (raw, _) = RawPacketBuilder {
                sequence_number: self.next_sequence_number,
                timestamp: ts,
                payload_type: self.payload_type,
                ssrc: self.ssrc,
                mark: i == 0,
            }
            .build(chunk.iter().copied())?;
            self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
            ts = ts.wrapping_add((chunk.len() * 8) as u32 / self.bits_per_sample);
            let _ = self.clock_rate; // timestamps advance in sample units.
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

    #[test]
    fn depacketize_g711() {
        let mut d = Depacketizer::new(8_000, 8);
        let pkt = ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            sequence_number: 0,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(8_000).unwrap(), 0).unwrap(),
            payload_type: 0,
            ssrc: 0,
            mark: true,
            loss: 0,
        }
        .build((0..160u32).map(|i| i as u8))
        .unwrap();
        d.push(pkt).unwrap();
        let frame = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            _ => panic!(),
        };
        assert_eq!(frame.frame_length().get(), 160);
    }

    #[test]
    fn packetize_splits_on_sample_boundaries() {
        let mut p = Packetizer::new(0, 1, 0, 100, 8, 8_000);
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let pkts = p.packetize(&data, 1000).unwrap();
        assert_eq!(pkts.len(), 3);
        let (first, _) = crate::rtp::RawPacket::new(pkts[0].clone()).unwrap();
        assert!(first.mark());
        assert_eq!(first.timestamp(), 1000);
        let (second, _) = crate::rtp::RawPacket::new(pkts[1].clone()).unwrap();
        assert!(!second.mark());
        assert_eq!(second.timestamp(), 1100);
        let (third, range) = crate::rtp::RawPacket::new(pkts[2].clone()).unwrap();
        assert_eq!(third.timestamp(), 1200);
        assert_eq!(range.len(), 50);
    }
}
