// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opus, as specified in [RFC 7587](https://datatracker.ietf.org/doc/html/rfc7587):
//! exactly one Opus packet per RTP packet, always at a 48 kHz RTP clock.

use std::num::NonZeroU32;

use crate::rtp::ReceivedPacket;

use super::{AudioParameters, CodecItem};

#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: AudioParameters,
    pending: Option<super::AudioFrame>,
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self {
            parameters: AudioParameters {
                rfc6381_codec: Some("opus".to_owned()),
                frame_length: None, // varies with the TOC byte.
                clock_rate: 48_000,
                extra_data: Vec::new(),
            },
            pending: None,
        }
    }
}

/// Returns the duration in 48 kHz units described by an Opus TOC byte, per
/// [RFC 6716 section 3.1](https://datatracker.ietf.org/doc/html/rfc6716#section-3.1).
fn duration_from_toc(payload: &[u8]) -> Option<NonZeroU32> {
    let toc = *payload.first()?;
    let config = toc >> 3;
    // Frame duration by configuration: 2.5/5/10/20/40/60 ms depending on
    // mode; expressed here in 48 kHz clock units.
    let frame_duration: u32 = match config {
        16 | 20 | 24 | 28 => 120,  // 2.5 ms (CELT)
        17 | 21 | 25 | 29 => 240,  // 5 ms
        0 | 4 | 8 | 12 | 14 | 18 | 22 | 26 | 30 => 480, // 10 ms
        1 | 5 | 9 | 13 | 15 | 19 | 23 | 27 | 31 => 960, // 20 ms
        2 | 6 | 10 => 1920,        // 40 ms (SILK)
        3 | 7 | 11 => 2880,        // 60 ms
        _ => return None,
    };
    let frames: u32 = match toc & 0b11 {
        0 => 1,
        1 | 2 => 2,
        3 => u32::from(*payload.get(1)? & 0b0011_1111),
        _ => unreachable!(),
    };
    NonZeroU32::new(frame_duration.checked_mul(frames)?)
}

impl Depacketizer {
    pub(super) fn parameters(&self) -> Option<super::ParametersRef<'_>> {
        Some(super::ParametersRef::Audio(&self.parameters))
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        assert!(self.pending.is_none());
        let frame_length = duration_from_toc(pkt.payload())
            .ok_or_else(|| "Opus packet with invalid TOC".to_owned())?;
        self.pending = Some(super::AudioFrame {
            ctx: *pkt.ctx(),
            stream_id: pkt.stream_id(),
            timestamp: pkt.timestamp(),
            frame_length,
            loss: pkt.loss(),
            data: pkt.into_payload_bytes(),
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take().map(CodecItem::AudioFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toc_durations() {
        // Config 1 (SILK NB 20 ms), one frame.
        assert_eq!(duration_from_toc(&[0b00001_0_00]).unwrap().get(), 960);
        // Config 3 (SILK NB 60 ms), code 3 with 2 frames.
        assert_eq!(
            duration_from_toc(&[0b00011_0_11, 0b0000_0010])
                .unwrap()
                .get(),
            5760
        );
        // Code 1: two frames.
        assert_eq!(duration_from_toc(&[0b00001_0_01]).unwrap().get(), 1920);
        // Empty payload.
        assert!(duration_from_toc(&[]).is_none());
    }
}
