// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Passthrough handling for formats with no codec-specific RTP structure.

use bytes::Bytes;

use crate::rtp::{RawPacketBuilder, ReceivedPacket};

use super::{CodecItem, GenericFrame};

/// Yields one [`GenericFrame`] per RTP packet, as-is.
#[derive(Debug, Default)]
pub(crate) struct Depacketizer {
    pending: Option<GenericFrame>,
}

impl Depacketizer {
    pub(super) fn parameters(&self) -> Option<super::ParametersRef<'_>> {
        None
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        assert!(self.pending.is_none());
        self.pending = Some(GenericFrame {
            ctx: *pkt.ctx(),
            stream_id: pkt.stream_id(),
            timestamp: pkt.timestamp(),
            loss: pkt.loss(),
            mark: pkt.mark(),
            data: pkt.into_payload_bytes(),
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take().map(CodecItem::GenericFrame)
    }
}

/// Emits one RTP packet per frame; a frame larger than the maximum payload
/// size is an error because no codec-agnostic fragmentation exists.
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_type: u8,
    ssrc: u32,
    next_sequence_number: u16,
    max_payload_size: u16,
    mark: bool,
}

impl Packetizer {
    pub(crate) fn new(
        payload_type: u8,
        ssrc: u32,
        initial_sequence_number: u16,
        max_payload_size: u16,
        mark: bool,
    ) -> Self {
        Self {
            payload_type,
            ssrc,
            next_sequence_number: initial_sequence_number,
            max_payload_size,
            mark,
        }
    }

    pub(crate) fn packetize(&mut self, data: &[u8], timestamp: u32) -> Result<Vec<Bytes>, String> {
        if data.len() > usize::from(self.max_payload_size) {
            return Err(format!(
                "frame of {} bytes exceeds maximum payload size {}",
                data.len(),
                self.max_payload_size
            ));
        }
        let (raw, _) = RawPacketBuilder {
            sequence_number: self.next_sequence_number,
            timestamp,
            payload_type: self.payload_type,
            ssrc: self.ssrc,
            mark: self.mark,
        }
        .build(data.iter().copied())?;
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
        Ok(vec![raw.0])
    }
}
