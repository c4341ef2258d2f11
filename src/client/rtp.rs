// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-stream RTP/RTCP ingress handling; see
//! [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).

use bytes::{Buf, Bytes};
use log::{debug, trace};

use crate::rtp::{RawPacket, ReceivedPacket};
use crate::{Error, ErrorInt, PacketContext};

use super::{PacketItem, Timeline};

/// RTP demarshaller which ensures packets have the correct SSRC and
/// monotonically increasing SEQ.
///
/// This reports packet loss (via [`ReceivedPacket::loss`]) but doesn't
/// prohibit it, except for losses of more than `i16::MAX` which would be
/// indistinguishable from non-monotonic sequence numbers. Servers sometimes
/// drop packets internally even when sending data via TCP.
///
/// At least one camera (a Reolink) sometimes sends data from old RTSP
/// sessions over new ones. This seems like a serious bug, and currently
/// `StrictSequenceChecker` will error in this case, although it'd be possible
/// to discard the incorrect SSRC instead.
///
/// [RFC 3550 section 8.2](https://tools.ietf.org/html/rfc3550#section-8.2)
/// says that SSRC can change mid-session with a RTCP BYE message. This
/// currently isn't handled. I'm not sure it will ever come up with IP
/// cameras.
#[derive(Debug)]
pub(super) struct StrictSequenceChecker {
    ssrc: Option<u32>,
    next_seq: Option<u16>,
}

impl StrictSequenceChecker {
    pub(super) fn new(ssrc: Option<u32>, next_seq: Option<u16>) -> Self {
        Self { ssrc, next_seq }
    }

    pub(super) fn rtp(
        &mut self,
        conn_ctx: &crate::ConnectionContext,
        stream_ctx: &crate::StreamContext,
        pkt_ctx: PacketContext,
        timeline: &mut Timeline,
        stream_id: usize,
        mut data: Bytes,
    ) -> Result<PacketItem, Error> {
        // Workaround for a GW Security camera, which wraps one RTSP
        // interleaved message in another. RTP and RTCP packets can never
        // start with '$', so this shouldn't interfere with well-behaved
        // servers.
        if data.len() > 4
            && data[0] == b'$'
            && usize::from(u16::from_be_bytes([data[2], data[3]])) <= data.len() - 4
        {
            debug!("stripping extra interleaved data header");
            data.advance(4);
        }

        let (raw, payload_range) = RawPacket::new(data).map_err(|e| {
            wrap!(ErrorInt::PacketError {
                conn_ctx: *conn_ctx,
                stream_ctx: *stream_ctx,
                pkt_ctx,
                stream_id,
                description: format!(
                    "corrupt RTP header while expecting seq={:04x?}: {}\n{:#?}",
                    self.next_seq,
                    e.reason,
                    crate::hex::LimitedHex::new(&e.data[..], 64),
                ),
            })
        })?;

        let sequence_number = raw.sequence_number();
        let ssrc = raw.ssrc();
        let loss = sequence_number.wrapping_sub(self.next_seq.unwrap_or(sequence_number));
        if matches!(self.ssrc, Some(s) if s != ssrc) || loss > 0x80_00 {
            bail!(ErrorInt::RtpPacketError {
                conn_ctx: *conn_ctx,
                stream_ctx: *stream_ctx,
                pkt_ctx,
                stream_id,
                ssrc,
                sequence_number,
                description: format!(
                    "Expected ssrc={:08x?} seq={:04x?}",
                    self.ssrc, self.next_seq
                ),
            });
        }
        let timestamp = timeline.advance_to(raw.timestamp()).map_err(|description| {
            wrap!(ErrorInt::RtpPacketError {
                conn_ctx: *conn_ctx,
                stream_ctx: *stream_ctx,
                pkt_ctx,
                stream_id,
                ssrc,
                sequence_number,
                description,
            })
        })?;
        self.ssrc = Some(ssrc);
        trace!(
            "pkt {:04x}{} ts={} len={}",
            sequence_number,
            if raw.mark() { "   " } else { "(M)" },
            &timestamp,
            payload_range.len()
        );
        self.next_seq = Some(sequence_number.wrapping_add(1));
        Ok(PacketItem::Rtp(ReceivedPacket {
            ctx: pkt_ctx,
            stream_id,
            timestamp,
            raw,
            payload_range,
            loss,
        }))
    }

    pub(super) fn rtcp(
        &mut self,
        conn_ctx: &crate::ConnectionContext,
        stream_ctx: &crate::StreamContext,
        pkt_ctx: PacketContext,
        timeline: &mut Timeline,
        stream_id: usize,
        data: Bytes,
    ) -> Result<Option<PacketItem>, Error> {
        let first_pkt = crate::rtcp::ReceivedCompoundPacket::validate(&data[..]).map_err(
            |description| {
                wrap!(ErrorInt::PacketError {
                    conn_ctx: *conn_ctx,
                    stream_ctx: *stream_ctx,
                    pkt_ctx,
                    stream_id,
                    description,
                })
            },
        )?;
        let rtp_timestamp = match first_pkt.as_sender_report() {
            Ok(Some(sr)) => match timeline.place(sr.rtp_timestamp()) {
                Ok(ts) => Some(ts),
                Err(description) => {
                    bail!(ErrorInt::PacketError {
                        conn_ctx: *conn_ctx,
                        stream_ctx: *stream_ctx,
                        pkt_ctx,
                        stream_id,
                        description: format!("bad RTP timestamp in RTCP SR: {description}"),
                    });
                }
            },
            Ok(None) => None,
            Err(description) => {
                bail!(ErrorInt::PacketError {
                    conn_ctx: *conn_ctx,
                    stream_ctx: *stream_ctx,
                    pkt_ctx,
                    stream_id,
                    description,
                });
            }
        };
        Ok(Some(PacketItem::Rtcp(
            crate::rtcp::ReceivedCompoundPacket {
                ctx: pkt_ctx,
                stream_id,
                rtp_timestamp,
                raw: data,
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RawPacketBuilder;

    fn build(sequence_number: u16, timestamp: u32, ssrc: u32) -> Bytes {
        RawPacketBuilder {
            sequence_number,
            timestamp,
            payload_type: 96,
            ssrc,
            mark: false,
        }
        .build(b"x".iter().copied())
        .unwrap()
        .0
         .0
    }

    fn checker_ctx() -> (
        crate::ConnectionContext,
        crate::StreamContext,
        Timeline,
        StrictSequenceChecker,
    ) {
        (
            crate::ConnectionContext::dummy(),
            crate::StreamContext::dummy(),
            Timeline::new(None, 90_000, None).unwrap(),
            StrictSequenceChecker::new(None, None),
        )
    }

    #[test]
    fn in_order_and_loss_counting() {
        let (conn, stream, mut timeline, mut c) = checker_ctx();
        let p = c
            .rtp(
                &conn,
                &stream,
                PacketContext::dummy(),
                &mut timeline,
                0,
                build(100, 0, 42),
            )
            .unwrap();
        match p {
            PacketItem::Rtp(p) => assert_eq!(p.loss(), 0),
            _ => panic!(),
        }
        // Skip two packets.
        let p = c
            .rtp(
                &conn,
                &stream,
                PacketContext::dummy(),
                &mut timeline,
                0,
                build(103, 3000, 42),
            )
            .unwrap();
        match p {
            PacketItem::Rtp(p) => {
                assert_eq!(p.loss(), 2);
                assert_eq!(p.sequence_number(), 103);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn ssrc_change_rejected() {
        let (conn, stream, mut timeline, mut c) = checker_ctx();
        c.rtp(
            &conn,
            &stream,
            PacketContext::dummy(),
            &mut timeline,
            0,
            build(100, 0, 42),
        )
        .unwrap();
        c.rtp(
            &conn,
            &stream,
            PacketContext::dummy(),
            &mut timeline,
            0,
            build(101, 0, 43),
        )
        .unwrap_err();
    }

    #[test]
    fn rtcp_sender_report_placed_on_timeline() {
        let (conn, stream, mut timeline, mut c) = checker_ctx();
        let sr = crate::rtcp::serialize_sender_report(7, crate::NtpTimestamp(0), 90_000, 1, 1);
        let item = c
            .rtcp(
                &conn,
                &stream,
                PacketContext::dummy(),
                &mut timeline,
                0,
                sr,
            )
            .unwrap()
            .unwrap();
        match item {
            PacketItem::Rtcp(pkt) => {
                assert!(pkt.rtp_timestamp().is_some());
            }
            _ => panic!(),
        }
    }
}
