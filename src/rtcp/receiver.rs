// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Receiver-side RTCP statistics, as described in
//! [RFC 3550 section 6.4](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4)
//! and appendix A.8 (jitter estimation).

use std::num::NonZeroU32;
use std::time::Instant;

use bytes::Bytes;

use crate::NtpTimestamp;

use super::{serialize_receiver_report, ReportBlock, SenderReportRef};

/// The last sender report seen from the remote sender.
#[derive(Copy, Clone, Debug)]
struct LastSenderReport {
    ntp_timestamp: NtpTimestamp,
    rtp_timestamp: u32,
    arrival: Instant,
}

/// Tracks reception statistics for a single remote SSRC and produces
/// receiver reports on demand.
///
/// The expected/lost accounting and the interarrival jitter EWMA follow
/// RFC 3550 appendix A; the NTP/RTP pair recorded by
/// [`ReceiverReportState::process_sender_report`] is what later converts RTP
/// timestamps into wallclock presentation times.
#[derive(Debug)]
pub struct ReceiverReportState {
    clock_rate: NonZeroU32,

    /// An arbitrary epoch against which arrival times are converted into
    /// clock-rate units for jitter computation.
    epoch: Instant,

    ssrc: Option<u32>,
    base_seq: u32,

    /// The extended (cycle-count included) highest sequence number seen.
    max_seq_ext: u32,
    received: u64,
    expected_prior: u32,
    received_prior: u32,

    /// Relative transit time of the previous packet, in clock-rate units.
    transit: Option<i64>,

    /// Interarrival jitter estimate, in clock-rate units.
    jitter: f64,

    last_sr: Option<LastSenderReport>,
}

impl ReceiverReportState {
    pub fn new(clock_rate: NonZeroU32) -> Self {
        Self {
            clock_rate,
            epoch: Instant::now(),
            ssrc: None,
            base_seq: 0,
            max_seq_ext: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            transit: None,
            jitter: 0.,
            last_sr: None,
        }
    }

    /// Returns the SSRC of the remote sender, once a packet has been seen.
    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    /// Returns the current interarrival jitter estimate in clock-rate units.
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    fn arrival_units(&self, arrival: Instant) -> i64 {
        let elapsed = arrival.saturating_duration_since(self.epoch);
        (elapsed.as_secs_f64() * f64::from(self.clock_rate.get())) as i64
    }

    /// Notes the arrival of an RTP packet.
    ///
    /// Sequence numbers from a different SSRC reset all statistics; RFC 3550
    /// section 8.2 allows mid-session SSRC changes via BYE, and some cameras
    /// change SSRC without one.
    pub fn process_packet(&mut self, ssrc: u32, sequence_number: u16, rtp_timestamp: u32, arrival: Instant) {
        if self.ssrc != Some(ssrc) {
            self.ssrc = Some(ssrc);
            self.base_seq = u32::from(sequence_number);
            self.max_seq_ext = u32::from(sequence_number);
            self.received = 0;
            self.expected_prior = 0;
            self.received_prior = 0;
            self.transit = None;
            self.jitter = 0.;
        }
        self.received += 1;

        // Extend the 16-bit sequence number, tracking wraparound cycles.
        let max_lo = self.max_seq_ext as u16;
        let delta = sequence_number.wrapping_sub(max_lo);
        if delta < 0x8000 {
            // In order (possibly with a gap), maybe wrapping.
            if sequence_number < max_lo {
                self.max_seq_ext = self
                    .max_seq_ext
                    .wrapping_add(0x1_0000 - u32::from(max_lo))
                    .wrapping_add(u32::from(sequence_number));
            } else {
                self.max_seq_ext = self.max_seq_ext - u32::from(max_lo) + u32::from(sequence_number);
            }
        }
        // else: reordered packet; max stays.

        // RFC 3550 A.8: interarrival jitter.
        let arrival_units = self.arrival_units(arrival);
        let transit = arrival_units - i64::from(rtp_timestamp);
        if let Some(prev) = self.transit {
            let d = (transit - prev).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.;
        }
        self.transit = Some(transit);
    }

    /// Notes a sender report, recording the NTP/RTP timestamp pair.
    pub fn process_sender_report(&mut self, sr: &SenderReportRef<'_>, arrival: Instant) {
        self.last_sr = Some(LastSenderReport {
            ntp_timestamp: sr.ntp_timestamp(),
            rtp_timestamp: sr.rtp_timestamp(),
            arrival,
        });
    }

    /// Returns the NTP/RTP pair of the last sender report, if any.
    pub fn last_sender_report(&self) -> Option<(NtpTimestamp, u32)> {
        self.last_sr
            .map(|sr| (sr.ntp_timestamp, sr.rtp_timestamp))
    }

    /// Converts an RTP timestamp into a wallclock time using the last sender
    /// report's NTP/RTP pair, if one has been seen.
    pub fn wallclock(&self, rtp_timestamp: u32) -> Option<NtpTimestamp> {
        let sr = self.last_sr?;
        let delta = i64::from(rtp_timestamp.wrapping_sub(sr.rtp_timestamp) as i32);
        let delta_ntp =
            ((delta as f64 / f64::from(self.clock_rate.get())) * (1i64 << 32) as f64) as i64;
        Some(NtpTimestamp(
            sr.ntp_timestamp.0.wrapping_add(delta_ntp as u64),
        ))
    }

    /// Builds a receiver report, or `None` before the first packet.
    ///
    /// `local_ssrc` identifies this receiver in the report header.
    pub fn serialize_report(&mut self, local_ssrc: u32, now: Instant) -> Option<Bytes> {
        let remote_ssrc = self.ssrc?;

        // RFC 3550 A.3: loss accounting over the interval since the last
        // report.
        let expected = self.max_seq_ext.wrapping_sub(self.base_seq).wrapping_add(1);
        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = (self.received as u32).wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received as u32;
        let lost_interval = expected_interval.wrapping_sub(received_interval) as i32;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval as u32) << 8).checked_div(expected_interval).unwrap_or(0).min(255) as u8
        };
        let cumulative_lost = expected as i64 - self.received as i64;

        let (last_sr, delay_since_last_sr) = match self.last_sr {
            None => (0, 0),
            Some(sr) => {
                let delay = now.saturating_duration_since(sr.arrival);
                (
                    ((sr.ntp_timestamp.0 >> 16) & 0xFFFF_FFFF) as u32,
                    (delay.as_secs_f64() * 65536.) as u32,
                )
            }
        };
        Some(serialize_receiver_report(
            local_ssrc,
            Some(ReportBlock {
                ssrc: remote_ssrc,
                fraction_lost,
                cumulative_lost: cumulative_lost.clamp(i64::from(i32::MIN), i64::from(i32::MAX))
                    as i32,
                extended_highest_sequence: self.max_seq_ext,
                jitter: self.jitter as u32,
                last_sr,
                delay_since_last_sr,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::PacketRef;

    fn state() -> ReceiverReportState {
        ReceiverReportState::new(NonZeroU32::new(90_000).unwrap())
    }

    #[test]
    fn no_report_before_first_packet() {
        let mut s = state();
        assert!(s.serialize_report(1, Instant::now()).is_none());
    }

    #[test]
    fn counts_and_cycles() {
        let mut s = state();
        let now = Instant::now();
        s.process_packet(42, 0xFFFE, 0, now);
        s.process_packet(42, 0xFFFF, 3000, now);
        s.process_packet(42, 0x0000, 6000, now); // wraps.
        s.process_packet(42, 0x0002, 9000, now); // one lost.
        assert_eq!(s.max_seq_ext, 0x1_0002);
        let report = s.serialize_report(1, now).unwrap();
        let (pkt, _) = PacketRef::parse(&report[..]).unwrap();
        let rr = match pkt.as_typed().unwrap().unwrap() {
            crate::rtcp::TypedPacketRef::ReceiverReport(rr) => rr,
            _ => panic!(),
        };
        assert_eq!(rr.ssrc(), 1);
        // 5 expected, 4 received.
        assert_eq!(rr.fraction_lost(0), Some(51));
    }

    #[test]
    fn wallclock_alignment() {
        let mut s = state();
        let raw = crate::rtcp::serialize_sender_report(
            7,
            crate::NtpTimestamp(0x100 << 32),
            90_000,
            1,
            1,
        );
        let (pkt, _) = PacketRef::parse(&raw[..]).unwrap();
        let sr = pkt.as_sender_report().unwrap().unwrap();
        s.process_sender_report(&sr, Instant::now());

        // One second after the SR's RTP timestamp.
        let ts = s.wallclock(180_000).unwrap();
        assert_eq!(ts.0 >> 32, 0x101);
        // One second before.
        let ts = s.wallclock(0).unwrap();
        assert_eq!(ts.0 >> 32, 0xFF);
    }
}
