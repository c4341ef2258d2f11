// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sender-side RTCP state: periodic sender reports, as described in
//! [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;

use crate::NtpTimestamp;

use super::serialize_sender_report;

/// The default interval between sender reports.
pub(crate) const DEFAULT_SENDER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Tracks transmission statistics for one sender SSRC and builds the periodic
/// sender reports.
///
/// The report interval is fixed (not the RFC 3550 adaptive algorithm); only
/// the *first* period is jittered by ±20% so that many streams started
/// together (eg on server restart) don't report in lockstep.
#[derive(Debug)]
pub struct SenderReportState {
    ssrc: u32,
    clock_rate: NonZeroU32,
    interval: Duration,
    first_interval: Duration,

    packet_count: u32,
    octet_count: u32,

    /// The RTP timestamp of the most recently sent packet and when it was
    /// sent, used to extrapolate the RTP timestamp for "now" in each report.
    last_rtp: Option<(u32, Instant)>,

    reports_sent: u64,
}

impl SenderReportState {
    pub fn new(ssrc: u32, clock_rate: NonZeroU32, interval: Option<Duration>) -> Self {
        let interval = interval.unwrap_or(DEFAULT_SENDER_REPORT_INTERVAL);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Self {
            ssrc,
            clock_rate,
            interval,
            first_interval: interval.mul_f64(jitter),
            packet_count: 0,
            octet_count: 0,
            last_rtp: None,
            reports_sent: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Returns the delay until the next report should be sent.
    pub fn next_interval(&self) -> Duration {
        if self.reports_sent == 0 {
            self.first_interval
        } else {
            self.interval
        }
    }

    /// Notes the transmission of one RTP packet with `payload_len` payload
    /// bytes.
    pub fn record_packet(&mut self, rtp_timestamp: u32, payload_len: usize, now: Instant) {
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload_len as u32);
        self.last_rtp = Some((rtp_timestamp, now));
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn octet_count(&self) -> u32 {
        self.octet_count
    }

    /// Builds a sender report for the current wallclock, or `None` if no
    /// packet has been sent yet (a report without an RTP timestamp reference
    /// would be useless for synchronization).
    pub fn serialize_report(&mut self, now: Instant, now_wall: NtpTimestamp) -> Option<Bytes> {
        let (last_ts, last_instant) = self.last_rtp?;
        let elapsed = now.saturating_duration_since(last_instant);
        let rtp_now = last_ts
            .wrapping_add((elapsed.as_secs_f64() * f64::from(self.clock_rate.get())) as u32);
        self.reports_sent += 1;
        Some(serialize_sender_report(
            self.ssrc,
            now_wall,
            rtp_now,
            self.packet_count,
            self.octet_count,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::PacketRef;

    #[test]
    fn no_report_before_first_packet() {
        let mut s = SenderReportState::new(1, NonZeroU32::new(90_000).unwrap(), None);
        assert!(s
            .serialize_report(Instant::now(), crate::UNIX_EPOCH)
            .is_none());
    }

    #[test]
    fn report_extrapolates_rtp_timestamp() {
        let mut s = SenderReportState::new(42, NonZeroU32::new(90_000).unwrap(), None);
        let t0 = Instant::now();
        s.record_packet(1_000, 100, t0);
        s.record_packet(4_000, 100, t0);
        let raw = s
            .serialize_report(t0 + Duration::from_secs(1), crate::UNIX_EPOCH)
            .unwrap();
        let (pkt, _) = PacketRef::parse(&raw[..]).unwrap();
        let sr = pkt.as_sender_report().unwrap().unwrap();
        assert_eq!(sr.ssrc(), 42);
        assert_eq!(sr.packet_count(), 2);
        assert_eq!(sr.octet_count(), 200);
        assert_eq!(sr.rtp_timestamp(), 4_000 + 90_000);
    }

    #[test]
    fn only_first_interval_jittered() {
        let mut s = SenderReportState::new(1, NonZeroU32::new(8_000).unwrap(), None);
        let first = s.next_interval();
        assert!(first >= Duration::from_secs(4) && first <= Duration::from_secs(6));
        s.record_packet(0, 1, Instant::now());
        s.serialize_report(Instant::now(), crate::UNIX_EPOCH)
            .unwrap();
        assert_eq!(s.next_interval(), DEFAULT_SENDER_REPORT_INTERVAL);
    }
}
