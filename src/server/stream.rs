// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-to-many delivery of a published stream to reader sessions.
//!
//! A [`ServerStream`] is the publisher's side of a path: the handler returns
//! one from `on_describe`/`on_setup`, and the publisher (an `ANNOUNCE`d
//! session, a file reader, a transcoder...) calls [`ServerStream::write_rtp`]
//! for each packet. Publishing and subscriber changes are serialized by a
//! single lock whose critical section only updates counters and clones the
//! subscriber list; the actual sends happen through each reader's bounded
//! writer queue.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorInt;
use crate::rtcp::SenderReportState;
use crate::sdp::Media;
use crate::writer::{PacketKind, QueuedPacket, SessionWriter};
use crate::Error;

/// A handle to one subscribed reader session's egress.
pub(super) struct ReaderHandle {
    pub(super) session_id: String,
    pub(super) writer: SessionWriter,

    /// Cancelling collapses the reader's session; done when its queue fills.
    pub(super) token: CancellationToken,
}

struct StreamInner {
    /// Per medium, per format: counters for sender reports.
    senders: Vec<Vec<SenderReportState>>,

    readers: Vec<ReaderHandle>,

    /// Multicast egress, if any reader negotiated it: the network fans out,
    /// so there is exactly one writer regardless of the reader count.
    multicast: Option<MulticastSender>,
}

pub(super) struct MulticastSender {
    pub(super) writer: SessionWriter,
    pub(super) group: std::net::Ipv4Addr,
    pub(super) rtp_port: u16,
    pub(super) ttl: u32,
    pub(super) refs: usize,
}

/// A publisher's media and its set of subscribed reader sessions.
pub struct ServerStream {
    medias: Vec<Media>,
    inner: Mutex<StreamInner>,
}

impl ServerStream {
    /// Creates a stream for the given media.
    ///
    /// Each medium gets an independent random SSRC for the sender reports.
    pub fn new(medias: Vec<Media>) -> Result<Arc<Self>, Error> {
        use rand::Rng;
        if medias.is_empty() || medias.len() > crate::MAX_MEDIA_PER_SESSION {
            bail!(ErrorInt::InvalidArgument(format!(
                "expected 1..={} media, got {}",
                crate::MAX_MEDIA_PER_SESSION,
                medias.len()
            )));
        }
        let mut senders = Vec::with_capacity(medias.len());
        for m in &medias {
            let mut per_format = Vec::with_capacity(m.formats.len());
            for f in &m.formats {
                let clock_rate = NonZeroU32::new(f.clock_rate()).ok_or_else(|| {
                    wrap!(ErrorInt::InvalidArgument("format with clock_rate=0".into()))
                })?;
                per_format.push(SenderReportState::new(
                    rand::thread_rng().gen(),
                    clock_rate,
                    None,
                ));
            }
            senders.push(per_format);
        }
        let stream = Arc::new(Self {
            medias,
            inner: Mutex::new(StreamInner {
                senders,
                readers: Vec::new(),
                multicast: None,
            }),
        });

        // Periodic sender reports: wallclock alignment for receivers, and
        // the way UDP/multicast pinholes are opened toward readers. Only the
        // first interval is jittered; see `SenderReportState`.
        let interval = crate::rtcp::sender::DEFAULT_SENDER_REPORT_INTERVAL;
        let first = interval.mul_f64(rand::thread_rng().gen_range(0.8..1.2));
        let weak = Arc::downgrade(&stream);
        tokio::spawn(async move {
            tokio::time::sleep(first).await;
            loop {
                match weak.upgrade() {
                    Some(s) => s.send_sender_reports(),
                    None => break,
                }
                tokio::time::sleep(interval).await;
            }
        });
        Ok(stream)
    }

    pub fn medias(&self) -> &[Media] {
        &self.medias
    }

    /// Returns the number of subscribed readers.
    pub fn reader_count(&self) -> usize {
        self.inner.lock().expect("not poisoned").readers.len()
    }

    /// Publishes one serialized RTP packet on the given medium to every
    /// reader.
    ///
    /// Readers whose write queue has filled (they can't keep up) have their
    /// sessions collapsed and are dropped from the subscriber list; this
    /// never blocks or fails the publisher.
    pub fn write_rtp(&self, medium: usize, pkt: Bytes) -> Result<(), Error> {
        if medium >= self.medias.len() {
            bail!(ErrorInt::InvalidArgument(format!(
                "medium {medium} out of range"
            )));
        }
        let (raw, payload_range) = crate::rtp::RawPacket::new(pkt.clone()).map_err(|e| {
            wrap!(ErrorInt::InvalidArgument(format!(
                "bad RTP packet: {}",
                e.reason
            )))
        })?;
        let (readers, multicast) = {
            let mut inner = self.inner.lock().expect("not poisoned");
            if let Some(i) = self.medias[medium]
                .formats
                .iter()
                .position(|f| f.payload_type() == raw.payload_type())
            {
                inner.senders[medium][i].record_packet(
                    raw.timestamp(),
                    payload_range.len(),
                    Instant::now(),
                );
            }
            (
                inner
                    .readers
                    .iter()
                    .map(|r| (r.writer.clone(), r.token.clone()))
                    .collect::<Vec<_>>(),
                inner.multicast.as_ref().map(|m| m.writer.clone()),
            )
        };
        fan_out(&readers, multicast.as_ref(), medium, PacketKind::Rtp, &pkt);
        Ok(())
    }

    /// Publishes one serialized RTCP packet on the given medium.
    pub fn write_rtcp(&self, medium: usize, pkt: Bytes) -> Result<(), Error> {
        if medium >= self.medias.len() {
            bail!(ErrorInt::InvalidArgument(format!(
                "medium {medium} out of range"
            )));
        }
        let (readers, multicast) = {
            let inner = self.inner.lock().expect("not poisoned");
            (
                inner
                    .readers
                    .iter()
                    .map(|r| (r.writer.clone(), r.token.clone()))
                    .collect::<Vec<_>>(),
                inner.multicast.as_ref().map(|m| m.writer.clone()),
            )
        };
        fan_out(&readers, multicast.as_ref(), medium, PacketKind::Rtcp, &pkt);
        Ok(())
    }

    /// Builds and fans out a sender report for every medium that has sent
    /// data since startup.
    ///
    /// Beyond receiver synchronization, these are what open NAT pinholes
    /// toward multicast/UDP readers that never send anything back.
    pub(super) fn send_sender_reports(&self) {
        let now = Instant::now();
        let now_wall = crate::NtpTimestamp::try_from(chrono::Utc::now())
            .unwrap_or(crate::UNIX_EPOCH);
        let mut reports = Vec::new();
        let (readers, multicast) = {
            let mut inner = self.inner.lock().expect("not poisoned");
            let inner = &mut *inner;
            for (medium, per_format) in inner.senders.iter_mut().enumerate() {
                for sender in per_format.iter_mut() {
                    if let Some(report) = sender.serialize_report(now, now_wall) {
                        reports.push((medium, report));
                    }
                }
            }
            (
                inner
                    .readers
                    .iter()
                    .map(|r| (r.writer.clone(), r.token.clone()))
                    .collect::<Vec<_>>(),
                inner.multicast.as_ref().map(|m| m.writer.clone()),
            )
        };
        for (medium, report) in reports {
            fan_out(&readers, multicast.as_ref(), medium, PacketKind::Rtcp, &report);
        }
    }

    pub(super) fn add_reader(&self, handle: ReaderHandle) {
        self.inner.lock().expect("not poisoned").readers.push(handle);
    }

    pub(super) fn remove_reader(&self, session_id: &str) {
        self.inner
            .lock()
            .expect("not poisoned")
            .readers
            .retain(|r| r.session_id != session_id);
    }

    /// Registers a multicast reader, creating the single multicast egress on
    /// first use. Returns `(group, rtp_port, ttl)` for the `Transport`
    /// response.
    pub(super) fn add_multicast_reader(
        &self,
        create: impl FnOnce() -> Result<MulticastSender, Error>,
    ) -> Result<(std::net::Ipv4Addr, u16, u32), Error> {
        let mut inner = self.inner.lock().expect("not poisoned");
        match &mut inner.multicast {
            Some(m) => {
                m.refs += 1;
                Ok((m.group, m.rtp_port, m.ttl))
            }
            None => {
                let m = create()?;
                let out = (m.group, m.rtp_port, m.ttl);
                inner.multicast = Some(m);
                Ok(out)
            }
        }
    }

    pub(super) fn remove_multicast_reader(&self) {
        let mut inner = self.inner.lock().expect("not poisoned");
        if let Some(m) = &mut inner.multicast {
            m.refs -= 1;
            if m.refs == 0 {
                inner.multicast = None;
            }
        }
    }

    /// Drops every reader, collapsing their sessions. Used when the publisher
    /// goes away.
    pub fn close(&self) {
        let readers = {
            let mut inner = self.inner.lock().expect("not poisoned");
            inner.multicast = None;
            std::mem::take(&mut inner.readers)
        };
        for r in readers {
            r.token.cancel();
        }
    }
}

fn fan_out(
    readers: &[(SessionWriter, CancellationToken)],
    multicast: Option<&SessionWriter>,
    medium: usize,
    kind: PacketKind,
    pkt: &Bytes,
) {
    for (writer, token) in readers {
        if let Err(e) = writer.try_queue(QueuedPacket {
            medium,
            kind,
            payload: pkt.clone(),
        }) {
            // Slow reader: its queue filled. Fatal for that session only.
            debug!("dropping reader: {e}");
            token.cancel();
        }
    }
    if let Some(writer) = multicast {
        if let Err(e) = writer.try_queue(QueuedPacket {
            medium,
            kind,
            payload: pkt.clone(),
        }) {
            debug!("multicast write queue full: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    fn stream() -> Arc<ServerStream> {
        ServerStream::new(vec![Media::new(
            "audio",
            Format::from_sdp("audio", 0, "pcmu", 8_000, None, None).unwrap(),
        )])
        .unwrap()
    }

    fn rtp_pkt(seq: u16) -> Bytes {
        crate::rtp::RawPacketBuilder {
            sequence_number: seq,
            timestamp: 0,
            payload_type: 0,
            ssrc: 1,
            mark: false,
        }
        .build(b"x".iter().copied())
        .unwrap()
        .0
         .0
    }

    #[tokio::test]
    async fn fan_out_to_readers() {
        let s = stream();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        s.add_reader(ReaderHandle {
            session_id: "a".into(),
            writer: crate::writer::SessionWriter::for_test(tx),
            token: CancellationToken::new(),
        });
        assert_eq!(s.reader_count(), 1);
        s.write_rtp(0, rtp_pkt(1)).unwrap();
        let q = rx.recv().await.unwrap();
        assert_eq!(q.medium, 0);
        assert_eq!(q.kind, PacketKind::Rtp);
        s.remove_reader("a");
        assert_eq!(s.reader_count(), 0);
    }

    #[tokio::test]
    async fn slow_reader_collapsed() {
        let s = stream();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let token = CancellationToken::new();
        s.add_reader(ReaderHandle {
            session_id: "a".into(),
            writer: crate::writer::SessionWriter::for_test(tx),
            token: token.clone(),
        });
        s.write_rtp(0, rtp_pkt(1)).unwrap();
        assert!(!token.is_cancelled());
        // Queue of one is now full; the next write collapses the reader.
        s.write_rtp(0, rtp_pkt(2)).unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let s = stream();
        s.write_rtp(0, Bytes::from_static(b"nope")).unwrap_err();
        s.write_rtp(1, rtp_pkt(0)).unwrap_err();
    }
}
