// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A server session: the state machine driven by one client's `SETUP` and
//! subsequent requests, and its media plane.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::client::Timeline;
use crate::codec::Depacketizer;
use crate::error::ErrorInt;
use crate::format::Format;
use crate::rtcp::ReceiverReportState;
use crate::rtp::{RawPacket, ReceivedPacket};
use crate::sdp::Media;
use crate::writer::SessionWriter;
use crate::{Error, PacketContext, Transport, WallTime};

use super::udp::UdpListenerPair;
use super::{ServerHandler, SessionContext};

/// Extra time past the advertised timeout before an idle session is
/// expired, allowing for keepalives delayed in flight.
pub(super) const EXPIRY_GRACE: Duration = Duration::from_secs(5);

/// Session state, per RFC 2326 appendix A: `SETUP` is accepted in `Initial`,
/// `PrePlay`, and `PreRecord`; `PLAY` only in `PrePlay`; `RECORD` only in
/// `PreRecord`; in `Play`/`Record` only `PAUSE`, `TEARDOWN`,
/// `GET_PARAMETER`, and `SET_PARAMETER` are accepted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
}

/// Per-medium transport assignment and (in record mode) per-format read
/// state.
#[derive(Default)]
pub(super) struct SessionMedia {
    pub(super) tcp_channel: Option<u8>,
    pub(super) peer_rtp_port: Option<u16>,
    pub(super) peer_rtcp_port: Option<u16>,

    /// Keyed by RTP payload type; populated at `RECORD` time.
    pub(super) formats: HashMap<u8, RecordFormat>,
}

/// Read-path state for one format of one medium of a recording session.
pub(super) struct RecordFormat {
    depacketizer: Option<Depacketizer>,
    timeline: Timeline,
    pub(super) rtcp_rx: ReceiverReportState,
    next_seq: Option<u16>,
}

impl RecordFormat {
    pub(super) fn new(format: &Format) -> Result<Self, String> {
        let clock_rate = format.clock_rate();
        Ok(Self {
            depacketizer: Depacketizer::new(format).ok(),
            timeline: Timeline::new(None, clock_rate, None)?,
            rtcp_rx: ReceiverReportState::new(
                std::num::NonZeroU32::new(clock_rate).ok_or("clock_rate=0")?,
            ),
            next_seq: None,
        })
    }
}

pub(super) struct SessionInner {
    pub(super) state: SessionState,
    pub(super) transport: Option<Transport>,
    pub(super) media: Vec<SessionMedia>,

    /// The stream being read, in play mode.
    pub(super) stream: Option<Arc<super::stream::ServerStream>>,

    /// The announced media being published, in record mode.
    pub(super) announced: Option<Vec<Media>>,

    pub(super) writer: Option<SessionWriter>,
    pub(super) is_multicast: bool,
    closed: bool,
}

pub(crate) struct ServerSession {
    pub(super) id: String,
    pub(super) conn_id: u64,
    pub(super) peer_ip: IpAddr,
    pub(super) session_timeout: Duration,
    pub(super) token: CancellationToken,
    pub(super) handler: Arc<dyn ServerHandler>,
    pub(super) udp: Option<Arc<UdpListenerPair>>,
    pub(super) inner: Mutex<SessionInner>,

    /// The fatal error (if any) terminating this session, reported once via
    /// `on_session_close`.
    error: Mutex<Option<Error>>,

    last_activity: Mutex<Instant>,
}

impl ServerSession {
    pub(super) fn new(
        id: String,
        conn_id: u64,
        peer_ip: IpAddr,
        session_timeout: Duration,
        token: CancellationToken,
        handler: Arc<dyn ServerHandler>,
        udp: Option<Arc<UdpListenerPair>>,
        media_count: usize,
    ) -> Arc<Self> {
        let mut media = Vec::with_capacity(media_count);
        media.resize_with(media_count, SessionMedia::default);
        Arc::new(Self {
            id,
            conn_id,
            peer_ip,
            session_timeout,
            token,
            handler,
            udp,
            inner: Mutex::new(SessionInner {
                state: SessionState::Initial,
                transport: None,
                media,
                stream: None,
                announced: None,
                writer: None,
                is_multicast: false,
                closed: false,
            }),
            error: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub(super) fn ctx(&self) -> SessionContext<'_> {
        SessionContext {
            conn_id: self.conn_id,
            session_id: &self.id,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.inner.lock().expect("not poisoned").state
    }

    pub(super) fn refresh_activity(&self) {
        *self.last_activity.lock().expect("not poisoned") = Instant::now();
    }

    pub(super) fn is_expired(&self, now: Instant) -> bool {
        let last = *self.last_activity.lock().expect("not poisoned");
        now.saturating_duration_since(last) > self.session_timeout + EXPIRY_GRACE
    }

    pub(super) fn set_error(&self, e: Error) {
        let mut slot = self.error.lock().expect("not poisoned");
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    /// Tears the session's media plane down: deregisters from the UDP
    /// listeners and the stream's reader set, and cancels all of its tasks.
    /// Idempotent; the caller removes the session from the server's table.
    pub(super) fn close(&self) {
        let (stream, was_multicast) = {
            let mut inner = self.inner.lock().expect("not poisoned");
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.writer = None;
            (inner.stream.take(), inner.is_multicast)
        };
        if let Some(udp) = &self.udp {
            udp.remove_session(self);
        }
        if let Some(stream) = stream {
            stream.remove_reader(&self.id);
            if was_multicast {
                stream.remove_multicast_reader();
            }
        }
        self.token.cancel();
        let err = self.error.lock().expect("not poisoned").take();
        self.handler.on_session_close(&self.ctx(), err.as_ref());
    }

    pub(super) fn warn_packet_too_big(&self, is_rtp: bool) {
        self.warn(wrap!(ErrorInt::InvalidArgument(format!(
            "{} packet is too big to be read with UDP",
            if is_rtp { "RTP" } else { "RTCP" },
        ))));
    }

    fn warn(&self, e: Error) {
        self.handler.on_warning(&self.ctx(), &e);
    }

    /// Handles an RTP datagram from the UDP listener.
    pub(crate) fn handle_rtp(&self, medium: usize, body: Bytes) {
        self.refresh_activity();
        self.process_rtp(medium, PacketContext::udp(WallTime::now()), body);
    }

    /// Handles an RTCP datagram from the UDP listener.
    pub(crate) fn handle_rtcp(&self, medium: usize, body: Bytes) {
        self.refresh_activity();
        self.process_rtcp(medium, PacketContext::udp(WallTime::now()), body);
    }

    /// Handles an interleaved frame from the session's connection.
    pub(super) fn handle_interleaved(
        &self,
        channel_id: u8,
        msg_ctx: crate::RtspMessageContext,
        body: Bytes,
    ) {
        let medium = {
            let inner = self.inner.lock().expect("not poisoned");
            inner
                .media
                .iter()
                .position(|m| matches!(m.tcp_channel, Some(c) if c == channel_id & !1))
        };
        let Some(medium) = medium else {
            self.warn(wrap!(ErrorInt::InvalidArgument(format!(
                "interleaved frame on unassigned channel {channel_id}"
            ))));
            return;
        };
        let ctx = PacketContext::tcp(msg_ctx);
        if (channel_id & 1) == 0 {
            self.process_rtp(medium, ctx, body);
        } else {
            self.process_rtcp(medium, ctx, body);
        }
    }

    /// The `RECORD` RTP read path: validate, track stats, forward to the
    /// handler, and feed the per-format depacketizer.
    ///
    /// Codec-level errors from a single packet are warnings; the session
    /// continues with the packet dropped.
    fn process_rtp(&self, medium: usize, pkt_ctx: PacketContext, body: Bytes) {
        let pkt = {
            let mut inner = self.inner.lock().expect("not poisoned");
            if inner.state != SessionState::Record {
                // RTP toward a reader session is nonsense; drop it.
                return;
            }
            let Some(m) = inner.media.get_mut(medium) else {
                return;
            };
            let (raw, payload_range) = match RawPacket::new(body) {
                Ok(p) => p,
                Err(e) => {
                    drop(inner);
                    self.warn(wrap!(ErrorInt::InvalidArgument(format!(
                        "corrupt RTP packet: {}",
                        e.reason
                    ))));
                    return;
                }
            };
            let payload_type = raw.payload_type();
            let Some(f) = m.formats.get_mut(&payload_type) else {
                drop(inner);
                self.warn(wrap!(ErrorInt::InvalidArgument(format!(
                    "received RTP packet with unknown payload type ({payload_type})"
                ))));
                return;
            };
            let sequence_number = raw.sequence_number();
            let timestamp = match f.timeline.advance_to(raw.timestamp()) {
                Ok(t) => t,
                Err(description) => {
                    drop(inner);
                    self.warn(wrap!(ErrorInt::InvalidArgument(description)));
                    return;
                }
            };
            let loss = sequence_number.wrapping_sub(f.next_seq.unwrap_or(sequence_number));
            f.next_seq = Some(sequence_number.wrapping_add(1));
            f.rtcp_rx.process_packet(
                raw.ssrc(),
                sequence_number,
                raw.timestamp(),
                Instant::now(),
            );
            let pkt = ReceivedPacket {
                ctx: pkt_ctx,
                stream_id: medium,
                timestamp,
                raw,
                payload_range,
                loss,
            };
            if let Some(d) = &mut f.depacketizer {
                // Keep the depacketizer fed so frame boundaries and in-band
                // parameter updates stay coherent; frames themselves are the
                // application's business via on_packet_rtp.
                let copy = ReceivedPacket {
                    ctx: pkt.ctx,
                    stream_id: pkt.stream_id,
                    timestamp: pkt.timestamp,
                    raw: RawPacket(pkt.raw.0.clone()),
                    payload_range: pkt.payload_range.clone(),
                    loss: pkt.loss,
                };
                if let Err(description) = d.push(copy) {
                    drop(inner);
                    self.warn(wrap!(ErrorInt::InvalidArgument(description)));
                    self.handler.on_packet_rtp(&self.ctx(), medium, &pkt);
                    return;
                }
                while d.pull().is_some() {}
            }
            pkt
        };
        self.handler.on_packet_rtp(&self.ctx(), medium, &pkt);
    }

    /// The RTCP read path, live in both directions: readers send receiver
    /// reports; publishers send sender reports that align RTP timestamps
    /// with wallclock.
    fn process_rtcp(&self, medium: usize, pkt_ctx: PacketContext, body: Bytes) {
        if let Err(description) = crate::rtcp::ReceivedCompoundPacket::validate(&body[..]) {
            self.warn(wrap!(ErrorInt::InvalidArgument(description)));
            return;
        }
        let pkt = crate::rtcp::ReceivedCompoundPacket {
            ctx: pkt_ctx,
            stream_id: medium,
            rtp_timestamp: None,
            raw: body,
        };
        {
            let mut inner = self.inner.lock().expect("not poisoned");
            if inner.state == SessionState::Record {
                if let Some(m) = inner.media.get_mut(medium) {
                    let now = Instant::now();
                    for p in pkt.pkts() {
                        if let Ok(Some(sr)) = p.as_sender_report() {
                            if let Some(f) = m
                                .formats
                                .values_mut()
                                .find(|f| f.rtcp_rx.ssrc() == Some(sr.ssrc()))
                            {
                                f.rtcp_rx.process_sender_report(&sr, now);
                            }
                        }
                    }
                }
            }
        }
        self.handler.on_packet_rtcp(&self.ctx(), medium, &pkt);
    }

    /// Emits receiver reports for a recording session's media through its
    /// writer queue; a no-op for reading sessions.
    pub(super) fn send_receiver_reports(&self, local_ssrc: u32) {
        let mut inner = self.inner.lock().expect("not poisoned");
        if inner.state != SessionState::Record {
            return;
        }
        let now = Instant::now();
        let inner = &mut *inner;
        let Some(writer) = &inner.writer else { return };
        for (i, m) in inner.media.iter_mut().enumerate() {
            for f in m.formats.values_mut() {
                let Some(report) = f.rtcp_rx.serialize_report(local_ssrc, now) else {
                    continue;
                };
                if let Err(e) = writer.try_queue(crate::writer::QueuedPacket {
                    medium: i,
                    kind: crate::writer::PacketKind::Rtcp,
                    payload: report,
                }) {
                    debug!("session {}: dropping receiver report: {e}", self.id);
                }
            }
        }
    }
}
