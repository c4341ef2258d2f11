// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-connection request dispatch.
//!
//! A single task per connection reads RTSP requests and interleaved frames,
//! writes responses and queued media frames, and drives the session state
//! machine. Wire-format errors drop the offending connection; they never
//! poison the whole server.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace, warn};
use rtsp_types::{Message, Method, StatusCode, Version};
use tokio::sync::mpsc;
use url::Url;

use crate::client::parse::{parse_transport, ParsedTransport};
use crate::conn::Connection;
use crate::sdp::Media;
use crate::writer::{self, MediumWriteTarget, PacketKind, QueuedPacket};
use crate::Transport;

use super::session::{RecordFormat, ServerSession, SessionState};
use super::stream::{MulticastSender, ReaderHandle, ServerStream};
use super::{RequestContext, ServerInner};

/// How many outgoing messages (responses and interleaved frames) may be
/// queued toward the socket before writers are pushed back on.
const OUTGOING_QUEUE_SIZE: usize = 32;

struct ConnState {
    server: Arc<ServerInner>,
    conn_id: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    /// The session bound to this connection by its first `SETUP`.
    session: Option<Arc<ServerSession>>,

    /// Media announced on this connection, awaiting `SETUP mode=record`.
    announced: Option<(String, Vec<Media>)>,

    /// The stream described on this connection, reused by `SETUP` when the
    /// handler doesn't implement `on_setup`.
    described: Option<(String, Arc<ServerStream>)>,

    outgoing_tx: mpsc::Sender<Message<Bytes>>,
}

pub(super) async fn run(server: Arc<ServerInner>, stream: tokio::net::TcpStream) {
    let conn_id = server.next_conn_id();
    let mut conn = match Connection::from_stream(stream) {
        Ok(c) => c,
        Err(e) => {
            debug!("failed to wrap accepted connection: {e}");
            return;
        }
    };
    let conn_ctx = *conn.ctx();
    let local_addr = conn_ctx.local_addr();
    let peer_addr = conn_ctx.peer_addr();
    server.handler.on_connection_open(conn_id, &conn_ctx);

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_SIZE);
    let mut state = ConnState {
        server: Arc::clone(&server),
        conn_id,
        local_addr,
        peer_addr,
        session: None,
        announced: None,
        described: None,
        outgoing_tx,
    };

    let write_timeout = server.config.write_timeout;
    loop {
        let session_token = state.session.as_ref().map(|s| s.token.clone());
        let session_cancelled = async move {
            match session_token {
                Some(t) => t.cancelled_owned().await,
                None => futures::future::pending().await,
            }
        };
        tokio::select! {
            _ = server.token.cancelled() => break,
            _ = session_cancelled => {
                debug!("conn {conn_id}: session collapsed; closing connection");
                break;
            }
            out = outgoing_rx.recv() => {
                let Some(msg) = out else { break };
                let r = tokio::time::timeout(write_timeout, conn.send(msg)).await;
                match r {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => { debug!("conn {conn_id}: write error: {e}"); break; }
                    Err(_) => { debug!("conn {conn_id}: write timeout"); break; }
                }
            }
            msg = conn.next_msg() => {
                let msg = match msg {
                    None => break,
                    Some(Err(e)) => {
                        // Malformed message: log and drop this connection.
                        debug!("conn {conn_id}: {e}");
                        break;
                    }
                    Some(Ok(m)) => m,
                };
                match msg.msg {
                    Message::Request(req) => {
                        let resp = state.dispatch(&req);
                        let r = tokio::time::timeout(
                            write_timeout,
                            conn.send(Message::Response(resp)),
                        )
                        .await;
                        match r {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => { debug!("conn {conn_id}: write error: {e}"); break; }
                            Err(_) => { debug!("conn {conn_id}: write timeout"); break; }
                        }
                    }
                    Message::Data(data) => {
                        let channel_id = data.channel_id();
                        match &state.session {
                            Some(s) => {
                                s.refresh_activity();
                                s.handle_interleaved(channel_id, msg.ctx, data.into_body());
                            }
                            None => trace!(
                                "conn {conn_id}: data on channel {channel_id} with no session"
                            ),
                        }
                    }
                    Message::Response(r) => {
                        debug!("conn {conn_id}: ignoring unexpected response {:?}", r.status());
                    }
                }
            }
        }
    }

    // A TCP-interleaved session can't outlive its connection; a UDP session
    // lives on until its timeout.
    if let Some(session) = state.session.take() {
        let transport = {
            let inner = session.inner.lock().expect("not poisoned");
            inner.transport
        };
        if !matches!(transport, Some(Transport::Udp) | Some(Transport::UdpMulticast)) {
            server.remove_session(&session);
        }
    }
    server.handler.on_connection_close(conn_id);
}

/// Builds a response with the status and `CSeq` filled in.
fn response(status: StatusCode, cseq: Option<&str>) -> rtsp_types::Response<Bytes> {
    let mut b = rtsp_types::Response::builder(Version::V1_0, status);
    if let Some(cseq) = cseq {
        b = b.header(rtsp_types::headers::CSEQ, cseq);
    }
    b.build(Bytes::new())
}

/// Splits `/path/trackID=0` into the path and the track index.
fn split_track(path: &str) -> (&str, Option<usize>) {
    match path.rsplit_once('/') {
        Some((prefix, last)) => match last.strip_prefix("trackID=") {
            Some(n) => match n.parse() {
                Ok(i) => (prefix, Some(i)),
                Err(_) => (path, None),
            },
            None => (path, None),
        },
        None => (path, None),
    }
}

impl ConnState {
    fn dispatch(&mut self, req: &rtsp_types::Request<Bytes>) -> rtsp_types::Response<Bytes> {
        let cseq = req
            .header(&rtsp_types::headers::CSEQ)
            .map(|v| v.as_str().to_owned());
        let Some(cseq) = cseq else {
            return response(StatusCode::BadRequest, None);
        };
        let cseq = cseq.as_str();
        let url = match req.request_uri() {
            Some(u) => u.clone(),
            None if matches!(req.method(), Method::Options) => {
                // `OPTIONS *` is acceptable.
                return self.options(cseq);
            }
            None => return response(StatusCode::BadRequest, Some(cseq)),
        };
        trace!("conn {}: {:?} {}", self.conn_id, req.method(), url);
        match req.method() {
            Method::Options => self.options(cseq),
            Method::Describe => self.describe(cseq, req, &url),
            Method::Announce => self.announce(cseq, req, &url),
            Method::Setup => self.setup(cseq, req, &url),
            Method::Play => self.play(cseq, req, &url),
            Method::Record => self.record(cseq, req, &url),
            Method::Pause => self.pause(cseq, req, &url),
            Method::Teardown => self.teardown(cseq, req, &url),
            Method::GetParameter => self.get_parameter(cseq, req, &url),
            Method::SetParameter => self.set_parameter(cseq, req, &url),
            _ => response(StatusCode::NotImplemented, Some(cseq)),
        }
    }

    fn request_ctx<'a>(
        &self,
        req: &'a rtsp_types::Request<Bytes>,
        path: &'a str,
    ) -> RequestContext<'a> {
        RequestContext {
            conn_id: self.conn_id,
            session_id: req
                .header(&rtsp_types::headers::SESSION)
                .map(|v| v.as_str().split(';').next().unwrap_or("")),
            request: req,
            path,
        }
    }

    /// Looks up the session named by the request's `Session` header,
    /// refreshing its activity timer. `Err` is the 454 response.
    fn resolve_session(
        &self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
    ) -> Result<Arc<ServerSession>, rtsp_types::Response<Bytes>> {
        let id = req
            .header(&rtsp_types::headers::SESSION)
            .map(|v| v.as_str().split(';').next().unwrap_or("").to_owned());
        let Some(id) = id else {
            return Err(response(StatusCode::SessionNotFound, Some(cseq)));
        };
        let session = self
            .server
            .sessions
            .lock()
            .expect("not poisoned")
            .get(&id)
            .cloned();
        match session {
            Some(s) => {
                s.refresh_activity();
                Ok(s)
            }
            None => Err(response(StatusCode::SessionNotFound, Some(cseq))),
        }
    }

    fn session_header_value(&self, session: &ServerSession) -> String {
        format!(
            "{};timeout={}",
            session.id,
            session.session_timeout.as_secs()
        )
    }

    fn options(&self, cseq: &str) -> rtsp_types::Response<Bytes> {
        let mut r = response(StatusCode::Ok, Some(cseq));
        r.insert_header(
            rtsp_types::headers::PUBLIC,
            "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, RECORD, TEARDOWN, \
             GET_PARAMETER, SET_PARAMETER",
        );
        r
    }

    fn describe(
        &mut self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
        url: &Url,
    ) -> rtsp_types::Response<Bytes> {
        if let Some(v) = req.header(&rtsp_types::headers::ACCEPT) {
            if !v.as_str().contains("application/sdp") {
                return response(StatusCode::NotAcceptable, Some(cseq));
            }
        }
        let path = url.path().to_owned();
        let ctx = self.request_ctx(req, &path);
        let stream = match self.server.handler.on_describe(&ctx) {
            Ok(s) => s,
            Err(status) => return response(status, Some(cseq)),
        };
        let sdp = crate::sdp::marshal(stream.medias(), self.local_addr.ip(), "Stream");
        self.described = Some((path, stream));
        let base = if url.as_str().ends_with('/') {
            url.to_string()
        } else {
            format!("{url}/")
        };
        rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok)
            .header(rtsp_types::headers::CSEQ, cseq)
            .header(rtsp_types::headers::CONTENT_TYPE, "application/sdp")
            .header(rtsp_types::headers::CONTENT_BASE, base)
            .build(Bytes::from(sdp))
    }

    fn announce(
        &mut self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
        url: &Url,
    ) -> rtsp_types::Response<Bytes> {
        if !matches!(req.header(&rtsp_types::headers::CONTENT_TYPE),
                     Some(v) if v.as_str() == "application/sdp")
        {
            return response(StatusCode::UnsupportedMediaType, Some(cseq));
        }
        let medias = match crate::sdp::parse_medias(&req.body()[..]) {
            Ok(m) => m,
            Err(e) => {
                debug!("conn {}: bad ANNOUNCE: {e}", self.conn_id);
                return response(StatusCode::BadRequest, Some(cseq));
            }
        };
        let path = url.path().to_owned();
        let ctx = self.request_ctx(req, &path);
        if let Err(status) = self.server.handler.on_announce(&ctx, &medias) {
            return response(status, Some(cseq));
        }
        self.announced = Some((path, medias));
        response(StatusCode::Ok, Some(cseq))
    }

    fn setup(
        &mut self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
        url: &Url,
    ) -> rtsp_types::Response<Bytes> {
        let transports: Vec<ParsedTransport> = match req
            .header(&rtsp_types::headers::TRANSPORT)
        {
            None => return response(StatusCode::BadRequest, Some(cseq)),
            Some(v) => v
                .as_str()
                .split(',')
                .filter_map(|t| parse_transport(t.trim()).ok())
                .collect(),
        };
        if transports.is_empty() {
            return response(StatusCode::UnsupportedTransport, Some(cseq));
        }
        let (path, track) = split_track(url.path());
        let path = path.to_owned();

        let record_mode =
            transports.iter().any(|t| t.mode_record) && self.announced.is_some();

        // Resolve what's being set up: the publisher's announced media, or a
        // stream to read.
        let (media_count, stream, announced) = if record_mode {
            let (announced_path, medias) = self.announced.clone().expect("checked above");
            if announced_path != path {
                return response(StatusCode::NotFound, Some(cseq));
            }
            (medias.len(), None, Some(medias))
        } else {
            let ctx = self.request_ctx(req, &path);
            let stream = match &self.session {
                Some(s) => s.inner.lock().expect("not poisoned").stream.clone(),
                None => None,
            };
            let stream = stream.or_else(|| match &self.described {
                Some((p, s)) if *p == path => Some(Arc::clone(s)),
                _ => None,
            });
            let stream = match stream {
                Some(s) => s,
                None => match self.server.handler.on_setup(&ctx) {
                    Ok(s) => s,
                    Err(status) => return response(status, Some(cseq)),
                },
            };
            (stream.medias().len(), Some(stream), None)
        };
        let medium = track.unwrap_or(0);
        if medium >= media_count {
            return response(StatusCode::NotFound, Some(cseq));
        }

        // Find or create the session.
        let session = if req.header(&rtsp_types::headers::SESSION).is_some() {
            match self.resolve_session(cseq, req) {
                Ok(s) => s,
                Err(r) => return r,
            }
        } else {
            match ServerInner::create_session(
                &self.server,
                self.conn_id,
                self.peer_addr.ip(),
                media_count,
            ) {
                Ok(s) => s,
                Err(status) => return response(status, Some(cseq)),
            }
        };
        if self.session.as_ref().map(|s| !Arc::ptr_eq(s, &session)).unwrap_or(false) {
            // This connection already drives a different session.
            return response(StatusCode::SessionNotFound, Some(cseq));
        }

        // Pick the first mutually supported transport alternative.
        let mut chosen = None;
        for t in &transports {
            if t.is_interleaved {
                chosen = Some((Transport::Tcp, t));
                break;
            }
            if t.is_multicast {
                if !record_mode && self.server.config.multicast.is_some() {
                    chosen = Some((Transport::UdpMulticast, t));
                    break;
                }
                continue;
            }
            if t.client_port.is_some() && self.server.udp.is_some() {
                chosen = Some((Transport::Udp, t));
                break;
            }
        }
        let Some((transport, params)) = chosen else {
            return response(StatusCode::UnsupportedTransport, Some(cseq));
        };

        let mut inner = session.inner.lock().expect("not poisoned");
        if !matches!(
            inner.state,
            SessionState::Initial | SessionState::PrePlay | SessionState::PreRecord
        ) {
            return response(StatusCode::MethodNotValidInThisState, Some(cseq));
        }
        match inner.transport {
            None => inner.transport = Some(transport),
            Some(t) if t != transport => {
                // All media of one session share one transport kind.
                return response(StatusCode::UnsupportedTransport, Some(cseq));
            }
            Some(_) => {}
        }
        match (record_mode, &stream) {
            (true, _) => {
                if inner.announced.is_none() {
                    inner.announced = announced;
                }
                inner.state = SessionState::PreRecord;
            }
            (false, Some(stream)) => {
                match &inner.stream {
                    None => inner.stream = Some(Arc::clone(stream)),
                    Some(existing) if !Arc::ptr_eq(existing, stream) => {
                        return response(StatusCode::NotFound, Some(cseq));
                    }
                    Some(_) => {}
                }
                inner.state = SessionState::PrePlay;
            }
            (false, None) => unreachable!("play mode always has a stream"),
        }

        let transport_response = match transport {
            Transport::Tcp => {
                let channel_id = params.channel_id.unwrap_or((medium as u8) * 2);
                inner.media[medium].tcp_channel = Some(channel_id);
                format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{}",
                    channel_id,
                    channel_id + 1
                )
            }
            Transport::Udp => {
                let (rtp_port, rtcp_port) =
                    params.client_port.expect("checked in transport choice");
                let udp = self.server.udp.as_ref().expect("checked in transport choice");
                inner.media[medium].peer_rtp_port = Some(rtp_port);
                inner.media[medium].peer_rtcp_port = Some(rtcp_port);
                format!(
                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                    rtp_port,
                    rtcp_port,
                    udp.rtp_port,
                    udp.rtp_port + 1
                )
            }
            Transport::UdpMulticast => {
                let stream = stream.as_ref().expect("multicast is play-only");
                let server = Arc::clone(&self.server);
                let session_token = session.token.clone();
                let media_count_for_mc = media_count;
                let r = stream.add_multicast_reader(move || {
                    new_multicast_sender(&server, session_token, media_count_for_mc)
                });
                let (group, base_port, ttl) = match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("multicast setup failed: {e}");
                        return response(StatusCode::UnsupportedTransport, Some(cseq));
                    }
                };
                inner.is_multicast = true;
                let rtp_port = base_port + 2 * (medium as u16);
                format!(
                    "RTP/AVP;multicast;destination={};port={}-{};ttl={}",
                    group,
                    rtp_port,
                    rtp_port + 1,
                    ttl
                )
            }
        };
        drop(inner);

        self.session = Some(Arc::clone(&session));
        let mut r = response(StatusCode::Ok, Some(cseq));
        r.insert_header(
            rtsp_types::headers::SESSION,
            self.session_header_value(&session),
        );
        r.insert_header(rtsp_types::headers::TRANSPORT, transport_response);
        r
    }

    fn play(
        &mut self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
        url: &Url,
    ) -> rtsp_types::Response<Bytes> {
        let session = match self.resolve_session(cseq, req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        let path = url.path().to_owned();
        let ctx = self.request_ctx(req, &path);
        {
            let inner = session.inner.lock().expect("not poisoned");
            if inner.state != SessionState::PrePlay {
                return response(StatusCode::MethodNotValidInThisState, Some(cseq));
            }
        }
        if let Err(status) = self.server.handler.on_play(&ctx) {
            return response(status, Some(cseq));
        }
        if let Err(status) = self.arm_play(&session) {
            return response(status, Some(cseq));
        }
        let mut r = response(StatusCode::Ok, Some(cseq));
        r.insert_header(
            rtsp_types::headers::SESSION,
            self.session_header_value(&session),
        );
        r
    }

    /// Binds the media plane for a reading session: the writer queue, the
    /// UDP firewall pinholes, RTCP registration, and the subscription to the
    /// stream.
    fn arm_play(&self, session: &Arc<ServerSession>) -> Result<(), StatusCode> {
        let mut inner = session.inner.lock().expect("not poisoned");
        let transport = inner.transport.expect("SETUP set transport");
        let stream = Arc::clone(inner.stream.as_ref().expect("play session has stream"));
        if transport == Transport::UdpMulticast {
            // The network fans out; nothing per-session to arm.
            inner.state = SessionState::Play;
            return Ok(());
        }
        let targets = self.write_targets(&inner.media, transport)?;
        let writer = {
            let session2 = Arc::clone(session);
            writer::spawn(
                targets,
                self.server.config.write_queue_size,
                self.server.config.write_timeout,
                session.token.clone(),
                move |e| session2.set_error(e),
            )
        };

        if transport == Transport::Udp {
            // Open the firewall: the first two packets on each new UDP
            // transport are a no-payload RTP packet and an empty receiver
            // report.
            let udp = self.server.udp.as_ref().expect("udp transport has listeners");
            enqueue_pinholes(&writer, &inner.media);
            for (i, m) in inner.media.iter().enumerate() {
                if let Some(rtcp_port) = m.peer_rtcp_port {
                    // Readers send RTCP (receiver reports) only.
                    udp.add_client((session.peer_ip, rtcp_port), session, i);
                }
            }
        }
        stream.add_reader(ReaderHandle {
            session_id: session.id.clone(),
            writer: writer.clone(),
            token: session.token.clone(),
        });
        inner.writer = Some(writer);
        inner.state = SessionState::Play;
        Ok(())
    }

    fn record(
        &mut self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
        url: &Url,
    ) -> rtsp_types::Response<Bytes> {
        let session = match self.resolve_session(cseq, req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        let path = url.path().to_owned();
        let ctx = self.request_ctx(req, &path);
        {
            let inner = session.inner.lock().expect("not poisoned");
            if inner.state != SessionState::PreRecord {
                return response(StatusCode::MethodNotValidInThisState, Some(cseq));
            }
        }
        if let Err(status) = self.server.handler.on_record(&ctx) {
            return response(status, Some(cseq));
        }
        if let Err(status) = self.arm_record(&session) {
            return response(status, Some(cseq));
        }
        let mut r = response(StatusCode::Ok, Some(cseq));
        r.insert_header(
            rtsp_types::headers::SESSION,
            self.session_header_value(&session),
        );
        r
    }

    /// Binds the media plane for a publishing session: per-format read
    /// state, UDP registration, pinholes, and the periodic receiver reports.
    fn arm_record(&self, session: &Arc<ServerSession>) -> Result<(), StatusCode> {
        use rand::Rng;
        let mut inner = session.inner.lock().expect("not poisoned");
        let transport = inner.transport.expect("SETUP set transport");
        let announced = inner
            .announced
            .clone()
            .expect("record session has announced media");
        for (i, m) in announced.iter().enumerate() {
            let media = &mut inner.media[i];
            media.formats.clear();
            for f in &m.formats {
                match RecordFormat::new(f) {
                    Ok(rf) => {
                        media.formats.insert(f.payload_type(), rf);
                    }
                    Err(e) => {
                        debug!("unsupported format in RECORD: {e}");
                        return Err(StatusCode::UnsupportedMediaType);
                    }
                }
            }
        }
        let targets = self.write_targets(&inner.media, transport)?;
        let writer = {
            let session2 = Arc::clone(session);
            writer::spawn(
                targets,
                self.server.config.write_queue_size,
                self.server.config.write_timeout,
                session.token.clone(),
                move |e| session2.set_error(e),
            )
        };
        if transport == Transport::Udp {
            let udp = self.server.udp.as_ref().expect("udp transport has listeners");
            // Open the firewall by sending test packets to the counterpart.
            enqueue_pinholes(&writer, &inner.media);
            for (i, m) in inner.media.iter().enumerate() {
                if let Some(rtp_port) = m.peer_rtp_port {
                    udp.add_client((session.peer_ip, rtp_port), session, i);
                }
                if let Some(rtcp_port) = m.peer_rtcp_port {
                    udp.add_client((session.peer_ip, rtcp_port), session, i);
                }
            }
        }
        inner.writer = Some(writer);
        inner.state = SessionState::Record;
        drop(inner);

        // Periodic receiver reports toward the publisher.
        let local_ssrc: u32 = rand::thread_rng().gen();
        let session2 = Arc::clone(session);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session2.token.cancelled() => break,
                    _ = tokio::time::sleep(crate::rtcp::sender::DEFAULT_SENDER_REPORT_INTERVAL) => {
                        session2.send_receiver_reports(local_ssrc);
                    }
                }
            }
        });
        Ok(())
    }

    /// Builds the per-medium writer targets for the negotiated transport.
    fn write_targets(
        &self,
        media: &[super::session::SessionMedia],
        transport: Transport,
    ) -> Result<Vec<MediumWriteTarget>, StatusCode> {
        let mut targets = Vec::with_capacity(media.len());
        for m in media {
            match transport {
                Transport::Tcp => {
                    let Some(c) = m.tcp_channel else {
                        // Medium not set up; writes to it are dropped.
                        targets.push(MediumWriteTarget::Interleaved {
                            tx: self.outgoing_tx.clone(),
                            rtp_channel_id: 254,
                        });
                        continue;
                    };
                    targets.push(MediumWriteTarget::Interleaved {
                        tx: self.outgoing_tx.clone(),
                        rtp_channel_id: c,
                    });
                }
                Transport::Udp => {
                    let udp = self.server.udp.as_ref().ok_or(StatusCode::UnsupportedTransport)?;
                    let (Some(rtp_port), Some(rtcp_port)) = (m.peer_rtp_port, m.peer_rtcp_port)
                    else {
                        targets.push(MediumWriteTarget::Udp {
                            rtp_socket: udp.rtp_socket.clone(),
                            rtp_to: SocketAddr::new(self.peer_addr.ip(), 9), // discard port
                            rtcp_socket: udp.rtcp_socket.clone(),
                            rtcp_to: SocketAddr::new(self.peer_addr.ip(), 9),
                        });
                        continue;
                    };
                    targets.push(MediumWriteTarget::Udp {
                        rtp_socket: udp.rtp_socket.clone(),
                        rtp_to: SocketAddr::new(self.peer_addr.ip(), rtp_port),
                        rtcp_socket: udp.rtcp_socket.clone(),
                        rtcp_to: SocketAddr::new(self.peer_addr.ip(), rtcp_port),
                    });
                }
                Transport::UdpMulticast => unreachable!("multicast has no per-session writer"),
            }
        }
        Ok(targets)
    }

    fn pause(
        &mut self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
        url: &Url,
    ) -> rtsp_types::Response<Bytes> {
        let session = match self.resolve_session(cseq, req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        let path = url.path().to_owned();
        let ctx = self.request_ctx(req, &path);
        if let Err(status) = self.server.handler.on_pause(&ctx) {
            return response(status, Some(cseq));
        }
        {
            let mut inner = session.inner.lock().expect("not poisoned");
            match inner.state {
                SessionState::Play => {
                    if let Some(stream) = &inner.stream {
                        stream.remove_reader(&session.id);
                    }
                    inner.writer = None;
                    inner.state = SessionState::PrePlay;
                }
                SessionState::Record => {
                    inner.writer = None;
                    inner.state = SessionState::PreRecord;
                    drop(inner);
                    if let Some(udp) = &self.server.udp {
                        udp.remove_session(&session);
                    }
                }
                SessionState::PrePlay | SessionState::PreRecord => {} // no-op.
                SessionState::Initial => {
                    return response(StatusCode::MethodNotValidInThisState, Some(cseq))
                }
            }
        }
        let mut r = response(StatusCode::Ok, Some(cseq));
        r.insert_header(
            rtsp_types::headers::SESSION,
            self.session_header_value(&session),
        );
        r
    }

    fn teardown(
        &mut self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
        url: &Url,
    ) -> rtsp_types::Response<Bytes> {
        let session = match self.resolve_session(cseq, req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        let path = url.path().to_owned();
        let ctx = self.request_ctx(req, &path);
        self.server.handler.on_teardown(&ctx);
        self.server.remove_session(&session);
        if self.session.as_ref().map(|s| Arc::ptr_eq(s, &session)).unwrap_or(false) {
            self.session = None;
        }
        response(StatusCode::Ok, Some(cseq))
    }

    fn get_parameter(
        &mut self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
        url: &Url,
    ) -> rtsp_types::Response<Bytes> {
        // Valid with or without a session; with one, it refreshes the
        // keepalive timer.
        if req.header(&rtsp_types::headers::SESSION).is_some() {
            if let Err(r) = self.resolve_session(cseq, req) {
                return r;
            }
        }
        let path = url.path().to_owned();
        let ctx = self.request_ctx(req, &path);
        match self.server.handler.on_get_parameter(&ctx) {
            Ok(body) if body.is_empty() => response(StatusCode::Ok, Some(cseq)),
            Ok(body) => rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok)
                .header(rtsp_types::headers::CSEQ, cseq)
                .header(rtsp_types::headers::CONTENT_TYPE, "text/parameters")
                .build(body),
            Err(status) => response(status, Some(cseq)),
        }
    }

    fn set_parameter(
        &mut self,
        cseq: &str,
        req: &rtsp_types::Request<Bytes>,
        url: &Url,
    ) -> rtsp_types::Response<Bytes> {
        if req.header(&rtsp_types::headers::SESSION).is_some() {
            if let Err(r) = self.resolve_session(cseq, req) {
                return r;
            }
        }
        let path = url.path().to_owned();
        let ctx = self.request_ctx(req, &path);
        match self.server.handler.on_set_parameter(&ctx) {
            Ok(()) => response(StatusCode::Ok, Some(cseq)),
            Err(status) => response(status, Some(cseq)),
        }
    }
}

/// Enqueues the firewall-opening packets: always the first two packets sent
/// on a new UDP transport.
fn enqueue_pinholes(writer: &crate::writer::SessionWriter, media: &[super::session::SessionMedia]) {
    let blank_rtp = crate::rtp::RawPacketBuilder {
        sequence_number: 0,
        timestamp: 0,
        payload_type: 0,
        ssrc: 0,
        mark: false,
    }
    .build(std::iter::empty())
    .expect("blank rtp packet is valid")
    .0
     .0;
    let empty_rr = crate::rtcp::serialize_receiver_report(0, None);
    for (i, m) in media.iter().enumerate() {
        if m.peer_rtp_port.is_none() {
            continue;
        }
        let _ = writer.try_queue(QueuedPacket {
            medium: i,
            kind: PacketKind::Rtp,
            payload: blank_rtp.clone(),
        });
        let _ = writer.try_queue(QueuedPacket {
            medium: i,
            kind: PacketKind::Rtcp,
            payload: empty_rr.clone(),
        });
    }
}

/// Creates the single multicast egress for a stream: an ephemeral socket
/// with the configured TTL, a writer queue targeting the allocated group.
fn new_multicast_sender(
    server: &Arc<ServerInner>,
    token: tokio_util::sync::CancellationToken,
    media_count: usize,
) -> Result<MulticastSender, crate::Error> {
    use crate::error::ErrorInt;
    let (group, base_port, ttl) = server
        .next_multicast_addr()
        .ok_or_else(|| wrap!(ErrorInt::FailedPrecondition("multicast not configured".into())))?;
    let socket = std::net::UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| {
            s.set_multicast_ttl_v4(ttl)?;
            s.set_nonblocking(true)?;
            Ok(s)
        })
        .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
    let socket = Arc::new(
        tokio::net::UdpSocket::from_std(socket).map_err(|e| wrap!(ErrorInt::ConnectError(e)))?,
    );
    let mut targets = Vec::with_capacity(media_count);
    for i in 0..media_count {
        let rtp_port = base_port + 2 * (i as u16);
        targets.push(MediumWriteTarget::Udp {
            rtp_socket: Arc::clone(&socket),
            rtp_to: SocketAddr::new(group.into(), rtp_port),
            rtcp_socket: Arc::clone(&socket),
            rtcp_to: SocketAddr::new(group.into(), rtp_port + 1),
        });
    }
    let writer = writer::spawn(
        targets,
        server.config.write_queue_size,
        server.config.write_timeout,
        token,
        |e| warn!("multicast writer failed: {e}"),
    );
    Ok(MulticastSender {
        writer,
        group,
        rtp_port: base_port,
        ttl,
        refs: 1,
    })
}
