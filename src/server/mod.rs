// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP server: accepts connections that read streams (`DESCRIBE`/`PLAY`)
//! and publish streams (`ANNOUNCE`/`RECORD`), over UDP unicast, UDP
//! multicast, and TCP interleaved transports.
//!
//! The application supplies a [`ServerHandler`]; the server drives the
//! per-connection and per-session state machines and the media plane.
//!
//! ```no_run
//! use std::sync::Arc;
//! # use fovea::server::{Server, ServerConfig, ServerHandler, ServerStream, RequestContext};
//! struct Handler(Arc<ServerStream>);
//! impl ServerHandler for Handler {
//!     fn on_describe(
//!         &self,
//!         _ctx: &RequestContext<'_>,
//!     ) -> Result<Arc<ServerStream>, rtsp_types::StatusCode> {
//!         Ok(self.0.clone())
//!     }
//! }
//! # async fn go(stream: Arc<ServerStream>) -> Result<(), fovea::Error> {
//! let server = Server::bind(ServerConfig::default(), Handler(stream.clone())).await?;
//! // ... publish packets via stream.write_rtp(...) ...
//! server.run().await
//! # }
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorInt;
use crate::rtcp::ReceivedCompoundPacket;
use crate::rtp::ReceivedPacket;
use crate::sdp::Media;
use crate::Error;

mod conn;
pub(crate) mod session;
mod stream;
mod udp;

pub use stream::ServerStream;

/// Configuration for the multicast transport.
#[derive(Clone, Debug)]
pub struct MulticastConfig {
    /// The first group address to allocate; subsequent streams get
    /// subsequent addresses.
    pub base_address: Ipv4Addr,

    /// The base RTP port within the group; medium `i` uses
    /// `base_rtp_port + 2*i` (RTP) and the following odd port (RTCP).
    pub base_rtp_port: u16,

    /// Time-to-live for published packets.
    pub ttl: u32,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            base_address: Ipv4Addr::new(239, 64, 0, 1),
            base_rtp_port: 5000,
            ttl: 16,
        }
    }
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address for the RTSP TCP listener.
    pub bind_addr: SocketAddr,

    /// Even port for the shared UDP RTP listener (RTCP is one higher), or
    /// `None` to refuse UDP unicast transport. Port 0 picks an ephemeral
    /// pair.
    pub udp_rtp_port: Option<u16>,

    /// Enables the UDP multicast transport.
    pub multicast: Option<MulticastConfig>,

    /// Per-message read deadline while a message is in flight.
    pub read_timeout: Duration,

    /// Per-frame write deadline.
    pub write_timeout: Duration,

    /// Advertised session timeout; sessions idle longer (plus a grace
    /// period) are expired.
    pub session_timeout: Duration,

    /// Maximum concurrent sessions; further `SETUP`s get `503`.
    pub max_sessions: usize,

    /// Bound on each session's writer queue.
    pub write_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8554),
            udp_rtp_port: Some(0),
            multicast: None,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            max_sessions: 1024,
            write_queue_size: crate::writer::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Immutable context passed to request-level handler callbacks.
pub struct RequestContext<'a> {
    pub conn_id: u64,
    pub session_id: Option<&'a str>,
    pub request: &'a rtsp_types::Request<Bytes>,

    /// The path component of the request URL.
    pub path: &'a str,
}

/// Immutable context passed to session-level handler callbacks.
pub struct SessionContext<'a> {
    pub conn_id: u64,
    pub session_id: &'a str,
}

/// The application's side of the server.
///
/// All methods have defaults so implementations override only what they
/// need; a read-only server just implements [`ServerHandler::on_describe`].
/// Callbacks are brief and synchronous; they run on the connection and
/// listener tasks. Errors map to the returned status code.
#[allow(unused_variables)]
pub trait ServerHandler: Send + Sync + 'static {
    fn on_connection_open(&self, conn_id: u64, ctx: &crate::ConnectionContext) {}
    fn on_connection_close(&self, conn_id: u64) {}
    fn on_session_open(&self, ctx: &SessionContext<'_>) {}

    /// Called when the session ends, with the fatal error if one collapsed
    /// it.
    fn on_session_close(&self, ctx: &SessionContext<'_>, err: Option<&Error>) {}

    /// Returns the stream to describe for the request's path.
    fn on_describe(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Arc<ServerStream>, rtsp_types::StatusCode> {
        Err(rtsp_types::StatusCode::NotFound)
    }

    /// Accepts or rejects an incoming publication.
    fn on_announce(
        &self,
        ctx: &RequestContext<'_>,
        medias: &[Media],
    ) -> Result<(), rtsp_types::StatusCode> {
        Ok(())
    }

    /// Returns the stream for a `SETUP` without a preceding `DESCRIBE` on
    /// the same connection. Most implementations can rely on the default:
    /// the server remembers the stream from the connection's `DESCRIBE`.
    fn on_setup(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Arc<ServerStream>, rtsp_types::StatusCode> {
        Err(rtsp_types::StatusCode::NotFound)
    }

    fn on_play(&self, ctx: &RequestContext<'_>) -> Result<(), rtsp_types::StatusCode> {
        Ok(())
    }

    fn on_record(&self, ctx: &RequestContext<'_>) -> Result<(), rtsp_types::StatusCode> {
        Ok(())
    }

    fn on_pause(&self, ctx: &RequestContext<'_>) -> Result<(), rtsp_types::StatusCode> {
        Ok(())
    }

    fn on_teardown(&self, ctx: &RequestContext<'_>) {}

    fn on_get_parameter(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Bytes, rtsp_types::StatusCode> {
        Ok(Bytes::new())
    }

    fn on_set_parameter(&self, ctx: &RequestContext<'_>) -> Result<(), rtsp_types::StatusCode> {
        Ok(())
    }

    /// An RTP packet received from a publishing session.
    fn on_packet_rtp(&self, ctx: &SessionContext<'_>, medium: usize, pkt: &ReceivedPacket) {}

    /// An RTCP compound packet received from a session.
    fn on_packet_rtcp(
        &self,
        ctx: &SessionContext<'_>,
        medium: usize,
        pkt: &ReceivedCompoundPacket,
    ) {
    }

    /// A non-fatal error: a malformed packet, an unknown payload type. The
    /// session continues.
    fn on_warning(&self, ctx: &SessionContext<'_>, err: &Error) {
        log::warn!("session {}: {err}", ctx.session_id);
    }
}

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) handler: Arc<dyn ServerHandler>,
    pub(crate) sessions: Mutex<HashMap<String, Arc<session::ServerSession>>>,
    pub(crate) udp: Option<Arc<udp::UdpListenerPair>>,
    pub(crate) token: CancellationToken,
    next_conn_id: AtomicU64,
    next_multicast_offset: AtomicU32,
}

impl ServerInner {
    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_multicast_addr(&self) -> Option<(Ipv4Addr, u16, u32)> {
        let mc = self.config.multicast.as_ref()?;
        let offset = self.next_multicast_offset.fetch_add(1, Ordering::Relaxed);
        let base = u32::from(mc.base_address);
        let group = Ipv4Addr::from(base.wrapping_add(offset));
        Some((group, mc.base_rtp_port, mc.ttl))
    }

    /// Creates a session, registering it in the table and spawning its
    /// expiry watcher.
    pub(crate) fn create_session(
        this: &Arc<Self>,
        conn_id: u64,
        peer_ip: IpAddr,
        media_count: usize,
    ) -> Result<Arc<session::ServerSession>, rtsp_types::StatusCode> {
        use rand::distributions::Alphanumeric;
        use rand::Rng;
        let mut sessions = this.sessions.lock().expect("not poisoned");
        if sessions.len() >= this.config.max_sessions {
            return Err(rtsp_types::StatusCode::ServiceUnavailable);
        }
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let session = session::ServerSession::new(
            id.clone(),
            conn_id,
            peer_ip,
            this.config.session_timeout,
            this.token.child_token(),
            Arc::clone(&this.handler),
            this.udp.clone(),
            media_count,
        );
        sessions.insert(id, Arc::clone(&session));
        drop(sessions);
        this.handler.on_session_open(&session.ctx());
        Self::spawn_expiry_watcher(this, &session);
        Ok(session)
    }

    pub(crate) fn remove_session(&self, session: &session::ServerSession) {
        self.sessions.lock().expect("not poisoned").remove(&session.id);
        session.close();
    }

    /// Watches for session expiry (missed keepalives) and for the session's
    /// token, whichever collapses it first.
    fn spawn_expiry_watcher(this: &Arc<Self>, session: &Arc<session::ServerSession>) {
        let check_period = std::cmp::max(
            this.config.session_timeout / 2,
            Duration::from_secs(1),
        );
        let this = Arc::clone(this);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.token.cancelled() => break,
                    _ = tokio::time::sleep(check_period) => {
                        if session.is_expired(std::time::Instant::now()) {
                            info!("session {} expired", session.id);
                            session.set_error(wrap!(ErrorInt::Timeout));
                            break;
                        }
                    }
                }
            }
            this.remove_session(&session);
        });
    }
}

/// An RTSP server bound to its listening sockets.
pub struct Server {
    inner: Arc<ServerInner>,
    listener: TcpListener,
}

/// A handle for stopping a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle(CancellationToken);

impl ServerHandle {
    /// Stops the server: closes all sessions and tasks.
    pub fn stop(&self) {
        self.0.cancel();
    }
}

impl Server {
    /// Binds the TCP listener and (if configured) the shared UDP listener
    /// pair.
    pub async fn bind<H: ServerHandler>(config: ServerConfig, handler: H) -> Result<Self, Error> {
        let token = CancellationToken::new();
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let udp = match config.udp_rtp_port {
            Some(port) => Some(
                udp::UdpListenerPair::bind(config.bind_addr.ip(), port, token.clone())
                    .await
                    .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?,
            ),
            None => None,
        };
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                handler: Arc::new(handler),
                sessions: Mutex::new(HashMap::new()),
                udp,
                token,
                next_conn_id: AtomicU64::new(0),
                next_multicast_offset: AtomicU32::new(0),
            }),
            listener,
        })
    }

    /// Returns the RTSP listener's local address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener
            .local_addr()
            .map_err(|e| wrap!(ErrorInt::Internal(Box::new(e))))
    }

    /// Returns a handle that stops the server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle(self.inner.token.clone())
    }

    /// Accepts connections until stopped.
    pub async fn run(self) -> Result<(), Error> {
        let token = self.inner.token.clone();
        loop {
            let conn = tokio::select! {
                _ = token.cancelled() => break,
                conn = self.listener.accept() => conn,
            };
            match conn {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        conn::run(inner, stream).await;
                    });
                }
                Err(e) => {
                    // Transient accept errors (eg EMFILE) shouldn't poison
                    // the whole server.
                    log::warn!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        // Collapse remaining sessions.
        let sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .expect("not poisoned")
            .values()
            .cloned()
            .collect();
        for s in sessions {
            self.inner.remove_session(&s);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use futures::StreamExt;
    use url::Url;

    use super::*;
    use crate::client::{self, PacketItem, PlayOptions, SessionOptions};
    use crate::format::Format;
    use crate::Transport;

    struct TestHandler {
        stream: Arc<ServerStream>,
        warnings: StdMutex<Vec<String>>,
        rtp_packets: AtomicUsize,
    }

    impl TestHandler {
        fn new(stream: Arc<ServerStream>) -> Arc<Self> {
            Arc::new(Self {
                stream,
                warnings: StdMutex::new(Vec::new()),
                rtp_packets: AtomicUsize::new(0),
            })
        }
    }

    impl ServerHandler for Arc<TestHandler> {
        fn on_describe(
            &self,
            _ctx: &RequestContext<'_>,
        ) -> Result<Arc<ServerStream>, rtsp_types::StatusCode> {
            Ok(self.stream.clone())
        }

        fn on_packet_rtp(
            &self,
            _ctx: &SessionContext<'_>,
            _medium: usize,
            _pkt: &ReceivedPacket,
        ) {
            self.rtp_packets.fetch_add(1, Ordering::SeqCst);
        }

        fn on_warning(&self, _ctx: &SessionContext<'_>, err: &Error) {
            self.warnings
                .lock()
                .expect("not poisoned")
                .push(err.to_string());
        }
    }

    fn h264_stream() -> Arc<ServerStream> {
        ServerStream::new(vec![Media::new(
            "video",
            Format::from_sdp(
                "video",
                96,
                "h264",
                90_000,
                None,
                Some("packetization-mode=1; sprop-parameter-sets=Z2QAHqwsaoLA9puCgIKgAAADACAAAAMD0IAA,aO4xshsA"),
            )
            .unwrap(),
        )])
        .unwrap()
    }

    fn rtp_pkt(seq: u16, timestamp: u32) -> bytes::Bytes {
        crate::rtp::RawPacketBuilder {
            sequence_number: seq,
            timestamp,
            payload_type: 96,
            ssrc: 0x1234_5678,
            mark: true,
        }
        .build(b"\x65\xaa\xbb".iter().copied())
        .unwrap()
        .0
         .0
    }

    async fn start_server(
        handler: Arc<TestHandler>,
        udp: bool,
    ) -> (std::net::SocketAddr, ServerHandle) {
        let config = ServerConfig {
            bind_addr: std::net::SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                0,
            ),
            udp_rtp_port: udp.then_some(0),
            ..ServerConfig::default()
        };
        let server = Server::bind(config, handler).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(server.run());
        (addr, handle)
    }

    /// DESCRIBE→SETUP→PLAY happy path over TCP interleaved: the client
    /// callback observes every published packet, in sequence.
    #[tokio::test(flavor = "multi_thread")]
    async fn describe_setup_play_tcp() {
        crate::testutil::init_logging();
        let stream = h264_stream();
        let handler = TestHandler::new(stream.clone());
        let (addr, handle) = start_server(handler, false).await;

        let url = Url::parse(&format!("rtsp://{addr}/cam")).unwrap();
        let mut session = client::Session::describe(
            url,
            SessionOptions::default().transport(Transport::Tcp),
        )
        .await
        .unwrap();
        assert_eq!(session.streams().len(), 1);
        assert_eq!(session.streams()[0].encoding_name, "h264");
        session.setup(0).await.unwrap();
        let mut playing = session.play(PlayOptions::default()).await.unwrap();
        assert_eq!(stream.reader_count(), 1);

        for i in 0..10u16 {
            stream.write_rtp(0, rtp_pkt(100 + i, 3000 * u32::from(i))).unwrap();
        }
        let mut received = Vec::new();
        while received.len() < 10 {
            match playing.next().await {
                Some(Ok(PacketItem::Rtp(p))) => received.push(p.sequence_number()),
                Some(Ok(_)) => {}
                other => panic!("unexpected item: {other:?}"),
            }
        }
        assert_eq!(received, (100..110).collect::<Vec<u16>>());
        playing.teardown().await.unwrap();
        handle.stop();
    }

    /// The same happy path over UDP: the firewall-opening packets come
    /// first, then media flows through the shared listeners.
    #[tokio::test(flavor = "multi_thread")]
    async fn describe_setup_play_udp() {
        crate::testutil::init_logging();
        let stream = h264_stream();
        let handler = TestHandler::new(stream.clone());
        let (addr, handle) = start_server(handler, true).await;

        let url = Url::parse(&format!("rtsp://{addr}/cam")).unwrap();
        let mut session = client::Session::describe(
            url,
            SessionOptions::default().transport(Transport::Udp),
        )
        .await
        .unwrap();
        session.setup(0).await.unwrap();
        let mut playing = session.play(PlayOptions::default()).await.unwrap();

        for i in 0..10u16 {
            stream.write_rtp(0, rtp_pkt(200 + i, 3000 * u32::from(i))).unwrap();
        }
        let mut received = Vec::new();
        while received.len() < 10 {
            match playing.next().await {
                Some(Ok(PacketItem::Rtp(p))) => received.push(p.sequence_number()),
                Some(Ok(_)) => {} // RTCP, including the pinhole receiver report.
                other => panic!("unexpected item: {other:?}"),
            }
        }
        assert_eq!(received, (200..210).collect::<Vec<u16>>());
        playing.teardown().await.unwrap();
        handle.stop();
    }

    /// A session in Play rejects SETUP with 455 Method Not Valid In This
    /// State.
    #[tokio::test(flavor = "multi_thread")]
    async fn setup_in_play_state_rejected() {
        crate::testutil::init_logging();
        let stream = h264_stream();
        let handler = TestHandler::new(stream.clone());
        let (addr, handle) = start_server(handler, false).await;

        let url = Url::parse(&format!("rtsp://{addr}/cam")).unwrap();
        let mut session = client::Session::describe(
            url.clone(),
            SessionOptions::default().transport(Transport::Tcp),
        )
        .await
        .unwrap();
        session.setup(0).await.unwrap();
        let playing = session.play(PlayOptions::default()).await.unwrap();

        // Poke the playing session from a second connection.
        let raw = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut conn = crate::conn::Connection::from_stream(raw).unwrap();
        let sid = playing.session_id().to_owned();
        let req = rtsp_types::Request::builder(
            rtsp_types::Method::Setup,
            rtsp_types::Version::V1_0,
        )
        .request_uri(Url::parse(&format!("rtsp://{addr}/cam/trackID=0")).unwrap())
        .header(rtsp_types::headers::CSEQ, "1")
        .header(rtsp_types::headers::SESSION, sid)
        .header(
            rtsp_types::headers::TRANSPORT,
            "RTP/AVP/TCP;unicast;interleaved=0-1",
        )
        .build(bytes::Bytes::new());
        conn.send(rtsp_types::Message::Request(req)).await.unwrap();
        let resp = match conn.next_msg().await.unwrap().unwrap().msg {
            rtsp_types::Message::Response(r) => r,
            o => panic!("unexpected message {o:?}"),
        };
        assert_eq!(
            resp.status(),
            rtsp_types::StatusCode::MethodNotValidInThisState
        );
        handle.stop();
    }

    /// An RTP packet with a payload type outside the session's format map
    /// fires `on_warning` and the session continues (scenario from a
    /// publishing session).
    #[tokio::test]
    async fn unknown_payload_type_is_warning() {
        crate::testutil::init_logging();
        let stream = h264_stream();
        let handler = TestHandler::new(stream.clone());
        let token = tokio_util::sync::CancellationToken::new();
        let session = session::ServerSession::new(
            "test".into(),
            0,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_secs(60),
            token,
            Arc::new(handler.clone()),
            None,
            1,
        );
        {
            let mut inner = session.inner.lock().unwrap();
            inner.state = session::SessionState::Record;
            inner.media[0]
                .formats
                .insert(96, session::RecordFormat::new(&stream.medias()[0].formats[0]).unwrap());
        }
        // Payload type 97 is not in the format map.
        let bad = crate::rtp::RawPacketBuilder {
            sequence_number: 1,
            timestamp: 0,
            payload_type: 97,
            ssrc: 1,
            mark: true,
        }
        .build(b"x".iter().copied())
        .unwrap()
        .0
         .0;
        session.handle_rtp(0, bad);
        let warnings = handler.warnings.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("unknown payload type (97)"));
        drop(warnings);

        // A good packet still flows to the handler afterward.
        session.handle_rtp(0, rtp_pkt(2, 3000));
        assert_eq!(handler.rtp_packets.load(Ordering::SeqCst), 1);
    }

}
