// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client: reads streams from servers (`DESCRIBE`/`PLAY`) and publishes
//! streams to them (`ANNOUNCE`/`RECORD`), over UDP unicast, UDP multicast,
//! and TCP interleaved transports.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::num::{NonZeroU16, NonZeroU32};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use futures::{Future, SinkExt, StreamExt};
use log::{debug, trace, warn};
use rand::Rng;
use tokio::net::UdpSocket;
use url::Url;

use crate::codec::{CodecItem, Depacketizer};
use crate::conn::Connection;
use crate::error::ErrorInt;
use crate::format::Format;
use crate::rtcp::{ReceiverReportState, SenderReportState};
use crate::{
    Error, PacketContext, StreamContext, Transport, WallTime, MAX_TCP_PACKET_SIZE,
    MAX_UDP_PACKET_SIZE,
};

use self::channel_mapping::{ChannelMappings, ChannelType};
pub use self::timeline::Timeline;

mod channel_mapping;
pub(crate) mod parse;
pub mod rtp;
mod teardown;
mod timeline;

/// Minimum keepalive period; `session timeout / 2` is used when larger.
const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for the first packet after a UDP `PLAY` before falling
/// back to TCP.
const DEFAULT_INITIAL_UDP_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-message read deadline.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-frame write deadline.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Username and password authentication credentials.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"(elided)")
            .finish()
    }
}

/// Options which apply to a whole session.
#[derive(Clone, Default)]
pub struct SessionOptions {
    creds: Option<Credentials>,
    user_agent: Option<Box<str>>,
    transport: Option<Transport>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    initial_udp_read_timeout: Option<Duration>,
    on_warning: Option<Arc<dyn Fn(&Error) + Send + Sync>>,
}

impl SessionOptions {
    /// Uses the given credentials when/if the server requests digest or
    /// basic authentication.
    pub fn creds(mut self, creds: Option<Credentials>) -> Self {
        self.creds = creds;
        self
    }

    /// Sends the given user agent string with each request.
    pub fn user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = (!user_agent.is_empty()).then(|| user_agent.into_boxed_str());
        self
    }

    /// Forces a specific transport rather than negotiating one.
    ///
    /// Without this, `SETUP` tries UDP first and falls back to TCP, both on
    /// a `461 Unsupported Transport` response and when a UDP `PLAY` produces
    /// no packets within the initial read timeout.
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the per-message read deadline (default 10 seconds).
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    /// Sets the per-frame write deadline (default 10 seconds).
    pub fn write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = Some(write_timeout);
        self
    }

    /// Sets how long to wait for the first packet after a UDP `PLAY` before
    /// falling back to TCP (default 3 seconds).
    pub fn initial_udp_read_timeout(mut self, timeout: Duration) -> Self {
        self.initial_udp_read_timeout = Some(timeout);
        self
    }

    /// Receives non-fatal errors: dropped packets, codec-level problems.
    pub fn on_warning(mut self, f: Arc<dyn Fn(&Error) + Send + Sync>) -> Self {
        self.on_warning = Some(f);
        self
    }

    fn read_timeout_or_default(&self) -> Duration {
        self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT)
    }

    fn write_timeout_or_default(&self) -> Duration {
        self.write_timeout.unwrap_or(DEFAULT_WRITE_TIMEOUT)
    }

    fn warn(&self, e: Error) {
        if let Some(f) = &self.on_warning {
            f(&e);
        } else {
            warn!("{e}");
        }
    }
}

/// Policy for handling the `rtptime` parameter normally seen in the
/// `RTP-Info` header. This parameter is used to map each stream's RTP
/// timestamp to NPT ("normal play time"), allowing multiple streams to be
/// played in sync.
#[derive(Copy, Clone, Debug, Default)]
pub enum InitialTimestampPolicy {
    /// Default policy: currently `Require` when playing multiple streams,
    /// `Ignore` otherwise.
    #[default]
    Default,

    /// Require the `rtptime` parameter be present and use it to set NPT. Use
    /// when accurate multi-stream NPT is important.
    Require,

    /// Ignore the `rtptime` parameter and assume the first received packet
    /// for each stream is at NPT 0. Use with cameras that are known to set
    /// `rtptime` incorrectly.
    Ignore,

    /// Use the `rtptime` parameter when playing multiple streams if it's
    /// specified for all of them; otherwise assume the first received packet
    /// for each stream is at NPT 0.
    Permissive,
}

impl std::fmt::Display for InitialTimestampPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitialTimestampPolicy::Default => f.pad("default"),
            InitialTimestampPolicy::Require => f.pad("require"),
            InitialTimestampPolicy::Ignore => f.pad("ignore"),
            InitialTimestampPolicy::Permissive => f.pad("permissive"),
        }
    }
}

/// Policy decisions to make on `PLAY`.
///
/// These are mostly adjustments for non-compliant server implementations.
#[derive(Clone, Default)]
pub struct PlayOptions {
    initial_timestamp: InitialTimestampPolicy,
    ignore_zero_seq: bool,
    enforce_timestamps_with_max_jump_secs: Option<NonZeroU32>,
}

impl PlayOptions {
    pub fn initial_timestamp(self, initial_timestamp: InitialTimestampPolicy) -> Self {
        Self {
            initial_timestamp,
            ..self
        }
    }

    /// If the `RTP-Info` specifies `seq=0`, ignore it. Some cameras set this
    /// value then start the stream with something dramatically different.
    pub fn ignore_zero_seq(self, ignore_zero_seq: bool) -> Self {
        Self {
            ignore_zero_seq,
            ..self
        }
    }

    /// Enforces that timestamps are non-decreasing and jump forward by no
    /// more than the given number of seconds.
    ///
    /// By default, no enforcement is done, and computed [`crate::Timestamp`]
    /// values will go backward if subsequent 32-bit RTP timestamps differ by
    /// more than `i32::MAX`.
    pub fn enforce_timestamps_with_max_jump_secs(self, secs: NonZeroU32) -> Self {
        Self {
            enforce_timestamps_with_max_jump_secs: Some(secs),
            ..self
        }
    }
}

/// The media description and per-stream state resulting from `DESCRIBE` or
/// `ANNOUNCE`.
#[derive(Debug)]
pub struct Presentation {
    pub streams: Vec<Stream>,
    base_url: Url,
    pub control: Url,
}

/// Information about a stream offered within a presentation.
/// Currently if multiple formats are offered, this only describes the first.
#[derive(Debug)]
pub struct Stream {
    /// Media type, as specified in the [IANA SDP parameters media
    /// registry](https://www.iana.org/assignments/sdp-parameters/sdp-parameters.xhtml#sdp-parameters-1).
    pub media: String,

    /// An encoding name, as specified in the [IANA media type
    /// registry](https://www.iana.org/assignments/media-types/media-types.xhtml),
    /// with ASCII characters in lowercase.
    pub encoding_name: String,

    /// RTP payload type.
    /// See the [registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1).
    /// It's common to use one of the dynamically assigned values, 96-127.
    pub rtp_payload_type: u8,

    /// RTP clock rate, in Hz.
    pub clock_rate: u32,

    /// Number of audio channels, if applicable (`media` is `audio`) and
    /// known.
    pub channels: Option<NonZeroU16>,

    /// The parsed format.
    pub format: Format,

    pub(crate) depacketizer: Result<Depacketizer, String>,

    /// The specified control URL.
    /// This is needed with multiple streams to send `SETUP` requests and
    /// interpret the `PLAY` response's `RTP-Info` header.
    /// [RFC 2326 section C.3](https://datatracker.ietf.org/doc/html/rfc2326#appendix-C.3)
    /// says the server is allowed to omit it when there is only a single
    /// stream.
    pub control: Option<Url>,

    /// Some buggy cameras expect the base URL to be interpreted as if it had
    /// an implicit trailing slash. (This is approximately what ffmpeg 4.3.1
    /// does when the base URL has a query string.) If `RTP-Info` matching
    /// fails, try again with this URL.
    alt_control: Option<Url>,

    pub(crate) sockets: Option<UdpSockets>,

    pub(crate) state: StreamState,
}

impl Stream {
    /// Returns the parameters for this stream, if known.
    ///
    /// Returns `None` on unknown codecs, bad parameters, or if parameters
    /// aren't specified via SDP. Some codecs allow parameters to be specified
    /// in-band instead.
    pub fn parameters(&self) -> Option<crate::codec::ParametersRef<'_>> {
        self.depacketizer.as_ref().ok().and_then(|d| d.parameters())
    }
}

/// A stream's pair of UDP sockets and the peer addresses they talk to.
pub(crate) struct UdpSockets {
    local_ip: IpAddr,
    local_rtp_port: u16,
    rtp_socket: Arc<UdpSocket>,
    rtcp_socket: Arc<UdpSocket>,
    peer_rtp: Option<SocketAddr>,
    peer_rtcp: Option<SocketAddr>,
}

impl std::fmt::Debug for UdpSockets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSockets")
            .field("local_ip", &self.local_ip)
            .field("local_rtp_port", &self.local_rtp_port)
            .field("peer_rtp", &self.peer_rtp)
            .field("peer_rtcp", &self.peer_rtcp)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum StreamState {
    /// Uninitialized; no `SETUP` has yet been sent.
    Uninit,

    /// `SETUP` reply has been received.
    Init(StreamStateInit),

    /// `PLAY` reply has been received.
    Playing {
        timeline: Timeline,
        rtp_handler: rtp::StrictSequenceChecker,
        rtcp_rx: ReceiverReportState,
        ctx: StreamContext,
    },

    /// `RECORD` reply has been received.
    Recording {
        rtcp_tx: SenderReportState,
        ctx: StreamContext,
    },
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct StreamStateInit {
    /// The RTP synchronization source (SSRC), as defined in
    /// [RFC 3550](https://tools.ietf.org/html/rfc3550). This is normally
    /// supplied in the `SETUP` response's `Transport` header. Reolink cameras
    /// instead supply it in the `PLAY` response's `RTP-Info` header.
    pub(crate) ssrc: Option<u32>,

    /// The initial RTP sequence number, as specified in the `PLAY` response's
    /// `RTP-Info` header.
    pub(crate) initial_seq: Option<u16>,

    /// The initial RTP timestamp, as specified in the `PLAY` response's
    /// `RTP-Info` header.
    pub(crate) initial_rtptime: Option<u32>,
}

/// Whether this session was started to read (`DESCRIBE`) or publish
/// (`ANNOUNCE`) media.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SessionMode {
    Play,
    Record,
}

/// Distinguishes the two packet kinds on the record write path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum MediaKind {
    Rtp,
    Rtcp,
}

/// An item yielded by [`Session<Playing>`]'s [`futures::Stream`] impl.
#[derive(Debug)]
pub enum PacketItem {
    Rtp(crate::rtp::ReceivedPacket),
    Rtcp(crate::rtcp::ReceivedCompoundPacket),
}

/// Marker trait for the state of a [`Session`].
///
/// This doesn't closely match [RFC 2326
/// A.1](https://tools.ietf.org/html/rfc2326#appendix-A.1). In practice, we've
/// found that cheap IP cameras are more restrictive than RTSP suggests. Eg, a
/// `DESCRIBE` changes the connection's state such that another one will fail,
/// before assigning a session id. Thus [`Session`] represents something more
/// like an RTSP connection than an RTSP session.
#[doc(hidden)]
pub trait State {}

/// Initial state after a `DESCRIBE` or `ANNOUNCE`; use via
/// `Session<Described>`.
///
/// One or more `SETUP`s may have also been issued, in which case a
/// `session_id` will be assigned.
pub struct Described {
    presentation: Presentation,
    session: Option<(String, Duration)>,
    channels: ChannelMappings,
    negotiated: Option<Transport>,
    mode: SessionMode,
    keepalive_method: rtsp_types::Method,
}
impl State for Described {}

enum KeepaliveState {
    Idle,
    Flushing(u32),
    Waiting(u32),
}

/// State after a `PLAY`; use via `Session<Playing>`.
pub struct Playing {
    presentation: Presentation,
    session_id: String,
    channels: ChannelMappings,
    negotiated: Transport,
    mode: SessionMode,
    keepalive_method: rtsp_types::Method,
    keepalive_state: KeepaliveState,
    keepalive_period: Duration,
    session_timeout: Duration,
    keepalive_timer: Pin<Box<tokio::time::Sleep>>,
    rtcp_timer: Pin<Box<tokio::time::Sleep>>,
    local_ssrc: u32,
    buffered: VecDeque<PacketItem>,
    udp_buf: Box<[u8; MAX_UDP_PACKET_SIZE + 1]>,
}
impl State for Playing {}

/// State after a `RECORD`; use via `Session<Recording>`.
pub struct Recording {
    presentation: Presentation,
    session_id: String,
    channels: ChannelMappings,
    negotiated: Transport,
    keepalive_method: rtsp_types::Method,
    keepalive_period: Duration,
    session_timeout: Duration,
    next_keepalive: tokio::time::Instant,
    next_sender_report: tokio::time::Instant,
    local_ssrc: u32,
}
impl State for Recording {}

/// The raw connection, without tracking session state.
struct RtspConnection {
    inner: Connection,
    requested_auth: Option<digest_auth::WwwAuthenticateHeader>,
    requested_basic: bool,

    /// The next `CSeq` header value to use when sending an RTSP request.
    next_cseq: u32,
}

/// An RTSP session, or a connection that may be used in a proscriptive way.
/// See discussion at [`State`].
pub struct Session<S: State> {
    conn: RtspConnection,
    options: SessionOptions,
    state: S,
}

impl RtspConnection {
    async fn connect(url: &Url) -> Result<Self, Error> {
        let (host, port) = Self::host_port(url)?;
        let inner = Connection::connect(host, port)
            .await
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        Ok(Self {
            inner,
            requested_auth: None,
            requested_basic: false,
            next_cseq: 1,
        })
    }

    fn host_port(url: &Url) -> Result<(url::Host<&str>, u16), Error> {
        if url.scheme() != "rtsp" {
            bail!(ErrorInt::InvalidArgument(format!(
                "unsupported scheme {:?}; only rtsp is supported",
                url.scheme()
            )));
        }
        let host = url.host().ok_or_else(|| {
            wrap!(ErrorInt::InvalidArgument(format!(
                "must specify host in rtsp url {url}"
            )))
        })?;
        let port = url.port().unwrap_or(554);
        Ok((host, port))
    }

    /// Sends a request and expects the next non-data message from the peer to
    /// be its response. Takes care of authorization and `CSeq`.
    async fn send(
        &mut self,
        options: &SessionOptions,
        req: &mut rtsp_types::Request<Bytes>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let read_timeout = options.read_timeout_or_default();
        loop {
            let cseq = self.fill_req(options, req)?;
            self.inner
                .send(rtsp_types::Message::Request(req.clone()))
                .await?;
            let (resp, msg_ctx) = loop {
                let msg = tokio::time::timeout(read_timeout, self.inner.next_msg())
                    .await
                    .map_err(|_| wrap!(ErrorInt::Timeout))?
                    .ok_or_else(|| {
                        wrap!(ErrorInt::RtspReadError {
                            conn_ctx: *self.inner.ctx(),
                            msg_ctx: self.inner.eof_ctx(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "EOF while waiting for reply",
                            ),
                        })
                    })??;
                match msg.msg {
                    rtsp_types::Message::Response(r) => break (r, msg.ctx),
                    rtsp_types::Message::Data(_) => {
                        // Media from the previous state (eg packets arriving
                        // after a PAUSE request); drop.
                        trace!("ignoring data message while awaiting response");
                        continue;
                    }
                    rtsp_types::Message::Request(r) => {
                        debug!("ignoring request {:?} while awaiting response", r.method());
                        continue;
                    }
                }
            };
            if parse::get_cseq(&resp) != Some(cseq) {
                bail!(ErrorInt::RtspFramingError {
                    conn_ctx: *self.inner.ctx(),
                    msg_ctx,
                    description: format!("didn't get expected CSeq {cseq} in response"),
                });
            }
            if resp.status() == rtsp_types::StatusCode::Unauthorized {
                if self.requested_auth.is_some() || self.requested_basic {
                    bail!(ErrorInt::AuthError {
                        conn_ctx: *self.inner.ctx(),
                        description: "received Unauthorized after authenticating".into(),
                    });
                }
                if options.creds.is_none() {
                    bail!(ErrorInt::AuthError {
                        conn_ctx: *self.inner.ctx(),
                        description: "authentication required; no credentials supplied".into(),
                    });
                }
                let www_authenticate =
                    match resp.header(&rtsp_types::headers::WWW_AUTHENTICATE) {
                        None => bail!(ErrorInt::AuthError {
                            conn_ctx: *self.inner.ctx(),
                            description: "Unauthorized without WWW-Authenticate header".into(),
                        }),
                        Some(h) => h.as_str(),
                    };
                if www_authenticate.starts_with("Digest ") {
                    self.requested_auth = Some(
                        digest_auth::WwwAuthenticateHeader::parse(www_authenticate).map_err(
                            |e| {
                                wrap!(ErrorInt::AuthError {
                                    conn_ctx: *self.inner.ctx(),
                                    description: format!("bad WWW-Authenticate header: {e}"),
                                })
                            },
                        )?,
                    );
                } else if www_authenticate.starts_with("Basic ") {
                    self.requested_basic = true;
                } else {
                    bail!(ErrorInt::AuthError {
                        conn_ctx: *self.inner.ctx(),
                        description: format!(
                            "unsupported authentication scheme {www_authenticate:?}"
                        ),
                    });
                }
                continue;
            } else if !resp.status().is_success() {
                bail!(ErrorInt::RtspResponseError {
                    conn_ctx: *self.inner.ctx(),
                    msg_ctx,
                    method: req.method().clone(),
                    cseq,
                    status: resp.status(),
                    description: "non-success response".into(),
                });
            }
            return Ok(resp);
        }
    }

    /// Fills out `req` with authorization and `CSeq` headers.
    fn fill_req(
        &mut self,
        options: &SessionOptions,
        req: &mut rtsp_types::Request<Bytes>,
    ) -> Result<u32, Error> {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        match (&self.requested_auth, self.requested_basic, &options.creds) {
            (Some(auth), _, Some(creds)) => {
                let uri = req.request_uri().map(|u| u.as_str()).unwrap_or("*");
                let method = digest_auth::HttpMethod(Cow::Borrowed(req.method().into()));
                let ctx = digest_auth::AuthContext::new_with_method(
                    &creds.username,
                    &creds.password,
                    uri,
                    Option::<&'static [u8]>::None,
                    method,
                );
                let mut auth = auth.clone();
                let authorization = auth
                    .respond(&ctx)
                    .map_err(|e| {
                        wrap!(ErrorInt::AuthError {
                            conn_ctx: *self.inner.ctx(),
                            description: format!("digest challenge failed: {e}"),
                        })
                    })?
                    .to_string();
                self.requested_auth = Some(auth);
                req.insert_header(rtsp_types::headers::AUTHORIZATION, authorization);
            }
            (None, true, Some(creds)) => {
                let encoded =
                    base64::encode(format!("{}:{}", creds.username, creds.password));
                req.insert_header(
                    rtsp_types::headers::AUTHORIZATION,
                    format!("Basic {encoded}"),
                );
            }
            _ => {}
        }
        req.insert_header(rtsp_types::headers::CSEQ, cseq.to_string());
        if let Some(ref user_agent) = options.user_agent {
            req.insert_header(rtsp_types::headers::USER_AGENT, user_agent.to_string());
        }
        Ok(cseq)
    }
}

impl Session<Described> {
    /// Creates a new session from the given URL, reading the presentation
    /// with `OPTIONS` + `DESCRIBE`.
    pub async fn describe(url: Url, options: SessionOptions) -> Result<Self, Error> {
        let mut conn = RtspConnection::connect(&url).await?;

        // OPTIONS first: the advertised methods decide whether keepalives use
        // GET_PARAMETER or fall back to OPTIONS.
        let mut req =
            rtsp_types::Request::builder(rtsp_types::Method::Options, rtsp_types::Version::V1_0)
                .request_uri(url.clone())
                .build(Bytes::new());
        let options_response = conn.send(&options, &mut req).await?;
        let keepalive_method = options_response
            .header(&rtsp_types::headers::PUBLIC)
            .map(|v| v.as_str().contains("GET_PARAMETER"))
            .unwrap_or(false)
            .then_some(rtsp_types::Method::GetParameter)
            .unwrap_or(rtsp_types::Method::Options);

        let mut req =
            rtsp_types::Request::builder(rtsp_types::Method::Describe, rtsp_types::Version::V1_0)
                .header(rtsp_types::headers::ACCEPT, "application/sdp")
                .request_uri(url.clone())
                .build(Bytes::new());
        let response = conn.send(&options, &mut req).await?;
        let presentation = parse::parse_describe(url, &response).map_err(|description| {
            wrap!(ErrorInt::RtspResponseError {
                conn_ctx: *conn.inner.ctx(),
                msg_ctx: crate::RtspMessageContext::dummy(),
                method: rtsp_types::Method::Describe,
                cseq: conn.next_cseq - 1,
                status: response.status(),
                description,
            })
        })?;
        Ok(Session {
            conn,
            options,
            state: Described {
                presentation,
                session: None,
                channels: ChannelMappings::default(),
                negotiated: None,
                mode: SessionMode::Play,
                keepalive_method,
            },
        })
    }

    /// Creates a new publishing session, announcing the given media with
    /// `ANNOUNCE`. Follow with `setup` for each stream and `record`.
    pub async fn announce(
        url: Url,
        medias: Vec<crate::sdp::Media>,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        if medias.is_empty() || medias.len() > crate::MAX_MEDIA_PER_SESSION {
            bail!(ErrorInt::InvalidArgument(format!(
                "expected 1..={} media, got {}",
                crate::MAX_MEDIA_PER_SESSION,
                medias.len()
            )));
        }
        let mut conn = RtspConnection::connect(&url).await?;
        let local_ip = conn.inner.ctx().local_addr().ip();
        let sdp = crate::sdp::marshal(&medias, local_ip, "Stream");
        let mut req =
            rtsp_types::Request::builder(rtsp_types::Method::Announce, rtsp_types::Version::V1_0)
                .header(rtsp_types::headers::CONTENT_TYPE, "application/sdp")
                .request_uri(url.clone())
                .build(Bytes::from(sdp));
        conn.send(&options, &mut req).await?;

        let streams = medias
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let format = m.formats[0].clone();
                let control = crate::sdp::join_control(&url, &format!("trackID={i}"))
                    .map_err(|e| wrap!(ErrorInt::InvalidArgument(e)))?;
                Ok(Stream {
                    media: m.media_type.clone(),
                    encoding_name: format.encoding_name().to_ascii_lowercase(),
                    rtp_payload_type: format.payload_type(),
                    clock_rate: format.clock_rate(),
                    channels: format.channels(),
                    depacketizer: Depacketizer::new(&format),
                    format,
                    control: Some(control),
                    alt_control: None,
                    sockets: None,
                    state: StreamState::Uninit,
                })
            })
            .collect::<Result<Vec<Stream>, Error>>()?;
        Ok(Session {
            conn,
            options,
            state: Described {
                presentation: Presentation {
                    control: url.clone(),
                    base_url: url,
                    streams,
                },
                session: None,
                channels: ChannelMappings::default(),
                negotiated: None,
                mode: SessionMode::Record,
                keepalive_method: rtsp_types::Method::Options,
            },
        })
    }

    pub fn streams(&self) -> &[Stream] {
        &self.state.presentation.streams
    }

    /// Sends a `SETUP` request for a stream, negotiating the transport.
    ///
    /// Note these can't reasonably be pipelined because subsequent requests
    /// are expected to adopt the previous response's `Session`. Likewise, the
    /// server may override the preferred interleaved channel id and it seems
    /// like a bad idea to try to assign more interleaved channels without
    /// inspecting that first.
    ///
    /// Panics if `stream_i >= self.streams().len()`.
    pub async fn setup(&mut self, stream_i: usize) -> Result<(), Error> {
        let mut candidates: &[Transport] = match (self.options.transport, self.state.negotiated) {
            (_, Some(t)) => match t {
                Transport::Udp => &[Transport::Udp],
                Transport::UdpMulticast => &[Transport::UdpMulticast],
                Transport::Tcp => &[Transport::Tcp],
            },
            (Some(Transport::Udp), None) => &[Transport::Udp],
            (Some(Transport::UdpMulticast), None) => &[Transport::UdpMulticast],
            (Some(Transport::Tcp), None) => &[Transport::Tcp],
            (None, None) => &[Transport::Udp, Transport::Tcp],
        };
        loop {
            let (transport, rest) = candidates.split_first().expect("non-empty candidates");
            match self.setup_with(stream_i, *transport).await {
                Ok(()) => {
                    self.state.negotiated = Some(*transport);
                    return Ok(());
                }
                Err(e)
                    if !rest.is_empty()
                        && e.status_code() == Some(461 /* Unsupported Transport */) =>
                {
                    debug!("transport {transport} rejected with 461; trying next");
                    candidates = rest;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn setup_with(&mut self, stream_i: usize, transport: Transport) -> Result<(), Error> {
        let stream = &mut self.state.presentation.streams[stream_i];
        if !matches!(stream.state, StreamState::Uninit) {
            bail!(ErrorInt::FailedPrecondition("stream already set up".into()));
        }
        let local_ip = self.conn.inner.ctx().local_addr().ip();
        let mode = match self.state.mode {
            SessionMode::Play => "",
            SessionMode::Record => ";mode=record",
        };
        let mut proposed_channel_id = None;
        let transport_hdr = match transport {
            Transport::Udp => {
                let pair = crate::conn::UdpPair::for_ip(local_ip)
                    .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
                stream.sockets = Some(UdpSockets {
                    local_ip,
                    local_rtp_port: pair.rtp_port,
                    rtp_socket: Arc::new(pair.rtp_socket),
                    rtcp_socket: Arc::new(pair.rtcp_socket),
                    peer_rtp: None,
                    peer_rtcp: None,
                });
                format!(
                    "RTP/AVP/UDP;unicast;client_port={}-{}{mode}",
                    pair.rtp_port,
                    pair.rtp_port + 1,
                )
            }
            Transport::UdpMulticast => format!("RTP/AVP;multicast{mode}"),
            Transport::Tcp => {
                let c = self.state.channels.next_unassigned().ok_or_else(|| {
                    wrap!(ErrorInt::FailedPrecondition(
                        "out of interleaved channels".into()
                    ))
                })?;
                proposed_channel_id = Some(c);
                format!("RTP/AVP/TCP;unicast;interleaved={}-{}{mode}", c, c + 1)
            }
        };
        let url = stream
            .control
            .as_ref()
            .unwrap_or(&self.state.presentation.control)
            .clone();
        let mut req =
            rtsp_types::Request::builder(rtsp_types::Method::Setup, rtsp_types::Version::V1_0)
                .request_uri(url)
                .header(rtsp_types::headers::TRANSPORT, transport_hdr)
                .build(Bytes::new());
        if let Some((ref s, _)) = self.state.session {
            req.insert_header(rtsp_types::headers::SESSION, s.clone());
        }
        let response = match self.conn.send(&self.options, &mut req).await {
            Ok(r) => r,
            Err(e) => {
                // Don't leak sockets for a failed attempt.
                self.state.presentation.streams[stream_i].sockets = None;
                return Err(e);
            }
        };
        let conn_ctx = *self.conn.inner.ctx();
        let stream = &mut self.state.presentation.streams[stream_i];
        let fail = |description: String| {
            wrap!(ErrorInt::RtspProtocolError {
                conn_ctx,
                description,
            })
        };
        let response = parse::parse_setup(&response).map_err(fail)?;
        if let Some((old, _)) = &self.state.session {
            if *old != response.session_id {
                stream.sockets = None;
                return Err(fail(format!(
                    "SETUP response changed session id from {old:?} to {:?}",
                    response.session_id
                )));
            }
        } else {
            self.state.session = Some((response.session_id, response.session_timeout));
        }
        let t = response.transport;
        match transport {
            Transport::Udp => {
                let sockets = stream.sockets.as_mut().expect("udp sockets bound");
                let server_port = match t.server_port {
                    Some(p) => p,
                    None => {
                        stream.sockets = None;
                        return Err(fail("UDP SETUP response with no server_port".into()));
                    }
                };
                if server_port.1 != server_port.0 + 1 {
                    stream.sockets = None;
                    return Err(fail(format!(
                        "UDP SETUP response with mismatched server ports {server_port:?}"
                    )));
                }
                let peer_ip = t.destination.unwrap_or_else(|| conn_ctx.peer_addr().ip());
                sockets.peer_rtp = Some(SocketAddr::new(peer_ip, server_port.0));
                sockets.peer_rtcp = Some(SocketAddr::new(peer_ip, server_port.1));
            }
            Transport::UdpMulticast => {
                let group = match (t.destination, t.server_port) {
                    (Some(IpAddr::V4(group)), Some(port)) if group.is_multicast() => {
                        (group, port)
                    }
                    _ => {
                        return Err(fail(
                            "multicast SETUP response without destination/port".into(),
                        ))
                    }
                };
                let (rtp_socket, rtcp_socket) =
                    join_multicast(group.0, group.1).map_err(|e| {
                        wrap!(ErrorInt::ConnectError(e))
                    })?;
                stream.sockets = Some(UdpSockets {
                    local_ip: IpAddr::V4(group.0),
                    local_rtp_port: group.1 .0,
                    rtp_socket: Arc::new(rtp_socket),
                    rtcp_socket: Arc::new(rtcp_socket),
                    peer_rtp: Some(SocketAddr::new(IpAddr::V4(group.0), group.1 .0)),
                    peer_rtcp: Some(SocketAddr::new(IpAddr::V4(group.0), group.1 .1)),
                });
            }
            Transport::Tcp => {
                let channel_id = t
                    .channel_id
                    .or(proposed_channel_id)
                    .ok_or_else(|| fail("TCP SETUP response with no interleaved channel".into()))?;
                self.state
                    .channels
                    .assign(channel_id, stream_i)
                    .map_err(fail)?;
            }
        }
        stream.state = StreamState::Init(StreamStateInit::new(t.ssrc));
        Ok(())
    }

    /// Sends a `PLAY` request for the entire presentation and transitions to
    /// state `Playing`.
    ///
    /// The presentation must support aggregate control, as defined in
    /// [RFC 2326 section 1.3](https://tools.ietf.org/html/rfc2326#section-1.3).
    ///
    /// If the negotiated transport is UDP and no packet arrives within the
    /// initial read timeout, tears the session down and retries all media on
    /// TCP.
    pub async fn play(mut self, policy: PlayOptions) -> Result<Session<Playing>, Error> {
        if self.state.mode != SessionMode::Play {
            bail!(ErrorInt::FailedPrecondition(
                "can't PLAY in a publishing session".into()
            ));
        }
        let fallback_eligible = self.options.transport.is_none()
            && matches!(self.state.negotiated, Some(Transport::Udp));
        let setup_streams: Vec<usize> = self
            .state
            .presentation
            .streams
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.state, StreamState::Init(_)))
            .map(|(i, _)| i)
            .collect();
        let initial_udp_read_timeout = self
            .options
            .initial_udp_read_timeout
            .unwrap_or(DEFAULT_INITIAL_UDP_READ_TIMEOUT);
        let mut playing = self.play_once(policy.clone()).await?;
        if !fallback_eligible {
            return Ok(playing);
        }
        match playing.wait_first_packet(initial_udp_read_timeout).await {
            Ok(()) => Ok(playing),
            Err(e) if e.is_timeout() => {
                log::info!(
                    "no packets within {initial_udp_read_timeout:?} after UDP PLAY; \
                     retrying on TCP"
                );
                let mut described = playing.into_described().await?;
                described.state.negotiated = Some(Transport::Tcp);
                for i in setup_streams {
                    described.setup_with(i, Transport::Tcp).await?;
                }
                described.play_once(policy).await
            }
            Err(e) => Err(e),
        }
    }

    async fn play_once(mut self, policy: PlayOptions) -> Result<Session<Playing>, Error> {
        let (session_id, session_timeout) = self
            .state
            .session
            .clone()
            .ok_or_else(|| wrap!(ErrorInt::FailedPrecondition("must SETUP before PLAY".into())))?;
        trace!("PLAY with channel mappings: {:#?}", &self.state.channels);
        let response = self
            .conn
            .send(
                &self.options,
                &mut rtsp_types::Request::builder(
                    rtsp_types::Method::Play,
                    rtsp_types::Version::V1_0,
                )
                .request_uri(self.state.presentation.control.clone())
                .header(rtsp_types::headers::SESSION, session_id.clone())
                .header(rtsp_types::headers::RANGE, "npt=0.000-".to_owned())
                .build(Bytes::new()),
            )
            .await?;
        let conn_ctx = *self.conn.inner.ctx();
        parse::parse_play(&response, &mut self.state.presentation).map_err(|description| {
            wrap!(ErrorInt::RtspProtocolError {
                conn_ctx,
                description,
            })
        })?;

        // Count how many streams have been set up (not how many are in the
        // presentation).
        let setup_streams = self
            .state
            .presentation
            .streams
            .iter()
            .filter(|s| matches!(s.state, StreamState::Init(_)))
            .count();

        let all_have_time = self
            .state
            .presentation
            .streams
            .iter()
            .all(|s| match s.state {
                StreamState::Init(StreamStateInit {
                    initial_rtptime, ..
                }) => initial_rtptime.is_some(),
                _ => true,
            });

        // Move all streams that have been set up from Init to Playing state.
        // Check that required parameters are present while doing so.
        for (i, s) in self.state.presentation.streams.iter_mut().enumerate() {
            match s.state {
                StreamState::Init(StreamStateInit {
                    initial_rtptime,
                    initial_seq,
                    ssrc,
                }) => {
                    let initial_rtptime = match policy.initial_timestamp {
                        InitialTimestampPolicy::Require | InitialTimestampPolicy::Default
                            if setup_streams > 1 =>
                        {
                            if initial_rtptime.is_none() {
                                bail!(ErrorInt::RtspProtocolError {
                                    conn_ctx,
                                    description: format!(
                                        "Expected rtptime on PLAY with mode {:?}, missing on \
                                         stream {} ({:?}). Consider setting initial timestamp \
                                         mode permissive.",
                                        policy.initial_timestamp, i, &s.control
                                    ),
                                });
                            }
                            initial_rtptime
                        }
                        InitialTimestampPolicy::Permissive
                            if setup_streams > 1 && all_have_time =>
                        {
                            initial_rtptime
                        }
                        _ => None,
                    };
                    let initial_seq = match initial_seq {
                        Some(0) if policy.ignore_zero_seq => {
                            log::info!("Ignoring seq=0 on stream {i}");
                            None
                        }
                        o => o,
                    };
                    let ctx = stream_ctx(s, i, &self.state.channels, &conn_ctx);
                    let timeline = Timeline::new(
                        initial_rtptime,
                        s.clock_rate,
                        policy.enforce_timestamps_with_max_jump_secs,
                    )
                    .map_err(|description| {
                        wrap!(ErrorInt::RtspProtocolError {
                            conn_ctx,
                            description,
                        })
                    })?;
                    s.state = StreamState::Playing {
                        timeline,
                        rtp_handler: rtp::StrictSequenceChecker::new(ssrc, initial_seq),
                        rtcp_rx: ReceiverReportState::new(
                            NonZeroU32::new(s.clock_rate).expect("validated by Timeline::new"),
                        ),
                        ctx,
                    };
                }
                StreamState::Uninit => {}
                StreamState::Playing { .. } | StreamState::Recording { .. } => unreachable!(),
            };
        }

        let local_ssrc = rand::thread_rng().gen();
        let negotiated = self.state.negotiated.expect("negotiated by SETUP");

        // Open firewall pinholes on UDP: a no-payload RTP packet and an empty
        // receiver report, before anything else on these sockets.
        if negotiated == Transport::Udp {
            punch_pinholes(&self.state.presentation.streams, local_ssrc).await?;
        }

        let keepalive_period =
            std::cmp::max(session_timeout / 2, MIN_KEEPALIVE_PERIOD);
        Ok(Session {
            conn: self.conn,
            options: self.options,
            state: Playing {
                presentation: self.state.presentation,
                session_id,
                channels: self.state.channels,
                negotiated,
                mode: self.state.mode,
                keepalive_method: self.state.keepalive_method,
                keepalive_state: KeepaliveState::Idle,
                keepalive_period,
                session_timeout,
                keepalive_timer: Box::pin(tokio::time::sleep(keepalive_period)),
                rtcp_timer: Box::pin(tokio::time::sleep(
                    crate::rtcp::sender::DEFAULT_SENDER_REPORT_INTERVAL,
                )),
                local_ssrc,
                buffered: VecDeque::new(),
                udp_buf: Box::new([0u8; MAX_UDP_PACKET_SIZE + 1]),
            },
        })
    }

    /// Sends a `RECORD` request and transitions to state `Recording`.
    pub async fn record(mut self) -> Result<Session<Recording>, Error> {
        if self.state.mode != SessionMode::Record {
            bail!(ErrorInt::FailedPrecondition(
                "can't RECORD in a reading session; use announce()".into()
            ));
        }
        let (session_id, session_timeout) = self.state.session.clone().ok_or_else(|| {
            wrap!(ErrorInt::FailedPrecondition("must SETUP before RECORD".into()))
        })?;
        self.conn
            .send(
                &self.options,
                &mut rtsp_types::Request::builder(
                    rtsp_types::Method::Record,
                    rtsp_types::Version::V1_0,
                )
                .request_uri(self.state.presentation.control.clone())
                .header(rtsp_types::headers::SESSION, session_id.clone())
                .build(Bytes::new()),
            )
            .await?;
        let conn_ctx = *self.conn.inner.ctx();
        let local_ssrc: u32 = rand::thread_rng().gen();
        let negotiated = self.state.negotiated.expect("negotiated by SETUP");
        for (i, s) in self.state.presentation.streams.iter_mut().enumerate() {
            if let StreamState::Init(_) = s.state {
                let ctx = stream_ctx(s, i, &self.state.channels, &conn_ctx);
                s.state = StreamState::Recording {
                    rtcp_tx: SenderReportState::new(
                        local_ssrc,
                        NonZeroU32::new(s.clock_rate).ok_or_else(|| {
                            wrap!(ErrorInt::InvalidArgument("clock_rate=0".into()))
                        })?,
                        None,
                    ),
                    ctx,
                };
            }
        }
        if negotiated == Transport::Udp {
            punch_pinholes(&self.state.presentation.streams, local_ssrc).await?;
        }
        let keepalive_period = std::cmp::max(session_timeout / 2, MIN_KEEPALIVE_PERIOD);
        let now = tokio::time::Instant::now();
        Ok(Session {
            conn: self.conn,
            options: self.options,
            state: Recording {
                presentation: self.state.presentation,
                session_id,
                channels: self.state.channels,
                negotiated,
                keepalive_method: self.state.keepalive_method,
                keepalive_period,
                session_timeout,
                next_keepalive: now + keepalive_period,
                next_sender_report: now + crate::rtcp::sender::DEFAULT_SENDER_REPORT_INTERVAL,
                local_ssrc,
            },
        })
    }

    /// Tears down the session (if established) and closes the connection.
    pub async fn teardown(mut self) -> Result<(), Error> {
        match self.state.session.take() {
            Some((session_id, session_timeout)) => {
                teardown::teardown(
                    &mut self.conn,
                    &self.options,
                    &self.state.presentation.base_url,
                    &session_id,
                    session_timeout,
                )
                .await
            }
            None => Ok(()),
        }
    }
}

fn stream_ctx(
    s: &Stream,
    stream_i: usize,
    channels: &ChannelMappings,
    conn_ctx: &crate::ConnectionContext,
) -> StreamContext {
    match &s.sockets {
        Some(sockets) => StreamContext::udp(
            sockets.local_ip,
            sockets.local_rtp_port,
            sockets
                .peer_rtp
                .map(|a| a.ip())
                .unwrap_or_else(|| conn_ctx.peer_addr().ip()),
            sockets.peer_rtp.map(|a| a.port()).unwrap_or(0),
        ),
        None => StreamContext::tcp(channels.channel_id_for_stream(stream_i).unwrap_or(0)),
    }
}

/// Binds and joins a multicast group for RTP and RTCP reception.
fn join_multicast(
    group: std::net::Ipv4Addr,
    ports: (u16, u16),
) -> Result<(UdpSocket, UdpSocket), std::io::Error> {
    let bind = |port: u16| -> Result<UdpSocket, std::io::Error> {
        let s = std::net::UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port,
        ))?;
        s.join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)?;
        s.set_nonblocking(true)?;
        UdpSocket::from_std(s)
    };
    Ok((bind(ports.0)?, bind(ports.1)?))
}

/// Sends the firewall-opening packets: the first two packets on each new UDP
/// transport are a no-payload RTP packet and an empty receiver report.
async fn punch_pinholes(streams: &[Stream], local_ssrc: u32) -> Result<(), Error> {
    let blank_rtp = crate::rtp::RawPacketBuilder {
        sequence_number: 0,
        timestamp: 0,
        payload_type: 0,
        ssrc: local_ssrc,
        mark: false,
    }
    .build(std::iter::empty())
    .expect("blank rtp packet is valid")
    .0
     .0;
    let empty_rr = crate::rtcp::serialize_receiver_report(local_ssrc, None);
    for s in streams {
        let sockets = match &s.sockets {
            Some(s) => s,
            None => continue,
        };
        if let (Some(peer_rtp), Some(peer_rtcp)) = (sockets.peer_rtp, sockets.peer_rtcp) {
            sockets
                .rtp_socket
                .send_to(&blank_rtp[..], peer_rtp)
                .await
                .map_err(|e| wrap!(ErrorInt::UdpSendError(e)))?;
            sockets
                .rtcp_socket
                .send_to(&empty_rr[..], peer_rtcp)
                .await
                .map_err(|e| wrap!(ErrorInt::UdpSendError(e)))?;
        }
    }
    Ok(())
}

impl Session<Playing> {
    pub fn streams(&self) -> &[Stream] {
        &self.state.presentation.streams
    }

    /// Returns the server-assigned session id.
    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    /// Returns a wrapper which demuxes/depacketizes into frames.
    ///
    /// Fails if any setup stream's depacketizer isn't supported.
    pub fn demuxed(mut self) -> Result<Demuxed, Error> {
        for s in &mut self.state.presentation.streams {
            if matches!(s.state, StreamState::Playing { .. }) {
                if let Err(ref description) = s.depacketizer {
                    bail!(ErrorInt::RtspProtocolError {
                        conn_ctx: *self.conn.inner.ctx(),
                        description: description.clone(),
                    });
                }
            }
        }
        Ok(Demuxed {
            state: DemuxedState::Waiting,
            session: self,
        })
    }

    /// Sends a `PAUSE` request, returning to the ready state; `play` may be
    /// called again.
    pub async fn pause(mut self) -> Result<Session<Described>, Error> {
        let mut req =
            rtsp_types::Request::builder(rtsp_types::Method::Pause, rtsp_types::Version::V1_0)
                .request_uri(self.state.presentation.control.clone())
                .header(rtsp_types::headers::SESSION, self.state.session_id.clone())
                .build(Bytes::new());
        self.conn.send(&self.options, &mut req).await?;
        for s in &mut self.state.presentation.streams {
            if matches!(s.state, StreamState::Playing { .. }) {
                s.state = StreamState::Init(StreamStateInit::new(None));
            }
        }
        Ok(Session {
            conn: self.conn,
            options: self.options,
            state: Described {
                presentation: self.state.presentation,
                session: Some((self.state.session_id, self.state.session_timeout)),
                channels: self.state.channels,
                negotiated: Some(self.state.negotiated),
                mode: self.state.mode,
                keepalive_method: self.state.keepalive_method,
            },
        })
    }

    /// Tears down the session: signals the server and releases all sockets.
    pub async fn teardown(self) -> Result<(), Error> {
        let mut described = self.into_described_without_teardown();
        teardown::teardown_consumed(&mut described).await
    }

    /// Waits up to `timeout` for the first packet, buffering it.
    async fn wait_first_packet(&mut self, timeout: Duration) -> Result<(), Error> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(Some(Ok(item))) => {
                self.state.buffered.push_back(item);
                Ok(())
            }
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => bail!(ErrorInt::RtspReadError {
                conn_ctx: *self.conn.inner.ctx(),
                msg_ctx: self.conn.inner.eof_ctx(),
                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "EOF before data"),
            }),
            Err(_) => bail!(ErrorInt::Timeout),
        }
    }

    /// Tears down and returns to the `Described` state (for the UDP→TCP
    /// fallback).
    async fn into_described(self) -> Result<Session<Described>, Error> {
        let mut described = self.into_described_without_teardown();
        teardown::teardown_consumed(&mut described).await?;
        for s in &mut described.state.presentation.streams {
            s.sockets = None;
            if !matches!(s.state, StreamState::Uninit) {
                s.state = StreamState::Uninit;
            }
        }
        described.state.session = None;
        described.state.channels = ChannelMappings::default();
        described.state.negotiated = None;
        Ok(described)
    }

    fn into_described_without_teardown(self) -> Session<Described> {
        Session {
            conn: self.conn,
            options: self.options,
            state: Described {
                presentation: self.state.presentation,
                session: Some((self.state.session_id, self.state.session_timeout)),
                channels: self.state.channels,
                negotiated: Some(self.state.negotiated),
                mode: self.state.mode,
                keepalive_method: self.state.keepalive_method,
            },
        }
    }

    fn handle_keepalive_timer(&mut self, cx: &mut std::task::Context<'_>) -> Result<(), Error> {
        let conn_ctx = *self.conn.inner.ctx();
        // Expect the previous keepalive request to have finished.
        match self.state.keepalive_state {
            KeepaliveState::Flushing(cseq) => bail!(ErrorInt::RtspProtocolError {
                conn_ctx,
                description: format!(
                    "Unable to write keepalive {} within {:?}",
                    cseq, self.state.keepalive_period,
                ),
            }),
            KeepaliveState::Waiting(cseq) => bail!(ErrorInt::RtspProtocolError {
                conn_ctx,
                description: format!(
                    "Server failed to respond to keepalive {} within {:?}",
                    cseq, self.state.keepalive_period,
                ),
            }),
            KeepaliveState::Idle => {}
        }

        // Currently the only outbound data should be keepalives and receiver
        // reports, both small; the sink should be ready.
        if matches!(self.conn.inner.poll_ready_unpin(cx), Poll::Pending) {
            bail!(ErrorInt::RtspProtocolError {
                conn_ctx,
                description: "Unexpectedly not ready to send keepalive".into(),
            });
        }
        let mut req = rtsp_types::Request::builder(
            self.state.keepalive_method.clone(),
            rtsp_types::Version::V1_0,
        )
        .request_uri(self.state.presentation.base_url.clone())
        .header(rtsp_types::headers::SESSION, self.state.session_id.clone())
        .build(Bytes::new());
        let cseq = self.conn.fill_req(&self.options, &mut req)?;
        self.conn
            .inner
            .start_send_unpin(rtsp_types::Message::Request(req))
            .expect("encoding is infallible");
        self.state.keepalive_state = match self.conn.inner.poll_flush_unpin(cx) {
            Poll::Ready(Ok(())) => KeepaliveState::Waiting(cseq),
            Poll::Ready(Err(e)) => return Err(wrap!(e)),
            Poll::Pending => KeepaliveState::Flushing(cseq),
        };

        self.state
            .keepalive_timer
            .as_mut()
            .reset(tokio::time::Instant::now() + self.state.keepalive_period);
        Ok(())
    }

    /// Sends receiver reports for all playing streams, on the RTCP timer.
    fn handle_rtcp_timer(&mut self, cx: &mut std::task::Context<'_>) {
        let now = std::time::Instant::now();
        let Playing {
            presentation,
            channels,
            local_ssrc,
            rtcp_timer,
            ..
        } = &mut self.state;
        let mut interleaved = Vec::new();
        for (i, s) in presentation.streams.iter_mut().enumerate() {
            let rtcp_rx = match &mut s.state {
                StreamState::Playing { rtcp_rx, .. } => rtcp_rx,
                _ => continue,
            };
            let report = match rtcp_rx.serialize_report(*local_ssrc, now) {
                Some(r) => r,
                None => continue,
            };
            match &s.sockets {
                Some(sockets) => {
                    if let Some(peer_rtcp) = sockets.peer_rtcp {
                        // Non-blocking best effort; a dropped report is fine.
                        let _ = sockets.rtcp_socket.try_send_to(&report[..], peer_rtcp);
                    }
                }
                None => {
                    if let Some(c) = channels.channel_id_for_stream(i) {
                        interleaved.push(crate::conn::make_data_frame(c + 1, report));
                    }
                }
            }
        }
        if !interleaved.is_empty()
            && matches!(self.conn.inner.poll_ready_unpin(cx), Poll::Ready(Ok(())))
        {
            for msg in interleaved {
                if self.conn.inner.start_send_unpin(msg).is_err() {
                    break;
                }
            }
            let _ = self.conn.inner.poll_flush_unpin(cx);
        }
        rtcp_timer
            .as_mut()
            .reset(tokio::time::Instant::now() + crate::rtcp::sender::DEFAULT_SENDER_REPORT_INTERVAL);
    }

    fn handle_response(&mut self, response: rtsp_types::Response<Bytes>) -> Result<(), Error> {
        if matches!(self.state.keepalive_state,
                    KeepaliveState::Waiting(cseq) if parse::get_cseq(&response) == Some(cseq))
        {
            // We don't care if the keepalive response succeeds or fails; the
            // point was our request freshening the session timer.
            self.state.keepalive_state = KeepaliveState::Idle;
            return Ok(());
        }
        // The only response we expect in this state is to our keepalive
        // request.
        bail!(ErrorInt::RtspProtocolError {
            conn_ctx: *self.conn.inner.ctx(),
            description: format!("Unexpected RTSP response {:?}", response.status()),
        })
    }

    fn handle_data(
        &mut self,
        msg_ctx: crate::RtspMessageContext,
        data: rtsp_types::Data<Bytes>,
    ) -> Result<Option<PacketItem>, Error> {
        let c = data.channel_id();
        let conn_ctx = *self.conn.inner.ctx();
        let pkt_ctx = PacketContext::tcp(msg_ctx);
        let m = match self.state.channels.lookup(c) {
            Some(m) => m,
            None => bail!(ErrorInt::RtspUnassignedChannelError {
                conn_ctx,
                msg_ctx,
                channel_id: c,
                data: data.into_body(),
            }),
        };
        let body = data.into_body();
        if body.len() > MAX_TCP_PACKET_SIZE {
            self.options.warn(wrap!(ErrorInt::PacketError {
                conn_ctx,
                stream_ctx: StreamContext::tcp(c & !1),
                pkt_ctx,
                stream_id: m.stream_i,
                description: format!(
                    "interleaved packet of {} bytes exceeds maximum {}",
                    body.len(),
                    MAX_TCP_PACKET_SIZE
                ),
            }));
            return Ok(None);
        }
        process_ingress(
            &mut self.state.presentation.streams[m.stream_i],
            &self.options,
            &conn_ctx,
            pkt_ctx,
            m.stream_i,
            m.channel_type,
            body,
        )
    }

    /// Polls all UDP sockets of playing streams once.
    fn poll_udp(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Result<PacketItem, Error>>> {
        let conn_ctx = *self.conn.inner.ctx();
        let options = &self.options;
        let Playing {
            presentation,
            udp_buf,
            negotiated,
            ..
        } = &mut self.state;
        let negotiated = *negotiated;
        for i in 0..presentation.streams.len() {
            let (rtp_socket, rtcp_socket, peer_rtp, peer_rtcp) = {
                let s = &presentation.streams[i];
                if !matches!(s.state, StreamState::Playing { .. }) {
                    continue;
                }
                match &s.sockets {
                    Some(k) => (
                        k.rtp_socket.clone(),
                        k.rtcp_socket.clone(),
                        k.peer_rtp,
                        k.peer_rtcp,
                    ),
                    None => continue,
                }
            };
            for channel_type in [ChannelType::Rtp, ChannelType::Rtcp] {
                let (socket, expected) = match channel_type {
                    ChannelType::Rtp => (&rtp_socket, peer_rtp),
                    ChannelType::Rtcp => (&rtcp_socket, peer_rtcp),
                };
                let mut buf = tokio::io::ReadBuf::new(&mut udp_buf[..]);
                let src = match socket.poll_recv_from(cx, &mut buf) {
                    Poll::Pending => continue,
                    Poll::Ready(Err(e)) => {
                        return Poll::Ready(Some(Err(wrap!(ErrorInt::UdpRecvError {
                            conn_ctx,
                            stream_ctx: StreamContext::dummy(),
                            when: WallTime::now(),
                            source: e,
                        }))))
                    }
                    Poll::Ready(Ok(src)) => src,
                };
                if negotiated == Transport::Udp
                    && matches!(expected, Some(e) if e.ip() != src.ip())
                {
                    trace!("ignoring datagram from unexpected source {src}");
                    continue;
                }
                let len = buf.filled().len();
                if len > MAX_UDP_PACKET_SIZE {
                    options.warn(wrap!(ErrorInt::PacketError {
                        conn_ctx,
                        stream_ctx: StreamContext::dummy(),
                        pkt_ctx: PacketContext::udp(WallTime::now()),
                        stream_id: i,
                        description: "UDP packet too big to be read".into(),
                    }));
                    continue;
                }
                let body = Bytes::copy_from_slice(&buf.filled()[..len]);
                let pkt_ctx = PacketContext::udp(WallTime::now());
                match process_ingress(
                    &mut presentation.streams[i],
                    options,
                    &conn_ctx,
                    pkt_ctx,
                    i,
                    channel_type,
                    body,
                ) {
                    Ok(Some(item)) => return Poll::Ready(Some(Ok(item))),
                    Ok(None) => continue,
                    Err(e) => return Poll::Ready(Some(Err(e))),
                }
            }
        }
        Poll::Pending
    }
}

/// Routes one RTP or RTCP packet through a playing stream's state.
fn process_ingress(
    stream: &mut Stream,
    options: &SessionOptions,
    conn_ctx: &crate::ConnectionContext,
    pkt_ctx: PacketContext,
    stream_id: usize,
    channel_type: ChannelType,
    body: Bytes,
) -> Result<Option<PacketItem>, Error> {
    let StreamState::Playing {
        timeline,
        rtp_handler,
        rtcp_rx,
        ctx,
    } = &mut stream.state
    else {
        // Media arriving for a stream we didn't arm (eg after PAUSE raced
        // with in-flight packets); drop.
        return Ok(None);
    };
    match channel_type {
        ChannelType::Rtp => {
            // Zero-payload packets (firewall pinhole probes) and foreign
            // payload types must not reach the sequence tracker; their SSRCs
            // and sequence numbers are unrelated to the media stream's.
            if let Ok((raw, payload_range)) = crate::rtp::RawPacket::new(body.clone()) {
                if payload_range.is_empty() {
                    trace!("ignoring zero-payload RTP packet on stream {stream_id}");
                    return Ok(None);
                }
                if raw.payload_type() != stream.rtp_payload_type {
                    options.warn(wrap!(ErrorInt::PacketError {
                        conn_ctx: *conn_ctx,
                        stream_ctx: *ctx,
                        pkt_ctx,
                        stream_id,
                        description: format!(
                            "RTP packet with unexpected payload type {} (want {})",
                            raw.payload_type(),
                            stream.rtp_payload_type
                        ),
                    }));
                    return Ok(None);
                }
            }
            match rtp_handler.rtp(conn_ctx, ctx, pkt_ctx, timeline, stream_id, body) {
                Ok(PacketItem::Rtp(pkt)) => {
                    rtcp_rx.process_packet(
                        pkt.ssrc(),
                        pkt.sequence_number(),
                        pkt.timestamp().timestamp() as u32,
                        std::time::Instant::now(),
                    );
                    Ok(Some(PacketItem::Rtp(pkt)))
                }
                Ok(item) => Ok(Some(item)),
                Err(e) => Err(e),
            }
        }
        ChannelType::Rtcp => {
            match rtp_handler.rtcp(conn_ctx, ctx, pkt_ctx, timeline, stream_id, body) {
                Ok(Some(PacketItem::Rtcp(pkt))) => {
                    let now = std::time::Instant::now();
                    for p in pkt.pkts() {
                        if let Ok(Some(sr)) = p.as_sender_report() {
                            rtcp_rx.process_sender_report(&sr, now);
                        }
                    }
                    Ok(Some(PacketItem::Rtcp(pkt)))
                }
                Ok(item) => Ok(item),
                Err(e) => {
                    // A corrupt RTCP packet is a warning, not a fatal error.
                    options.warn(e);
                    Ok(None)
                }
            }
        }
    }
}

impl futures::Stream for Session<Playing> {
    type Item = Result<PacketItem, Error>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.state.buffered.pop_front() {
                return Poll::Ready(Some(Ok(item)));
            }

            // First try receiving data on the RTSP connection. Let this
            // starve keepalive handling; if we can't keep up, the server
            // should probably drop us.
            match Pin::new(&mut this.conn.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg.msg {
                    rtsp_types::Message::Data(data) => {
                        match this.handle_data(msg.ctx, data) {
                            Err(e) => return Poll::Ready(Some(Err(e))),
                            Ok(Some(pkt)) => return Poll::Ready(Some(Ok(pkt))),
                            Ok(None) => continue,
                        };
                    }
                    rtsp_types::Message::Response(response) => {
                        if let Err(e) = this.handle_response(response) {
                            return Poll::Ready(Some(Err(e)));
                        }
                        continue;
                    }
                    rtsp_types::Message::Request(request) => {
                        warn!(
                            "Received RTSP request in Playing state; ignoring. {:?}",
                            request.method()
                        );
                        continue;
                    }
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => {}
            }

            // Then UDP ingress.
            match this.poll_udp(cx) {
                Poll::Ready(r) => return Poll::Ready(r),
                Poll::Pending => {}
            }

            // Then check if it's time for a new keepalive.
            if matches!(this.state.keepalive_timer.as_mut().poll(cx), Poll::Ready(())) {
                if let Err(e) = this.handle_keepalive_timer(cx) {
                    return Poll::Ready(Some(Err(e)));
                }
            }

            // And for receiver reports.
            if matches!(this.state.rtcp_timer.as_mut().poll(cx), Poll::Ready(())) {
                this.handle_rtcp_timer(cx);
            }

            // Then finish flushing the current keepalive if necessary.
            if let KeepaliveState::Flushing(cseq) = this.state.keepalive_state {
                match this.conn.inner.poll_flush_unpin(cx) {
                    Poll::Ready(Ok(())) => {
                        this.state.keepalive_state = KeepaliveState::Waiting(cseq)
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(wrap!(e)))),
                    Poll::Pending => {}
                }
            }

            // Nothing to do. The poll calls above have already registered cx
            // as necessary.
            return Poll::Pending;
        }
    }
}

impl Session<Recording> {
    pub fn streams(&self) -> &[Stream] {
        &self.state.presentation.streams
    }

    /// Writes a serialized RTP packet to the given stream.
    ///
    /// The packet must be a complete, valid RTP packet whose payload type
    /// matches the stream's format; its size must fit the negotiated
    /// transport.
    pub async fn write_rtp(&mut self, stream_i: usize, pkt: Bytes) -> Result<(), Error> {
        self.drain_incoming()?;
        let max = match self.state.negotiated {
            Transport::Tcp => MAX_TCP_PACKET_SIZE,
            _ => MAX_UDP_PACKET_SIZE,
        };
        if pkt.len() > max {
            bail!(ErrorInt::InvalidArgument(format!(
                "packet of {} bytes exceeds maximum {max} for this transport",
                pkt.len()
            )));
        }
        let (raw, payload_range) = crate::rtp::RawPacket::new(pkt.clone())
            .map_err(|e| wrap!(ErrorInt::InvalidArgument(format!("bad RTP packet: {}", e.reason))))?;
        let (rtp_timestamp, payload_len) = (raw.timestamp(), payload_range.len());
        {
            let s = &mut self.state.presentation.streams[stream_i];
            let StreamState::Recording { rtcp_tx, .. } = &mut s.state else {
                bail!(ErrorInt::FailedPrecondition(format!(
                    "stream {stream_i} not set up for recording"
                )));
            };
            rtcp_tx.record_packet(rtp_timestamp, payload_len, std::time::Instant::now());
        }
        self.send_media(stream_i, MediaKind::Rtp, pkt).await?;
        self.maybe_send_sender_reports().await?;
        self.maybe_send_keepalive().await?;
        Ok(())
    }

    /// Writes a serialized RTCP compound packet to the given stream.
    pub async fn write_rtcp(&mut self, stream_i: usize, pkt: Bytes) -> Result<(), Error> {
        self.drain_incoming()?;
        self.send_media(stream_i, MediaKind::Rtcp, pkt).await
    }

    /// Tears down the session: signals the server and releases all sockets.
    pub async fn teardown(mut self) -> Result<(), Error> {
        teardown::teardown(
            &mut self.conn,
            &self.options,
            &self.state.presentation.base_url,
            &self.state.session_id,
            self.state.session_timeout,
        )
        .await
    }

    /// Handles any buffered incoming messages without blocking.
    fn drain_incoming(&mut self) -> Result<(), Error> {
        loop {
            let poll = futures::FutureExt::now_or_never(self.conn.inner.next_msg());
            match poll {
                None => return Ok(()),
                Some(None) => bail!(ErrorInt::RtspReadError {
                    conn_ctx: *self.conn.inner.ctx(),
                    msg_ctx: self.conn.inner.eof_ctx(),
                    source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "EOF"),
                }),
                Some(Some(Err(e))) => return Err(e),
                Some(Some(Ok(msg))) => match msg.msg {
                    rtsp_types::Message::Response(_) => {} // keepalive response.
                    rtsp_types::Message::Data(d) => {
                        let channel_id = d.channel_id();
                        trace!(
                            "ignoring {}-byte data message on channel {channel_id} while recording",
                            d.into_body().len()
                        );
                    }
                    rtsp_types::Message::Request(r) => {
                        debug!("ignoring {:?} request while recording", r.method());
                    }
                },
            }
        }
    }

    async fn send_media(
        &mut self,
        stream_i: usize,
        kind: MediaKind,
        pkt: Bytes,
    ) -> Result<(), Error> {
        let write_timeout = self.options.write_timeout_or_default();
        let s = &self.state.presentation.streams[stream_i];
        match &s.sockets {
            Some(sockets) => {
                let to = match kind {
                    MediaKind::Rtp => sockets.peer_rtp,
                    MediaKind::Rtcp => sockets.peer_rtcp,
                };
                let to = to.ok_or_else(|| {
                    wrap!(ErrorInt::FailedPrecondition("no peer address".into()))
                })?;
                let socket = match kind {
                    MediaKind::Rtp => &sockets.rtp_socket,
                    MediaKind::Rtcp => &sockets.rtcp_socket,
                };
                tokio::time::timeout(write_timeout, socket.send_to(&pkt[..], to))
                    .await
                    .map_err(|_| wrap!(ErrorInt::Timeout))?
                    .map_err(|e| wrap!(ErrorInt::UdpSendError(e)))?;
            }
            None => {
                let c = self
                    .state
                    .channels
                    .channel_id_for_stream(stream_i)
                    .ok_or_else(|| {
                        wrap!(ErrorInt::FailedPrecondition(
                            "stream has no interleaved channel".into()
                        ))
                    })?;
                let c = match kind {
                    MediaKind::Rtp => c,
                    MediaKind::Rtcp => c + 1,
                };
                tokio::time::timeout(
                    write_timeout,
                    self.conn.inner.send(crate::conn::make_data_frame(c, pkt)),
                )
                .await
                .map_err(|_| wrap!(ErrorInt::Timeout))??;
            }
        }
        Ok(())
    }

    /// Sends sender reports for all recording streams if the interval has
    /// elapsed.
    async fn maybe_send_sender_reports(&mut self) -> Result<(), Error> {
        let now = tokio::time::Instant::now();
        if now < self.state.next_sender_report {
            return Ok(());
        }
        self.state.next_sender_report =
            now + crate::rtcp::sender::DEFAULT_SENDER_REPORT_INTERVAL;
        let now_wall = crate::NtpTimestamp::try_from(chrono::Utc::now())
            .unwrap_or(crate::UNIX_EPOCH);
        for i in 0..self.state.presentation.streams.len() {
            let s = &mut self.state.presentation.streams[i];
            let StreamState::Recording { rtcp_tx, .. } = &mut s.state else {
                continue;
            };
            let Some(report) = rtcp_tx.serialize_report(std::time::Instant::now(), now_wall)
            else {
                continue;
            };
            self.send_media(i, MediaKind::Rtcp, report).await?;
        }
        Ok(())
    }

    /// Sends a keepalive request if the period has elapsed. The response is
    /// consumed by a later `drain_incoming`.
    async fn maybe_send_keepalive(&mut self) -> Result<(), Error> {
        let now = tokio::time::Instant::now();
        if now < self.state.next_keepalive {
            return Ok(());
        }
        self.state.next_keepalive = now + self.state.keepalive_period;
        let mut req = rtsp_types::Request::builder(
            self.state.keepalive_method.clone(),
            rtsp_types::Version::V1_0,
        )
        .request_uri(self.state.presentation.base_url.clone())
        .header(rtsp_types::headers::SESSION, self.state.session_id.clone())
        .build(Bytes::new());
        self.conn.fill_req(&self.options, &mut req)?;
        self.conn
            .inner
            .send(rtsp_types::Message::Request(req))
            .await?;
        Ok(())
    }
}

enum DemuxedState {
    Waiting,
    Pulling(usize),
}

/// Wrapper returned by [`Session<Playing>::demuxed`] which demuxes and
/// depacketizes into frames.
pub struct Demuxed {
    state: DemuxedState,
    session: Session<Playing>,
}

impl Demuxed {
    pub fn streams(&self) -> &[Stream] {
        self.session.streams()
    }

    /// Tears down the session; see [`Session<Playing>::teardown`].
    pub async fn teardown(self) -> Result<(), Error> {
        self.session.teardown().await
    }
}

impl futures::Stream for Demuxed {
    type Item = Result<CodecItem, Error>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let (stream_id, pkt) = match this.state {
                DemuxedState::Waiting => {
                    match futures::ready!(Pin::new(&mut this.session).poll_next(cx)) {
                        Some(Ok(PacketItem::Rtp(p))) => (p.stream_id(), Some(p)),
                        Some(Ok(PacketItem::Rtcp(p))) => {
                            return Poll::Ready(Some(Ok(CodecItem::Rtcp(p))))
                        }
                        Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                        None => return Poll::Ready(None),
                    }
                }
                DemuxedState::Pulling(stream_id) => (stream_id, None),
            };
            let depacketizer = match &mut this.session.state.presentation.streams[stream_id]
                .depacketizer
            {
                Ok(d) => d,
                Err(_) => unreachable!("demuxed() ensured the depacketizer was Ok"),
            };
            if let Some(p) = pkt {
                if let Err(description) = depacketizer.push(p) {
                    // Codec-level errors from a single packet are warnings;
                    // the packet is dropped and the session continues.
                    let conn_ctx = *this.session.conn.inner.ctx();
                    this.session.options.warn(wrap!(ErrorInt::PacketError {
                        conn_ctx,
                        stream_ctx: StreamContext::dummy(),
                        pkt_ctx: PacketContext::dummy(),
                        stream_id,
                        description,
                    }));
                    this.state = DemuxedState::Waiting;
                    continue;
                }
            }
            match depacketizer.pull() {
                Some(item) => {
                    this.state = DemuxedState::Pulling(stream_id);
                    return Poll::Ready(Some(Ok(item)));
                }
                None => {
                    this.state = DemuxedState::Waiting;
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsp_types::{Message, Method, StatusCode, Version};

    /// A minimal in-process server: accepts connections and answers
    /// OPTIONS/DESCRIBE/SETUP/PLAY/TEARDOWN for a single PCMU track. UDP
    /// `SETUP`s are accepted but no media is ever sent over UDP (the
    /// "server silently drops UDP" scenario); once the client is playing
    /// over TCP, one interleaved packet is sent.
    async fn run_fake_server(listener: tokio::net::TcpListener) {
        loop {
            let (sock, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let mut conn = match Connection::from_stream(sock) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let mut tcp_setup = false;
            while let Some(Ok(msg)) = conn.next_msg().await {
                let req = match msg.msg {
                    Message::Request(r) => r,
                    _ => continue,
                };
                let cseq = req
                    .header(&rtsp_types::headers::CSEQ)
                    .expect("fake server requires CSeq")
                    .as_str()
                    .to_owned();
                let respond = |status: StatusCode| {
                    rtsp_types::Response::builder(Version::V1_0, status)
                        .header(rtsp_types::headers::CSEQ, cseq.clone())
                        .build(Bytes::new())
                };
                match req.method() {
                    Method::Options => {
                        let mut r = respond(StatusCode::Ok);
                        r.insert_header(
                            rtsp_types::headers::PUBLIC,
                            "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER",
                        );
                        conn.send(Message::Response(r)).await.unwrap();
                    }
                    Method::Describe => {
                        let sdp = b"v=0\r\n\
                                    o=- 0 0 IN IP4 127.0.0.1\r\n\
                                    s=-\r\n\
                                    t=0 0\r\n\
                                    m=audio 0 RTP/AVP 0\r\n\
                                    a=control:trackID=0\r\n";
                        let r = rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok)
                            .header(rtsp_types::headers::CSEQ, cseq.clone())
                            .header(rtsp_types::headers::CONTENT_TYPE, "application/sdp")
                            .build(Bytes::from_static(sdp));
                        conn.send(Message::Response(r)).await.unwrap();
                    }
                    Method::Setup => {
                        let t = req
                            .header(&rtsp_types::headers::TRANSPORT)
                            .expect("SETUP has Transport")
                            .as_str();
                        let transport = if t.contains("TCP") {
                            tcp_setup = true;
                            "RTP/AVP/TCP;unicast;interleaved=0-1".to_owned()
                        } else {
                            "RTP/AVP;unicast;server_port=50000-50001".to_owned()
                        };
                        let mut r = respond(StatusCode::Ok);
                        r.insert_header(rtsp_types::headers::SESSION, "fake1234;timeout=60");
                        r.insert_header(rtsp_types::headers::TRANSPORT, transport);
                        conn.send(Message::Response(r)).await.unwrap();
                    }
                    Method::Play => {
                        let mut r = respond(StatusCode::Ok);
                        r.insert_header(rtsp_types::headers::SESSION, "fake1234");
                        conn.send(Message::Response(r)).await.unwrap();
                        if tcp_setup {
                            let pkt = crate::rtp::RawPacketBuilder {
                                sequence_number: 7,
                                timestamp: 0,
                                payload_type: 0,
                                ssrc: 0xabcd,
                                mark: true,
                            }
                            .build((0..160u32).map(|i| i as u8))
                            .unwrap()
                            .0
                             .0;
                            conn.send(crate::conn::make_data_frame(0, pkt)).await.unwrap();
                        }
                    }
                    Method::Teardown => {
                        tcp_setup = false;
                        let r = respond(StatusCode::Ok);
                        conn.send(Message::Response(r)).await.unwrap();
                    }
                    _ => {
                        let r = respond(StatusCode::Ok);
                        conn.send(Message::Response(r)).await.unwrap();
                    }
                }
            }
        }
    }

    /// The key UDP→TCP fallback heuristic: the first UDP `SETUP` succeeds,
    /// but `PLAY` yields no packets within the initial UDP read timeout, so
    /// the client tears down and retries all media on TCP.
    #[tokio::test(flavor = "multi_thread")]
    async fn udp_to_tcp_fallback() {
        crate::testutil::init_logging();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_fake_server(listener));

        let url = Url::parse(&format!("rtsp://{addr}/stream")).unwrap();
        let mut session = Session::describe(
            url,
            SessionOptions::default()
                .initial_udp_read_timeout(Duration::from_millis(250)),
        )
        .await
        .unwrap();
        assert_eq!(session.streams().len(), 1);
        session.setup(0).await.unwrap();
        // Negotiation prefers UDP first.
        assert_eq!(session.state.negotiated, Some(Transport::Udp));
        let mut playing = session.play(PlayOptions::default()).await.unwrap();
        // The fallback re-ran SETUP on TCP.
        assert_eq!(playing.state.negotiated, Transport::Tcp);
        match playing.next().await {
            Some(Ok(PacketItem::Rtp(p))) => {
                assert_eq!(p.sequence_number(), 7);
                assert_eq!(p.payload().len(), 160);
            }
            o => panic!("unexpected item: {o:?}"),
        }
    }

    /// A forced-TCP session doesn't wait for the fallback timer at all.
    #[tokio::test(flavor = "multi_thread")]
    async fn forced_tcp() {
        crate::testutil::init_logging();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_fake_server(listener));

        let url = Url::parse(&format!("rtsp://{addr}/stream")).unwrap();
        let mut session = Session::describe(
            url,
            SessionOptions::default().transport(Transport::Tcp),
        )
        .await
        .unwrap();
        session.setup(0).await.unwrap();
        let mut playing = session.play(PlayOptions::default()).await.unwrap();
        match playing.next().await {
            Some(Ok(PacketItem::Rtp(p))) => assert_eq!(p.sequence_number(), 7),
            o => panic!("unexpected item: {o:?}"),
        }
        playing.teardown().await.unwrap();
    }
}
