// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP response headers the client cares about: `DESCRIBE`
//! bodies, `Session`, `Transport`, and `RTP-Info`.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::sdp;

use super::{Presentation, Stream, StreamState, StreamStateInit};

/// The session timeout to assume when the server doesn't specify one, per
/// RFC 2326 section 12.37.
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if
/// missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| cseq.as_str().parse().ok())
}

/// Parses a successful RTSP `DESCRIBE` response into a [`Presentation`].
///
/// On error, returns a string which is expected to be packed into an
/// `RtspResponseError`.
pub(crate) fn parse_describe(
    request_url: Url,
    response: &rtsp_types::Response<Bytes>,
) -> Result<Presentation, String> {
    if !matches!(response.header(&rtsp_types::headers::CONTENT_TYPE),
                 Some(v) if v.as_str() == "application/sdp")
    {
        return Err("Describe response not of expected application/sdp content type".to_string());
    }

    let sdp_session = sdp_types::Session::parse(&response.body()[..])
        .map_err(|e| format!("Unable to parse SDP: {e}"))?;

    // Base URL rules of RFC 2326 appendix C.1.1: Content-Base, else
    // Content-Location, else the request URL.
    let base_url = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .map(|v| (rtsp_types::headers::CONTENT_BASE, v))
        .or_else(|| {
            response
                .header(&rtsp_types::headers::CONTENT_LOCATION)
                .map(|v| (rtsp_types::headers::CONTENT_LOCATION, v))
        })
        .map(|(h, v)| Url::parse(v.as_str()).map_err(|e| format!("bad {h} {v:?}: {e}")))
        .unwrap_or(Ok(request_url.clone()))?;

    let mut control = None;
    for a in &sdp_session.attributes {
        if a.attribute == "control" {
            control = a
                .value
                .as_deref()
                .map(|c| sdp::join_control(&base_url, c))
                .transpose()?;
            break;
        }
    }
    let control = control.unwrap_or(request_url);

    if sdp_session.medias.len() > crate::MAX_MEDIA_PER_SESSION {
        return Err(format!(
            "SDP has {} media descriptions; only {} supported",
            sdp_session.medias.len(),
            crate::MAX_MEDIA_PER_SESSION
        ));
    }
    let streams = sdp_session
        .medias
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let parsed = sdp::parse_media(m)
                .map_err(|e| format!("Unable to parse stream {i}: {e}\n\n{m:#?}"))?;
            Ok(Stream::from_parsed(parsed, &base_url)?)
        })
        .collect::<Result<Vec<Stream>, String>>()?;
    if streams.is_empty() {
        return Err("SDP has no media descriptions".into());
    }

    Ok(Presentation {
        streams,
        base_url,
        control,
    })
}

impl Stream {
    fn from_parsed(parsed: sdp::ParsedMedia, base_url: &Url) -> Result<Self, String> {
        let control = parsed
            .control
            .as_deref()
            .map(|c| sdp::join_control(base_url, c))
            .transpose()?;

        // Some buggy cameras expect the base URL to be interpreted as if it
        // had an implicit trailing slash. If `RTP-Info` matching fails, try
        // again with this URL.
        let alt_control = match (&control, parsed.control.as_deref()) {
            (Some(_), Some(c)) if !base_url.as_str().ends_with('/') => {
                let base_with_slash = format!("{}/", base_url.as_str());
                Url::parse(&base_with_slash)
                    .ok()
                    .and_then(|b| sdp::join_control(&b, c).ok())
            }
            _ => None,
        };
        Ok(Stream {
            media: parsed.media_type,
            encoding_name: parsed.encoding_name,
            rtp_payload_type: parsed.rtp_payload_type,
            clock_rate: parsed.clock_rate,
            channels: parsed.channels,
            format: parsed.format.clone(),
            depacketizer: crate::codec::Depacketizer::new(&parsed.format),
            control,
            alt_control,
            sockets: None,
            state: StreamState::Uninit,
        })
    }
}

/// The parameters of one alternative in a `Transport` header, per RFC 2326
/// section 12.39: `token(;param)*`.
#[derive(Debug, Default)]
pub(crate) struct ParsedTransport {
    pub is_multicast: bool,
    pub is_interleaved: bool,
    pub channel_id: Option<u8>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub destination: Option<IpAddr>,
    pub ssrc: Option<u32>,
    pub mode_record: bool,
    pub ttl: Option<u8>,
}

fn parse_port_pair(value: &str) -> Result<(u16, u16), String> {
    let (a, b) = match value.split_once('-') {
        Some((a, b)) => (a, Some(b)),
        None => (value, None),
    };
    let a: u16 = a.parse().map_err(|_| format!("bad port {value:?}"))?;
    let b = match b {
        Some(b) => b.parse().map_err(|_| format!("bad port {value:?}"))?,
        None => a + 1,
    };
    Ok((a, b))
}

/// Parses one `Transport` alternative.
pub(crate) fn parse_transport(value: &str) -> Result<ParsedTransport, String> {
    let mut parts = value.split(';');
    let spec = parts.next().ok_or("empty Transport header")?.trim();
    let mut t = ParsedTransport {
        is_interleaved: spec.eq_ignore_ascii_case("RTP/AVP/TCP"),
        ..Default::default()
    };
    if !spec.starts_with("RTP/AVP") {
        return Err(format!("unsupported transport spec {spec:?}"));
    }
    for p in parts {
        let p = p.trim();
        let (key, value) = match p.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (p, None),
        };
        match (key, value) {
            ("unicast", None) => {}
            ("multicast", None) => t.is_multicast = true,
            ("interleaved", Some(v)) => {
                let (a, b) = parse_port_pair(v)?;
                if b != a + 1 {
                    return Err(format!("non-adjacent interleaved channels {v:?}"));
                }
                t.channel_id = Some(
                    u8::try_from(a).map_err(|_| format!("interleaved channel {a} too large"))?,
                );
            }
            ("client_port", Some(v)) => t.client_port = Some(parse_port_pair(v)?),
            ("server_port", Some(v)) => t.server_port = Some(parse_port_pair(v)?),
            ("port", Some(v)) => t.server_port = Some(parse_port_pair(v)?),
            ("destination", Some(v)) => {
                t.destination =
                    Some(v.parse().map_err(|_| format!("bad destination {v:?}"))?)
            }
            ("ssrc", Some(v)) => {
                t.ssrc = Some(
                    u32::from_str_radix(v, 16).map_err(|_| format!("bad ssrc {v:?}"))?,
                )
            }
            ("ttl", Some(v)) => {
                t.ttl = Some(v.parse().map_err(|_| format!("bad ttl {v:?}"))?)
            }
            ("mode", Some(v)) => {
                let v = v.trim_matches('"');
                t.mode_record = v.eq_ignore_ascii_case("record");
            }
            _ => {} // Ignore unknown parameters, as RFC 2326 requires.
        }
    }
    Ok(t)
}

#[derive(Debug)]
pub(crate) struct SetupResponse {
    pub session_id: String,
    pub session_timeout: Duration,
    pub transport: ParsedTransport,
}

/// Parses the `Session:` header value into an id and timeout.
pub(crate) fn parse_session_header(value: &str) -> Result<(String, Duration), String> {
    let mut parts = value.split(';');
    let session_id = parts
        .next()
        .ok_or("empty Session header")?
        .trim()
        .to_owned();
    if session_id.is_empty() {
        return Err("empty session id".into());
    }
    let mut timeout = DEFAULT_SESSION_TIMEOUT;
    for p in parts {
        let p = p.trim();
        if let Some(v) = p.strip_prefix("timeout=") {
            let secs: u64 = v.parse().map_err(|_| format!("bad timeout {v:?}"))?;
            timeout = Duration::from_secs(secs);
        }
    }
    Ok((session_id, timeout))
}

/// Parses a `SETUP` response.
pub(crate) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse, String> {
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or("SETUP response with no Session header")?;
    let (session_id, session_timeout) = parse_session_header(session.as_str())?;
    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or("SETUP response with no Transport header")?;
    let transport = parse_transport(transport.as_str())?;
    Ok(SetupResponse {
        session_id,
        session_timeout,
        transport,
    })
}

/// Parses a `PLAY` response's `RTP-Info` header, filling in each matched
/// stream's initial sequence number and RTP timestamp.
///
/// RFC 2326 section 12.33. The header is optional; unmatched streams keep
/// `None` values.
pub(crate) fn parse_play(
    response: &rtsp_types::Response<Bytes>,
    presentation: &mut Presentation,
) -> Result<(), String> {
    let rtp_info = match response.header(&rtsp_types::headers::RTP_INFO) {
        None => return Ok(()),
        Some(v) => v,
    };
    for stream_info in rtp_info.as_str().split(',') {
        let stream_info = stream_info.trim();
        let mut url = None;
        let mut seq = None;
        let mut rtptime = None;
        for p in stream_info.split(';') {
            let (key, value) = p
                .split_once('=')
                .ok_or_else(|| format!("bad RTP-Info parameter {p:?}"))?;
            match key {
                "url" => url = Some(value),
                "seq" => {
                    seq = Some(
                        value
                            .parse::<u16>()
                            .map_err(|_| format!("bad seq {value:?}"))?,
                    )
                }
                "rtptime" => {
                    rtptime = Some(
                        value
                            .parse::<u32>()
                            .map_err(|_| format!("bad rtptime {value:?}"))?,
                    )
                }
                _ => {}
            }
        }
        let url = url.ok_or("RTP-Info stream with no url")?;
        let stream = presentation.streams.iter_mut().find(|s| {
            s.control.as_ref().map(Url::as_str) == Some(url)
                || s.alt_control.as_ref().map(Url::as_str) == Some(url)
                || s.control
                    .as_ref()
                    .map(|c| c.as_str().ends_with(url))
                    .unwrap_or(false)
        });
        let stream = match stream {
            Some(s) => s,
            None => {
                // Some servers name streams the client didn't set up, or use
                // URLs that match nothing; ignore rather than failing the
                // whole PLAY.
                log::debug!("RTP-Info url {url} matches no stream");
                continue;
            }
        };
        if let StreamState::Init(state) = &mut stream.state {
            state.initial_seq = seq;
            state.initial_rtptime = rtptime;
        }
    }
    Ok(())
}

impl StreamStateInit {
    pub(super) fn new(ssrc: Option<u32>) -> Self {
        Self {
            ssrc,
            initial_seq: None,
            initial_rtptime: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::response;

    #[test]
    fn setup_udp() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 2\r\n\
              Session: 1234abcd;timeout=30\r\n\
              Transport: RTP/AVP;unicast;client_port=40000-40001;server_port=50000-50001;ssrc=4D2F80A1\r\n\
              \r\n",
        );
        let s = parse_setup(&r).unwrap();
        assert_eq!(s.session_id, "1234abcd");
        assert_eq!(s.session_timeout, Duration::from_secs(30));
        assert!(!s.transport.is_interleaved);
        assert_eq!(s.transport.client_port, Some((40000, 40001)));
        assert_eq!(s.transport.server_port, Some((50000, 50001)));
        assert_eq!(s.transport.ssrc, Some(0x4D2F_80A1));
    }

    #[test]
    fn setup_tcp() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 2\r\n\
              Session: ABC\r\n\
              Transport: RTP/AVP/TCP;unicast;interleaved=4-5\r\n\
              \r\n",
        );
        let s = parse_setup(&r).unwrap();
        assert_eq!(s.session_timeout, DEFAULT_SESSION_TIMEOUT);
        assert!(s.transport.is_interleaved);
        assert_eq!(s.transport.channel_id, Some(4));
    }

    #[test]
    fn setup_multicast() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 2\r\n\
              Session: ABC\r\n\
              Transport: RTP/AVP;multicast;destination=239.0.0.1;port=5000-5001;ttl=16\r\n\
              \r\n",
        );
        let s = parse_setup(&r).unwrap();
        assert!(s.transport.is_multicast);
        assert_eq!(
            s.transport.destination,
            Some("239.0.0.1".parse::<IpAddr>().unwrap())
        );
        assert_eq!(s.transport.server_port, Some((5000, 5001)));
        assert_eq!(s.transport.ttl, Some(16));
    }

    #[test]
    fn transport_rejects_garbage() {
        parse_transport("HTTP/1.1;unicast").unwrap_err();
        parse_transport("RTP/AVP;client_port=nope").unwrap_err();
    }

    #[test]
    fn describe_with_content_base() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 2\r\n\
              Content-Type: application/sdp\r\n\
              Content-Base: rtsp://example.com/stream/\r\n\
              Content-Length: 189\r\n\
              \r\n\
              v=0\r\n\
              o=- 0 0 IN IP4 127.0.0.1\r\n\
              s=Stream\r\n\
              t=0 0\r\n\
              m=video 0 RTP/AVP 96\r\n\
              a=control:trackID=0\r\n\
              a=rtpmap:96 H264/90000\r\n\
              a=fmtp:96 packetization-mode=1\r\n\
              m=audio 0 RTP/AVP 0\r\n\
              a=control:trackID=1\r\n",
        );
        let p = parse_describe(Url::parse("rtsp://example.com/stream").unwrap(), &r).unwrap();
        assert_eq!(p.base_url.as_str(), "rtsp://example.com/stream/");
        assert_eq!(p.streams.len(), 2);
        assert_eq!(
            p.streams[0].control.as_ref().unwrap().as_str(),
            "rtsp://example.com/stream/trackID=0"
        );
        assert_eq!(p.streams[0].media, "video");
        assert_eq!(p.streams[0].encoding_name, "h264");
        assert_eq!(p.streams[1].media, "audio");
        assert_eq!(p.streams[1].rtp_payload_type, 0);
    }

    #[test]
    fn play_rtp_info() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 4\r\n\
              Session: ABC\r\n\
              RTP-Info: url=rtsp://example.com/stream/trackID=0;seq=9921;rtptime=3450012\r\n\
              \r\n",
        );
        let describe = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 2\r\n\
              Content-Type: application/sdp\r\n\
              Content-Base: rtsp://example.com/stream/\r\n\
              Content-Length: 115\r\n\
              \r\n\
              v=0\r\n\
              o=- 0 0 IN IP4 127.0.0.1\r\n\
              s=Stream\r\n\
              t=0 0\r\n\
              m=video 0 RTP/AVP 96\r\n\
              a=control:trackID=0\r\n\
              a=rtpmap:96 H264/90000\r\n",
        );
        let mut p =
            parse_describe(Url::parse("rtsp://example.com/stream").unwrap(), &describe).unwrap();
        p.streams[0].state = StreamState::Init(StreamStateInit::new(None));
        parse_play(&r, &mut p).unwrap();
        match &p.streams[0].state {
            StreamState::Init(s) => {
                assert_eq!(s.initial_seq, Some(9921));
                assert_eq!(s.initial_rtptime, Some(3450012));
            }
            o => panic!("unexpected state {o:?}"),
        }
    }
}
