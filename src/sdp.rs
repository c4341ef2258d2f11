// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SDP glue ([RFC 4566](https://datatracker.ietf.org/doc/html/rfc4566)):
//! interpreting media descriptions from `DESCRIBE`/`ANNOUNCE` bodies and
//! marshalling them for the reverse directions.
//!
//! The `a=rtpmap:` and `a=fmtp:` attributes are the format discriminators;
//! `a=control:` carries the track URL.

use std::net::IpAddr;
use std::num::NonZeroU16;

use url::Url;

use crate::format::Format;

/// One SDP media description: a medium of a presentation, with its format(s).
///
/// A presentation holds `1..=64` media; all media of one session share a
/// transport kind once `SETUP` completes.
#[derive(Clone, Debug)]
pub struct Media {
    /// The media type: `video`, `audio`, or `application`.
    pub media_type: String,

    /// The `a=control:` attribute value, if any. May be absolute or relative;
    /// relative values are resolved against the session-level base URL.
    pub control: Option<String>,

    /// The formats offered, in preference order. At least one.
    pub formats: Vec<Format>,
}

impl Media {
    pub fn new(media_type: &str, format: Format) -> Self {
        Self {
            media_type: media_type.to_owned(),
            control: None,
            formats: vec![format],
        }
    }

    /// Returns the format matching the given RTP payload type, if any.
    pub fn format_for_payload_type(&self, payload_type: u8) -> Option<&Format> {
        self.formats
            .iter()
            .find(|f| f.payload_type() == payload_type)
    }
}

/// A static payload type in the [RTP parameters
/// registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1).
/// The registry is officially closed, so this list should never change.
/// `(media, encoding, clock_rate, channels)`.
pub(crate) fn static_payload_type(
    payload_type: u8,
) -> Option<(&'static str, &'static str, u32, Option<NonZeroU16>)> {
    let one = NonZeroU16::new(1);
    let two = NonZeroU16::new(2);
    Some(match payload_type {
        0 => ("audio", "pcmu", 8_000, one),
        3 => ("audio", "gsm", 8_000, one),
        4 => ("audio", "g723", 8_000, one),
        5 => ("audio", "dvi4", 8_000, one),
        6 => ("audio", "dvi4", 16_000, one),
        7 => ("audio", "lpc", 8_000, one),
        8 => ("audio", "pcma", 8_000, one),
        9 => ("audio", "g722", 8_000, one),
        10 => ("audio", "l16", 44_100, two),
        11 => ("audio", "l16", 44_100, one),
        12 => ("audio", "qcelp", 8_000, one),
        13 => ("audio", "cn", 8_000, one),
        14 => ("audio", "mpa", 90_000, None),
        15 => ("audio", "g728", 8_000, one),
        16 => ("audio", "dvi4", 11_025, one),
        17 => ("audio", "dvi4", 22_050, one),
        18 => ("audio", "g729", 8_000, one),
        25 => ("video", "celb", 90_000, None),
        26 => ("video", "jpeg", 90_000, None),
        28 => ("video", "nv", 90_000, None),
        31 => ("video", "h261", 90_000, None),
        32 => ("video", "mpv", 90_000, None),
        33 => ("video", "mp2t", 90_000, None),
        34 => ("video", "h263", 90_000, None),
        _ => return None,
    })
}

/// The interesting fields of one parsed SDP media description.
pub(crate) struct ParsedMedia {
    pub media_type: String,
    pub encoding_name: String,
    pub rtp_payload_type: u8,
    pub clock_rate: u32,
    pub channels: Option<NonZeroU16>,
    pub fmtp: Option<String>,

    /// The raw `a=control:` value, unresolved.
    pub control: Option<String>,
    pub format: Format,
}

/// Parses a [`sdp_types::Media`] into its format and attributes.
///
/// On failure, returns an error which is expected to be supplemented with
/// the media description debug string by the caller.
pub(crate) fn parse_media(media_description: &sdp_types::Media) -> Result<ParsedMedia, String> {
    let media_type = media_description.media.clone();

    // https://tools.ietf.org/html/rfc8866#section-5.14 says "If the <proto>
    // sub-field is "RTP/AVP" or "RTP/SAVP" the <fmt> sub-fields contain RTP
    // payload type numbers." Several other variants exist, such as
    // "TCP/RTP/AVP"; looking for a "RTP" component seems appropriate.
    if !media_description.proto.starts_with("RTP/") && !media_description.proto.contains("/RTP/") {
        return Err("Expected RTP-based proto".into());
    }

    // RFC 8866: "When a list of payload type numbers is given, this implies
    // that all of these payload formats MAY be used in the session, but the
    // first of these formats SHOULD be used as the default format for the
    // session." Just use the first until we find a stream where this isn't
    // the right thing to do.
    let rtp_payload_type_str = media_description
        .fmt
        .split_ascii_whitespace()
        .next()
        .unwrap_or("");
    let rtp_payload_type: u8 = rtp_payload_type_str
        .parse()
        .map_err(|_| format!("invalid RTP payload type {rtp_payload_type_str:?}"))?;
    if (rtp_payload_type & 0x80) != 0 {
        return Err(format!("invalid RTP payload type {rtp_payload_type}"));
    }

    let mut rtpmap = None;
    let mut fmtp = None;
    let mut control = None;
    for a in &media_description.attributes {
        if a.attribute == "rtpmap" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "rtpmap attribute with no value".to_string())?;
            // rtpmap-value = payload-type SP encoding-name
            //   "/" clock-rate [ "/" encoding-params ]
            let (rtpmap_payload_type, v) = v
                .split_once(' ')
                .ok_or_else(|| "invalid rtpmap attribute".to_string())?;
            if rtpmap_payload_type == rtp_payload_type_str {
                rtpmap = Some(v);
            }
        } else if a.attribute == "fmtp" {
            // Similarly starts with payload-type SP.
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "fmtp attribute with no value".to_string())?;
            let (fmtp_payload_type, v) = v
                .split_once(' ')
                .ok_or_else(|| "invalid fmtp attribute".to_string())?;
            if fmtp_payload_type == rtp_payload_type_str {
                fmtp = Some(v.to_owned());
            }
        } else if a.attribute == "control" {
            control = a.value.clone();
        }
    }

    let encoding_name;
    let clock_rate;
    let channels;
    match rtpmap {
        Some(rtpmap) => {
            let (e, rtpmap) = rtpmap
                .split_once('/')
                .ok_or_else(|| "invalid rtpmap attribute".to_string())?;
            encoding_name = e.to_owned();
            let (clock_rate_str, channels_str) = match rtpmap.find('/') {
                None => (rtpmap, None),
                Some(i) => (&rtpmap[..i], Some(&rtpmap[i + 1..])),
            };
            clock_rate = clock_rate_str
                .parse()
                .map_err(|_| "bad clockrate in rtpmap".to_string())?;
            channels = channels_str
                .map(|c| {
                    c.parse::<u16>()
                        .ok()
                        .and_then(NonZeroU16::new)
                        .ok_or_else(|| format!("Invalid channels specification {c:?}"))
                })
                .transpose()?;
        }
        None => {
            let (m, e, c, ch) = static_payload_type(rtp_payload_type).ok_or_else(|| {
                format!(
                    "Expected rtpmap parameter or assigned static payload type (got {rtp_payload_type})"
                )
            })?;
            if m != media_type {
                return Err(format!(
                    "SDP media type {media_type} must match static RTP payload type {rtp_payload_type}"
                ));
            }
            encoding_name = e.to_owned();
            clock_rate = c;
            channels = ch;
        }
    }

    let encoding_name = encoding_name.to_ascii_lowercase();
    let format = Format::from_sdp(
        &media_type,
        rtp_payload_type,
        &encoding_name,
        clock_rate,
        channels,
        fmtp.as_deref(),
    )
    .unwrap_or_else(|e| {
        // A recognized encoding with bad parameters still describes a stream
        // the caller may want to set up; fall back to passthrough.
        log::info!("treating {media_type}/{encoding_name} as generic: {e}");
        Format::from_sdp("", rtp_payload_type, "", clock_rate, channels, fmtp.as_deref())
            .expect("generic format is infallible")
    });

    Ok(ParsedMedia {
        media_type,
        encoding_name,
        rtp_payload_type,
        clock_rate,
        channels,
        fmtp,
        control,
        format,
    })
}

/// Parses an SDP session description (eg an `ANNOUNCE` body) into [`Media`]
/// entries.
pub(crate) fn parse_medias(body: &[u8]) -> Result<Vec<Media>, String> {
    let sdp = sdp_types::Session::parse(body).map_err(|e| format!("Unable to parse SDP: {e}"))?;
    if sdp.medias.is_empty() {
        return Err("SDP has no media descriptions".into());
    }
    if sdp.medias.len() > crate::MAX_MEDIA_PER_SESSION {
        return Err(format!(
            "SDP has {} media descriptions; only {} supported",
            sdp.medias.len(),
            crate::MAX_MEDIA_PER_SESSION
        ));
    }
    sdp.medias
        .iter()
        .map(|m| {
            let parsed = parse_media(m).map_err(|e| format!("bad media description: {e}"))?;
            Ok(Media {
                media_type: parsed.media_type,
                control: parsed.control,
                formats: vec![parsed.format],
            })
        })
        .collect()
}

/// Marshals a session description for a `DESCRIBE` response or an `ANNOUNCE`
/// request.
///
/// Each media gets a `a=control:trackID=<i>` attribute; ports are zero
/// because transport parameters are negotiated by `SETUP`, not SDP.
pub(crate) fn marshal(medias: &[Media], origin_ip: IpAddr, session_name: &str) -> String {
    use std::fmt::Write;
    let (addr_type, addr) = match origin_ip {
        IpAddr::V4(a) => ("IP4", a.to_string()),
        IpAddr::V6(a) => ("IP6", a.to_string()),
    };
    let mut out = String::new();
    let _ = write!(
        &mut out,
        "v=0\r\n\
         o=- 0 0 IN {addr_type} {addr}\r\n\
         s={session_name}\r\n\
         c=IN {addr_type} {addr}\r\n\
         t=0 0\r\n"
    );
    for (i, media) in medias.iter().enumerate() {
        let mut fmt_list = String::new();
        for f in &media.formats {
            if !fmt_list.is_empty() {
                fmt_list.push(' ');
            }
            let _ = write!(&mut fmt_list, "{}", f.payload_type());
        }
        let _ = write!(
            &mut out,
            "m={} 0 RTP/AVP {}\r\n\
             a=control:trackID={}\r\n",
            media.media_type, fmt_list, i
        );
        for f in &media.formats {
            let _ = write!(&mut out, "a=rtpmap:{} {}\r\n", f.payload_type(), f.rtpmap());
            if let Some(fmtp) = f.fmtp() {
                let _ = write!(&mut out, "a=fmtp:{} {}\r\n", f.payload_type(), fmtp);
            }
        }
    }
    out
}

/// Joins a base URL with a control attribute value, per RFC 2326 section
/// 19.1: the control may be absolute or relative; relative is resolved
/// against the session-level base.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }

    // Not an absolute URL; treat as relative. `Url::join` doesn't work as
    // some servers expect here, so simply concatenate, ensuring a single
    // slash between the base and the control.
    Url::parse(&format!(
        "{}{}{}",
        base_url.as_str(),
        if base_url.as_str().ends_with('/') {
            ""
        } else {
            "/"
        },
        control
    ))
    .map_err(|e| format!("unable to join base url {base_url} with control url {control:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    fn h264_media() -> Media {
        Media::new(
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
        )
    }

    #[test]
    fn marshal_and_reparse() {
        let medias = vec![
            h264_media(),
            Media::new(
                "audio",
                Format::from_sdp("audio", 0, "pcmu", 8_000, NonZeroU16::new(1), None).unwrap(),
            ),
        ];
        let sdp = marshal(&medias, IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), "Stream");
        let parsed = parse_medias(sdp.as_bytes()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].media_type, "video");
        assert_eq!(parsed[0].control.as_deref(), Some("trackID=0"));
        match &parsed[0].formats[0] {
            Format::H264(f) => assert!(f.sps().is_some() && f.pps().is_some()),
            o => panic!("unexpected format {o:?}"),
        }
        assert_eq!(parsed[1].media_type, "audio");
        assert_eq!(parsed[1].control.as_deref(), Some("trackID=1"));
        assert!(matches!(parsed[1].formats[0], Format::G711(_)));
    }

    #[test]
    fn join_control_variants() {
        let base = Url::parse("rtsp://example.com/stream").unwrap();
        assert_eq!(join_control(&base, "*").unwrap().as_str(), base.as_str());
        assert_eq!(
            join_control(&base, "trackID=1").unwrap().as_str(),
            "rtsp://example.com/stream/trackID=1"
        );
        assert_eq!(
            join_control(&base, "rtsp://other.com/foo").unwrap().as_str(),
            "rtsp://other.com/foo"
        );
        let base_slash = Url::parse("rtsp://example.com/stream/").unwrap();
        assert_eq!(
            join_control(&base_slash, "trackID=1").unwrap().as_str(),
            "rtsp://example.com/stream/trackID=1"
        );
    }

    #[test]
    fn static_type_without_rtpmap() {
        let sdp = b"v=0\r\n\
                    o=- 0 0 IN IP4 127.0.0.1\r\n\
                    s=-\r\n\
                    t=0 0\r\n\
                    m=audio 0 RTP/AVP 8\r\n\
                    a=control:trackID=0\r\n";
        let medias = parse_medias(&sdp[..]).unwrap();
        assert_eq!(medias.len(), 1);
        match &medias[0].formats[0] {
            Format::G711(_) => {}
            o => panic!("unexpected format {o:?}"),
        }
        assert_eq!(medias[0].formats[0].payload_type(), 8);
    }

    #[test]
    fn rejects_non_rtp_proto() {
        let sdp = b"v=0\r\n\
                    o=- 0 0 IN IP4 127.0.0.1\r\n\
                    s=-\r\n\
                    t=0 0\r\n\
                    m=application 9 TCP/TLS 5\r\n";
        parse_medias(&sdp[..]).unwrap_err();
    }
}
