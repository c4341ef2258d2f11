// Copyright (C) 2023 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The format registry: one variant per supported codec.
//!
//! A [`Format`] is the bridge between SDP and the media plane: it is parsed
//! from an `a=rtpmap:`/`a=fmtp:` attribute pair, can marshal itself back into
//! those attributes, and constructs the codec's depacketizer and packetizer.
//!
//! Dispatch is by enum variant rather than trait object: the method set is
//! small and closed, and matching makes the codec-specific quirks (eg H.264's
//! IDR detection) easy to audit in one place.

use std::num::NonZeroU16;

use bytes::Bytes;

use crate::codec::mpeg4_audio::Mpeg4AudioConfig;

/// A media format, identified in SDP by its rtpmap encoding name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Format {
    H264(H264),
    H265(H265),
    Vp8(Vp8),
    Vp9(Vp9),
    Mpeg4Audio(Mpeg4Audio),
    Mpeg4AudioLatm(Mpeg4AudioLatm),
    Opus(Opus),
    G711(G711),
    G722(G722),
    Jpeg(Jpeg),

    /// A format this library doesn't interpret; the raw rtpmap and fmtp
    /// values are retained so the stream can still be set up and its packets
    /// passed through.
    Generic(Generic),
}

impl Format {
    /// Creates a format from SDP media description fields.
    ///
    /// Unknown encodings become [`Format::Generic`]; a recognized encoding
    /// with malformed parameters is an error.
    pub fn from_sdp(
        media: &str,
        payload_type: u8,
        encoding_name: &str,
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        fmtp: Option<&str>,
    ) -> Result<Self, String> {
        Ok(match (media, encoding_name) {
            ("video", "h264") => {
                if clock_rate != 90_000 {
                    return Err("H.264 clock rate must always be 90000".into());
                }
                Format::H264(H264::from_fmtp(payload_type, fmtp)?)
            }
            ("video", "h265") => {
                if clock_rate != 90_000 {
                    return Err("H.265 clock rate must always be 90000".into());
                }
                Format::H265(H265::from_fmtp(payload_type, fmtp)?)
            }
            ("video", "vp8") => Format::Vp8(Vp8::from_fmtp(payload_type, fmtp)?),
            ("video", "vp9") => Format::Vp9(Vp9::from_fmtp(payload_type, fmtp)?),
            ("audio", "mpeg4-generic") => {
                Format::Mpeg4Audio(Mpeg4Audio::from_fmtp(payload_type, fmtp)?)
            }
            ("audio", "mp4a-latm") => {
                Format::Mpeg4AudioLatm(Mpeg4AudioLatm::from_fmtp(payload_type, fmtp)?)
            }
            ("audio", "opus") => Format::Opus(Opus {
                payload_type,
                channels: channels.map(NonZeroU16::get).unwrap_or(2),
            }),
            ("audio", "pcmu") => Format::G711(G711 {
                payload_type,
                mulaw: true,
            }),
            ("audio", "pcma") => Format::G711(G711 {
                payload_type,
                mulaw: false,
            }),
            ("audio", "g722") => Format::G722(G722 { payload_type }),
            ("video" | "image", "jpeg") => Format::Jpeg(Jpeg { payload_type }),
            (_, _) => Format::Generic(Generic {
                media: media.to_owned(),
                payload_type,
                encoding_name: encoding_name.to_owned(),
                clock_rate,
                channels,
                fmtp: fmtp.map(str::to_owned),
            }),
        })
    }

    /// Returns the RTP payload type.
    pub fn payload_type(&self) -> u8 {
        match self {
            Format::H264(f) => f.payload_type,
            Format::H265(f) => f.payload_type,
            Format::Vp8(f) => f.payload_type,
            Format::Vp9(f) => f.payload_type,
            Format::Mpeg4Audio(f) => f.payload_type,
            Format::Mpeg4AudioLatm(f) => f.payload_type,
            Format::Opus(f) => f.payload_type,
            Format::G711(f) => f.payload_type,
            Format::G722(f) => f.payload_type,
            Format::Jpeg(f) => f.payload_type,
            Format::Generic(f) => f.payload_type,
        }
    }

    /// Returns the RTP clock rate, in Hz.
    pub fn clock_rate(&self) -> u32 {
        match self {
            Format::H264(_) | Format::H265(_) | Format::Vp8(_) | Format::Vp9(_) => 90_000,
            Format::Mpeg4Audio(f) => f.config.sampling_frequency,
            Format::Mpeg4AudioLatm(f) => f.config.sampling_frequency,
            Format::Opus(_) => 48_000,

            // G.722 is a special case: RFC 3551 section 4.5.2 specifies an
            // (erroneous, retained for compatibility) 8,000 Hz RTP clock even
            // though the audio is sampled at 16 kHz.
            Format::G711(_) | Format::G722(_) => 8_000,
            Format::Jpeg(_) => 90_000,
            Format::Generic(f) => f.clock_rate,
        }
    }

    /// Returns the number of audio channels, if applicable.
    pub fn channels(&self) -> Option<NonZeroU16> {
        match self {
            Format::Mpeg4Audio(f) => NonZeroU16::new(u16::from(f.config.channels)),
            Format::Mpeg4AudioLatm(f) => NonZeroU16::new(u16::from(f.config.channels)),
            Format::Opus(f) => NonZeroU16::new(f.channels),
            Format::G711(_) | Format::G722(_) => NonZeroU16::new(1),
            Format::Generic(f) => f.channels,
            _ => None,
        }
    }

    /// Returns the encoding name as it appears in `a=rtpmap:`.
    pub fn encoding_name(&self) -> &str {
        match self {
            Format::H264(_) => "H264",
            Format::H265(_) => "H265",
            Format::Vp8(_) => "VP8",
            Format::Vp9(_) => "VP9",
            Format::Mpeg4Audio(_) => "mpeg4-generic",
            Format::Mpeg4AudioLatm(_) => "MP4A-LATM",
            Format::Opus(_) => "opus",
            Format::G711(G711 { mulaw: true, .. }) => "PCMU",
            Format::G711(G711 { mulaw: false, .. }) => "PCMA",
            Format::G722(_) => "G722",
            Format::Jpeg(_) => "JPEG",
            Format::Generic(f) => &f.encoding_name,
        }
    }

    /// Marshals the `a=rtpmap:` attribute value (without the payload type).
    pub fn rtpmap(&self) -> String {
        let mut s = format!("{}/{}", self.encoding_name(), self.clock_rate());
        if let Some(channels) = self.channels() {
            s.push('/');
            s.push_str(&channels.to_string());
        }
        s
    }

    /// Marshals the `a=fmtp:` attribute value (without the payload type), if
    /// the format has parameters.
    pub fn fmtp(&self) -> Option<String> {
        match self {
            Format::H264(f) => {
                let mut s = format!("packetization-mode={}", f.packetization_mode);
                if let (Some(sps), Some(pps)) = (&f.sps, &f.pps) {
                    s.push_str("; sprop-parameter-sets=");
                    s.push_str(&base64::encode(sps));
                    s.push(',');
                    s.push_str(&base64::encode(pps));
                    if sps.len() >= 4 {
                        s.push_str(&format!(
                            "; profile-level-id={:02X}{:02X}{:02X}",
                            sps[1], sps[2], sps[3]
                        ));
                    }
                }
                Some(s)
            }
            Format::H265(f) => {
                let mut s = String::new();
                for (name, val) in [
                    ("sprop-vps", &f.vps),
                    ("sprop-sps", &f.sps),
                    ("sprop-pps", &f.pps),
                ] {
                    if let Some(val) = val {
                        if !s.is_empty() {
                            s.push_str("; ");
                        }
                        s.push_str(name);
                        s.push('=');
                        s.push_str(&base64::encode(val));
                    }
                }
                (!s.is_empty()).then_some(s)
            }
            Format::Vp8(f) => {
                let mut s = String::new();
                if let Some(fr) = f.max_fr {
                    s.push_str(&format!("max-fr={fr}"));
                }
                if let Some(fs) = f.max_fs {
                    if !s.is_empty() {
                        s.push_str("; ");
                    }
                    s.push_str(&format!("max-fs={fs}"));
                }
                (!s.is_empty()).then_some(s)
            }
            Format::Vp9(f) => f
                .profile_id
                .map(|p| format!("profile-id={p}")),
            Format::Mpeg4Audio(f) => Some(format!(
                "profile-level-id=1; mode=AAC-hbr; sizelength={}; indexlength={}; indexdeltalength={}; config={}",
                f.size_length,
                f.index_length,
                f.index_delta_length,
                encode_hex(f.config.raw())
            )),
            Format::Mpeg4AudioLatm(f) => Some(format!(
                "profile-level-id={}; object=2; cpresent=0; config={}",
                f.profile_level_id,
                encode_hex(&f.config_raw)
            )),
            Format::Opus(f) => Some(format!(
                "sprop-stereo={}",
                if f.channels == 2 { 1 } else { 0 }
            )),
            Format::G711(_) | Format::G722(_) | Format::Jpeg(_) => None,
            Format::Generic(f) => f.fmtp.clone(),
        }
    }

    /// Returns true iff a packet of this format may be stamped with a
    /// presentation time equal to its decode time without reordering risk.
    ///
    /// For H.264/H.265 this is true iff the packet contains (or starts a
    /// fragment of) a random access picture, detected at the payload level
    /// without decoding. For audio formats it is unconditionally true.
    pub fn pts_equals_dts(&self, pkt: &crate::rtp::ReceivedPacket) -> bool {
        match self {
            Format::H264(_) => h264_contains_idr(pkt.payload()),
            Format::H265(_) => h265_contains_irap(pkt.payload()),
            Format::Vp8(_) => crate::codec::vp8::starts_keyframe(pkt.payload()),
            Format::Vp9(_) => crate::codec::vp9::starts_keyframe(pkt.payload()),
            Format::Jpeg(_)
            | Format::Mpeg4Audio(_)
            | Format::Mpeg4AudioLatm(_)
            | Format::Opus(_)
            | Format::G711(_)
            | Format::G722(_) => true,
            Format::Generic(_) => true,
        }
    }
}

/// Checks whether an RTP/H264 payload contains an IDR, without decoding.
fn h264_contains_idr(payload: &[u8]) -> bool {
    const IDR: u8 = 5;
    if payload.is_empty() {
        return false;
    }
    match payload[0] & 0x1F {
        IDR => true,
        24 => {
            // STAP-A: walk the size-prefixed NALUs.
            let mut payload = &payload[1..];
            while !payload.is_empty() {
                if payload.len() < 2 {
                    return false;
                }
                let size = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
                payload = &payload[2..];
                if size == 0 || size > payload.len() {
                    return false;
                }
                if (payload[0] & 0x1F) == IDR {
                    return true;
                }
                payload = &payload[size..];
            }
            false
        }
        28 => {
            // FU-A: only a fragment with the start bit names the NALU type.
            if payload.len() < 2 {
                return false;
            }
            let start = payload[1] >> 7;
            start == 1 && (payload[1] & 0x1F) == IDR
        }
        _ => false,
    }
}

/// Checks whether an RTP/H265 payload contains an IRAP picture.
fn h265_contains_irap(payload: &[u8]) -> bool {
    fn is_irap(t: u8) -> bool {
        (16..=21).contains(&t)
    }
    if payload.len() < 2 {
        return false;
    }
    match (payload[0] >> 1) & 0x3F {
        48 => {
            // AP: walk the size-prefixed NALUs.
            let mut payload = &payload[2..];
            while !payload.is_empty() {
                if payload.len() < 2 {
                    return false;
                }
                let size = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
                payload = &payload[2..];
                if size < 2 || size > payload.len() {
                    return false;
                }
                if is_irap((payload[0] >> 1) & 0x3F) {
                    return true;
                }
                payload = &payload[size..];
            }
            false
        }
        49 => {
            if payload.len() < 3 {
                return false;
            }
            let start = (payload[2] & 0b1000_0000) != 0;
            start && is_irap(payload[2] & 0x3F)
        }
        t => is_irap(t),
    }
}

/// Splits an fmtp attribute value into `key=value` pairs.
fn fmtp_params(fmtp: &str) -> impl Iterator<Item = (&str, &str)> {
    fmtp.split(';').filter_map(|p| {
        let p = p.trim();
        p.split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .or(if p.is_empty() { None } else { Some((p, "")) })
    })
}

fn encode_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err(format!("odd-length hex string {s:?}"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| format!("bad hex string {s:?}"))
        })
        .collect()
}

/// H.264, [RFC 6184](https://tools.ietf.org/html/rfc6184).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct H264 {
    payload_type: u8,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    packetization_mode: u8,
}

impl H264 {
    pub fn from_fmtp(payload_type: u8, fmtp: Option<&str>) -> Result<Self, String> {
        let mut sps = None;
        let mut pps = None;
        let mut packetization_mode = 0;
        if let Some(fmtp) = fmtp {
            for (key, value) in fmtp_params(fmtp) {
                match key {
                    "sprop-parameter-sets" => {
                        for nal in value.split(',') {
                            let nal = base64::decode(nal)
                                .map_err(|_| "NAL has invalid base64 encoding".to_owned())?;
                            if nal.is_empty() {
                                return Err("empty NAL in sprop-parameter-sets".into());
                            }
                            // Some cameras leave Annex B start codes at the
                            // end; strip them so parameter comparison works.
                            let nal = nal
                                .strip_suffix(b"\x00\x00\x00\x01")
                                .map(<[u8]>::to_vec)
                                .unwrap_or(nal);
                            match nal[0] & 0x1F {
                                7 => sps = Some(Bytes::from(nal)),
                                8 => pps = Some(Bytes::from(nal)),
                                _ => {
                                    // Some encoders stuff SEI and more in
                                    // here; ignore.
                                }
                            }
                        }
                    }
                    "packetization-mode" => {
                        packetization_mode = value
                            .parse()
                            .map_err(|_| format!("bad packetization-mode {value:?}"))?;
                        if packetization_mode > 1 {
                            return Err(format!(
                                "unsupported packetization-mode {packetization_mode}"
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(Self {
            payload_type,
            sps,
            pps,
            packetization_mode,
        })
    }

    pub fn sps(&self) -> Option<&[u8]> {
        self.sps.as_deref()
    }

    pub fn pps(&self) -> Option<&[u8]> {
        self.pps.as_deref()
    }

    pub(crate) fn payload_type(&self) -> u8 {
        self.payload_type
    }
}

/// H.265, [RFC 7798](https://datatracker.ietf.org/doc/html/rfc7798).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct H265 {
    payload_type: u8,
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl H265 {
    pub fn from_fmtp(payload_type: u8, fmtp: Option<&str>) -> Result<Self, String> {
        let mut vps = None;
        let mut sps = None;
        let mut pps = None;
        if let Some(fmtp) = fmtp {
            for (key, value) in fmtp_params(fmtp) {
                let target = match key {
                    "sprop-vps" => &mut vps,
                    "sprop-sps" => &mut sps,
                    "sprop-pps" => &mut pps,
                    _ => continue,
                };
                let nal = base64::decode(value)
                    .map_err(|_| format!("{key} has invalid base64 encoding"))?;
                if nal.len() < 2 {
                    return Err(format!("{key} NAL too short"));
                }
                *target = Some(Bytes::from(nal));
            }
        }
        Ok(Self {
            payload_type,
            vps,
            sps,
            pps,
        })
    }

    pub fn vps(&self) -> Option<&[u8]> {
        self.vps.as_deref()
    }

    pub fn sps(&self) -> Option<&[u8]> {
        self.sps.as_deref()
    }

    pub fn pps(&self) -> Option<&[u8]> {
        self.pps.as_deref()
    }
}

/// VP8, [RFC 7741](https://datatracker.ietf.org/doc/html/rfc7741).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Vp8 {
    payload_type: u8,
    max_fr: Option<u32>,
    max_fs: Option<u32>,
}

impl Vp8 {
    pub fn from_fmtp(payload_type: u8, fmtp: Option<&str>) -> Result<Self, String> {
        let mut max_fr = None;
        let mut max_fs = None;
        if let Some(fmtp) = fmtp {
            for (key, value) in fmtp_params(fmtp) {
                match key {
                    "max-fr" => {
                        max_fr = Some(value.parse().map_err(|_| format!("bad max-fr {value:?}"))?)
                    }
                    "max-fs" => {
                        max_fs = Some(value.parse().map_err(|_| format!("bad max-fs {value:?}"))?)
                    }
                    _ => {}
                }
            }
        }
        Ok(Self {
            payload_type,
            max_fr,
            max_fs,
        })
    }
}

/// VP9, [draft-ietf-payload-vp9](https://datatracker.ietf.org/doc/html/draft-ietf-payload-vp9).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Vp9 {
    payload_type: u8,
    profile_id: Option<u32>,
}

impl Vp9 {
    pub fn from_fmtp(payload_type: u8, fmtp: Option<&str>) -> Result<Self, String> {
        let mut profile_id = None;
        if let Some(fmtp) = fmtp {
            for (key, value) in fmtp_params(fmtp) {
                if key == "profile-id" {
                    profile_id =
                        Some(value.parse().map_err(|_| format!("bad profile-id {value:?}"))?);
                }
            }
        }
        Ok(Self {
            payload_type,
            profile_id,
        })
    }
}

/// MPEG-4 Audio with the RFC 3640 `mpeg4-generic` mapping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mpeg4Audio {
    payload_type: u8,
    config: Mpeg4AudioConfig,
    size_length: u8,
    index_length: u8,
    index_delta_length: u8,
}

impl Mpeg4Audio {
    pub fn from_fmtp(payload_type: u8, fmtp: Option<&str>) -> Result<Self, String> {
        let fmtp = fmtp.ok_or("mpeg4-generic requires format-specific parameters")?;
        let mut config = None;
        let mut size_length = None;
        let mut index_length = 0;
        let mut index_delta_length = 0;
        let mut mode = None;
        for (key, value) in fmtp_params(fmtp) {
            // Keys are case-insensitive per RFC 3640 section 4.1.
            match key.to_ascii_lowercase().as_str() {
                "config" => config = Some(Mpeg4AudioConfig::parse(&decode_hex(value)?)?),
                "sizelength" => {
                    size_length =
                        Some(value.parse().map_err(|_| format!("bad sizelength {value:?}"))?)
                }
                "indexlength" => {
                    index_length = value.parse().map_err(|_| format!("bad indexlength {value:?}"))?
                }
                "indexdeltalength" => {
                    index_delta_length = value
                        .parse()
                        .map_err(|_| format!("bad indexdeltalength {value:?}"))?
                }
                "mode" => mode = Some(value.to_ascii_lowercase()),
                _ => {}
            }
        }
        match mode.as_deref() {
            Some("aac-hbr") | Some("aac-lbr") | None => {}
            Some(o) => return Err(format!("unsupported mpeg4-generic mode {o:?}")),
        }
        Ok(Self {
            payload_type,
            config: config.ok_or("mpeg4-generic requires a config parameter")?,
            size_length: size_length.ok_or("mpeg4-generic requires a sizelength parameter")?,
            index_length,
            index_delta_length,
        })
    }

    pub fn config(&self) -> &Mpeg4AudioConfig {
        &self.config
    }

    pub(crate) fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub(crate) fn size_length(&self) -> u8 {
        self.size_length
    }

    pub(crate) fn index_length(&self) -> u8 {
        self.index_length
    }
}

/// MPEG-4 Audio with the RFC 3016 `MP4A-LATM` mapping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mpeg4AudioLatm {
    payload_type: u8,
    profile_level_id: u32,
    config: Mpeg4AudioConfig,

    /// The raw StreamMuxConfig, as carried in the `config` fmtp parameter.
    config_raw: Vec<u8>,
}

impl Mpeg4AudioLatm {
    pub fn from_fmtp(payload_type: u8, fmtp: Option<&str>) -> Result<Self, String> {
        let fmtp = fmtp.ok_or("MP4A-LATM requires format-specific parameters")?;
        let mut config = None;
        let mut profile_level_id = 30;
        for (key, value) in fmtp_params(fmtp) {
            match key.to_ascii_lowercase().as_str() {
                "config" => config = Some(decode_hex(value)?),
                "profile-level-id" => {
                    profile_level_id = value
                        .parse()
                        .map_err(|_| format!("bad profile-level-id {value:?}"))?
                }
                "cpresent" => {
                    if value != "0" {
                        return Err("MP4A-LATM with in-band configuration unsupported".into());
                    }
                }
                _ => {}
            }
        }
        let config_raw = config.ok_or("MP4A-LATM requires a config parameter")?;
        let audio_config = parse_stream_mux_config(&config_raw)?;
        Ok(Self {
            payload_type,
            profile_level_id,
            config: audio_config,
            config_raw,
        })
    }

    pub fn config(&self) -> &Mpeg4AudioConfig {
        &self.config
    }
}

/// Extracts the embedded AudioSpecificConfig from a StreamMuxConfig
/// (ISO/IEC 14496-3 section 1.7.3).
fn parse_stream_mux_config(raw: &[u8]) -> Result<Mpeg4AudioConfig, String> {
    use bitstream_io::BitRead;
    let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
    let audio_mux_version = r
        .read_bit()
        .map_err(|e| format!("unable to read audioMuxVersion: {e}"))?;
    if audio_mux_version {
        return Err("audioMuxVersion 1 unsupported".into());
    }
    let all_streams_same_time_framing = r
        .read_bit()
        .map_err(|e| format!("unable to read allStreamsSameTimeFraming: {e}"))?;
    if !all_streams_same_time_framing {
        return Err("streams with differing time framing unsupported".into());
    }
    let num_sub_frames = r
        .read::<u8>(6)
        .map_err(|e| format!("unable to read numSubFrames: {e}"))?;
    if num_sub_frames != 0 {
        return Err(format!("numSubFrames {num_sub_frames} unsupported"));
    }
    let num_program = r
        .read::<u8>(4)
        .map_err(|e| format!("unable to read numProgram: {e}"))?;
    let num_layer = r
        .read::<u8>(3)
        .map_err(|e| format!("unable to read numLayer: {e}"))?;
    if num_program != 0 || num_layer != 0 {
        return Err("multiple LATM programs/layers unsupported".into());
    }
    // The AudioSpecificConfig follows, bit-packed and not byte-aligned.
    // Re-align by copying whole bytes from the reader; trailing bits beyond
    // the last full byte are padding.
    let mut rest = Vec::with_capacity(raw.len());
    while let Ok(byte) = r.read::<u8>(8) {
        rest.push(byte);
    }
    Mpeg4AudioConfig::parse(&rest)
}

/// Opus, [RFC 7587](https://datatracker.ietf.org/doc/html/rfc7587).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Opus {
    payload_type: u8,
    channels: u16,
}

impl Opus {
    pub fn new(payload_type: u8, channels: u16) -> Self {
        Self {
            payload_type,
            channels,
        }
    }
}

/// G.711 (µ-law `PCMU` or A-law `PCMA`),
/// [RFC 3551 section 4.5.14](https://datatracker.ietf.org/doc/html/rfc3551#section-4.5.14).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct G711 {
    payload_type: u8,
    mulaw: bool,
}

impl G711 {
    pub fn new(mulaw: bool) -> Self {
        Self {
            payload_type: if mulaw { 0 } else { 8 },
            mulaw,
        }
    }
}

/// G.722, [RFC 3551 section 4.5.2](https://datatracker.ietf.org/doc/html/rfc3551#section-4.5.2).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct G722 {
    payload_type: u8,
}

impl Default for G722 {
    fn default() -> Self {
        Self { payload_type: 9 }
    }
}

/// Motion JPEG, [RFC 2435](https://www.rfc-editor.org/rfc/rfc2435.txt).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Jpeg {
    payload_type: u8,
}

impl Default for Jpeg {
    fn default() -> Self {
        Self { payload_type: 26 }
    }
}

/// A format with no codec-specific support.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Generic {
    media: String,
    payload_type: u8,
    encoding_name: String,
    clock_rate: u32,
    channels: Option<NonZeroU16>,
    fmtp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::ReceivedPacketBuilder;
    use crate::PacketContext;
    use std::num::NonZeroU32;

    fn h264() -> Format {
        Format::from_sdp(
            "video",
            96,
            "h264",
            90_000,
            None,
            Some("packetization-mode=1; sprop-parameter-sets=Z2QAHqwsaoLA9puCgIKgAAADACAAAAMD0IAA,aO4xshsA; profile-level-id=64001E"),
        )
        .unwrap()
    }

    fn pkt(payload: &[u8]) -> crate::rtp::ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            sequence_number: 0,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(90_000).unwrap(), 0).unwrap(),
            payload_type: 96,
            ssrc: 0,
            mark: true,
            loss: 0,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    #[test]
    fn h264_from_sdp() {
        let f = h264();
        assert_eq!(f.payload_type(), 96);
        assert_eq!(f.clock_rate(), 90_000);
        assert_eq!(f.rtpmap(), "H264/90000");
        let fmtp = f.fmtp().unwrap();
        assert!(fmtp.contains("packetization-mode=1"));
        assert!(fmtp.contains("sprop-parameter-sets=Z2QAHqwsaoLA9puCgIKgAAADACAAAAMD0IAA,aO4xshsA"));
        assert!(fmtp.contains("profile-level-id=64001E"));
    }

    #[test]
    fn h264_pts_equals_dts() {
        let f = h264();
        // Single IDR NAL.
        assert!(f.pts_equals_dts(&pkt(b"\x65\xaa")));
        // Single non-IDR NAL.
        assert!(!f.pts_equals_dts(&pkt(b"\x61\xaa")));
        // FU-A start fragment of an IDR: type 5, start bit set.
        assert!(f.pts_equals_dts(&pkt(b"\x7c\x85\xaa")));
        // FU-A middle fragment of an IDR: no start bit.
        assert!(!f.pts_equals_dts(&pkt(b"\x7c\x05\xbb")));
        // STAP-A with an SPS and an IDR.
        assert!(f.pts_equals_dts(&pkt(b"\x18\x00\x02\x67\x42\x00\x02\x65\xaa")));
        // STAP-A with only parameter sets.
        assert!(!f.pts_equals_dts(&pkt(b"\x18\x00\x02\x67\x42\x00\x02\x68\xce")));
        // Truncated STAP-A entry.
        assert!(!f.pts_equals_dts(&pkt(b"\x18\x00\x09\x67\x42")));
    }

    #[test]
    fn unknown_becomes_generic() {
        let f = Format::from_sdp(
            "application",
            98,
            "vnd.onvif.metadata",
            90_000,
            None,
            None,
        )
        .unwrap();
        assert!(matches!(f, Format::Generic(_)));
        assert_eq!(f.rtpmap(), "vnd.onvif.metadata/90000");
    }

    #[test]
    fn g711_static_types() {
        let f = Format::from_sdp("audio", 0, "pcmu", 8_000, NonZeroU16::new(1), None).unwrap();
        assert_eq!(f.encoding_name(), "PCMU");
        assert_eq!(f.rtpmap(), "PCMU/8000/1");
        assert!(f.pts_equals_dts(&pkt(b"\x00")));
    }

    #[test]
    fn mpeg4_audio_fmtp_round_trip() {
        let f = Format::from_sdp(
            "audio",
            96,
            "mpeg4-generic",
            48_000,
            NonZeroU16::new(2),
            Some("profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1190"),
        )
        .unwrap();
        assert_eq!(f.clock_rate(), 48_000);
        assert_eq!(f.channels(), NonZeroU16::new(2));
        let fmtp = f.fmtp().unwrap();
        assert!(fmtp.contains("config=1190"));
        assert!(fmtp.contains("sizelength=13"));
    }

    #[test]
    fn hex() {
        assert_eq!(decode_hex("1190").unwrap(), vec![0x11, 0x90]);
        assert_eq!(encode_hex(&[0x11, 0x90]), "1190");
        decode_hex("119").unwrap_err();
        decode_hex("11x0").unwrap_err();
    }
}
