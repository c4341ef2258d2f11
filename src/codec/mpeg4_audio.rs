// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-4 Audio (AAC), in two RTP mappings:
//!
//! *   the `mpeg4-generic` mapping of
//!     [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640), using
//!     AU headers ("AAC-hbr" mode);
//! *   the `MP4A-LATM` mapping of
//!     [RFC 3016](https://datatracker.ietf.org/doc/html/rfc3016), carrying
//!     an audioMuxElement with byte-stuffed payload lengths.
//!
//! See also ISO/IEC 14496-3, which defines the `AudioSpecificConfig` both
//! mappings exchange via SDP.

use std::collections::VecDeque;
use std::num::NonZeroU32;

use bitstream_io::BitRead;
use bytes::{Buf, Bytes};

use crate::format;
use crate::rtp::{RawPacketBuilder, ReceivedPacket};

use super::{AudioFrame, AudioParameters, CodecItem};

/// A fragmented AU may not exceed this size.
const MAX_AU_LEN: usize = 1 << 20;

/// ISO/IEC 14496-3 section 1.6.3.3.
const SAMPLING_FREQUENCIES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// An `AudioSpecificConfig` as in ISO/IEC 14496-3 section 1.6.2.1.
///
/// Currently stores the raw form and the fields of interest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Mpeg4AudioConfig {
    pub audio_object_type: u8,
    pub sampling_frequency: u32,

    /// The channelConfiguration id, 1..=7.
    pub channels: u8,

    /// Samples per frame: 1024, or 960 when the frameLengthFlag is set.
    pub frame_length: u16,

    raw: Vec<u8>,
}

impl Mpeg4AudioConfig {
    /// Parses from raw bytes (eg the `config` fmtp parameter, hex-decoded).
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
        let audio_object_type = match r
            .read::<u8>(5)
            .map_err(|e| format!("unable to read audio_object_type: {e}"))?
        {
            31 => {
                32 + r
                    .read::<u8>(6)
                    .map_err(|e| format!("unable to read audio_object_type ext: {e}"))?
            }
            o => o,
        };
        if audio_object_type != 2 {
            return Err(format!(
                "unsupported audio_object_type {audio_object_type}; only AAC-LC (2) is supported"
            ));
        }
        let sampling_frequency = match r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read sampling_frequency_index: {e}"))?
        {
            i @ 0x0..=0xc => SAMPLING_FREQUENCIES[usize::from(i)],
            0xf => r
                .read::<u32>(24)
                .map_err(|e| format!("unable to read sampling_frequency ext: {e}"))?,
            i => return Err(format!("reserved sampling_frequency_index value 0x{i:x}")),
        };
        let channels = r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read channelConfiguration: {e}"))?;
        if !(1..=7).contains(&channels) {
            return Err(format!("unsupported channelConfiguration {channels}"));
        }
        // GASpecificConfig, ISO/IEC 14496-3 section 4.4.1.
        let frame_length_flag = r
            .read_bit()
            .map_err(|e| format!("unable to read frameLengthFlag: {e}"))?;
        let frame_length = if frame_length_flag { 960 } else { 1024 };
        let depends_on_core_coder = r
            .read_bit()
            .map_err(|e| format!("unable to read dependsOnCoreCoder: {e}"))?;
        if depends_on_core_coder {
            r.skip(14) // coreCoderDelay
                .map_err(|e| format!("unable to read coreCoderDelay: {e}"))?;
        }
        let extension_flag = r
            .read_bit()
            .map_err(|e| format!("unable to read extensionFlag: {e}"))?;
        if extension_flag {
            return Err("AudioSpecificConfig extensionFlag unsupported".into());
        }
        Ok(Self {
            audio_object_type,
            sampling_frequency,
            channels,
            frame_length,
            raw: raw.to_vec(),
        })
    }

    /// Returns the raw serialized form.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn parameters(&self) -> AudioParameters {
        AudioParameters {
            // https://datatracker.ietf.org/doc/html/rfc6381#section-3.3
            rfc6381_codec: Some(format!("mp4a.40.{}", self.audio_object_type)),
            frame_length: NonZeroU32::new(u32::from(self.frame_length)),
            clock_rate: self.sampling_frequency,
            extra_data: self.raw.clone(),
        }
    }
}

/// In-progress fragmented AU state.
#[derive(Debug)]
struct Fragment {
    ctx: crate::PacketContext,
    timestamp: crate::Timestamp,
    stream_id: usize,
    loss: u16,

    /// The full AU size, as stated by each fragment's AU header.
    size: usize,
    data: Vec<u8>,
}

/// Depacketizer for the RFC 3640 `mpeg4-generic` mapping.
///
/// AU interleaving (a non-zero `indexdeltalength` value on the wire) is not
/// supported; the library never reorders.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: AudioParameters,
    frame_length: u32,
    size_length: u8,
    index_length: u8,
    fragment: Option<Fragment>,
    pending: VecDeque<AudioFrame>,
}

impl Depacketizer {
    pub(super) fn new(format: &format::Mpeg4Audio) -> Result<Self, String> {
        if format.size_length() == 0 || format.size_length() > 16 {
            return Err(format!(
                "bad sizelength {}; expected 1..=16",
                format.size_length()
            ));
        }
        Ok(Self {
            parameters: format.config().parameters(),
            frame_length: u32::from(format.config().frame_length),
            size_length: format.size_length(),
            index_length: format.index_length(),
            fragment: None,
            pending: VecDeque::new(),
        })
    }

    pub(super) fn parameters(&self) -> Option<super::ParametersRef<'_>> {
        Some(super::ParametersRef::Audio(&self.parameters))
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        assert!(self.pending.is_empty());
        if pkt.loss() > 0 {
            self.fragment = None;
        }
        let ctx = *pkt.ctx();
        let mark = pkt.mark();
        let timestamp = pkt.timestamp();
        let stream_id = pkt.stream_id();
        let loss = pkt.loss();
        let mut data = pkt.into_payload_bytes();
        if data.len() < 2 {
            return Err("payload too short for AU-headers-length".into());
        }
        let au_headers_length_bits = usize::from(data.get_u16());
        let au_header_bits = usize::from(self.size_length) + usize::from(self.index_length);
        if au_headers_length_bits == 0 || au_headers_length_bits % au_header_bits != 0 {
            return Err(format!(
                "AU-headers-length {au_headers_length_bits} not a multiple of the {au_header_bits}-bit AU header"
            ));
        }
        let n_aus = au_headers_length_bits / au_header_bits;
        let au_headers_bytes = au_headers_length_bits.div_ceil(8);
        if data.len() < au_headers_bytes {
            return Err("payload too short for AU headers".into());
        }
        let headers = data.split_to(au_headers_bytes);
        let mut r = bitstream_io::BitReader::endian(&headers[..], bitstream_io::BigEndian);
        let mut sizes = Vec::with_capacity(n_aus);
        for i in 0..n_aus {
            let size: u32 = r
                .read(u32::from(self.size_length))
                .map_err(|e| format!("unable to read AU size: {e}"))?;
            if self.index_length > 0 {
                let index: u32 = r
                    .read(u32::from(self.index_length))
                    .map_err(|e| format!("unable to read AU index: {e}"))?;
                if index != 0 {
                    return Err(format!("AU {i} has interleaving index {index}; unsupported"));
                }
            }
            sizes.push(usize::try_from(size).expect("size_length <= 16"));
        }

        if n_aus == 1 && (self.fragment.is_some() || sizes[0] > data.len()) {
            // A fragmented AU: each fragment repeats the full AU size.
            let size = sizes[0];
            let frag = match &mut self.fragment {
                None => {
                    if size > MAX_AU_LEN {
                        return Err(format!("AU of {size} bytes exceeds {MAX_AU_LEN}"));
                    }
                    self.fragment = Some(Fragment {
                        ctx,
                        timestamp,
                        stream_id,
                        loss,
                        size,
                        data: Vec::with_capacity(size),
                    });
                    self.fragment.as_mut().expect("just set")
                }
                Some(frag) => {
                    if frag.size != size {
                        self.fragment = None;
                        return Err("AU size changed mid-fragment".into());
                    }
                    if frag.timestamp.timestamp() != timestamp.timestamp() {
                        self.fragment = None;
                        return Err("timestamp changed mid-fragment".into());
                    }
                    frag
                }
            };
            if frag.data.len() + data.len() > frag.size {
                self.fragment = None;
                return Err("fragments overflow stated AU size".into());
            }
            frag.data.extend_from_slice(&data);
            if mark {
                let frag = self.fragment.take().expect("fragment is some");
                if frag.data.len() != frag.size {
                    return Err(format!(
                        "fragmented AU ended with {} of {} bytes",
                        frag.data.len(),
                        frag.size
                    ));
                }
                self.pending.push_back(AudioFrame {
                    ctx: frag.ctx,
                    stream_id: frag.stream_id,
                    timestamp: frag.timestamp,
                    frame_length: NonZeroU32::new(self.frame_length).expect("non-zero"),
                    loss: frag.loss,
                    data: frag.data.into(),
                });
            }
            return Ok(());
        }

        if !mark {
            return Err("multi-AU packet without mark".into());
        }
        let mut timestamp = timestamp;
        for (i, &size) in sizes.iter().enumerate() {
            if data.remaining() < size {
                return Err(format!(
                    "packet too short: AU {i} of {size} bytes with only {} remaining",
                    data.remaining()
                ));
            }
            let au = data.split_to(size);
            self.pending.push_back(AudioFrame {
                ctx,
                stream_id,
                timestamp,
                frame_length: NonZeroU32::new(self.frame_length).expect("non-zero"),
                loss: if i == 0 { loss } else { 0 },
                data: au,
            });
            timestamp = timestamp
                .try_add(self.frame_length)
                .ok_or("timestamp overflow advancing across AUs")?;
        }
        if data.has_remaining() {
            return Err(format!("{} unclaimed bytes after final AU", data.remaining()));
        }
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.pop_front().map(CodecItem::AudioFrame)
    }
}

/// Packetizer for the RFC 3640 `mpeg4-generic` mapping: one AU per packet,
/// fragmented when it exceeds the maximum payload size. Each fragment's AU
/// header states the full AU size; the mark bit closes the AU.
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_type: u8,
    ssrc: u32,
    next_sequence_number: u16,
    max_payload_size: u16,
    size_length: u8,
    index_length: u8,
}

impl Packetizer {
    pub(crate) fn new(
        format: &format::Mpeg4Audio,
        ssrc: u32,
        initial_sequence_number: u16,
        max_payload_size: u16,
    ) -> Result<Self, String> {
        if format.size_length() == 0 || format.size_length() > 16 {
            return Err(format!("bad sizelength {}", format.size_length()));
        }
        Ok(Self {
            payload_type: format.payload_type(),
            ssrc,
            next_sequence_number: initial_sequence_number,
            max_payload_size,
            size_length: format.size_length(),
            index_length: format.index_length(),
        })
    }

    fn au_header(&self, au_len: usize) -> Result<[u8; 4], String> {
        let bits = u32::from(self.size_length) + u32::from(self.index_length);
        if bits > 16 {
            return Err("AU headers longer than 16 bits unsupported".into());
        }
        let size = u16::try_from(au_len).map_err(|_| "AU too large for sizelength".to_owned())?;
        if u32::from(size) >= (1 << self.size_length) {
            return Err(format!("AU of {au_len} bytes overflows sizelength"));
        }
        let header = u16::from(size) << self.index_length;
        let header = header << (16 - bits as u16);
        let mut out = [0u8; 4];
        out[..2].copy_from_slice(&(bits as u16).to_be_bytes());
        out[2..].copy_from_slice(&header.to_be_bytes());
        Ok(out)
    }

    pub(crate) fn packetize(&mut self, au: &[u8], timestamp: u32) -> Result<Vec<Bytes>, String> {
        let bits = usize::from(self.size_length) + usize::from(self.index_length);
        let header_bytes = 2 + bits.div_ceil(8);
        let max_data = usize::from(self.max_payload_size)
            .checked_sub(header_bytes)
            .ok_or("maximum payload size smaller than AU headers")?;
        let header = self.au_header(au.len())?;
        let header = &header[..header_bytes];
        let nchunks = au.len().div_ceil(max_data).max(1);
        let mut out = Vec::with_capacity(nchunks);
        for (i, chunk) in au.chunks(max_data).enumerate() {
            let (raw, _) = RawPacketBuilder {
                sequence_number: self.next_sequence_number,
                timestamp,
                payload_type: self.payload_type,
                ssrc: self.ssrc,
                mark: i + 1 == nchunks,
            }
            .build(header.iter().copied().chain(chunk.iter().copied()))?;
            self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
            out.push(raw.0);
        }
        Ok(out)
    }
}

/// Depacketizer for the RFC 3016 `MP4A-LATM` mapping with
/// `cpresent=0` (mux configuration out of band): each packet carries an
/// audioMuxElement whose payload length is byte-stuffed (0xFF continuation
/// bytes).
#[derive(Debug)]
pub(crate) struct LatmDepacketizer {
    parameters: AudioParameters,
    frame_length: u32,
    pending: Option<AudioFrame>,
}

impl LatmDepacketizer {
    pub(super) fn new(format: &format::Mpeg4AudioLatm) -> Result<Self, String> {
        Ok(Self {
            parameters: format.config().parameters(),
            frame_length: u32::from(format.config().frame_length),
            pending: None,
        })
    }

    pub(super) fn parameters(&self) -> Option<super::ParametersRef<'_>> {
        Some(super::ParametersRef::Audio(&self.parameters))
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        assert!(self.pending.is_none());
        if !pkt.mark() {
            // RFC 3016 allows fragmenting an audioMuxElement across packets,
            // but real senders don't; dropping keeps the state machine simple.
            return Err("fragmented audioMuxElement unsupported".into());
        }
        let ctx = *pkt.ctx();
        let timestamp = pkt.timestamp();
        let stream_id = pkt.stream_id();
        let loss = pkt.loss();
        let mut data = pkt.into_payload_bytes();

        // PayloadLengthInfo: bytes of 0xFF accumulate; a byte < 0xFF ends.
        let mut len = 0usize;
        loop {
            if data.is_empty() {
                return Err("audioMuxElement truncated in PayloadLengthInfo".into());
            }
            let b = data[0];
            data.advance(1);
            len += usize::from(b);
            if b != 0xFF {
                break;
            }
        }
        if data.len() < len {
            return Err(format!(
                "audioMuxElement states {len} payload bytes; have {}",
                data.len()
            ));
        }
        data.truncate(len);
        self.pending = Some(AudioFrame {
            ctx,
            stream_id,
            timestamp,
            frame_length: NonZeroU32::new(self.frame_length).expect("non-zero"),
            loss,
            data,
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take().map(CodecItem::AudioFrame)
    }
}

/// Packetizer for the `MP4A-LATM` mapping with `cpresent=0`.
#[derive(Debug)]
pub(crate) struct LatmPacketizer {
    payload_type: u8,
    ssrc: u32,
    next_sequence_number: u16,
    max_payload_size: u16,
}

impl LatmPacketizer {
    pub(crate) fn new(
        payload_type: u8,
        ssrc: u32,
        initial_sequence_number: u16,
        max_payload_size: u16,
    ) -> Self {
        Self {
            payload_type,
            ssrc,
            next_sequence_number: initial_sequence_number,
            max_payload_size,
        }
    }

    pub(crate) fn packetize(&mut self, au: &[u8], timestamp: u32) -> Result<Vec<Bytes>, String> {
        let length_info_len = au.len() / 255 + 1;
        if length_info_len + au.len() > usize::from(self.max_payload_size) {
            return Err(format!(
                "audioMuxElement of {} bytes exceeds maximum payload size",
                au.len()
            ));
        }
        let mut payload = Vec::with_capacity(length_info_len + au.len());
        let mut remaining = au.len();
        while remaining >= 255 {
            payload.push(0xFF);
            remaining -= 255;
        }
        payload.push(remaining as u8);
        payload.extend_from_slice(au);
        let (raw, _) = RawPacketBuilder {
            sequence_number: self.next_sequence_number,
            timestamp,
            payload_type: self.payload_type,
            ssrc: self.ssrc,
            mark: true,
        }
        .build(payload)?;
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
        Ok(vec![raw.0])
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;
    use crate::rtp::ReceivedPacketBuilder;
    use crate::PacketContext;

    fn fmt() -> format::Mpeg4Audio {
        // 48 kHz stereo AAC-LC: config 11 90.
        format::Mpeg4Audio::from_fmtp(
            96,
            Some("profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1190"),
        )
        .unwrap()
    }

    fn pkt(sequence_number: u16, mark: bool, loss: u16, payload: &[u8]) -> ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            sequence_number,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(48_000).unwrap(), 0).unwrap(),
            payload_type: 96,
            ssrc: 0,
            mark,
            loss,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    #[test]
    fn config_parse() {
        // 0x1190: AOT=2 (AAC-LC), freq index 3 (48 kHz), channels 2.
        let c = Mpeg4AudioConfig::parse(&[0x11, 0x90]).unwrap();
        assert_eq!(c.audio_object_type, 2);
        assert_eq!(c.sampling_frequency, 48_000);
        assert_eq!(c.channels, 2);
        assert_eq!(c.frame_length, 1024);
    }

    #[test]
    fn config_rejects_non_lc() {
        // AOT=1 (AAC main).
        Mpeg4AudioConfig::parse(&[0x09, 0x90]).unwrap_err();
    }

    #[test]
    fn two_aus_in_one_packet() {
        let mut d = Depacketizer::new(&fmt()).unwrap();
        // AU-headers-length=32 bits; sizes 3<<3 and 2<<3.
        d.push(pkt(
            0,
            true,
            0,
            b"\x00\x20\x00\x18\x00\x10\xaa\xbb\xcc\xdd\xee",
        ))
        .unwrap();
        let f1 = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            _ => panic!(),
        };
        assert_eq!(&f1.data()[..], b"\xaa\xbb\xcc");
        assert_eq!(f1.timestamp().timestamp(), 0);
        let f2 = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            _ => panic!(),
        };
        assert_eq!(&f2.data()[..], b"\xdd\xee");
        assert_eq!(f2.timestamp().timestamp(), 1024);
        assert!(d.pull().is_none());
    }

    #[test]
    fn fragmented_au_round_trip() {
        let au: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut p = Packetizer::new(&fmt(), 1, 0, 400).unwrap();
        let pkts = p.packetize(&au, 0).unwrap();
        assert_eq!(pkts.len(), 3);
        let mut d = Depacketizer::new(&fmt()).unwrap();
        for (i, raw) in pkts.iter().enumerate() {
            let (raw_pkt, range) = crate::rtp::RawPacket::new(raw.clone()).unwrap();
            assert!(range.len() <= 400);
            d.push(pkt(
                raw_pkt.sequence_number(),
                i + 1 == pkts.len(),
                0,
                &raw[usize::from(range.start)..],
            ))
            .unwrap();
        }
        let f = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            _ => panic!(),
        };
        assert_eq!(&f.data()[..], &au[..]);
    }

    #[test]
    fn latm_round_trip() {
        let cfg = format::Mpeg4AudioLatm::from_fmtp(96, Some("profile-level-id=1;cpresent=0;config=400026103fc0")).unwrap();
        let au: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let mut p = LatmPacketizer::new(96, 1, 7, 1400);
        let pkts = p.packetize(&au, 0).unwrap();
        assert_eq!(pkts.len(), 1);
        let mut d = LatmDepacketizer::new(&cfg).unwrap();
        let (raw_pkt, range) = crate::rtp::RawPacket::new(pkts[0].clone()).unwrap();
        d.push(pkt(
            raw_pkt.sequence_number(),
            true,
            0,
            &pkts[0][usize::from(range.start)..],
        ))
        .unwrap();
        let f = match d.pull() {
            Some(CodecItem::AudioFrame(f)) => f,
            _ => panic!(),
        };
        assert_eq!(&f.data()[..], &au[..]);
    }
}
