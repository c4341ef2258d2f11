// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video,
//! depacketized and packetized as specified in
//! [RFC 6184](https://tools.ietf.org/html/rfc6184).

use std::convert::TryFrom;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use h264_reader::nal::{NalHeader, UnitType};
use log::debug;

use crate::format;
use crate::rtp::{RawPacketBuilder, ReceivedPacket};

use super::VideoFrame;

/// NAL unit type for a single-time aggregation packet without DONs.
const NAL_STAP_A: u8 = 24;

/// NAL unit type for a type-A fragmentation unit.
const NAL_FU_A: u8 = 28;

/// A reassembled NAL may not exceed this size; anything larger indicates a
/// broken or hostile sender.
const MAX_NAL_LEN: u32 = 1 << 20;

/// A [super::Depacketizer] implementation which finds access unit boundaries
/// and produces unfragmented NAL units as specified in RFC 6184.
///
/// This doesn't inspect the contents of the NAL units, so it doesn't depend
/// on or verify compliance with H.264 section 7.4.1.2.3 "Order of NAL units
/// and coded pictures and association to access units".
///
/// Currently expects that the stream starts at an access unit boundary unless
/// packet loss is indicated.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    input_state: DepacketizerInputState,

    /// A complete video frame ready for pull.
    pending: Option<VideoFrame>,

    parameters: Option<InternalParameters>,

    /// In state `PreMark`, pieces of NALs, excluding their header bytes.
    /// Kept around (empty) in other states to re-use the backing allocation.
    pieces: Vec<Bytes>,

    /// In state `PreMark`, an entry for each NAL.
    /// Kept around (empty) in other states to re-use the backing allocation.
    nals: Vec<Nal>,
}

#[derive(Debug)]
struct Nal {
    hdr: NalHeader,

    /// The length of `Depacketizer::pieces` as this NAL finishes.
    next_piece_idx: u32,

    /// The total length of this NAL, including the header byte.
    len: u32,
}

/// An access unit that is currently being accumulated during `PreMark` state.
#[derive(Debug)]
struct AccessUnit {
    start_ctx: crate::PacketContext,
    end_ctx: crate::PacketContext,
    timestamp: crate::Timestamp,
    stream_id: usize,

    /// True iff currently processing a FU-A.
    in_fu_a: bool,

    /// RTP packets lost as this access unit was starting.
    loss: u16,
}

#[derive(Debug)]
enum DepacketizerInputState {
    /// Not yet processing an access unit.
    New,

    /// Ignoring the remainder of an access unit because of interior packet
    /// loss.
    Loss {
        timestamp: crate::Timestamp,
        pkts: u16,
    },

    /// Currently processing an access unit.
    /// This will be flushed after a marked packet or when receiving a later
    /// timestamp.
    PreMark(AccessUnit),

    /// Finished processing the given packet. It's an error to receive the
    /// same timestamp again.
    PostMark {
        timestamp: crate::Timestamp,
        loss: u16,
    },
}

impl Depacketizer {
    pub(super) fn new(format: &format::H264) -> Result<Self, String> {
        let parameters = match (format.sps(), format.pps()) {
            (Some(sps), Some(pps)) => Some(InternalParameters::parse_sps_and_pps(sps, pps)?),
            _ => None,
        };
        Ok(Depacketizer {
            input_state: DepacketizerInputState::New,
            pending: None,
            pieces: Vec::new(),
            nals: Vec::new(),
            parameters,
        })
    }

    pub(super) fn parameters(&self) -> Option<super::ParametersRef<'_>> {
        self.parameters
            .as_ref()
            .map(|p| super::ParametersRef::Video(&p.generic_parameters))
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        // Push shouldn't be called until pull is exhausted.
        if let Some(p) = self.pending.as_ref() {
            panic!("push with data already pending: {p:?}");
        }

        let seq = pkt.sequence_number();
        let mut access_unit =
            match std::mem::replace(&mut self.input_state, DepacketizerInputState::New) {
                DepacketizerInputState::New => {
                    debug_assert!(self.nals.is_empty());
                    debug_assert!(self.pieces.is_empty());
                    AccessUnit::start(&pkt, 0)
                }
                DepacketizerInputState::PreMark(mut access_unit) => {
                    let loss = pkt.loss();
                    if loss > 0 {
                        self.nals.clear();
                        self.pieces.clear();
                        if access_unit.timestamp.timestamp == pkt.timestamp().timestamp {
                            // Loss within this access unit. Ignore until mark
                            // or new timestamp.
                            self.input_state = if pkt.mark() {
                                DepacketizerInputState::PostMark {
                                    timestamp: pkt.timestamp(),
                                    loss,
                                }
                            } else {
                                DepacketizerInputState::Loss {
                                    timestamp: pkt.timestamp(),
                                    pkts: loss,
                                }
                            };
                            return Ok(());
                        }
                        // A suffix of a previous access unit was lost; discard
                        // it. A prefix of the new one may have been lost; try
                        // parsing.
                        AccessUnit::start(&pkt, 0)
                    } else if access_unit.timestamp.timestamp != pkt.timestamp().timestamp {
                        if access_unit.in_fu_a {
                            return Err(format!(
                                "Timestamp changed from {} to {} in the middle of a fragmented NAL",
                                access_unit.timestamp,
                                pkt.timestamp()
                            ));
                        }
                        access_unit.end_ctx = *pkt.ctx();
                        self.pending = Some(self.finalize_access_unit(access_unit)?);
                        AccessUnit::start(&pkt, 0)
                    } else {
                        access_unit
                    }
                }
                DepacketizerInputState::PostMark {
                    timestamp: state_ts,
                    loss,
                } => {
                    debug_assert!(self.nals.is_empty());
                    debug_assert!(self.pieces.is_empty());
                    if state_ts.timestamp == pkt.timestamp().timestamp {
                        return Err(format!(
                            "Received packet with timestamp {} after marked packet with same timestamp at seq={seq:04x}",
                            pkt.timestamp()
                        ));
                    }
                    AccessUnit::start(&pkt, loss)
                }
                DepacketizerInputState::Loss {
                    timestamp,
                    mut pkts,
                } => {
                    debug_assert!(self.nals.is_empty());
                    debug_assert!(self.pieces.is_empty());
                    if pkt.timestamp().timestamp == timestamp.timestamp {
                        pkts += pkt.loss();
                        self.input_state = DepacketizerInputState::Loss { timestamp, pkts };
                        return Ok(());
                    }
                    AccessUnit::start(&pkt, pkts)
                }
            };

        let ctx = *pkt.ctx();
        let mark = pkt.mark();
        let loss = pkt.loss();
        let timestamp = pkt.timestamp();
        let mut data = pkt.into_payload_bytes();
        if data.is_empty() {
            return Err(format!("Empty NAL at RTP seq {seq:04x}"));
        }
        // https://tools.ietf.org/html/rfc6184#section-5.2
        let nal_header = data[0];
        if (nal_header >> 7) != 0 {
            return Err(format!("NAL header {nal_header:02x} has F bit set at seq {seq:04x}"));
        }
        data.advance(1); // skip the header byte.
        match nal_header & 0b11111 {
            1..=23 => {
                if access_unit.in_fu_a {
                    return Err(format!(
                        "Non-fragmented NAL {nal_header:02x} while fragment in progress at seq {seq:04x}"
                    ));
                }
                let len = to_u32_len(data.len()) + 1;
                let next_piece_idx = self.add_piece(data)?;
                self.nals.push(Nal {
                    hdr: NalHeader::new(nal_header).expect("header w/o F bit set is valid"),
                    next_piece_idx,
                    len,
                });
            }
            NAL_STAP_A => {
                // STAP-A. https://tools.ietf.org/html/rfc6184#section-5.7.1
                loop {
                    if data.remaining() < 2 {
                        return Err(format!(
                            "STAP-A has {} remaining bytes while expecting 2-byte length",
                            data.remaining()
                        ));
                    }
                    let len = data.get_u16();
                    if len == 0 {
                        return Err("zero length in STAP-A".into());
                    }
                    match data.remaining().cmp(&usize::from(len)) {
                        std::cmp::Ordering::Less => {
                            return Err(format!(
                                "STAP-A too short: {} bytes remaining, expecting {}-byte NAL",
                                data.remaining(),
                                len
                            ))
                        }
                        std::cmp::Ordering::Equal => {
                            let hdr = NalHeader::new(data[0])
                                .map_err(|_| "bad header in STAP-A".to_owned())?;
                            data.advance(1);
                            let next_piece_idx = self.add_piece(data)?;
                            self.nals.push(Nal {
                                hdr,
                                next_piece_idx,
                                len: u32::from(len),
                            });
                            break;
                        }
                        std::cmp::Ordering::Greater => {
                            let mut piece = data.split_to(usize::from(len));
                            let hdr = NalHeader::new(piece[0])
                                .map_err(|_| "bad header in STAP-A".to_owned())?;
                            piece.advance(1);
                            let next_piece_idx = self.add_piece(piece)?;
                            self.nals.push(Nal {
                                hdr,
                                next_piece_idx,
                                len: u32::from(len),
                            });
                        }
                    }
                }
            }
            25..=27 | 29 => {
                return Err(format!(
                    "unimplemented NAL (header 0x{nal_header:02x}) at seq {seq:04x}"
                ))
            }
            NAL_FU_A => {
                // FU-A. https://tools.ietf.org/html/rfc6184#section-5.8
                if data.len() < 2 {
                    return Err(format!("FU-A is too short at seq {seq:04x}"));
                }
                let fu_header = data[0];
                let start = (fu_header & 0b10000000) != 0;
                let end = (fu_header & 0b01000000) != 0;
                let reserved = (fu_header & 0b00100000) != 0;
                let nal_header = NalHeader::new((nal_header & 0b11100000) | (fu_header & 0b00011111))
                    .expect("NalHeader is valid");
                data.advance(1);
                if (start && end) || reserved {
                    return Err(format!("Invalid FU-A header {fu_header:08b} at seq {seq:04x}"));
                }
                let u32_len = to_u32_len(data.len());
                match (start, access_unit.in_fu_a) {
                    (true, true) => {
                        return Err(format!(
                            "FU-A with start bit while frag in progress at seq {seq:04x}"
                        ))
                    }
                    (true, false) => {
                        self.add_piece(data)?;
                        self.nals.push(Nal {
                            hdr: nal_header,
                            next_piece_idx: u32::MAX, // should be overwritten later.
                            len: 1 + u32_len,
                        });
                        access_unit.in_fu_a = true;
                    }
                    (false, true) => {
                        let pieces = self.add_piece(data)?;
                        let nal = self.nals.last_mut().expect("nals non-empty while in fu-a");
                        if u8::from(nal_header) != u8::from(nal.hdr) {
                            return Err(format!(
                                "FU-A has inconsistent NAL type: {:?} then {:?} at seq {seq:04x}",
                                nal.hdr, nal_header,
                            ));
                        }
                        nal.len = nal
                            .len
                            .checked_add(u32_len)
                            .filter(|&l| l <= MAX_NAL_LEN)
                            .ok_or_else(|| {
                                format!("fragmented NAL exceeds {MAX_NAL_LEN} bytes at seq {seq:04x}")
                            })?;
                        if end {
                            nal.next_piece_idx = pieces;
                            access_unit.in_fu_a = false;
                        } else if mark {
                            return Err(format!("FU-A with MARK and no END at seq {seq:04x}"));
                        }
                    }
                    (false, false) => {
                        if loss > 0 {
                            self.pieces.clear();
                            self.nals.clear();
                            self.input_state = DepacketizerInputState::Loss {
                                timestamp,
                                pkts: loss,
                            };
                            return Ok(());
                        }
                        return Err(format!(
                            "FU-A with start bit unset while no frag in progress at seq {seq:04x}"
                        ));
                    }
                }
            }
            _ => return Err(format!("bad nal header {nal_header:02x} at seq {seq:04x}")),
        }
        self.input_state = if mark {
            if access_unit.in_fu_a {
                return Err(format!("MARK with FU-A in progress at seq {seq:04x}"));
            }
            access_unit.end_ctx = ctx;
            self.pending = Some(self.finalize_access_unit(access_unit)?);
            DepacketizerInputState::PostMark { timestamp, loss: 0 }
        } else {
            DepacketizerInputState::PreMark(access_unit)
        };
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take().map(super::CodecItem::VideoFrame)
    }

    /// Adds a piece to `self.pieces`, erroring if it becomes absurdly large.
    fn add_piece(&mut self, piece: Bytes) -> Result<u32, String> {
        self.pieces.push(piece);
        u32::try_from(self.pieces.len()).map_err(|_| "more than u32::MAX pieces!".to_owned())
    }

    fn finalize_access_unit(&mut self, au: AccessUnit) -> Result<VideoFrame, String> {
        let mut piece_idx = 0;
        let mut retained_len = 0usize;
        let mut is_random_access_point = false;
        let mut is_disposable = true;
        let mut new_sps = None;
        let mut new_pps = None;
        for nal in &self.nals {
            let next_piece_idx = usize::try_from(nal.next_piece_idx).expect("u32 fits in usize");
            let nal_pieces = &self.pieces[piece_idx..next_piece_idx];
            match nal.hdr.nal_unit_type() {
                UnitType::SeqParameterSet => {
                    if !self.matches_sps(nal.hdr, nal_pieces) {
                        new_sps = Some(to_bytes(nal.hdr, nal.len, nal_pieces));
                    }
                }
                UnitType::PicParameterSet => {
                    if !self.matches_pps(nal.hdr, nal_pieces) {
                        new_pps = Some(to_bytes(nal.hdr, nal.len, nal_pieces));
                    }
                }
                UnitType::SliceLayerWithoutPartitioningIdr => is_random_access_point = true,
                _ => {}
            }
            if nal.hdr.nal_ref_idc() != 0 {
                is_disposable = false;
            }
            retained_len += 4usize + usize::try_from(nal.len).expect("u32 fits in usize");
            piece_idx = next_piece_idx;
        }
        let mut data = Vec::with_capacity(retained_len);
        piece_idx = 0;
        for nal in &self.nals {
            let next_piece_idx = usize::try_from(nal.next_piece_idx).expect("u32 fits in usize");
            let nal_pieces = &self.pieces[piece_idx..next_piece_idx];
            data.extend_from_slice(&nal.len.to_be_bytes()[..]);
            data.push(nal.hdr.into());
            let mut actual_len = 1;
            for piece in nal_pieces {
                data.extend_from_slice(&piece[..]);
                actual_len += piece.len();
            }
            debug_assert_eq!(
                usize::try_from(nal.len).expect("u32 fits in usize"),
                actual_len
            );
            piece_idx = next_piece_idx;
        }
        debug_assert_eq!(retained_len, data.len());
        self.nals.clear();
        self.pieces.clear();

        let has_new_parameters = if new_sps.is_some() || new_pps.is_some() {
            let old = self.parameters.take();
            let sps_nal = new_sps
                .as_deref()
                .or_else(|| old.as_ref().map(|p| &p.sps_nal[..]));
            let pps_nal = new_pps
                .as_deref()
                .or_else(|| old.as_ref().map(|p| &p.pps_nal[..]));
            match (sps_nal, pps_nal) {
                (Some(sps_nal), Some(pps_nal)) => {
                    self.parameters = Some(InternalParameters::parse_sps_and_pps(sps_nal, pps_nal)?);
                    true
                }
                _ => {
                    // Wait for the other half to arrive in-band.
                    debug!("in-band parameter NAL with no counterpart yet");
                    self.parameters = old;
                    false
                }
            }
        } else {
            false
        };
        Ok(VideoFrame {
            has_new_parameters,
            loss: au.loss,
            start_ctx: au.start_ctx,
            end_ctx: au.end_ctx,
            timestamp: au.timestamp,
            stream_id: au.stream_id,
            is_random_access_point,
            is_disposable,
            data,
        })
    }

    fn matches_sps(&self, hdr: NalHeader, pieces: &[Bytes]) -> bool {
        match self.parameters.as_ref() {
            Some(p) => matches(&p.sps_nal[..], hdr, pieces),
            None => false,
        }
    }

    fn matches_pps(&self, hdr: NalHeader, pieces: &[Bytes]) -> bool {
        match self.parameters.as_ref() {
            Some(p) => matches(&p.pps_nal[..], hdr, pieces),
            None => false,
        }
    }
}

fn to_u32_len(len: usize) -> u32 {
    u32::try_from(len).expect("RTP payload fits in u32")
}

impl AccessUnit {
    fn start(pkt: &ReceivedPacket, additional_loss: u16) -> Self {
        AccessUnit {
            start_ctx: *pkt.ctx(),
            end_ctx: *pkt.ctx(),
            timestamp: pkt.timestamp(),
            stream_id: pkt.stream_id(),
            in_fu_a: false,
            loss: pkt.loss().saturating_add(additional_loss),
        }
    }
}

#[derive(Clone, Debug)]
struct InternalParameters {
    generic_parameters: super::VideoParameters,

    /// The (single) SPS NAL.
    sps_nal: Bytes,

    /// The (single) PPS NAL.
    pps_nal: Bytes,
}

impl InternalParameters {
    fn parse_sps_and_pps(sps_nal: &[u8], pps_nal: &[u8]) -> Result<InternalParameters, String> {
        let sps_rbsp = h264_reader::rbsp::decode_nal(&sps_nal[1..]);
        if sps_rbsp.len() < 4 {
            return Err("bad sps".into());
        }
        let rfc6381_codec = format!(
            "avc1.{:02X}{:02X}{:02X}",
            sps_rbsp[0], sps_rbsp[1], sps_rbsp[2]
        );
        let sps = h264_reader::nal::sps::SeqParameterSet::from_bytes(&sps_rbsp)
            .map_err(|e| format!("Bad SPS: {e:?}"))?;

        let (pixel_dimensions_width, pixel_dimensions_height) = sps
            .pixel_dimensions()
            .map_err(|e| format!("SPS has invalid pixel dimensions: {e:?}"))?;
        let pixel_dimensions = (
            u16::try_from(pixel_dimensions_width).map_err(|_| "pixel width too large".to_owned())?,
            u16::try_from(pixel_dimensions_height).map_err(|_| "pixel height too large".to_owned())?,
        );

        // Create the AVCDecoderConfiguration, ISO/IEC 14496-15 section
        // 5.2.4.1. The beginning takes a few values from the SPS (ISO/IEC
        // 14496-10 section 7.3.2.1.1).
        let mut avc_decoder_config = BytesMut::with_capacity(11 + sps_nal.len() + pps_nal.len());
        avc_decoder_config.put_u8(1); // configurationVersion
        avc_decoder_config.extend(&sps_rbsp[0..=2]); // profile/compat/level.

        // Hardcode lengthSizeMinusOne to 3, matching the 4-byte lengths used
        // in VideoFrame::data.
        avc_decoder_config.put_u8(0xff);

        // Only support one SPS and PPS. ffmpeg's ff_isom_write_avcc has the
        // same limitation, so it's probably fine. This next byte is a
        // reserved 0b111 + a 5-bit # of SPSs (1).
        avc_decoder_config.put_u8(0xe1);
        avc_decoder_config.extend(
            &u16::try_from(sps_nal.len())
                .map_err(|_| "SPS too long".to_owned())?
                .to_be_bytes()[..],
        );
        let sps_nal_start = avc_decoder_config.len();
        avc_decoder_config.extend_from_slice(sps_nal);
        let sps_nal_end = avc_decoder_config.len();
        avc_decoder_config.put_u8(1); // # of PPSs.
        avc_decoder_config.extend(
            &u16::try_from(pps_nal.len())
                .map_err(|_| "PPS too long".to_owned())?
                .to_be_bytes()[..],
        );
        let pps_nal_start = avc_decoder_config.len();
        avc_decoder_config.extend_from_slice(pps_nal);
        let pps_nal_end = avc_decoder_config.len();
        debug_assert_eq!(avc_decoder_config.len(), 11 + sps_nal.len() + pps_nal.len());

        let avc_decoder_config = avc_decoder_config.freeze();
        let sps_nal = avc_decoder_config.slice(sps_nal_start..sps_nal_end);
        let pps_nal = avc_decoder_config.slice(pps_nal_start..pps_nal_end);
        Ok(InternalParameters {
            generic_parameters: super::VideoParameters {
                rfc6381_codec,
                pixel_dimensions,
                extra_data: avc_decoder_config,
            },
            sps_nal,
            pps_nal,
        })
    }
}

/// Returns true iff the bytes of `nal` equal the bytes of `[hdr, ..data]`.
fn matches(nal: &[u8], hdr: NalHeader, pieces: &[Bytes]) -> bool {
    if nal.is_empty() || nal[0] != u8::from(hdr) {
        return false;
    }
    let mut nal_pos = 1;
    for piece in pieces {
        let new_pos = nal_pos + piece.len();
        if nal.len() < new_pos {
            return false;
        }
        if piece[..] != nal[nal_pos..new_pos] {
            return false;
        }
        nal_pos = new_pos;
    }
    nal_pos == nal.len()
}

/// Saves the given NAL to a contiguous Bytes.
fn to_bytes(hdr: NalHeader, len: u32, pieces: &[Bytes]) -> Bytes {
    let len = usize::try_from(len).expect("u32 fits in usize");
    let mut out = Vec::with_capacity(len);
    out.push(hdr.into());
    for piece in pieces {
        out.extend_from_slice(&piece[..]);
    }
    debug_assert_eq!(len, out.len());
    out.into()
}

/// Splits H.264 access units into RTP packets as specified in
/// [RFC 6184](https://tools.ietf.org/html/rfc6184):
///
/// *   a NAL that fits in one packet is sent as a single NAL unit packet;
/// *   consecutive NALs whose aggregate (with the STAP-A header byte and
///     2-byte size prefixes) fits are sent as one STAP-A;
/// *   anything larger is fragmented into FU-As.
///
/// The last packet of each access unit carries the RTP marker bit.
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_type: u8,
    ssrc: u32,
    next_sequence_number: u16,
    max_payload_size: u16,
}

impl Packetizer {
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

    fn push(
        &mut self,
        out: &mut Vec<Bytes>,
        payload: Vec<u8>,
        timestamp: u32,
        mark: bool,
    ) -> Result<(), String> {
        let (raw, _) = RawPacketBuilder {
            sequence_number: self.next_sequence_number,
            timestamp,
            payload_type: self.payload_type,
            ssrc: self.ssrc,
            mark,
        }
        .build(payload)?;
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
        out.push(raw.0);
        Ok(())
    }

    pub(crate) fn packetize(
        &mut self,
        nalus: &[Bytes],
        timestamp: u32,
    ) -> Result<Vec<Bytes>, String> {
        if nalus.is_empty() {
            return Err("access unit with no NALs".into());
        }
        for nalu in nalus {
            if nalu.is_empty() {
                return Err("empty NAL".into());
            }
            if (nalu[0] >> 7) != 0 {
                return Err(format!("NAL header {:02x} has F bit set", nalu[0]));
            }
            if matches!(nalu[0] & 0b11111, 0 | 24..=31) {
                return Err(format!("NAL header {:02x} is not a valid single NAL type", nalu[0]));
            }
        }
        let max = usize::from(self.max_payload_size);
        let mut out = Vec::new();
        let mut i = 0;
        while i < nalus.len() {
            let nalu = &nalus[i];

            // Try to aggregate this NAL with following small ones.
            let mut agg_len = 1 + 2 + nalu.len();
            let mut j = i + 1;
            while j < nalus.len() && agg_len + 2 + nalus[j].len() <= max {
                agg_len += 2 + nalus[j].len();
                j += 1;
            }
            if j > i + 1 && agg_len <= max {
                // STAP-A of nalus[i..j].
                let mut payload = Vec::with_capacity(agg_len);
                let max_nri = nalus[i..j]
                    .iter()
                    .map(|n| n[0] & 0b0110_0000)
                    .max()
                    .expect("non-empty aggregate");
                payload.push(max_nri | NAL_STAP_A);
                for n in &nalus[i..j] {
                    payload.extend_from_slice(
                        &u16::try_from(n.len())
                            .map_err(|_| "NAL too long for STAP-A".to_owned())?
                            .to_be_bytes(),
                    );
                    payload.extend_from_slice(&n[..]);
                }
                let mark = j == nalus.len();
                self.push(&mut out, payload, timestamp, mark)?;
                i = j;
                continue;
            }
            if nalu.len() <= max {
                // Single NAL unit packet.
                let mark = i + 1 == nalus.len();
                self.push(&mut out, nalu.to_vec(), timestamp, mark)?;
                i += 1;
                continue;
            }

            // FU-A: fragment the NAL body (excluding its header byte) across
            // packets of at most `max` payload bytes each.
            let indicator = (nalu[0] & 0b0110_0000) | NAL_FU_A;
            let typ = nalu[0] & 0b11111;
            let body = &nalu[1..];
            let chunk_size = max - 2;
            let nchunks = body.len().div_ceil(chunk_size);
            debug_assert!(nchunks >= 2);
            for (ci, chunk) in body.chunks(chunk_size).enumerate() {
                let start = ci == 0;
                let end = ci + 1 == nchunks;
                let mut payload = Vec::with_capacity(2 + chunk.len());
                payload.push(indicator);
                payload.push(if start { 0b1000_0000 } else { 0 }
                    | if end { 0b0100_0000 } else { 0 }
                    | typ);
                payload.extend_from_slice(chunk);
                let mark = end && i + 1 == nalus.len();
                self.push(&mut out, payload, timestamp, mark)?;
            }
            i += 1;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use bytes::Bytes;

    use super::*;
    use crate::codec::CodecItem;
    use crate::rtp::ReceivedPacketBuilder;
    use crate::PacketContext;

    fn dummy_format() -> format::H264 {
        format::H264::from_fmtp(
            96,
            Some(
                "packetization-mode=1;profile-level-id=64001E;\
                 sprop-parameter-sets=Z2QAHqwsaoLA9puCgIKgAAADACAAAAMD0IAA,aO4xshsA",
            ),
        )
        .unwrap()
    }

    fn ts(timestamp: i64) -> crate::Timestamp {
        crate::Timestamp::new(timestamp, NonZeroU32::new(90_000).unwrap(), 0).unwrap()
    }

    fn pkt(sequence_number: u16, timestamp: i64, mark: bool, payload: &[u8]) -> ReceivedPacket {
        ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            sequence_number,
            timestamp: ts(timestamp),
            payload_type: 96,
            ssrc: 0x4cacc3d1,
            mark,
            loss: 0,
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    #[test]
    fn depacketize() {
        let mut d = Depacketizer::new(&dummy_format()).unwrap();
        d.push(pkt(0, 0, false, b"\x06plain")).unwrap(); // SEI
        assert!(d.pull().is_none());
        d.push(pkt(
            1,
            0,
            false,
            b"\x18\x00\x09\x06stap-a 1\x00\x09\x06stap-a 2",
        ))
        .unwrap();
        assert!(d.pull().is_none());
        d.push(pkt(2, 0, false, b"\x7c\x86fu-a start, ")).unwrap();
        assert!(d.pull().is_none());
        d.push(pkt(3, 0, false, b"\x7c\x06fu-a middle, ")).unwrap();
        assert!(d.pull().is_none());
        d.push(pkt(4, 0, true, b"\x7c\x46fu-a end")).unwrap();
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(frame)) => frame,
            _ => panic!(),
        };
        assert_eq!(
            &frame.data()[..],
            b"\x00\x00\x00\x06\x06plain\
              \x00\x00\x00\x09\x06stap-a 1\
              \x00\x00\x00\x09\x06stap-a 2\
              \x00\x00\x00\x22\x66fu-a start, fu-a middle, fu-a end"
        );
    }

    #[test]
    fn depacketize_idr_fu_a() {
        // Type 5 (IDR) split over three fragments: start, middle, end.
        let mut d = Depacketizer::new(&dummy_format()).unwrap();
        d.push(pkt(10, 0, false, b"\x7c\x85\xaa")).unwrap();
        assert!(d.pull().is_none());
        d.push(pkt(11, 0, false, b"\x7c\x05\xbb")).unwrap();
        assert!(d.pull().is_none());
        d.push(pkt(12, 0, true, b"\x7c\x45\xcc")).unwrap();
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(frame)) => frame,
            _ => panic!(),
        };
        assert_eq!(&frame.data()[..], b"\x00\x00\x00\x04\x65\xaa\xbb\xcc");
        assert!(frame.is_random_access_point());
    }

    #[test]
    fn depacketize_stap_a() {
        let mut d = Depacketizer::new(&dummy_format()).unwrap();
        d.push(pkt(
            0,
            0,
            true,
            b"\x18\x00\x02\x67\x42\x00\x04\x68\xce\x3c\x80",
        ))
        .unwrap();
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(frame)) => frame,
            _ => panic!(),
        };
        assert_eq!(
            &frame.data()[..],
            b"\x00\x00\x00\x02\x67\x42\x00\x00\x00\x04\x68\xce\x3c\x80"
        );
    }

    #[test]
    fn depacketize_rejects_inconsistent_fu_a() {
        let mut d = Depacketizer::new(&dummy_format()).unwrap();
        d.push(pkt(0, 0, false, b"\x7c\x85\xaa")).unwrap();
        // Type switches from 5 to 1 mid-fragment.
        d.push(pkt(1, 0, false, b"\x7c\x01\xbb")).unwrap_err();
    }

    #[test]
    fn depacketize_rejects_fu_a_end_without_start() {
        let mut d = Depacketizer::new(&dummy_format()).unwrap();
        d.push(pkt(0, 0, true, b"\x7c\x45\xcc")).unwrap_err();
    }

    #[test]
    fn depacketize_drops_fragment_on_loss() {
        let mut d = Depacketizer::new(&dummy_format()).unwrap();
        d.push(pkt(0, 0, false, b"\x7c\x85\xaa")).unwrap();
        // A gap, then a continuation fragment: dropped without error.
        let p = ReceivedPacketBuilder {
            ctx: PacketContext::dummy(),
            stream_id: 0,
            sequence_number: 5,
            timestamp: ts(0),
            payload_type: 96,
            ssrc: 0x4cacc3d1,
            mark: false,
            loss: 4,
        }
        .build(b"\x7c\x05\xbb".iter().copied())
        .unwrap();
        d.push(p).unwrap();
        assert!(d.pull().is_none());
    }

    #[test]
    fn packetize_single() {
        let mut p = Packetizer::new(96, 0x42, 1000, 1400);
        let nalus = vec![Bytes::from_static(b"\x65\x01\x02\x03")];
        let pkts = p.packetize(&nalus, 90_000).unwrap();
        assert_eq!(pkts.len(), 1);
        let (pkt, range) = crate::rtp::RawPacket::new(pkts[0].clone()).unwrap();
        assert!(pkt.mark());
        assert_eq!(pkt.sequence_number(), 1000);
        assert_eq!(pkt.timestamp(), 90_000);
        assert_eq!(&pkt.0[usize::from(range.start)..], b"\x65\x01\x02\x03");
    }

    #[test]
    fn packetize_stap_a() {
        let mut p = Packetizer::new(96, 0x42, 0, 1400);
        let nalus = vec![
            Bytes::from_static(b"\x67\x42"),
            Bytes::from_static(b"\x68\xce\x3c\x80"),
        ];
        let pkts = p.packetize(&nalus, 0).unwrap();
        assert_eq!(pkts.len(), 1);
        let (pkt, range) = crate::rtp::RawPacket::new(pkts[0].clone()).unwrap();
        assert_eq!(
            &pkt.0[usize::from(range.start)..],
            b"\x78\x00\x02\x67\x42\x00\x04\x68\xce\x3c\x80"
        );
    }

    #[test]
    fn round_trip_with_fragmentation() {
        const MAX_PAYLOAD: u16 = 100;
        let big_nal: Bytes = std::iter::once(0x65)
            .chain((0..500u32).map(|i| i as u8))
            .collect();
        let nalus = vec![
            Bytes::from_static(b"\x67\x42"),
            Bytes::from_static(b"\x68\xce\x3c\x80"),
            big_nal.clone(),
        ];
        let mut p = Packetizer::new(96, 0x42, 0xFFFE, MAX_PAYLOAD); // crosses seq wrap.
        let pkts = p.packetize(&nalus, 1234).unwrap();
        let mut d = Depacketizer::new(&dummy_format()).unwrap();
        for (i, raw) in pkts.iter().enumerate() {
            let (raw_pkt, range) = crate::rtp::RawPacket::new(raw.clone()).unwrap();
            assert!(range.len() <= usize::from(MAX_PAYLOAD), "pkt {i} too large");
            assert_eq!(raw_pkt.mark(), i + 1 == pkts.len());
            let pkt = ReceivedPacketBuilder {
                ctx: PacketContext::dummy(),
                stream_id: 0,
                sequence_number: raw_pkt.sequence_number(),
                timestamp: ts(1234),
                payload_type: 96,
                ssrc: 0x42,
                mark: raw_pkt.mark(),
                loss: 0,
            }
            .build(raw[usize::from(range.start)..].iter().copied())
            .unwrap();
            d.push(pkt).unwrap();
        }
        let frame = match d.pull() {
            Some(CodecItem::VideoFrame(frame)) => frame,
            _ => panic!(),
        };
        // Expect the three NALs back, 4-byte length prefixed.
        let mut expected = Vec::new();
        for nalu in &nalus {
            expected.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
            expected.extend_from_slice(&nalu[..]);
        }
        assert_eq!(&frame.data()[..], &expected[..]);
    }
}
