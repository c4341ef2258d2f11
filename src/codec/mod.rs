// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic (for audio, video, and application media types).
//!
//! This consists of RTP depacketization logic for each codec, as needed for a
//! client during `PLAY` and a server during `RECORD`, and the symmetric
//! packetization logic for the reverse directions.

use std::num::NonZeroU32;

use bytes::Bytes;

use crate::format::Format;
use crate::rtp::ReceivedPacket;

pub(crate) mod generic;
pub(crate) mod h264;
pub(crate) mod h265;
pub(crate) mod jpeg;
pub(crate) mod mpeg4_audio;
pub(crate) mod opus;
pub(crate) mod simple_audio;
pub(crate) mod vp8;
pub(crate) mod vp9;

/// An item yielded from a depacketizer.
#[derive(Debug)]
#[non_exhaustive]
pub enum CodecItem {
    VideoFrame(VideoFrame),
    AudioFrame(AudioFrame),
    GenericFrame(GenericFrame),
    Rtcp(crate::rtcp::ReceivedCompoundPacket),
}

/// Reference to parameters which describe a stream.
///
/// Parameters are often, but not always, available immediately after
/// `DESCRIBE`. They should always be available after the first frame. Video
/// streams' parameters may change mid-stream (in-band SPS/PPS updates); if
/// so, the frame which changed them will have `VideoFrame::has_new_parameters`
/// set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParametersRef<'a> {
    Video(&'a VideoParameters),
    Audio(&'a AudioParameters),
}

/// Parameters which describe a video stream.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VideoParameters {
    pub(crate) pixel_dimensions: (u16, u16),
    pub(crate) rfc6381_codec: String,

    /// The codec-specific "extra data" to feed to eg ffmpeg to decode the
    /// video frames.
    /// *   H.264: an AVCDecoderConfiguration.
    /// *   H.265: the VPS, SPS, and PPS NALs with four-byte length prefixes.
    pub(crate) extra_data: Bytes,
}

impl VideoParameters {
    /// Returns a codec description in
    /// [RFC-6381](https://tools.ietf.org/html/rfc6381) form, eg `avc1.4D401E`.
    pub fn rfc6381_codec(&self) -> &str {
        &self.rfc6381_codec
    }

    /// Returns the overall dimensions of the video frame in pixels, as
    /// `(width, height)`.
    pub fn pixel_dimensions(&self) -> (u32, u32) {
        let (width, height) = self.pixel_dimensions;
        (width.into(), height.into())
    }

    pub fn extra_data(&self) -> &[u8] {
        &self.extra_data
    }
}

impl std::fmt::Debug for VideoParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoParameters")
            .field("rfc6381_codec", &self.rfc6381_codec)
            .field("pixel_dimensions", &self.pixel_dimensions)
            .field(
                "extra_data",
                &crate::hex::LimitedHex::new(&self.extra_data, 256),
            )
            .finish()
    }
}

/// Parameters which describe an audio stream.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AudioParameters {
    pub(crate) rfc6381_codec: Option<String>,

    /// The length of each frame (in clock_rate units), if fixed.
    pub(crate) frame_length: Option<NonZeroU32>,
    pub(crate) clock_rate: u32,

    /// The codec-specific "extra data" to feed to eg ffmpeg to decode the
    /// audio.
    /// *   AAC: a serialized `AudioSpecificConfig`.
    pub(crate) extra_data: Vec<u8>,
}

impl std::fmt::Debug for AudioParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioParameters")
            .field("rfc6381_codec", &self.rfc6381_codec)
            .field("frame_length", &self.frame_length)
            .field(
                "extra_data",
                &crate::hex::LimitedHex::new(&self.extra_data, 256),
            )
            .finish()
    }
}

impl AudioParameters {
    pub fn rfc6381_codec(&self) -> Option<&str> {
        self.rfc6381_codec.as_deref()
    }

    pub fn frame_length(&self) -> Option<NonZeroU32> {
        self.frame_length
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn extra_data(&self) -> &[u8] {
        &self.extra_data
    }
}

/// An audio frame, which consists of one or more samples.
pub struct AudioFrame {
    pub(crate) ctx: crate::PacketContext,
    pub(crate) stream_id: usize,
    pub(crate) timestamp: crate::Timestamp,
    pub(crate) frame_length: NonZeroU32,
    pub(crate) loss: u16,
    pub(crate) data: Bytes,
}

impl AudioFrame {
    #[inline]
    pub fn ctx(&self) -> &crate::PacketContext {
        &self.ctx
    }

    #[inline]
    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    #[inline]
    pub fn timestamp(&self) -> crate::Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn frame_length(&self) -> NonZeroU32 {
        self.frame_length
    }

    /// Returns the number of lost RTP packets before this audio frame. See
    /// [`crate::rtp::ReceivedPacket::loss`].
    ///
    /// Note that if loss occurs during a fragmented frame, more than this
    /// number of packets' worth of data may be skipped.
    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("stream_id", &self.stream_id)
            .field("ctx", &self.ctx)
            .field("loss", &self.loss)
            .field("timestamp", &self.timestamp)
            .field("frame_length", &self.frame_length)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// A frame of an unrecognized format, passed through as-is.
pub struct GenericFrame {
    pub(crate) ctx: crate::PacketContext,
    pub(crate) timestamp: crate::Timestamp,
    pub(crate) stream_id: usize,
    pub(crate) loss: u16,
    pub(crate) mark: bool,
    pub(crate) data: Bytes,
}

impl std::fmt::Debug for GenericFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericFrame")
            .field("ctx", &self.ctx)
            .field("stream_id", &self.stream_id)
            .field("loss", &self.loss)
            .field("timestamp", &self.timestamp)
            .field("mark", &self.mark)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

impl GenericFrame {
    #[inline]
    pub fn ctx(&self) -> &crate::PacketContext {
        &self.ctx
    }

    #[inline]
    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    #[inline]
    pub fn timestamp(&self) -> crate::Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.mark
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A single video frame (aka video sample or video access unit).
///
/// Typically this is an encoded picture. It could also be a single field of
/// an interlaced picture.
///
/// Durations aren't specified here; they can be calculated from the timestamp
/// of a following picture, or approximated via the frame rate.
pub struct VideoFrame {
    // A pair of contexts: for the start and for the end.
    // Having both can be useful to measure the total time elapsed while
    // receiving the frame.
    pub(crate) start_ctx: crate::PacketContext,
    pub(crate) end_ctx: crate::PacketContext,

    pub(crate) has_new_parameters: bool,
    pub(crate) loss: u16,
    pub(crate) timestamp: crate::Timestamp,
    pub(crate) stream_id: usize,
    pub(crate) is_random_access_point: bool,
    pub(crate) is_disposable: bool,
    pub(crate) data: Vec<u8>,
}

impl VideoFrame {
    #[inline]
    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    /// Returns true if this frame set new video parameters.
    #[inline]
    pub fn has_new_parameters(&self) -> bool {
        self.has_new_parameters
    }

    /// Returns the number of lost RTP packets before this video frame. See
    /// [`crate::rtp::ReceivedPacket::loss`].
    ///
    /// Note that if loss occurs during a fragmented frame, more than this
    /// number of packets' worth of data may be skipped.
    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    /// Returns this picture's timestamp in the time base associated with the
    /// stream.
    #[inline]
    pub fn timestamp(&self) -> crate::Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn start_ctx(&self) -> &crate::PacketContext {
        &self.start_ctx
    }

    #[inline]
    pub fn end_ctx(&self) -> &crate::PacketContext {
        &self.end_ctx
    }

    /// Returns if this is a "random access point (RAP)" aka "instantaneous
    /// decoding refresh (IDR)" picture.
    ///
    /// The former is defined in ISO/IEC 14496-12; the latter in H.264. Both
    /// mean that this picture can be decoded without any other AND no pictures
    /// following this one depend on any pictures before this one.
    #[inline]
    pub fn is_random_access_point(&self) -> bool {
        self.is_random_access_point
    }

    /// Returns if no other pictures require this one to be decoded correctly.
    ///
    /// In H.264 terms, this is a frame with `nal_ref_idc == 0`.
    #[inline]
    pub fn is_disposable(&self) -> bool {
        self.is_disposable
    }

    /// Returns the data in a codec-specific format.
    ///
    /// For H.264 and H.265, each NAL is encoded as a `u32` length in
    /// big-endian format followed by the actual contents of the NAL
    /// (including "emulation prevention three" bytes). For other codecs, the
    /// encoded frame as-is.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("timestamp", &self.timestamp)
            .field("start_ctx", &self.start_ctx)
            .field("end_ctx", &self.end_ctx)
            .field("loss", &self.loss)
            .field("has_new_parameters", &self.has_new_parameters)
            .field("is_random_access_point", &self.is_random_access_point)
            .field("is_disposable", &self.is_disposable)
            .field("data", &crate::hex::LimitedHex::new(&self.data, 64))
            .finish()
    }
}

/// Turns RTP packets into [`CodecItem`]s.
#[derive(Debug)]
pub struct Depacketizer(DepacketizerInner);

#[derive(Debug)]
enum DepacketizerInner {
    H264(Box<h264::Depacketizer>),
    H265(Box<h265::Depacketizer>),
    Vp8(Box<vp8::Depacketizer>),
    Vp9(Box<vp9::Depacketizer>),
    Mpeg4Audio(Box<mpeg4_audio::Depacketizer>),
    Mpeg4AudioLatm(Box<mpeg4_audio::LatmDepacketizer>),
    Opus(Box<opus::Depacketizer>),
    SimpleAudio(Box<simple_audio::Depacketizer>),
    Jpeg(Box<jpeg::Depacketizer>),
    Generic(Box<generic::Depacketizer>),
}

impl Depacketizer {
    /// Creates a depacketizer for the given format.
    pub fn new(format: &Format) -> Result<Self, String> {
        Ok(Depacketizer(match format {
            Format::H264(f) => DepacketizerInner::H264(Box::new(h264::Depacketizer::new(f)?)),
            Format::H265(f) => DepacketizerInner::H265(Box::new(h265::Depacketizer::new(f)?)),
            Format::Vp8(_) => DepacketizerInner::Vp8(Box::default()),
            Format::Vp9(_) => DepacketizerInner::Vp9(Box::default()),
            Format::Mpeg4Audio(f) => {
                DepacketizerInner::Mpeg4Audio(Box::new(mpeg4_audio::Depacketizer::new(f)?))
            }
            Format::Mpeg4AudioLatm(f) => {
                DepacketizerInner::Mpeg4AudioLatm(Box::new(mpeg4_audio::LatmDepacketizer::new(f)?))
            }
            Format::Opus(_) => DepacketizerInner::Opus(Box::default()),
            Format::G711(_) | Format::G722(_) => DepacketizerInner::SimpleAudio(Box::new(
                simple_audio::Depacketizer::new(format.clock_rate(), 8),
            )),
            Format::Jpeg(_) => DepacketizerInner::Jpeg(Box::default()),
            Format::Generic(_) => DepacketizerInner::Generic(Box::default()),
        }))
    }

    /// Returns the current codec parameters, if known.
    pub fn parameters(&self) -> Option<ParametersRef<'_>> {
        match &self.0 {
            DepacketizerInner::H264(d) => d.parameters(),
            DepacketizerInner::H265(d) => d.parameters(),
            DepacketizerInner::Vp8(d) => d.parameters(),
            DepacketizerInner::Vp9(d) => d.parameters(),
            DepacketizerInner::Mpeg4Audio(d) => d.parameters(),
            DepacketizerInner::Mpeg4AudioLatm(d) => d.parameters(),
            DepacketizerInner::Opus(d) => d.parameters(),
            DepacketizerInner::SimpleAudio(d) => d.parameters(),
            DepacketizerInner::Jpeg(d) => d.parameters(),
            DepacketizerInner::Generic(d) => d.parameters(),
        }
    }

    /// Supplies a new packet to the depacketizer.
    ///
    /// Depacketizers are not required to buffer unbounded numbers of packets.
    /// Between any two calls to `push`, the caller must call `pull` until
    /// `pull` returns `None`. The later `push` call may panic or drop data if
    /// this expectation is violated.
    pub fn push(&mut self, input: ReceivedPacket) -> Result<(), String> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.push(input),
            DepacketizerInner::H265(d) => d.push(input),
            DepacketizerInner::Vp8(d) => d.push(input),
            DepacketizerInner::Vp9(d) => d.push(input),
            DepacketizerInner::Mpeg4Audio(d) => d.push(input),
            DepacketizerInner::Mpeg4AudioLatm(d) => d.push(input),
            DepacketizerInner::Opus(d) => d.push(input),
            DepacketizerInner::SimpleAudio(d) => d.push(input),
            DepacketizerInner::Jpeg(d) => d.push(input),
            DepacketizerInner::Generic(d) => d.push(input),
        }
    }

    /// Retrieves a completed frame from the depacketizer.
    ///
    /// Some packetization formats support aggregating multiple frames into
    /// one packet, so a single `push` call may cause `pull` to return
    /// `Some(...)` more than once.
    pub fn pull(&mut self) -> Option<CodecItem> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.pull(),
            DepacketizerInner::H265(d) => d.pull(),
            DepacketizerInner::Vp8(d) => d.pull(),
            DepacketizerInner::Vp9(d) => d.pull(),
            DepacketizerInner::Mpeg4Audio(d) => d.pull(),
            DepacketizerInner::Mpeg4AudioLatm(d) => d.pull(),
            DepacketizerInner::Opus(d) => d.pull(),
            DepacketizerInner::SimpleAudio(d) => d.pull(),
            DepacketizerInner::Jpeg(d) => d.pull(),
            DepacketizerInner::Generic(d) => d.pull(),
        }
    }
}

/// One media frame to be packetized.
#[derive(Copy, Clone)]
pub enum FrameRef<'a> {
    /// An H.264/H.265 access unit: one or more NAL units, without length
    /// prefixes or Annex B start codes.
    AccessUnit(&'a [Bytes]),

    /// An opaque frame for codecs without sub-frame structure.
    Raw(&'a [u8]),
}

/// Turns media frames into ready-to-send RTP packets.
///
/// Each produced packet is a complete RTP packet (header included) whose
/// payload is no larger than the configured maximum payload size. The
/// sequence number starts at a random value and increments by one per packet.
#[derive(Debug)]
pub struct Packetizer(PacketizerInner);

#[derive(Debug)]
enum PacketizerInner {
    H264(h264::Packetizer),
    H265(h265::Packetizer),
    Vp8(vp8::Packetizer),
    Vp9(vp9::Packetizer),
    Mpeg4Audio(mpeg4_audio::Packetizer),
    Mpeg4AudioLatm(mpeg4_audio::LatmPacketizer),
    SimpleAudio(simple_audio::Packetizer),
    Generic(generic::Packetizer),
    Jpeg(jpeg::Packetizer),
}

impl Packetizer {
    /// Creates a packetizer for the given format.
    ///
    /// `max_payload_size` bounds each packet's RTP payload; the 12-byte RTP
    /// header is added on top.
    pub fn new(format: &Format, ssrc: u32, max_payload_size: u16) -> Result<Self, String> {
        use rand::Rng;
        let initial_sequence_number: u16 = rand::thread_rng().gen();
        Self::with_sequence_number(format, ssrc, max_payload_size, initial_sequence_number)
    }

    #[doc(hidden)]
    pub fn with_sequence_number(
        format: &Format,
        ssrc: u32,
        max_payload_size: u16,
        initial_sequence_number: u16,
    ) -> Result<Self, String> {
        if usize::from(max_payload_size) + 12 > crate::MAX_UDP_PACKET_SIZE {
            return Err(format!(
                "max payload size {max_payload_size} too large for a UDP transport"
            ));
        }
        let payload_type = format.payload_type();
        Ok(Packetizer(match format {
            Format::H264(_) => PacketizerInner::H264(h264::Packetizer::new(
                payload_type,
                ssrc,
                initial_sequence_number,
                max_payload_size,
            )),
            Format::H265(_) => PacketizerInner::H265(h265::Packetizer::new(
                payload_type,
                ssrc,
                initial_sequence_number,
                max_payload_size,
            )),
            Format::Vp8(_) => PacketizerInner::Vp8(vp8::Packetizer::new(
                payload_type,
                ssrc,
                initial_sequence_number,
                max_payload_size,
            )),
            Format::Vp9(_) => PacketizerInner::Vp9(vp9::Packetizer::new(
                payload_type,
                ssrc,
                initial_sequence_number,
                max_payload_size,
            )),
            Format::Mpeg4Audio(f) => PacketizerInner::Mpeg4Audio(mpeg4_audio::Packetizer::new(
                f,
                ssrc,
                initial_sequence_number,
                max_payload_size,
            )?),
            Format::Mpeg4AudioLatm(_) => PacketizerInner::Mpeg4AudioLatm(
                mpeg4_audio::LatmPacketizer::new(payload_type, ssrc, initial_sequence_number, max_payload_size),
            ),
            Format::G711(_) | Format::G722(_) => {
                PacketizerInner::SimpleAudio(simple_audio::Packetizer::new(
                    payload_type,
                    ssrc,
                    initial_sequence_number,
                    max_payload_size,
                    8,
                    format.clock_rate(),
                ))
            }
            Format::Opus(_) | Format::Generic(_) => PacketizerInner::Generic(
                generic::Packetizer::new(payload_type, ssrc, initial_sequence_number, max_payload_size, true),
            ),
            Format::Jpeg(_) => PacketizerInner::Jpeg(jpeg::Packetizer::new(
                ssrc,
                initial_sequence_number,
                max_payload_size,
            )),
        }))
    }

    /// Packetizes one frame, returning complete RTP packets in send order.
    ///
    /// `timestamp` is the frame's RTP timestamp in the format's clock rate.
    pub fn packetize(&mut self, frame: FrameRef<'_>, timestamp: u32) -> Result<Vec<Bytes>, String> {
        match (&mut self.0, frame) {
            (PacketizerInner::H264(p), FrameRef::AccessUnit(nalus)) => {
                p.packetize(nalus, timestamp)
            }
            (PacketizerInner::H265(p), FrameRef::AccessUnit(nalus)) => {
                p.packetize(nalus, timestamp)
            }
            (PacketizerInner::Vp8(p), FrameRef::Raw(data)) => p.packetize(data, timestamp),
            (PacketizerInner::Vp9(p), FrameRef::Raw(data)) => p.packetize(data, timestamp),
            (PacketizerInner::Mpeg4Audio(p), FrameRef::Raw(data)) => p.packetize(data, timestamp),
            (PacketizerInner::Mpeg4AudioLatm(p), FrameRef::Raw(data)) => {
                p.packetize(data, timestamp)
            }
            (PacketizerInner::SimpleAudio(p), FrameRef::Raw(data)) => p.packetize(data, timestamp),
            (PacketizerInner::Generic(p), FrameRef::Raw(data)) => p.packetize(data, timestamp),
            (PacketizerInner::Jpeg(p), FrameRef::Raw(data)) => p.packetize(data, timestamp),
            (_, FrameRef::AccessUnit(_)) => {
                Err("this codec expects FrameRef::Raw input".to_owned())
            }
            (_, FrameRef::Raw(_)) => Err("this codec expects FrameRef::AccessUnit input".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // See with: cargo test -- --nocapture codec::tests::print_sizes
    #[test]
    fn print_sizes() {
        crate::testutil::init_logging();
        for (name, size) in &[
            ("Depacketizer", std::mem::size_of::<Depacketizer>()),
            (
                "h264::Depacketizer",
                std::mem::size_of::<h264::Depacketizer>(),
            ),
            (
                "h265::Depacketizer",
                std::mem::size_of::<h265::Depacketizer>(),
            ),
            (
                "mpeg4_audio::Depacketizer",
                std::mem::size_of::<mpeg4_audio::Depacketizer>(),
            ),
            (
                "simple_audio::Depacketizer",
                std::mem::size_of::<simple_audio::Depacketizer>(),
            ),
            ("CodecItem", std::mem::size_of::<CodecItem>()),
            ("VideoFrame", std::mem::size_of::<VideoFrame>()),
            ("AudioFrame", std::mem::size_of::<AudioFrame>()),
            ("GenericFrame", std::mem::size_of::<GenericFrame>()),
        ] {
            log::info!("{name:-40} {size:4}");
        }
    }
}
