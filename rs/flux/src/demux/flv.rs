use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
	AccessUnit,
	codec::{AacConfig, AudioCodec, Family, H264, H265, START_CODE, length_prefixed_to_annexb, opus_head, split_annexb},
	demux::{DemuxConfig, Metadata},
};

const FILE_HEADER: usize = 13;
const TAG_HEADER: usize = 11;
const PREVIOUS_TAG_SIZE: usize = 4;

const TAG_AUDIO: u8 = 8;
const TAG_VIDEO: u8 = 9;
const TAG_SCRIPT: u8 = 18;

/// The decoder configuration record from a video sequence header.
#[derive(Debug, Clone)]
struct VideoConfig {
	family: Family,
	length_size: usize,
	// Annex B, with 4 byte start codes.
	parameter_sets: Bytes,
	codec: String,
}

#[derive(Debug, Clone)]
struct AacState {
	config: AacConfig,
	description: Bytes,
}

#[derive(Debug, Clone)]
struct OpusState {
	head: Bytes,
	channels: u8,
}

enum VideoPacket {
	Config,
	Frames,
}

/// Demuxes FLV, including the enhanced RTMP video and audio headers.
pub struct Flv {
	buffer: BytesMut,

	// The 13 byte file header has been consumed.
	started: bool,

	video: Option<VideoConfig>,
	aac: Option<AacState>,
	opus: Option<OpusState>,

	pub(crate) metadata: Metadata,
}

impl Flv {
	pub fn new(config: DemuxConfig) -> Self {
		Self {
			buffer: BytesMut::new(),
			started: false,
			video: None,
			aac: None,
			opus: None,
			metadata: Metadata::new(config.metadata),
		}
	}

	/// The video codec string from the last sequence header.
	pub fn video_codec(&self) -> Option<&str> {
		self.video.as_ref().map(|v| v.codec.as_str())
	}

	pub fn demux(&mut self, chunk: &[u8]) -> Vec<AccessUnit> {
		self.buffer.extend_from_slice(chunk);

		let mut units = Vec::new();

		if !self.started {
			if self.buffer.len() < FILE_HEADER {
				return units;
			}

			if self.buffer.starts_with(b"FLV") {
				self.buffer.advance(FILE_HEADER);
			} else {
				tracing::debug!("no flv file header, assuming a bare tag stream");
			}
			self.started = true;
		}

		while self.buffer.len() >= TAG_HEADER {
			let tag_type = self.buffer[0] & 0x1f;
			let stream_id = &self.buffer[8..11];

			if !matches!(tag_type, TAG_AUDIO | TAG_VIDEO | TAG_SCRIPT) || stream_id != [0, 0, 0] {
				tracing::trace!(tag_type, "invalid tag header, resyncing");
				self.buffer.advance(1);
				continue;
			}

			let size = u24(&self.buffer[1..4]);
			let total = TAG_HEADER + size + PREVIOUS_TAG_SIZE;
			if self.buffer.len() < total {
				break;
			}

			let tag = self.buffer.split_to(total).freeze();
			let timestamp = ((tag[7] as i64) << 24) | u24(&tag[4..7]) as i64;
			let body = tag.slice(TAG_HEADER..TAG_HEADER + size);

			match tag_type {
				TAG_VIDEO => self.video(timestamp, body, &mut units),
				TAG_AUDIO => self.audio(timestamp, body, &mut units),
				_ => tracing::trace!(size, "skipping script tag"),
			}
		}

		units
	}

	/// Tags are self-delimiting, so there is never anything to flush.
	pub fn flush(&mut self) -> Vec<AccessUnit> {
		if !self.buffer.is_empty() {
			tracing::debug!(remaining = self.buffer.len(), "discarding partial tag");
			self.buffer.clear();
		}
		Vec::new()
	}

	fn video(&mut self, timestamp: i64, body: Bytes, units: &mut Vec<AccessUnit>) {
		let Some(&header) = body.first() else {
			return;
		};

		let keyframe = (header >> 4) & 0x07 == 1;

		let (family, packet, cts, data) = if header & 0x80 != 0 {
			// Enhanced RTMP: the low nibble is the packet type, followed by a FourCC.
			if body.len() < 5 {
				return;
			}

			let family = match &body[1..5] {
				b"avc1" => Family::H264,
				b"hvc1" => Family::H265,
				fourcc => {
					tracing::trace!(fourcc = ?String::from_utf8_lossy(fourcc), "unsupported video fourcc");
					return;
				}
			};

			match header & 0x0f {
				0 => (family, VideoPacket::Config, 0, body.slice(5..)),
				1 if body.len() >= 8 => (family, VideoPacket::Frames, i24(&body[5..8]), body.slice(8..)),
				// CodedFramesX: composition time is implicitly zero.
				3 => (family, VideoPacket::Frames, 0, body.slice(5..)),
				_ => return,
			}
		} else {
			let family = match header & 0x0f {
				7 => Family::H264,
				12 => Family::H265,
				codec_id => {
					tracing::trace!(codec_id, "unsupported video codec");
					return;
				}
			};

			if body.len() < 5 {
				return;
			}

			let packet = match body[1] {
				0 => VideoPacket::Config,
				1 => VideoPacket::Frames,
				_ => return,
			};

			(family, packet, i24(&body[2..5]), body.slice(5..))
		};

		match packet {
			VideoPacket::Config => {
				let config = match family {
					Family::H264 => parse_avcc(&data),
					Family::H265 => parse_hvcc(&data),
				};

				match config {
					Some(config) => {
						tracing::debug!(codec = %config.codec, "video sequence header");
						self.video = Some(config);
					}
					None => tracing::debug!(?family, size = data.len(), "invalid decoder configuration record"),
				}
			}
			VideoPacket::Frames => {
				let length_size = match &self.video {
					Some(config) if config.family == family => config.length_size,
					_ => 4,
				};

				let mut frame = BytesMut::with_capacity(data.len() + 64);
				if length_prefixed_to_annexb(&data, length_size, &mut frame) == 0 {
					return;
				}

				let payload = match &self.video {
					Some(config) if keyframe && config.family == family && !has_sps(family, &frame) => {
						let mut payload = BytesMut::with_capacity(config.parameter_sets.len() + frame.len());
						payload.put_slice(&config.parameter_sets);
						payload.put_slice(&frame);
						payload.freeze()
					}
					_ => frame.freeze(),
				};

				let timestamp = timestamp + cts as i64;
				self.metadata.sei_in(family, &payload, timestamp);

				let mut unit = AccessUnit::video(timestamp, keyframe, payload);
				unit.codec = self.video.as_ref().map(|c| c.codec.clone());
				units.push(unit);
			}
		}
	}

	fn audio(&mut self, timestamp: i64, body: Bytes, units: &mut Vec<AccessUnit>) {
		let Some(&header) = body.first() else {
			return;
		};

		match header >> 4 {
			// AAC
			10 => {
				if body.len() < 2 {
					return;
				}
				match body[1] {
					0 => self.aac_config(body.slice(2..)),
					_ => self.aac_frame(timestamp, body.slice(2..), units),
				}
			}
			// Enhanced RTMP audio: the low nibble is the packet type, followed by a FourCC.
			9 => {
				if body.len() < 5 {
					return;
				}
				let sequence_start = header & 0x0f == 0;
				let data = body.slice(5..);

				match (&body[1..5], sequence_start) {
					(b"Opus", true) => self.opus_head(data),
					(b"Opus", false) => self.opus_frame(timestamp, data, units),
					(b"mp4a", true) => self.aac_config(data),
					(b"mp4a", false) => self.aac_frame(timestamp, data, units),
					(fourcc, _) => {
						tracing::trace!(fourcc = ?String::from_utf8_lossy(fourcc), "unsupported audio fourcc")
					}
				}
			}
			// Opus without the enhanced header: the first packet is the OpusHead.
			13 => {
				let data = body.slice(1..);
				match self.opus {
					None => self.opus_head(data),
					Some(_) => self.opus_frame(timestamp, data, units),
				}
			}
			format @ (7 | 8) => {
				let codec = if format == 7 { AudioCodec::Alaw } else { AudioCodec::Ulaw };
				let mut unit = AccessUnit::audio(timestamp, body.slice(1..)).with_codec(codec.to_string());
				unit.sample_rate = Some(8000);
				unit.channels = Some(if header & 0x01 != 0 { 2 } else { 1 });
				units.push(unit);
			}
			2 => units.push(AccessUnit::audio(timestamp, body.slice(1..)).with_codec(AudioCodec::Mp3.to_string())),
			format => tracing::trace!(format, "unsupported sound format"),
		}
	}

	fn aac_config(&mut self, description: Bytes) {
		match AacConfig::parse(&description) {
			Some(config) => {
				tracing::debug!(codec = %config.codec(), rate = config.sample_rate(), "aac sequence header");
				self.aac = Some(AacState { config, description });
			}
			None => tracing::debug!(size = description.len(), "invalid AudioSpecificConfig"),
		}
	}

	fn aac_frame(&mut self, timestamp: i64, payload: Bytes, units: &mut Vec<AccessUnit>) {
		let Some(aac) = &self.aac else {
			tracing::trace!("aac frame before sequence header");
			return;
		};

		let mut unit = AccessUnit::audio(timestamp, payload).with_codec(aac.config.codec().to_string());
		unit.sample_rate = Some(aac.config.sample_rate());
		unit.channels = Some(aac.config.channels);
		unit.description = Some(aac.description.clone());
		units.push(unit);
	}

	fn opus_head(&mut self, head: Bytes) {
		let channels = match opus_head(&head) {
			Some((channels, _)) => channels,
			None => {
				tracing::debug!(size = head.len(), "invalid OpusHead, assuming stereo");
				2
			}
		};
		self.opus = Some(OpusState { head, channels });
	}

	fn opus_frame(&mut self, timestamp: i64, payload: Bytes, units: &mut Vec<AccessUnit>) {
		let mut unit = AccessUnit::audio(timestamp, payload).with_codec(AudioCodec::Opus.to_string());
		// Opus always decodes at 48kHz, whatever the input rate was.
		unit.sample_rate = Some(48000);
		if let Some(opus) = &self.opus {
			unit.channels = Some(opus.channels);
			unit.description = Some(opus.head.clone());
		}
		units.push(unit);
	}
}

fn u24(b: &[u8]) -> usize {
	((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize
}

// A signed 24 bit composition time offset.
fn i24(b: &[u8]) -> i32 {
	(((b[0] as i32) << 24) | ((b[1] as i32) << 16) | ((b[2] as i32) << 8)) >> 8
}

fn has_sps(family: Family, annexb: &[u8]) -> bool {
	split_annexb(annexb).any(|nal| match family {
		Family::H264 => family.nal_type(nal) == Some(7),
		Family::H265 => family.nal_type(nal) == Some(33),
	})
}

// Read a NAL unit prefixed with a 16 bit length.
fn read_nal(data: &[u8]) -> Option<(&[u8], &[u8])> {
	let [hi, lo, rest @ ..] = data else {
		return None;
	};
	let size = u16::from_be_bytes([*hi, *lo]) as usize;
	(size <= rest.len()).then(|| rest.split_at(size))
}

fn put_nal(out: &mut BytesMut, nal: &[u8]) {
	out.put_slice(&START_CODE);
	out.put_slice(nal);
}

// AVCDecoderConfigurationRecord, ISO/IEC 14496-15 5.3.3.1
fn parse_avcc(data: &[u8]) -> Option<VideoConfig> {
	if data.len() < 6 {
		return None;
	}

	let codec = H264 {
		profile: data[1],
		constraints: data[2],
		level: data[3],
	};
	let length_size = (data[4] & 0x03) as usize + 1;

	let mut parameter_sets = BytesMut::new();
	let mut rest = &data[5..];

	let count = rest.first()? & 0x1f;
	rest = &rest[1..];
	for _ in 0..count {
		let (nal, next) = read_nal(rest)?;
		put_nal(&mut parameter_sets, nal);
		rest = next;
	}

	let count = *rest.first()?;
	rest = &rest[1..];
	for _ in 0..count {
		let (nal, next) = read_nal(rest)?;
		put_nal(&mut parameter_sets, nal);
		rest = next;
	}

	Some(VideoConfig {
		family: Family::H264,
		length_size,
		parameter_sets: parameter_sets.freeze(),
		codec: codec.to_string(),
	})
}

// HEVCDecoderConfigurationRecord, ISO/IEC 14496-15 8.3.3.1
fn parse_hvcc(data: &[u8]) -> Option<VideoConfig> {
	if data.len() < 23 {
		return None;
	}

	let constraint_flags = data[6..12].iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
	let codec = H265 {
		// The parameter sets are prepended to keyframes, so they are in-band as far as the decoder knows.
		in_band: true,
		profile_space: data[1] >> 6,
		tier_flag: (data[1] >> 5) & 0x01 == 1,
		profile_idc: data[1] & 0x1f,
		profile_compatibility_flags: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
		constraint_flags,
		level_idc: data[12],
	};
	let length_size = (data[21] & 0x03) as usize + 1;

	let mut parameter_sets = BytesMut::new();
	let arrays = data[22];
	let mut rest = &data[23..];

	for _ in 0..arrays {
		let [_nal_type, hi, lo, next @ ..] = rest else {
			return None;
		};
		let count = u16::from_be_bytes([*hi, *lo]);
		rest = next;

		for _ in 0..count {
			let (nal, next) = read_nal(rest)?;
			put_nal(&mut parameter_sets, nal);
			rest = next;
		}
	}

	Some(VideoConfig {
		family: Family::H265,
		length_size,
		parameter_sets: parameter_sets.freeze(),
		codec: codec.to_string(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::demux::MetadataEvent;

	const SPS: &[u8] = &[0x67, 0x42, 0xe0, 0x1e, 0xab];
	const PPS: &[u8] = &[0x68, 0xce, 0x38, 0x80];

	fn header() -> Vec<u8> {
		vec![b'F', b'L', b'V', 1, 0x05, 0, 0, 0, 9, 0, 0, 0, 0]
	}

	fn tag(tag_type: u8, timestamp: u32, body: &[u8]) -> Vec<u8> {
		let size = body.len() as u32;
		let mut tag = vec![
			tag_type,
			(size >> 16) as u8,
			(size >> 8) as u8,
			size as u8,
			(timestamp >> 16) as u8,
			(timestamp >> 8) as u8,
			timestamp as u8,
			(timestamp >> 24) as u8,
			0,
			0,
			0,
		];
		tag.extend_from_slice(body);
		tag.extend_from_slice(&(size + 11).to_be_bytes());
		tag
	}

	fn avc_config() -> Vec<u8> {
		let mut body = vec![0x17, 0, 0, 0, 0];
		body.extend_from_slice(&[1, 0x42, 0xe0, 0x1e, 0xff, 0xe1]);
		body.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
		body.extend_from_slice(SPS);
		body.push(1);
		body.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
		body.extend_from_slice(PPS);
		body
	}

	fn avc_frame(keyframe: bool, cts: i32, nals: &[&[u8]]) -> Vec<u8> {
		let frame_type = if keyframe { 0x10 } else { 0x20 };
		let mut body = vec![frame_type | 7, 1];
		body.extend_from_slice(&cts.to_be_bytes()[1..]);
		for nal in nals {
			body.extend_from_slice(&(nal.len() as u32).to_be_bytes());
			body.extend_from_slice(nal);
		}
		body
	}

	fn stream() -> Vec<u8> {
		[
			header(),
			tag(TAG_SCRIPT, 0, b"onMetaData"),
			tag(TAG_VIDEO, 0, &avc_config()),
			tag(TAG_VIDEO, 0, &avc_frame(true, 0, &[&[0x65, 0x88, 0x84]])),
			tag(TAG_VIDEO, 40, &avc_frame(false, 40, &[&[0x41, 0x9a, 0x02]])),
		]
		.concat()
	}

	fn run(chunks: &[&[u8]]) -> Vec<AccessUnit> {
		let mut flv = Flv::new(DemuxConfig::default());
		chunks.iter().flat_map(|chunk| flv.demux(chunk)).collect()
	}

	#[test]
	fn config_keyframe_delta() {
		let units = run(&[&stream()]);

		assert_eq!(units.len(), 2);
		assert!(units[0].keyframe);
		assert!(!units[1].keyframe);
		assert_eq!(units[0].codec.as_deref(), Some("avc1.42E01E"));

		let expected = [&[0, 0, 0, 1][..], SPS, &[0, 0, 0, 1][..], PPS, &[0, 0, 0, 1, 0x65, 0x88, 0x84][..]].concat();
		assert_eq!(units[0].payload.as_ref(), expected.as_slice());
		assert_eq!(units[1].payload.as_ref(), &[0, 0, 0, 1, 0x41, 0x9a, 0x02]);

		// The composition time offset is added to the decode time.
		assert_eq!(units[1].timestamp, 80);
	}

	#[test]
	fn any_split_point() {
		let data = stream();
		let expected = run(&[&data]);

		for split in 0..=data.len() {
			let (a, b) = data.split_at(split);
			assert_eq!(run(&[a, b]), expected, "split at {split}");
		}
	}

	#[test]
	fn extended_timestamp() {
		let data = [header(), tag(TAG_VIDEO, 0x0100_0010, &avc_frame(false, 0, &[&[0x41, 0x9a]]))].concat();
		let units = run(&[&data]);
		assert_eq!(units[0].timestamp, 0x0100_0010);
	}

	#[test]
	fn negative_composition_time() {
		let data = [header(), tag(TAG_VIDEO, 100, &avc_frame(false, -20, &[&[0x41, 0x9a]]))].concat();
		let units = run(&[&data]);
		assert_eq!(units[0].timestamp, 80);
	}

	#[test]
	fn resyncs_on_garbage() {
		let data = [
			header(),
			vec![0xee, 0xee],
			tag(TAG_VIDEO, 0, &avc_frame(false, 0, &[&[0x41, 0x9a]])),
		]
		.concat();
		assert_eq!(run(&[&data]).len(), 1);
	}

	#[test]
	fn aac() {
		let data = [
			header(),
			tag(TAG_AUDIO, 0, &[0xaf, 0, 0x12, 0x10]),
			tag(TAG_AUDIO, 23, &[0xaf, 1, 0xde, 0xad]),
		]
		.concat();
		let units = run(&[&data]);

		assert_eq!(units.len(), 1);
		let unit = &units[0];
		assert!(unit.is_audio());
		assert_eq!(unit.timestamp, 23);
		assert_eq!(unit.codec.as_deref(), Some("mp4a.40.2"));
		assert_eq!(unit.sample_rate, Some(44100));
		assert_eq!(unit.channels, Some(2));
		assert_eq!(unit.description.as_deref(), Some(&[0x12, 0x10][..]));
		assert_eq!(unit.payload.as_ref(), &[0xde, 0xad]);
	}

	#[test]
	fn aac_before_config_dropped() {
		let data = [header(), tag(TAG_AUDIO, 0, &[0xaf, 1, 0xde, 0xad])].concat();
		assert!(run(&[&data]).is_empty());
	}

	#[test]
	fn opus_first_packet_is_header() {
		let mut head = b"OpusHead".to_vec();
		head.extend_from_slice(&[1, 1, 0x38, 0x01, 0x80, 0xbb, 0, 0, 0, 0, 0]);

		let data = [
			header(),
			tag(TAG_AUDIO, 0, &[&[0xd0][..], &head[..]].concat()),
			tag(TAG_AUDIO, 20, &[0xd0, 0xfc, 0xff]),
		]
		.concat();
		let units = run(&[&data]);

		assert_eq!(units.len(), 1);
		assert_eq!(units[0].codec.as_deref(), Some("opus"));
		assert_eq!(units[0].channels, Some(1));
		assert_eq!(units[0].sample_rate, Some(48000));
		assert_eq!(units[0].payload.as_ref(), &[0xfc, 0xff]);
	}

	#[test]
	fn g711() {
		let data = [header(), tag(TAG_AUDIO, 0, &[0x72, 0xd5, 0xd5]), tag(TAG_AUDIO, 20, &[0x82, 0xff])].concat();
		let units = run(&[&data]);

		assert_eq!(units[0].codec.as_deref(), Some("alaw"));
		assert_eq!(units[1].codec.as_deref(), Some("ulaw"));
		assert_eq!(units[0].sample_rate, Some(8000));
		assert_eq!(units[0].channels, Some(1));
	}

	#[test]
	fn enhanced_hevc() {
		let vps: &[u8] = &[0x40, 0x01, 0x0c];
		let idr: &[u8] = &[0x26, 0x01, 0xaf];

		let mut hvcc = vec![1, 0x01, 0x60, 0, 0, 0, 0xb0, 0, 0, 0, 0, 0, 93];
		hvcc.extend_from_slice(&[0xf0, 0, 0xfc, 0xfd, 0xf8, 0xf8, 0, 0, 0x0f]);
		hvcc.push(1);
		hvcc.extend_from_slice(&[0xa0, 0, 1]);
		hvcc.extend_from_slice(&(vps.len() as u16).to_be_bytes());
		hvcc.extend_from_slice(vps);

		let config = [&[0x90][..], &b"hvc1"[..], &hvcc[..]].concat();
		let mut frame = [&[0x93][..], &b"hvc1"[..]].concat();
		frame.extend_from_slice(&(idr.len() as u32).to_be_bytes());
		frame.extend_from_slice(idr);

		let data = [header(), tag(TAG_VIDEO, 0, &config), tag(TAG_VIDEO, 0, &frame)].concat();

		let mut flv = Flv::new(DemuxConfig::default());
		let units = flv.demux(&data);

		assert_eq!(flv.video_codec(), Some("hev1.1.6.L93.B0"));
		assert_eq!(units.len(), 1);
		assert!(units[0].keyframe);
		assert_eq!(units[0].payload.as_ref(), &[0, 0, 0, 1, 0x40, 0x01, 0x0c, 0, 0, 0, 1, 0x26, 0x01, 0xaf]);
	}

	#[test]
	fn sei_in_frames() {
		let sei: &[u8] = &[0x06, 5, 1, 0x42, 0x80];
		let data = [
			header(),
			tag(TAG_VIDEO, 0, &avc_frame(true, 0, &[sei, &[0x65, 0x88]])),
			tag(TAG_VIDEO, 40, &avc_frame(false, 0, &[sei, &[0x41, 0x9a]])),
		]
		.concat();

		let mut flv = Flv::new(DemuxConfig::default());
		flv.demux(&data);

		let events = flv.metadata.take();
		assert_eq!(events.len(), 3);
		assert!(matches!(events[0], MetadataEvent::SeiDetected { payload_type: 5, timestamp: 0 }));
		assert!(matches!(events[2], MetadataEvent::Sei { timestamp: 40, .. }));
	}
}
