//! A small TLV framing protocol carried over the same transport as the containers.
//!
//! Every frame starts with a type byte:
//!
//! - `0` stream-info: `[0][len:u32][json]`
//! - `1` video and `2` audio: `[type][flags][timestamp:u32][len:u32][payload]`
//! - `3` control: `[3][len:u32][payload]`
//!
//! All integers are big endian.
//! Media timestamps are relative to `presentationTimeBaseMs` from the latest stream-info record.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;

use crate::{AccessUnit, codec::CodecHints};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum FramingError {
	#[error("unknown frame type: {0}")]
	UnknownType(u8),

	#[error("frame too large: {size} > {max}")]
	TooLarge { size: usize, max: usize },

	#[error("invalid stream info: {0}")]
	Json(String),
}

/// Codec hints sent by the source alongside the media.
///
/// Every field is optional; records are merged field by field rather than replaced.
#[serde_with::serde_as]
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
	pub video_codec: Option<String>,
	pub audio_codec: Option<String>,

	pub width: Option<u32>,
	pub height: Option<u32>,

	pub sample_rate: Option<u32>,
	pub channels: Option<u8>,

	/// Added to every media timestamp.
	pub presentation_time_base_ms: Option<i64>,

	#[serde(default, alias = "spsBytes")]
	#[serde_as(as = "Option<Base64>")]
	pub sps: Option<Bytes>,

	#[serde(default, alias = "ppsBytes")]
	#[serde_as(as = "Option<Base64>")]
	pub pps: Option<Bytes>,

	#[serde(default, alias = "vpsBytes")]
	#[serde_as(as = "Option<Base64>")]
	pub vps: Option<Bytes>,

	/// The AudioSpecificConfig for AAC.
	#[serde(default, alias = "audioConfigBytes")]
	#[serde_as(as = "Option<Base64>")]
	pub audio_config: Option<Bytes>,

	#[serde(default, alias = "opusHeaderBytes")]
	#[serde_as(as = "Option<Base64>")]
	pub opus_header: Option<Bytes>,
}

// Overwrite `current` when `update` is set, returning true if the value changed.
fn merge_field<T: PartialEq>(current: &mut Option<T>, update: Option<T>) -> bool {
	match update {
		Some(update) if current.as_ref() != Some(&update) => {
			*current = Some(update);
			true
		}
		_ => false,
	}
}

impl StreamInfo {
	/// Merge a newer record into this one.
	///
	/// Returns true when the video decoder configuration is no longer valid:
	/// the video codec or the SPS/VPS changed.
	pub fn merge(&mut self, update: StreamInfo) -> bool {
		let mut invalidated = merge_field(&mut self.video_codec, update.video_codec);
		invalidated |= merge_field(&mut self.sps, update.sps);
		invalidated |= merge_field(&mut self.vps, update.vps);

		merge_field(&mut self.pps, update.pps);
		merge_field(&mut self.audio_codec, update.audio_codec);
		merge_field(&mut self.width, update.width);
		merge_field(&mut self.height, update.height);
		merge_field(&mut self.sample_rate, update.sample_rate);
		merge_field(&mut self.channels, update.channels);
		merge_field(&mut self.presentation_time_base_ms, update.presentation_time_base_ms);
		merge_field(&mut self.audio_config, update.audio_config);
		merge_field(&mut self.opus_header, update.opus_header);

		invalidated
	}

	pub fn codec_hints(&self) -> CodecHints {
		CodecHints {
			codec: self.video_codec.clone(),
			vps: self.vps.clone(),
			sps: self.sps.clone(),
			pps: self.pps.clone(),
		}
	}

	/// The audio decoder description for the signalled codec, if any.
	pub fn audio_description(&self) -> Option<Bytes> {
		match self.audio_codec.as_deref() {
			Some("opus") => self.opus_header.clone(),
			_ => self.audio_config.clone(),
		}
	}
}

/// One decoded frame of the framing protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Framed {
	Unit(AccessUnit),

	/// A stream-info record was merged; `info` is the state after merging.
	StreamInfo { info: StreamInfo, invalidated: bool },

	/// An opaque payload for the caller.
	Control(Bytes),

	/// A complete record that couldn't be parsed. Decoding continues with the next record.
	Invalid(FramingError),
}

const TYPE_STREAM_INFO: u8 = 0;
const TYPE_VIDEO: u8 = 1;
const TYPE_AUDIO: u8 = 2;
const TYPE_CONTROL: u8 = 3;

const FLAG_KEYFRAME: u8 = 0x01;

/// Incrementally decodes the framing protocol from arbitrary chunks.
pub struct FramingDecoder {
	buffer: BytesMut,
	max_frame_size: usize,
	info: StreamInfo,
}

impl FramingDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buffer: BytesMut::new(),
			max_frame_size,
			info: StreamInfo::default(),
		}
	}

	/// The stream-info merged from every record so far.
	pub fn info(&self) -> &StreamInfo {
		&self.info
	}

	/// Decode every complete frame, keeping any partial frame for the next chunk.
	///
	/// An unknown type or an oversized frame loses sync: the decoder is emptied and the error returned.
	/// A stream-info record with invalid JSON is still length delimited, so it is reported as [Framed::Invalid].
	pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Framed>, FramingError> {
		self.buffer.extend_from_slice(chunk);

		let mut frames = Vec::new();
		loop {
			match self.next() {
				Ok(Some(frame)) => frames.push(frame),
				Ok(None) => return Ok(frames),
				Err(err) => {
					self.buffer.clear();
					return Err(err);
				}
			}
		}
	}

	fn next(&mut self) -> Result<Option<Framed>, FramingError> {
		let Some(&kind) = self.buffer.first() else {
			return Ok(None);
		};

		let (header, size) = match kind {
			TYPE_STREAM_INFO | TYPE_CONTROL => match self.buffer.get(1..5) {
				Some(len) => (5, read_u32(len)),
				None => return Ok(None),
			},
			TYPE_VIDEO | TYPE_AUDIO => match self.buffer.get(6..10) {
				Some(len) => (10, read_u32(len)),
				None => return Ok(None),
			},
			kind => return Err(FramingError::UnknownType(kind)),
		};

		if size > self.max_frame_size {
			return Err(FramingError::TooLarge {
				size,
				max: self.max_frame_size,
			});
		}

		if self.buffer.len() < header + size {
			return Ok(None);
		}

		let mut frame = self.buffer.split_to(header + size).freeze();
		let flags = frame[1];
		let timestamp = frame.get(2..6).map(read_u32).unwrap_or_default() as i64;
		frame.advance(header);

		Ok(Some(match kind {
			TYPE_STREAM_INFO => self.stream_info(&frame).unwrap_or_else(|err| {
				tracing::warn!(%err, "skipping stream info");
				Framed::Invalid(err)
			}),
			TYPE_CONTROL => Framed::Control(frame),
			TYPE_VIDEO => Framed::Unit(self.video(flags, timestamp, frame)),
			_ => Framed::Unit(self.audio(timestamp, frame)),
		}))
	}

	fn stream_info(&mut self, json: &[u8]) -> Result<Framed, FramingError> {
		let update: StreamInfo = serde_json::from_slice(json).map_err(|err| FramingError::Json(err.to_string()))?;
		tracing::debug!(?update, "stream info");

		let invalidated = self.info.merge(update);
		Ok(Framed::StreamInfo {
			info: self.info.clone(),
			invalidated,
		})
	}

	fn base(&self) -> i64 {
		self.info.presentation_time_base_ms.unwrap_or_default()
	}

	fn video(&self, flags: u8, timestamp: i64, payload: Bytes) -> AccessUnit {
		let mut unit = AccessUnit::video(self.base() + timestamp, flags & FLAG_KEYFRAME != 0, payload);
		unit.codec = self.info.video_codec.clone();
		unit
	}

	fn audio(&self, timestamp: i64, payload: Bytes) -> AccessUnit {
		let mut unit = AccessUnit::audio(self.base() + timestamp, payload);
		unit.codec = self.info.audio_codec.clone();
		unit.sample_rate = self.info.sample_rate;
		unit.channels = self.info.channels;
		unit.description = self.info.audio_description();
		unit
	}
}

fn read_u32(b: &[u8]) -> usize {
	u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
}
