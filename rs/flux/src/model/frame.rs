use bytes::Bytes;
use derive_more::Debug;

/// Which elementary stream an [AccessUnit] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
	Video,
	Audio,
}

/// One timestamped unit of encoded media, ready for a decoder.
///
/// Access units are produced by a demuxer or the framing adapter and never mutated afterwards.
/// Ownership moves from the demuxer to the jitter buffer to the decoder, one holder at a time.
///
/// Video payloads are always Annex B with 4 byte start codes, regardless of the container they came from.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessUnit {
	/// The presentation timestamp in milliseconds.
	///
	/// This is relative to whatever the container considers zero; it is NOT a wall clock time.
	pub timestamp: i64,

	/// Whether this unit can be decoded independently.
	///
	/// Audio units are always keyframes.
	pub keyframe: bool,

	pub track: Track,

	/// The codec string (WebCodecs registry syntax) if the container signalled or implied one.
	pub codec: Option<String>,

	pub sample_rate: Option<u32>,
	pub channels: Option<u8>,

	/// The decoder configuration record for audio: AudioSpecificConfig for AAC, OpusHead for Opus.
	#[debug("{:?}", description.as_ref().map(|d| d.len()))]
	pub description: Option<Bytes>,

	/// The encoded payload.
	#[debug("{} bytes", payload.len())]
	pub payload: Bytes,
}

impl AccessUnit {
	/// Create a video unit without any codec information.
	pub fn video(timestamp: i64, keyframe: bool, payload: Bytes) -> Self {
		Self {
			timestamp,
			keyframe,
			track: Track::Video,
			codec: None,
			sample_rate: None,
			channels: None,
			description: None,
			payload,
		}
	}

	/// Create an audio unit without any codec information.
	pub fn audio(timestamp: i64, payload: Bytes) -> Self {
		Self {
			timestamp,
			keyframe: true,
			track: Track::Audio,
			codec: None,
			sample_rate: None,
			channels: None,
			description: None,
			payload,
		}
	}

	pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
		self.codec = Some(codec.into());
		self
	}

	pub fn is_video(&self) -> bool {
		self.track == Track::Video
	}

	pub fn is_audio(&self) -> bool {
		self.track == Track::Audio
	}
}
