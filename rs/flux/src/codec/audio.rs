use std::{fmt, str::FromStr};

use bytes::Bytes;

use crate::codec::CodecError;

/// Supported audio codecs, named per the WebCodecs codec registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
	Aac(Aac),
	Opus,
	Mp3,
	/// G.711 A-law.
	Alaw,
	/// G.711 µ-law.
	Ulaw,
}

impl AudioCodec {
	/// G.711 is decoded in software and never touches the external decoder.
	pub fn is_g711(&self) -> bool {
		matches!(self, Self::Alaw | Self::Ulaw)
	}

	/// Whether the decoder can't be configured without a description.
	pub fn requires_description(&self) -> bool {
		matches!(self, Self::Aac(_))
	}
}

impl fmt::Display for AudioCodec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Aac(aac) => aac.fmt(f),
			Self::Opus => write!(f, "opus"),
			Self::Mp3 => write!(f, "mp3"),
			Self::Alaw => write!(f, "alaw"),
			Self::Ulaw => write!(f, "ulaw"),
		}
	}
}

impl FromStr for AudioCodec {
	type Err = CodecError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"opus" => Self::Opus,
			"mp3" => Self::Mp3,
			"alaw" | "pcma" => Self::Alaw,
			"ulaw" | "pcmu" => Self::Ulaw,
			s if s.starts_with("mp4a.") => Self::Aac(s.parse()?),
			_ => return Err(CodecError::Unknown(s.to_string())),
		})
	}
}

/// AAC, formatted as `mp4a.40.{object type}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aac {
	pub profile: u8,
}

impl fmt::Display for Aac {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "mp4a.40.{}", self.profile)
	}
}

impl FromStr for Aac {
	type Err = CodecError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let profile = s.strip_prefix("mp4a.40.").ok_or(CodecError::Invalid)?;
		let profile = profile.parse().map_err(|_| CodecError::Invalid)?;
		Ok(Self { profile })
	}
}

pub const AAC_SAMPLE_RATES: [u32; 13] = [
	96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// The fields we care about from an AudioSpecificConfig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
	pub object_type: u8,
	pub frequency_index: u8,
	pub channels: u8,
}

impl AacConfig {
	pub fn parse(asc: &[u8]) -> Option<Self> {
		let [a, b, ..] = asc else {
			return None;
		};

		let object_type = a >> 3;
		let frequency_index = ((a & 0x07) << 1) | (b >> 7);
		let channels = (b >> 3) & 0x0f;

		if frequency_index as usize >= AAC_SAMPLE_RATES.len() {
			return None;
		}

		Some(Self {
			object_type,
			frequency_index,
			channels,
		})
	}

	pub fn sample_rate(&self) -> u32 {
		AAC_SAMPLE_RATES[self.frequency_index as usize]
	}

	pub fn codec(&self) -> AudioCodec {
		AudioCodec::Aac(Aac {
			profile: self.object_type,
		})
	}

	/// Encode a two byte AudioSpecificConfig.
	pub fn encode(&self) -> Bytes {
		let a = (self.object_type << 3) | (self.frequency_index >> 1);
		let b = ((self.frequency_index & 1) << 7) | (self.channels << 3);
		Bytes::from(vec![a, b])
	}
}

/// The channel count and input sample rate from an OpusHead.
pub fn opus_head(head: &[u8]) -> Option<(u8, u32)> {
	if head.len() < 19 || &head[..8] != b"OpusHead" {
		return None;
	}

	let channels = head[9];
	let sample_rate = u32::from_le_bytes([head[12], head[13], head[14], head[15]]);
	Some((channels, sample_rate))
}
