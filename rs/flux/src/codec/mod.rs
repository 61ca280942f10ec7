//! Codec strings and decoder negotiation.
//!
//! Codec strings follow the WebCodecs registry: `avc1.PPCCLL` for H.264 and
//! `hev1.P.C.TL.CC` for H.265, derived from the parameter sets in the bitstream.
mod audio;
mod bits;
mod h264;
mod h265;
mod nal;
mod negotiate;

pub use audio::*;
pub use bits::*;
pub use h264::*;
pub use h265::*;
pub use nal::*;
pub use negotiate::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
	#[error("invalid codec string")]
	Invalid,

	#[error("unknown codec: {0}")]
	Unknown(String),
}

/// A parsed video codec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::From, derive_more::Display)]
pub enum VideoCodec {
	H264(H264),
	H265(H265),
}

impl VideoCodec {
	pub fn family(&self) -> Family {
		match self {
			Self::H264(_) => Family::H264,
			Self::H265(_) => Family::H265,
		}
	}
}

impl std::str::FromStr for VideoCodec {
	type Err = CodecError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.starts_with("avc1") || s.starts_with("avc3") {
			return Ok(Self::H264(s.parse()?));
		}
		if s.starts_with("hev1") || s.starts_with("hvc1") {
			return Ok(Self::H265(s.parse()?));
		}
		Err(CodecError::Unknown(s.to_string()))
	}
}

/// The family a codec string belongs to, judged by its sample entry prefix alone.
pub fn family_of(codec: &str) -> Option<Family> {
	match codec.get(..4)? {
		"avc1" | "avc3" => Some(Family::H264),
		"hev1" | "hvc1" => Some(Family::H265),
		_ => None,
	}
}
