use std::{fmt, str::FromStr};

use crate::codec::{BitReader, CodecError, strip_emulation};

/// H.264 codec parameters, formatted as `avc1.PPCCLL`.
///
/// <https://www.w3.org/TR/webcodecs-avc-codec-registration/>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H264 {
	pub profile: u8,
	pub constraints: u8,
	pub level: u8,
}

impl H264 {
	/// Parse the profile, constraint flags and level out of an SPS NAL unit (header included).
	pub fn from_sps(nal: &[u8]) -> Option<Self> {
		let rbsp = strip_emulation(nal);
		let mut r = BitReader::new(&rbsp);

		// forbidden_zero_bit, nal_ref_idc, nal_unit_type
		r.skip(8).ok()?;

		Some(Self {
			profile: r.read_u8().ok()?,
			constraints: r.read_u8().ok()?,
			level: r.read_u8().ok()?,
		})
	}
}

impl fmt::Display for H264 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "avc1.{:02X}{:02X}{:02X}", self.profile, self.constraints, self.level)
	}
}

lazy_static::lazy_static! {
	static ref H264_REGEX: regex::Regex = regex::Regex::new(r"^(?:avc1|avc3)\.([0-9A-Fa-f]{2})([0-9A-Fa-f]{2})([0-9A-Fa-f]{2})$").unwrap();
}

impl FromStr for H264 {
	type Err = CodecError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let captures = H264_REGEX.captures(s).ok_or(CodecError::Invalid)?;
		let field = |i: usize| u8::from_str_radix(&captures[i], 16).map_err(|_| CodecError::Invalid);

		Ok(Self {
			profile: field(1)?,
			constraints: field(2)?,
			level: field(3)?,
		})
	}
}

/// The coded dimensions from an SPS NAL unit (header included).
#[cfg(feature = "h264")]
pub fn sps_dimensions(nal: &[u8]) -> Option<(u32, u32)> {
	let rbsp = h264_parser::nal::ebsp_to_rbsp(nal.get(1..)?);
	let sps = h264_parser::Sps::parse(&rbsp).ok()?;
	Some((sps.width, sps.height))
}

#[cfg(not(feature = "h264"))]
pub fn sps_dimensions(_nal: &[u8]) -> Option<(u32, u32)> {
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn derive_baseline() {
		let sps = [0x67, 0x42, 0xE0, 0x1E, 0xab, 0xcd];
		let codec = H264::from_sps(&sps).unwrap();
		assert_eq!(codec.to_string(), "avc1.42E01E");
	}

	#[test]
	fn derive_with_emulation() {
		// 00 00 03 01: the 03 is an emulation prevention byte and must not be read as a field.
		let sps = [0x67, 0x64, 0x00, 0x00, 0x03, 0x01];
		let codec = H264::from_sps(&sps).unwrap();
		assert_eq!(codec.profile, 0x64);
		assert_eq!(codec.constraints, 0x00);
		assert_eq!(codec.level, 0x00);
	}

	#[cfg(feature = "h264")]
	#[test]
	fn dimensions() {
		// Baseline, 20x15 macroblocks, progressive, no cropping or VUI.
		let sps = [0x67, 0x42, 0xc0, 0x1e, 0xda, 0x05, 0x07, 0xe4];
		assert_eq!(sps_dimensions(&sps), Some((320, 240)));
	}

	#[test]
	fn too_short() {
		assert!(H264::from_sps(&[0x67, 0x42]).is_none());
	}

	#[test]
	fn parse() {
		let codec: H264 = "avc1.64001f".parse().unwrap();
		assert_eq!(
			codec,
			H264 {
				profile: 0x64,
				constraints: 0x00,
				level: 0x1f
			}
		);
		assert_eq!(codec.to_string(), "avc1.64001F");
		assert!("avc1.64001".parse::<H264>().is_err());
		assert!("hev1.1.6.L93.B0".parse::<H264>().is_err());
	}
}
