use std::{fmt, str::FromStr};

use crate::codec::{BitReader, BitsExhausted, CodecError, strip_emulation};

/// H.265 codec parameters, formatted per ISO/IEC 14496-15 Annex E.
///
/// ex. `hev1.1.6.L93.B0`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct H265 {
	/// hev1 (parameter sets in-band) or hvc1 (parameter sets out-of-band).
	pub in_band: bool,
	pub profile_space: u8,
	pub profile_idc: u8,
	/// As read from the bitstream, flag 0 in the most significant bit.
	pub profile_compatibility_flags: u32,
	pub tier_flag: bool,
	pub level_idc: u8,
	/// The 48 bit general constraint indicator flags.
	pub constraint_flags: u64,
}

impl H265 {
	/// Parse the general profile_tier_level out of a VPS NAL unit (header included).
	pub fn from_vps(nal: &[u8]) -> Option<Self> {
		// vps_video_parameter_set_id(4), vps_base_layer_internal_flag(1), vps_base_layer_available_flag(1),
		// vps_max_layers_minus1(6), vps_max_sub_layers_minus1(3), vps_temporal_id_nesting_flag(1),
		// vps_reserved_0xffff_16bits(16)
		// 32 bits in all ahead of profile_tier_level, per H.265 7.3.2.1.
		Self::parse(nal, 32).ok()
	}

	/// Parse the general profile_tier_level out of an SPS NAL unit (header included).
	pub fn from_sps(nal: &[u8]) -> Option<Self> {
		// sps_video_parameter_set_id(4), sps_max_sub_layers_minus1(3), sps_temporal_id_nesting_flag(1)
		Self::parse(nal, 8).ok()
	}

	fn parse(nal: &[u8], skip: usize) -> Result<Self, BitsExhausted> {
		let rbsp = strip_emulation(nal);
		let mut r = BitReader::new(&rbsp);

		// The two byte NAL header.
		r.skip(16)?;
		r.skip(skip)?;

		let profile_space = r.read(2)? as u8;
		let tier_flag = r.read_bit()?;
		let profile_idc = r.read(5)? as u8;
		let profile_compatibility_flags = r.read_u32()?;
		let constraint_flags = r.read(48)?;
		let level_idc = r.read_u8()?;

		Ok(Self {
			in_band: true,
			profile_space,
			profile_idc,
			profile_compatibility_flags,
			tier_flag,
			level_idc,
			constraint_flags,
		})
	}
}

impl fmt::Display for H265 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let prefix = if self.in_band { "hev1" } else { "hvc1" };
		let space = match self.profile_space {
			0 => "",
			1 => "A",
			2 => "B",
			_ => "C",
		};
		let tier = if self.tier_flag { 'H' } else { 'L' };

		// The compatibility flags are written in reverse bit order; {:X} trims leading zeros but prints "0" for zero.
		write!(
			f,
			"{}.{}{}.{:X}.{}{}",
			prefix,
			space,
			self.profile_idc,
			self.profile_compatibility_flags.reverse_bits(),
			tier,
			self.level_idc
		)?;

		// Each constraint byte is a separate field; trailing zero bytes are omitted but at least one is kept.
		let bytes = self.constraint_flags.to_be_bytes();
		let bytes = &bytes[2..];
		let end = bytes.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(1);

		for b in &bytes[..end] {
			write!(f, ".{:X}", b)?;
		}

		Ok(())
	}
}

lazy_static::lazy_static! {
	static ref H265_REGEX: regex::Regex = regex::Regex::new(
		r"^(hev1|hvc1)\.([ABC]?)(\d{1,2})\.([0-9A-Fa-f]{1,8})\.([LH])(\d{1,3})((?:\.[0-9A-Fa-f]{1,2}){0,6})$"
	)
	.unwrap();
}

impl FromStr for H265 {
	type Err = CodecError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let captures = H265_REGEX.captures(s).ok_or(CodecError::Invalid)?;

		let profile_space = match &captures[2] {
			"" => 0,
			"A" => 1,
			"B" => 2,
			_ => 3,
		};

		let compatibility = u32::from_str_radix(&captures[4], 16).map_err(|_| CodecError::Invalid)?;

		let mut constraint_flags = 0u64;
		let mut count = 0;
		for byte in captures[7].split('.').filter(|s| !s.is_empty()) {
			let byte = u8::from_str_radix(byte, 16).map_err(|_| CodecError::Invalid)?;
			constraint_flags = (constraint_flags << 8) | byte as u64;
			count += 1;
		}
		constraint_flags <<= 8 * (6 - count);

		Ok(Self {
			in_band: &captures[1] == "hev1",
			profile_space,
			profile_idc: captures[3].parse().map_err(|_| CodecError::Invalid)?,
			profile_compatibility_flags: compatibility.reverse_bits(),
			tier_flag: &captures[5] == "H",
			level_idc: captures[6].parse().map_err(|_| CodecError::Invalid)?,
			constraint_flags,
		})
	}
}
